//! HTTP/2 flow control windows.

use std::fmt;

/// Largest legal window value (RFC 7540 Section 6.9.1).
pub const MAX_WINDOW: i64 = 0x7FFF_FFFF;

/// Window arithmetic failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowError {
    /// A WINDOW_UPDATE or SETTINGS delta pushed the window above 2^31 - 1.
    Overflow,
    /// Received or sent data exceeded the available window.
    Underflow,
}

impl fmt::Display for WindowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowError::Overflow => write!(f, "flow control window overflow"),
            WindowError::Underflow => write!(f, "flow control window exceeded"),
        }
    }
}

impl std::error::Error for WindowError {}

/// Flow control state for connection or stream level.
///
/// HTTP/2 uses a credit-based scheme. The window is a signed value in
/// [-2^31, 2^31-1]; a SETTINGS_INITIAL_WINDOW_SIZE decrease can legally
/// drive it negative. Receive-side instances also track consumption since
/// the last replenishment so WINDOW_UPDATE frames go out in batches rather
/// than per-frame.
#[derive(Debug, Clone)]
pub struct FlowControl {
    /// Current window.
    window: i64,
    /// Bytes consumed since the last replenishment WINDOW_UPDATE.
    consumed: u32,
    /// Replenish once consumption crosses this (half the initial window).
    update_threshold: u32,
}

impl FlowControl {
    /// Create a window with the given initial size.
    pub fn new(initial: u32) -> Self {
        Self {
            window: i64::from(initial),
            consumed: 0,
            update_threshold: initial / 2,
        }
    }

    /// Current window. Negative only after a SETTINGS shrink.
    pub fn window(&self) -> i64 {
        self.window
    }

    /// Window capacity usable right now.
    pub fn available(&self) -> u32 {
        self.window.clamp(0, MAX_WINDOW) as u32
    }

    /// Consume capacity for data sent or received. Consumption never takes
    /// the window below zero; that is the peer exceeding its credit.
    pub fn consume(&mut self, amount: u32) -> Result<(), WindowError> {
        if i64::from(amount) > self.window {
            return Err(WindowError::Underflow);
        }
        self.window -= i64::from(amount);
        self.consumed = self.consumed.saturating_add(amount);
        Ok(())
    }

    /// Debit capacity the caller already clamped to [`FlowControl::available`].
    /// Send-side bookkeeping only.
    pub fn debit(&mut self, amount: u32) {
        self.window -= i64::from(amount);
    }

    /// Add a WINDOW_UPDATE increment.
    pub fn increase(&mut self, increment: u32) -> Result<(), WindowError> {
        let new = self.window + i64::from(increment);
        if new > MAX_WINDOW {
            return Err(WindowError::Overflow);
        }
        self.window = new;
        Ok(())
    }

    /// Adjust after a SETTINGS_INITIAL_WINDOW_SIZE change. `delta` is
    /// (new - old) and may be negative; the result may go negative but must
    /// not exceed the maximum.
    pub fn adjust(&mut self, delta: i64) -> Result<(), WindowError> {
        let new = self.window + delta;
        if new > MAX_WINDOW {
            return Err(WindowError::Overflow);
        }
        self.window = new;
        Ok(())
    }

    /// Whether enough has been consumed to warrant a replenishment
    /// WINDOW_UPDATE on the receive side.
    pub fn should_update(&self) -> bool {
        self.update_threshold > 0 && self.consumed >= self.update_threshold
    }

    /// Take the pending replenishment: credits the window back and returns
    /// the increment to put in a WINDOW_UPDATE frame.
    pub fn take_update(&mut self) -> u32 {
        let increment = self.consumed;
        self.window += i64::from(increment);
        self.consumed = 0;
        increment
    }
}
