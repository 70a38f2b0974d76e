//! HTTP/2 connection settings.

use crate::frame::{self, Setting, SettingId};

/// HTTP/2 connection settings.
///
/// One instance tracks what we advertise to the peer (local), another what
/// the peer advertises to us (remote). Remote settings take effect the
/// moment the SETTINGS frame arrives; local settings only once the peer has
/// ACKed them (RFC 7540 Section 6.5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// HPACK dynamic table size.
    pub header_table_size: u32,
    /// Whether server push is permitted.
    pub enable_push: bool,
    /// Maximum number of concurrent streams the peer may open.
    pub max_concurrent_streams: u32,
    /// Initial stream-level window size.
    pub initial_window_size: u32,
    /// Maximum frame payload size.
    pub max_frame_size: u32,
    /// Maximum decoded header list size.
    pub max_header_list_size: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            header_table_size: frame::DEFAULT_HEADER_TABLE_SIZE,
            enable_push: true,
            max_concurrent_streams: frame::DEFAULT_MAX_CONCURRENT_STREAMS,
            initial_window_size: frame::DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: 16_384,
        }
    }
}

impl ConnectionSettings {
    /// Create new settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set HPACK header table size.
    pub fn header_table_size(mut self, value: u32) -> Self {
        self.header_table_size = value;
        self
    }

    /// Enable or disable server push.
    pub fn enable_push(mut self, value: bool) -> Self {
        self.enable_push = value;
        self
    }

    /// Set maximum concurrent streams.
    pub fn max_concurrent_streams(mut self, value: u32) -> Self {
        self.max_concurrent_streams = value;
        self
    }

    /// Set initial window size.
    pub fn initial_window_size(mut self, value: u32) -> Self {
        self.initial_window_size = value;
        self
    }

    /// Set maximum frame size.
    pub fn max_frame_size(mut self, value: u32) -> Self {
        self.max_frame_size = value;
        self
    }

    /// Set maximum header list size.
    pub fn max_header_list_size(mut self, value: u32) -> Self {
        self.max_header_list_size = value;
        self
    }

    /// The settings list a server advertises in its initial SETTINGS frame.
    ///
    /// ENABLE_PUSH is a client-only setting and never advertised by us.
    pub fn to_settings_list(&self) -> Vec<Setting> {
        vec![
            Setting {
                id: SettingId::HeaderTableSize,
                value: self.header_table_size,
            },
            Setting {
                id: SettingId::MaxConcurrentStreams,
                value: self.max_concurrent_streams,
            },
            Setting {
                id: SettingId::InitialWindowSize,
                value: self.initial_window_size,
            },
            Setting {
                id: SettingId::MaxFrameSize,
                value: self.max_frame_size,
            },
            Setting {
                id: SettingId::MaxHeaderListSize,
                value: self.max_header_list_size,
            },
        ]
    }
}
