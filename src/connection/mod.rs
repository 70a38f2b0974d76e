//! HTTP/2 connection state machine.
//!
//! This module implements the server-side HTTP/2 connection layer, handling:
//! - Connection preface and settings exchange
//! - Stream lifecycle management and the stream registry
//! - Flow control (connection and stream level)
//! - Header block assembly and validation
//! - Frame dispatching, server push, GOAWAY

mod flow_control;
mod registry;
mod server;
mod settings;
mod stream;

pub use flow_control::{FlowControl, WindowError};
pub use registry::{AdmitError, StreamRegistry};
pub use server::{ConnectionState, SendOutcome, ServerConnection, ServerEvent};
pub use settings::ConnectionSettings;
pub use stream::{RequestHead, Stream, StreamState};

/// Errors returned to handler tasks from the send-side API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The stream is closed (reset locally or by the peer).
    #[error("stream closed")]
    StreamClosed,
    /// The connection is closed or closing.
    #[error("connection closed")]
    ConnectionClosed,
    /// The stream exists but cannot accept this operation in its state.
    #[error("invalid stream state")]
    InvalidState,
}
