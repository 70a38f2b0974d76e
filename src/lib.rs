//! h2core - the HTTP/2 connection core of an HTTP server.
//!
//! This crate implements the server side of RFC 7540 framing and RFC 7541
//! header compression, a per-stream state machine with flow control, and a
//! dispatch layer that runs one user handler task per request stream. It does
//! not open sockets or terminate TLS; the acceptor hands over an
//! already-negotiated byte stream.
//!
//! # Architecture
//!
//! The crate is organized into four layers:
//!
//! - `frame`: HTTP/2 frame types, encoding, and decoding
//! - `hpack`: HPACK header compression
//! - `connection`: the sans-IO connection state machine (settings, windows,
//!   streams, header-block assembly, server push, GOAWAY)
//! - `server`: handler tasks and the transport glue that turns the sans-IO
//!   core into a running connection task
//!
//! The `connection::ServerConnection` core is fed bytes and polled for
//! events; all outbound bytes accumulate in its write buffer. The
//! `server::ConnectionDriver` owns one core per connection, spawns a handler
//! thread per request stream, and relays response writes back under flow
//! control.

pub mod connection;
pub mod frame;
pub mod hpack;
pub mod server;

// Re-export commonly used types
pub use frame::{
    CONNECTION_PREFACE, DEFAULT_HEADER_TABLE_SIZE, DEFAULT_INITIAL_WINDOW_SIZE,
    DEFAULT_MAX_CONCURRENT_STREAMS, DEFAULT_MAX_FRAME_SIZE, DataFrame, ErrorCode,
    FRAME_HEADER_SIZE, Frame, FrameDecoder, FrameEncoder, FrameError, FrameType, GoAwayFrame,
    HeadersFrame, PingFrame, Priority, RstStreamFrame, Setting, SettingId, SettingsFrame, StreamId,
    WindowUpdateFrame,
};

pub use hpack::{HeaderField, HpackDecoder, HpackEncoder};

pub use connection::{
    ConnectionSettings, ConnectionState, FlowControl, SendOutcome, ServerConnection, ServerEvent,
    Stream, StreamState,
};

pub use server::{
    BodyItem, BodyReader, ConnectionDriver, Disposition, Handler, HandlerError, Request,
    ResponseWriter, SendError, ServerConfig, ShutdownHandle,
};
