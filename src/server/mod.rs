//! Handler tasks and transport glue.
//!
//! This module turns the sans-IO [`crate::connection::ServerConnection`]
//! into a running connection task. The driver owns the connection core and
//! a typed mailbox; a reader thread forwards raw socket bytes into the
//! mailbox, and one handler thread per request stream submits response
//! writes into it. Handler threads block on per-call reply channels, which
//! is what turns flow-control parking into backpressure on user code.

mod driver;
mod handler;

pub use driver::{ConnectionDriver, Disposition, ServerConfig, ShutdownHandle};
pub use handler::{BodyItem, BodyReader, Handler, HandlerError, Request, ResponseWriter};

pub use crate::connection::SendError;
