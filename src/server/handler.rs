//! The user handler contract: one task per request stream.

use std::sync::mpsc;

use bytes::Bytes;

use crate::connection::SendError;
use crate::frame::StreamId;
use crate::hpack::HeaderField;

use super::driver::{ConnMsg, StreamCommand};

/// Error type handlers may return; surfaced as a stream INTERNAL_ERROR.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A user-supplied request handler.
///
/// `handle` runs on a dedicated thread per request stream. Returning `Err`
/// (or panicking) resets the stream with INTERNAL_ERROR; the connection and
/// its other streams are unaffected.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request, response: ResponseWriter) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(Request, ResponseWriter) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, request: Request, response: ResponseWriter) -> Result<(), HandlerError> {
        self(request, response)
    }
}

/// A fully assembled request, handed to the handler once its header block
/// completed and validated.
#[derive(Debug)]
pub struct Request {
    /// The request stream.
    pub stream_id: StreamId,
    /// `:method` pseudo-header.
    pub method: String,
    /// `:scheme` pseudo-header.
    pub scheme: String,
    /// `:path` pseudo-header.
    pub path: String,
    /// `:authority` pseudo-header, if present.
    pub authority: Option<String>,
    /// Declared `content-length`, if present.
    pub content_length: Option<u64>,
    /// The full decoded header list, pseudo-headers included.
    pub headers: Vec<HeaderField>,
    /// The request body channel.
    pub body: BodyReader,
}

/// One item on the request body channel.
#[derive(Debug)]
pub enum BodyItem {
    /// A chunk of body data.
    Data(Bytes),
    /// Trailers; the body is complete after these.
    Trailers(Vec<HeaderField>),
}

/// Receiving side of the per-stream body channel. The connection task
/// produces, the handler task consumes.
#[derive(Debug)]
pub struct BodyReader {
    rx: mpsc::Receiver<BodyItem>,
}

impl BodyReader {
    pub(super) fn new(rx: mpsc::Receiver<BodyItem>) -> Self {
        Self { rx }
    }

    /// Block until the next body item. `None` means the body is complete
    /// (END_STREAM seen, or the stream went away).
    pub fn next(&self) -> Option<BodyItem> {
        self.rx.recv().ok()
    }

    /// Drain the whole body into one buffer, returning trailers if the
    /// peer sent any.
    pub fn read_to_end(&self) -> (Vec<u8>, Option<Vec<HeaderField>>) {
        let mut body = Vec::new();
        let mut trailers = None;
        while let Some(item) = self.next() {
            match item {
                BodyItem::Data(chunk) => body.extend_from_slice(&chunk),
                BodyItem::Trailers(t) => trailers = Some(t),
            }
        }
        (body, trailers)
    }
}

/// Write side of a response stream.
///
/// All methods submit typed messages to the connection task and block until
/// it answers. `send_data` in particular does not return until the bytes
/// have actually been written under flow control; a slow peer therefore
/// suspends the handler task, not the connection.
#[derive(Debug, Clone)]
pub struct ResponseWriter {
    stream_id: StreamId,
    commands: mpsc::Sender<ConnMsg>,
}

impl ResponseWriter {
    pub(super) fn new(stream_id: StreamId, commands: mpsc::Sender<ConnMsg>) -> Self {
        Self { stream_id, commands }
    }

    /// The stream this writer responds on.
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Send response headers (or, with `end_stream`, a header-only
    /// response).
    pub fn send_headers(
        &self,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), SendError> {
        let (reply, rx) = mpsc::sync_channel(1);
        self.submit(StreamCommand::Headers {
            id: self.stream_id,
            headers: headers.to_vec(),
            end_stream,
            reply,
        })?;
        recv_reply(&rx)
    }

    /// Send body data. Blocks until the payload is flushed; when flow
    /// control parks part of it, the call does not return before the
    /// remainder drained.
    pub fn send_data(&self, data: impl Into<Bytes>, end_stream: bool) -> Result<(), SendError> {
        let (reply, rx) = mpsc::sync_channel(1);
        self.submit(StreamCommand::Data {
            id: self.stream_id,
            data: data.into(),
            end_stream,
            reply,
        })?;
        recv_reply(&rx)
    }

    /// Send trailers, ending the response.
    pub fn send_trailers(&self, headers: &[HeaderField]) -> Result<(), SendError> {
        self.send_headers(headers, true)
    }

    /// Promise a pushed response on a new server-initiated stream.
    ///
    /// `headers` are the synthesized request headers of the pushed
    /// resource. On success, the returned writer responds on the promised
    /// stream.
    pub fn push(&self, headers: &[HeaderField]) -> Result<ResponseWriter, SendError> {
        let (reply, rx) = mpsc::sync_channel(1);
        self.submit(StreamCommand::Push {
            parent: self.stream_id,
            headers: headers.to_vec(),
            reply,
        })?;
        let promised = recv_reply(&rx)?;
        Ok(ResponseWriter {
            stream_id: promised,
            commands: self.commands.clone(),
        })
    }

    fn submit(&self, command: StreamCommand) -> Result<(), SendError> {
        self.commands
            .send(ConnMsg::Stream(command))
            .map_err(|_| SendError::ConnectionClosed)
    }
}

fn recv_reply<T>(rx: &mpsc::Receiver<Result<T, SendError>>) -> Result<T, SendError> {
    rx.recv().map_err(|_| SendError::ConnectionClosed)?
}
