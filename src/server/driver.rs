//! Transport glue: the connection task.
//!
//! `ConnectionDriver` is the single owner of one connection's state. It can
//! be driven two ways:
//!
//! - Callback-style by an external acceptor loop: `handle_connection`,
//!   `handle_data`, `handle_timeout`, `handle_shutdown`, plus `service` to
//!   pump handler commands, with outbound bytes drained through
//!   `pending_send`/`advance_send`.
//! - As a blocking connection task over a `TcpStream` via `serve_tcp`,
//!   which spawns a reader thread that forwards raw bytes into the typed
//!   mailbox and runs the dispatch loop on the calling thread.
//!
//! Either way, only this task touches the HPACK contexts, the windows, the
//! registry, and the socket's write side.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::connection::{
    ConnectionSettings, ConnectionState, RequestHead, SendError, SendOutcome, ServerConnection,
    ServerEvent,
};
use crate::frame::{ErrorCode, StreamId};
use crate::hpack::HeaderField;

use super::handler::{BodyItem, BodyReader, Handler, Request, ResponseWriter};

/// Connection-task configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Settings advertised to every client.
    pub settings: ConnectionSettings,
    /// Idle read timeout; expiry sends GOAWAY(NO_ERROR, "Client timeout")
    /// and closes.
    pub read_timeout: Duration,
    /// How long a graceful shutdown waits for in-flight streams.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            settings: ConnectionSettings::default(),
            read_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// What the acceptor should do with the connection after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep the connection; call back on data or after `timeout`.
    Continue { timeout: Duration },
    /// Flush pending bytes and close the socket.
    Close,
}

/// Messages on the connection task's mailbox.
pub(crate) enum ConnMsg {
    /// Raw bytes from the socket.
    Io(Vec<u8>),
    /// The peer closed its write side.
    PeerClosed,
    /// Reading from the socket failed.
    IoError(io::Error),
    /// A handler task wants something written.
    Stream(StreamCommand),
    /// Graceful shutdown requested.
    Shutdown,
}

/// Typed requests from handler tasks to the connection task.
pub(crate) enum StreamCommand {
    Headers {
        id: StreamId,
        headers: Vec<HeaderField>,
        end_stream: bool,
        reply: SyncSender<Result<(), SendError>>,
    },
    Data {
        id: StreamId,
        data: Bytes,
        end_stream: bool,
        reply: SyncSender<Result<(), SendError>>,
    },
    Push {
        parent: StreamId,
        headers: Vec<HeaderField>,
        reply: SyncSender<Result<StreamId, SendError>>,
    },
    Done {
        id: StreamId,
        error: Option<String>,
    },
}

/// Requests a graceful drain of a running connection task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Sender<ConnMsg>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(ConnMsg::Shutdown);
    }
}

/// Dispatch-side state for one stream.
struct StreamTask {
    /// Body channel to the handler; dropped to signal end of body.
    body_tx: Option<mpsc::Sender<BodyItem>>,
    /// Reply for a parked `send_data`, answered when the park drains.
    pending_reply: Option<SyncSender<Result<(), SendError>>>,
    /// Handler thread, joined when the stream retires. Pushed streams have
    /// no thread of their own.
    join: Option<thread::JoinHandle<()>>,
}

/// The connection task: owns the sans-IO core and dispatches requests to
/// handler threads.
pub struct ConnectionDriver<H: Handler> {
    conn: ServerConnection,
    handler: Arc<H>,
    config: ServerConfig,
    tasks: HashMap<u32, StreamTask>,
    cmd_tx: Sender<ConnMsg>,
    cmd_rx: Receiver<ConnMsg>,
    draining_since: Option<Instant>,
}

impl<H: Handler> ConnectionDriver<H> {
    pub fn new(handler: H, config: ServerConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        Self {
            conn: ServerConnection::new(config.settings),
            handler: Arc::new(handler),
            config,
            tasks: HashMap::new(),
            cmd_tx,
            cmd_rx,
            draining_since: None,
        }
    }

    /// Handle for requesting a graceful shutdown from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.cmd_tx.clone(),
        }
    }

    // -- transport-handler contract --

    /// The acceptor handed over a freshly negotiated connection.
    pub fn handle_connection(&mut self) -> Disposition {
        tracing::debug!("h2 connection up");
        self.disposition()
    }

    /// Bytes arrived from the socket.
    pub fn handle_data(&mut self, data: &[u8]) -> Disposition {
        self.conn.feed_data(data);
        self.service_events();
        self.disposition()
    }

    /// The read timeout lapsed with no traffic.
    pub fn handle_timeout(&mut self) -> Disposition {
        tracing::debug!("client timeout, closing connection");
        self.conn.send_goaway(ErrorCode::NoError, b"Client timeout");
        self.abort_tasks(SendError::ConnectionClosed);
        Disposition::Close
    }

    /// Graceful shutdown: stop accepting streams, drain in-flight ones.
    pub fn handle_shutdown(&mut self) -> Disposition {
        tracing::debug!("draining h2 connection");
        self.conn.send_goaway(ErrorCode::NoError, b"");
        self.service_events();
        self.disposition()
    }

    /// Pump queued handler commands without blocking. Acceptor-driven
    /// integrations call this when the mailbox has activity.
    pub fn service(&mut self) -> Disposition {
        while let Ok(msg) = self.cmd_rx.try_recv() {
            self.dispatch_msg(msg);
        }
        self.disposition()
    }

    /// Outbound bytes awaiting the socket.
    pub fn pending_send(&self) -> &[u8] {
        self.conn.pending_send()
    }

    /// Mark outbound bytes as written.
    pub fn advance_send(&mut self, n: usize) {
        self.conn.advance_send(n);
    }

    pub fn has_pending_send(&self) -> bool {
        self.conn.has_pending_send()
    }

    // -- blocking connection task over TCP --

    /// Run the connection task over a TCP socket until the connection ends.
    ///
    /// A reader thread forwards socket bytes into the mailbox; this thread
    /// owns all state and all writes. The mailbox wait doubles as the read
    /// timeout.
    pub fn serve_tcp(mut self, socket: TcpStream) -> io::Result<()> {
        let reader = socket.try_clone()?;
        let reader_tx = self.cmd_tx.clone();
        thread::Builder::new()
            .name("h2-read".to_string())
            .spawn(move || read_loop(reader, reader_tx))?;

        let mut socket = socket;
        let mut disposition = self.handle_connection();
        self.flush(&mut socket)?;

        loop {
            let timeout = match disposition {
                Disposition::Continue { timeout } => timeout,
                Disposition::Close => break,
            };

            disposition = match self.cmd_rx.recv_timeout(timeout) {
                Ok(msg) => {
                    let d = self.dispatch_msg(msg);
                    self.flush(&mut socket)?;
                    d
                }
                Err(RecvTimeoutError::Timeout) => {
                    let d = self.handle_timeout();
                    self.flush(&mut socket)?;
                    d
                }
                Err(RecvTimeoutError::Disconnected) => Disposition::Close,
            };
        }

        self.flush(&mut socket)?;
        let _ = socket.shutdown(Shutdown::Both);
        self.abort_tasks(SendError::ConnectionClosed);
        Ok(())
    }

    fn dispatch_msg(&mut self, msg: ConnMsg) -> Disposition {
        match msg {
            ConnMsg::Io(bytes) => self.handle_data(&bytes),
            ConnMsg::PeerClosed => {
                tracing::debug!("peer closed connection");
                self.abort_tasks(SendError::ConnectionClosed);
                Disposition::Close
            }
            ConnMsg::IoError(e) => {
                tracing::debug!(error = %e, "socket read failed");
                self.abort_tasks(SendError::ConnectionClosed);
                Disposition::Close
            }
            ConnMsg::Stream(cmd) => {
                self.apply_command(cmd);
                self.service_events();
                self.disposition()
            }
            ConnMsg::Shutdown => self.handle_shutdown(),
        }
    }

    fn flush(&mut self, socket: &mut TcpStream) -> io::Result<()> {
        while self.conn.has_pending_send() {
            let n = socket.write(self.conn.pending_send())?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WriteZero));
            }
            self.conn.advance_send(n);
        }
        Ok(())
    }

    fn disposition(&mut self) -> Disposition {
        match self.conn.state() {
            ConnectionState::Closed => Disposition::Close,
            ConnectionState::Draining => {
                if self.conn.active_streams() == 0 {
                    return Disposition::Close;
                }
                let since = *self.draining_since.get_or_insert_with(Instant::now);
                let elapsed = since.elapsed();
                if elapsed >= self.config.drain_timeout {
                    tracing::debug!("drain deadline reached");
                    Disposition::Close
                } else {
                    Disposition::Continue {
                        timeout: (self.config.drain_timeout - elapsed).min(self.config.read_timeout),
                    }
                }
            }
            _ => Disposition::Continue {
                timeout: self.config.read_timeout,
            },
        }
    }

    // -- event and command plumbing --

    fn service_events(&mut self) {
        for event in self.conn.poll_events() {
            match event {
                ServerEvent::Ready => {
                    tracing::debug!("settings exchanged, connection ready");
                }
                ServerEvent::Request {
                    stream_id,
                    head,
                    headers,
                    end_stream,
                } => self.spawn_handler(stream_id, head, headers, end_stream),
                ServerEvent::Data {
                    stream_id,
                    data,
                    end_stream,
                } => {
                    if let Some(task) = self.tasks.get_mut(&stream_id.value()) {
                        if let Some(tx) = &task.body_tx {
                            let _ = tx.send(BodyItem::Data(data));
                        }
                        if end_stream {
                            task.body_tx = None;
                        }
                    }
                }
                ServerEvent::Trailers { stream_id, headers } => {
                    if let Some(task) = self.tasks.get_mut(&stream_id.value()) {
                        if let Some(tx) = &task.body_tx {
                            let _ = tx.send(BodyItem::Trailers(headers));
                        }
                        task.body_tx = None;
                    }
                }
                ServerEvent::StreamReset {
                    stream_id,
                    error_code,
                } => {
                    tracing::debug!(stream = stream_id.value(), code = %error_code, "stream reset by peer");
                    self.cancel_task(stream_id);
                }
                ServerEvent::StreamError {
                    stream_id,
                    error_code,
                } => {
                    tracing::debug!(stream = stream_id.value(), code = %error_code, "stream error");
                    self.cancel_task(stream_id);
                    // Streams that never reached a handler have no Done
                    // coming; retire them here.
                    if !self.tasks.contains_key(&stream_id.value()) {
                        self.conn.stream_terminated(stream_id, true);
                    }
                }
                ServerEvent::SendUnblocked { stream_id } => {
                    let mut detached = false;
                    if let Some(task) = self.tasks.get_mut(&stream_id.value()) {
                        if let Some(reply) = task.pending_reply.take() {
                            let _ = reply.send(Ok(()));
                        }
                        detached = task.join.is_none();
                    }
                    if detached {
                        self.tasks.remove(&stream_id.value());
                    }
                }
                ServerEvent::PeerGoAway {
                    last_stream_id,
                    error_code,
                } => {
                    tracing::debug!(last = last_stream_id.value(), code = %error_code, "peer sent GOAWAY");
                }
                ServerEvent::ConnectionError { code, reason } => {
                    tracing::warn!(code = %code, reason = %reason, "connection error");
                    self.abort_tasks(SendError::ConnectionClosed);
                }
            }
        }
    }

    fn spawn_handler(
        &mut self,
        id: StreamId,
        head: RequestHead,
        headers: Vec<HeaderField>,
        end_stream: bool,
    ) {
        let (body_tx, body_rx) = mpsc::channel();

        let request = Request {
            stream_id: id,
            method: String::from_utf8_lossy(&head.method).into_owned(),
            scheme: String::from_utf8_lossy(&head.scheme).into_owned(),
            path: String::from_utf8_lossy(&head.path).into_owned(),
            authority: head
                .authority
                .as_deref()
                .map(|a| String::from_utf8_lossy(a).into_owned()),
            content_length: head.content_length,
            headers,
            body: BodyReader::new(body_rx),
        };

        tracing::debug!(
            stream = id.value(),
            method = %request.method,
            path = %request.path,
            "dispatching request"
        );

        let writer = ResponseWriter::new(id, self.cmd_tx.clone());
        let handler = Arc::clone(&self.handler);
        let done_tx = self.cmd_tx.clone();

        let join = thread::Builder::new()
            .name(format!("h2-stream-{}", id.value()))
            .spawn(move || {
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| handler.handle(request, writer)));
                let error = match result {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some("handler panicked".to_string()),
                };
                let _ = done_tx.send(ConnMsg::Stream(StreamCommand::Done { id, error }));
            });

        match join {
            Ok(join) => {
                self.tasks.insert(
                    id.value(),
                    StreamTask {
                        body_tx: if end_stream { None } else { Some(body_tx) },
                        pending_reply: None,
                        join: Some(join),
                    },
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn handler thread");
                self.conn.reset_stream(id, ErrorCode::InternalError);
            }
        }
    }

    fn apply_command(&mut self, cmd: StreamCommand) {
        match cmd {
            StreamCommand::Headers {
                id,
                headers,
                end_stream,
                reply,
            } => {
                let result = self.conn.send_headers(id, &headers, end_stream);
                let _ = reply.send(result);
            }
            StreamCommand::Data {
                id,
                data,
                end_stream,
                reply,
            } => match self.conn.send_data(id, data, end_stream) {
                Ok(SendOutcome::Sent) => {
                    let _ = reply.send(Ok(()));
                }
                Ok(SendOutcome::Parked) => {
                    // The handler stays blocked until the park drains.
                    // Pushed streams get a slot here too; it lives only as
                    // long as the parked send.
                    let task = self.tasks.entry(id.value()).or_insert_with(|| StreamTask {
                        body_tx: None,
                        pending_reply: None,
                        join: None,
                    });
                    task.pending_reply = Some(reply);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            StreamCommand::Push {
                parent,
                headers,
                reply,
            } => {
                // Pushed streams carry no handler thread and no task slot;
                // the parent's handler writes them through its own writer.
                let result = self.conn.send_push(parent, &headers);
                let _ = reply.send(result);
            }
            StreamCommand::Done { id, error } => {
                if let Some(err) = &error {
                    tracing::warn!(stream = id.value(), error = %err, "handler failed");
                }
                self.conn.stream_terminated(id, error.is_none());
                if let Some(mut task) = self.tasks.remove(&id.value()) {
                    if let Some(reply) = task.pending_reply.take() {
                        let _ = reply.send(Err(SendError::StreamClosed));
                    }
                    if let Some(join) = task.join.take() {
                        let _ = join.join();
                    }
                }
            }
        }
    }

    /// Fail a stream's blocked handler interactions. Slots without a
    /// handler thread (pushed streams) are dropped outright.
    fn cancel_task(&mut self, id: StreamId) {
        let mut detached = false;
        if let Some(task) = self.tasks.get_mut(&id.value()) {
            task.body_tx = None;
            if let Some(reply) = task.pending_reply.take() {
                let _ = reply.send(Err(SendError::StreamClosed));
            }
            detached = task.join.is_none();
        }
        if detached {
            self.tasks.remove(&id.value());
        }
    }

    /// Fail every blocked handler interaction; used when the connection
    /// goes away.
    fn abort_tasks(&mut self, error: SendError) {
        for task in self.tasks.values_mut() {
            task.body_tx = None;
            if let Some(reply) = task.pending_reply.take() {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Reader thread: forward raw socket bytes into the connection mailbox.
fn read_loop(mut socket: TcpStream, tx: Sender<ConnMsg>) {
    let mut buf = [0u8; 16384];
    loop {
        match socket.read(&mut buf) {
            Ok(0) => {
                let _ = tx.send(ConnMsg::PeerClosed);
                break;
            }
            Ok(n) => {
                if tx.send(ConnMsg::Io(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(ConnMsg::IoError(e));
                break;
            }
        }
    }
}
