//! HTTP/2 server connection state machine.
//!
//! `ServerConnection` is the sans-IO core of a connection: bytes from the
//! socket go in through [`ServerConnection::feed_data`], events for the
//! dispatch layer come out of [`ServerConnection::poll_events`], and every
//! outbound byte accumulates in the write buffer exposed through
//! [`ServerConnection::pending_send`]. It owns both HPACK contexts, both
//! connection-level windows, and the stream registry; nothing else touches
//! them.

use bytes::{Bytes, BytesMut};

use crate::frame::{
    self, ContinuationFrame, DataFrame, ErrorCode, Frame, FrameDecoder, FrameEncoder, GoAwayFrame,
    HeadersFrame, PingFrame, PushPromiseFrame, RstStreamFrame, SettingId, SettingsFrame, StreamId,
    WindowUpdateFrame,
};
use crate::hpack::{HeaderField, HpackDecoder, HpackEncoder};

use super::flow_control::FlowControl;
use super::registry::{AdmitError, StreamRegistry};
use super::settings::ConnectionSettings;
use super::stream::{self, RequestHead, StreamState};
use super::SendError;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the 24-byte client preface.
    WaitingPreface,
    /// Preface seen and our SETTINGS queued; waiting for client SETTINGS.
    WaitingSettings,
    /// Connection is open and accepting requests.
    Open,
    /// GOAWAY sent or received; existing streams drain, new ones are refused.
    Draining,
    /// Connection is closed.
    Closed,
}

/// Events produced by the server connection.
#[derive(Debug)]
pub enum ServerEvent {
    /// Settings exchange finished; the connection accepts requests.
    Ready,
    /// A request header block completed on a new stream.
    Request {
        stream_id: StreamId,
        head: RequestHead,
        headers: Vec<HeaderField>,
        end_stream: bool,
    },
    /// Request body data arrived.
    Data {
        stream_id: StreamId,
        data: Bytes,
        end_stream: bool,
    },
    /// A trailer block completed; the request is finished.
    Trailers {
        stream_id: StreamId,
        headers: Vec<HeaderField>,
    },
    /// The peer reset a stream.
    StreamReset {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    /// We reset a stream; RST_STREAM is already queued.
    StreamError {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    /// A parked send finished flushing; the handler task can resume.
    SendUnblocked { stream_id: StreamId },
    /// The peer sent GOAWAY.
    PeerGoAway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
    },
    /// Connection error; GOAWAY is queued and the connection is closed.
    ConnectionError { code: ErrorCode, reason: String },
}

/// Result of a send-side data call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The whole payload was written.
    Sent,
    /// Flow control stopped part or all of the payload; it is parked and
    /// [`ServerEvent::SendUnblocked`] fires once it has drained.
    Parked,
}

/// What an in-flight header block will become once END_HEADERS arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    /// Request headers opening a stream.
    Request,
    /// Trailers ending a stream.
    Trailers,
    /// Block on a refused or closed stream. Still decoded, to keep the
    /// shared HPACK context in wire order, then dropped.
    Discard,
}

/// A header block being assembled from HEADERS + CONTINUATION frames.
#[derive(Debug)]
struct HeaderBlock {
    stream_id: StreamId,
    kind: BlockKind,
    end_stream: bool,
    fragments: BytesMut,
}

/// HTTP/2 server connection.
pub struct ServerConnection {
    /// Connection state.
    state: ConnectionState,
    /// Local settings currently in force (RFC defaults until the peer ACKs).
    local_settings: ConnectionSettings,
    /// Local settings we advertised, pending the peer's ACK.
    advertised_settings: ConnectionSettings,
    /// Whether the peer ACKed our SETTINGS.
    settings_acked: bool,
    /// Settings the peer advertised; in force since receipt.
    remote_settings: ConnectionSettings,
    /// Whether we've received the client's preface.
    got_preface: bool,
    /// Whether we've received the client's initial SETTINGS.
    got_settings: bool,
    /// Frame encoder.
    frame_encoder: FrameEncoder,
    /// Frame decoder.
    frame_decoder: FrameDecoder,
    /// HPACK encoder (outbound header blocks).
    hpack_encoder: HpackEncoder,
    /// HPACK decoder (inbound header blocks, strict wire order).
    hpack_decoder: HpackDecoder,
    /// Live streams.
    registry: StreamRegistry,
    /// Connection-level send window (the peer's credit to us).
    send_window: FlowControl,
    /// Connection-level receive window (our credit to the peer).
    recv_window: FlowControl,
    /// Buffer for incoming data.
    read_buf: BytesMut,
    /// Buffer for outgoing frames.
    write_buf: BytesMut,
    /// Pending events.
    events: Vec<ServerEvent>,
    /// Header block awaiting CONTINUATION frames. While set, no other frame
    /// is legal.
    continuation: Option<HeaderBlock>,
}

impl ServerConnection {
    /// Create a new server connection that will advertise `settings`.
    pub fn new(settings: ConnectionSettings) -> Self {
        // Until the peer ACKs, everything we advertised stays at its RFC
        // default; the knobs that are not negotiated (concurrency cap, push,
        // header list cap) are ours to enforce immediately.
        let local_settings = ConnectionSettings {
            header_table_size: frame::DEFAULT_HEADER_TABLE_SIZE,
            initial_window_size: frame::DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            ..settings
        };

        Self {
            state: ConnectionState::WaitingPreface,
            local_settings,
            advertised_settings: settings,
            settings_acked: false,
            remote_settings: ConnectionSettings::default(),
            got_preface: false,
            got_settings: false,
            frame_encoder: FrameEncoder::new(),
            frame_decoder: FrameDecoder::new(),
            hpack_encoder: HpackEncoder::new(),
            hpack_decoder: HpackDecoder::new(),
            registry: StreamRegistry::new(),
            send_window: FlowControl::new(frame::DEFAULT_INITIAL_WINDOW_SIZE),
            recv_window: FlowControl::new(frame::DEFAULT_INITIAL_WINDOW_SIZE),
            read_buf: BytesMut::with_capacity(16384),
            write_buf: BytesMut::with_capacity(16384),
            events: Vec::new(),
            continuation: None,
        }
    }

    /// Get the connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Check if the connection is ready for requests.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Number of live streams.
    pub fn active_streams(&self) -> usize {
        self.registry.len()
    }

    /// Feed bytes received from the transport and process them.
    pub fn feed_data(&mut self, data: &[u8]) {
        self.read_buf.extend_from_slice(data);
        self.process();
    }

    /// Process buffered bytes: preface first, then complete frames.
    fn process(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }

        if !self.got_preface {
            let preface = frame::CONNECTION_PREFACE;
            let have = self.read_buf.len().min(preface.len());
            if self.read_buf[..have] != preface[..have] {
                self.connection_error(ErrorCode::ProtocolError, "invalid connection preface");
                return;
            }
            if self.read_buf.len() < preface.len() {
                return; // need more data
            }
            let _ = self.read_buf.split_to(preface.len());
            self.got_preface = true;
            self.send_settings();
        }

        loop {
            if self.state == ConnectionState::Closed {
                return;
            }
            match self.frame_decoder.decode(&mut self.read_buf) {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => break, // need more data
                Err(e) => {
                    let reason = e.to_string();
                    self.connection_error(e.error_code(), &reason);
                    break;
                }
            }
        }
    }

    /// Queue our SETTINGS (and a connection WINDOW_UPDATE if configured
    /// larger than the default) in response to a valid preface.
    fn send_settings(&mut self) {
        let frame = SettingsFrame {
            ack: false,
            settings: self.advertised_settings.to_settings_list(),
        };
        self.queue_frame(&Frame::Settings(frame));

        // The connection window starts at 65535 regardless of settings and
        // only WINDOW_UPDATE can grow it.
        let target = self.advertised_settings.initial_window_size;
        if target > frame::DEFAULT_INITIAL_WINDOW_SIZE {
            let diff = target - frame::DEFAULT_INITIAL_WINDOW_SIZE;
            if self.recv_window.increase(diff).is_ok() {
                self.queue_frame(&Frame::WindowUpdate(WindowUpdateFrame {
                    stream_id: StreamId::CONNECTION,
                    increment: diff,
                }));
            }
        }

        self.state = ConnectionState::WaitingSettings;
    }

    /// Handle a received frame.
    fn handle_frame(&mut self, frame: Frame) {
        // An open header block admits nothing but its own CONTINUATION.
        if let Some(expected) = self.continuation.as_ref().map(|b| b.stream_id) {
            match frame {
                Frame::Continuation(f) if f.stream_id == expected => {
                    self.handle_continuation(f);
                }
                _ => {
                    self.connection_error(
                        ErrorCode::ProtocolError,
                        "expected CONTINUATION frame",
                    );
                }
            }
            return;
        }

        // The client preface ends with a SETTINGS frame; nothing else may
        // come first.
        if !self.got_settings && !matches!(&frame, Frame::Settings(f) if !f.ack) {
            self.connection_error(ErrorCode::ProtocolError, "first frame must be SETTINGS");
            return;
        }

        match frame {
            Frame::Settings(f) => self.handle_settings(f),
            Frame::Ping(f) => self.handle_ping(f),
            Frame::GoAway(f) => self.handle_goaway(f),
            Frame::WindowUpdate(f) => self.handle_window_update(f),
            Frame::Headers(f) => self.handle_headers(f),
            Frame::Data(f) => self.handle_data(f),
            Frame::RstStream(f) => self.handle_rst_stream(f),
            Frame::Priority(_) => {} // parsed and ignored
            Frame::PushPromise(_) => {
                self.connection_error(ErrorCode::ProtocolError, "PUSH_PROMISE from client");
            }
            Frame::Continuation(_) => {
                self.connection_error(ErrorCode::ProtocolError, "CONTINUATION without HEADERS");
            }
            Frame::Unknown(_) => {} // ignored per RFC 7540 Section 5.5
        }
    }

    /// Handle SETTINGS frame.
    fn handle_settings(&mut self, frame: SettingsFrame) {
        if frame.ack {
            if !self.settings_acked {
                self.settings_acked = true;
                self.apply_advertised_settings();
            }
            return;
        }

        for setting in &frame.settings {
            let value = setting.value;
            match setting.id {
                SettingId::HeaderTableSize => {
                    self.remote_settings.header_table_size = value;
                    self.hpack_encoder.set_table_size(value as usize);
                }
                SettingId::EnablePush => {
                    self.remote_settings.enable_push = value == 1;
                }
                SettingId::MaxConcurrentStreams => {
                    self.remote_settings.max_concurrent_streams = value;
                }
                SettingId::InitialWindowSize => {
                    let delta =
                        i64::from(value) - i64::from(self.remote_settings.initial_window_size);
                    self.remote_settings.initial_window_size = value;
                    if self.registry.apply_send_window_delta(delta).is_err() {
                        self.connection_error(
                            ErrorCode::FlowControlError,
                            "initial window size overflow",
                        );
                        return;
                    }
                }
                SettingId::MaxFrameSize => {
                    self.remote_settings.max_frame_size = value;
                    self.frame_encoder.set_max_frame_size(value);
                }
                SettingId::MaxHeaderListSize => {
                    self.remote_settings.max_header_list_size = value;
                }
                SettingId::Unknown(_) => {} // ignored
            }
        }

        self.queue_frame(&Frame::Settings(SettingsFrame {
            ack: true,
            settings: Vec::new(),
        }));

        if !self.got_settings {
            self.got_settings = true;
            self.state = ConnectionState::Open;
            self.events.push(ServerEvent::Ready);
        }

        // A raised initial window may have freed parked sends.
        self.drain_parked();
    }

    /// The peer ACKed our SETTINGS: what we advertised is now in force.
    fn apply_advertised_settings(&mut self) {
        let delta = i64::from(self.advertised_settings.initial_window_size)
            - i64::from(self.local_settings.initial_window_size);
        if delta != 0 && self.registry.apply_recv_window_delta(delta).is_err() {
            self.connection_error(ErrorCode::InternalError, "local window adjustment overflow");
            return;
        }

        self.hpack_decoder
            .set_max_table_size(self.advertised_settings.header_table_size as usize);
        self.frame_decoder
            .set_max_frame_size(self.advertised_settings.max_frame_size);
        self.local_settings = self.advertised_settings;
    }

    /// Handle PING frame.
    fn handle_ping(&mut self, frame: PingFrame) {
        if frame.ack {
            return;
        }
        self.queue_frame(&Frame::Ping(PingFrame {
            ack: true,
            data: frame.data,
        }));
    }

    /// Handle GOAWAY frame. New pushes stop; in-flight client streams
    /// drain; pushed streams the peer will not process are refused.
    fn handle_goaway(&mut self, frame: GoAwayFrame) {
        if self.state == ConnectionState::Open {
            self.state = ConnectionState::Draining;
        }

        // Pushed streams above the peer's last processed id will never be
        // acted on; reset them as safely retryable and retire them.
        let last = frame.last_stream_id.value();
        for id in self.registry.ids() {
            if !id.is_server_initiated() || id.value() <= last {
                continue;
            }
            let closed = match self.registry.get(id) {
                Some(stream) => stream.is_closed(),
                None => continue,
            };
            if !closed {
                self.stream_error(id, ErrorCode::RefusedStream);
            }
            self.registry.remove(id);
        }

        self.events.push(ServerEvent::PeerGoAway {
            last_stream_id: frame.last_stream_id,
            error_code: ErrorCode::from_u32(frame.error_code),
        });
    }

    /// Handle WINDOW_UPDATE frame.
    fn handle_window_update(&mut self, frame: WindowUpdateFrame) {
        if frame.stream_id.is_connection_level() {
            if frame.increment == 0 {
                self.connection_error(ErrorCode::ProtocolError, "WINDOW_UPDATE with 0 increment");
                return;
            }
            if self.send_window.increase(frame.increment).is_err() {
                self.connection_error(ErrorCode::ProtocolError, "connection window overflow");
                return;
            }
            self.drain_parked();
            return;
        }

        if self.is_idle(frame.stream_id) {
            self.connection_error(ErrorCode::ProtocolError, "WINDOW_UPDATE on idle stream");
            return;
        }

        enum Outcome {
            Ignore,
            ZeroIncrement,
            Overflow,
            Grown,
        }

        let outcome = match self.registry.get_mut(frame.stream_id) {
            None => Outcome::Ignore,
            Some(stream) if stream.is_closed() => Outcome::Ignore,
            Some(_) if frame.increment == 0 => Outcome::ZeroIncrement,
            Some(stream) => {
                if stream.send_window().increase(frame.increment).is_ok() {
                    Outcome::Grown
                } else {
                    Outcome::Overflow
                }
            }
        };

        match outcome {
            Outcome::Ignore => {}
            Outcome::ZeroIncrement => {
                self.stream_error(frame.stream_id, ErrorCode::ProtocolError);
            }
            Outcome::Overflow => {
                self.stream_error(frame.stream_id, ErrorCode::FlowControlError);
            }
            Outcome::Grown => self.drain_stream(frame.stream_id),
        }
    }

    /// Handle HEADERS frame: a new request, trailers, or a block on a dead
    /// stream that still has to pass through the HPACK decoder.
    fn handle_headers(&mut self, frame: HeadersFrame) {
        let id = frame.stream_id;

        if !id.is_client_initiated() {
            self.connection_error(ErrorCode::ProtocolError, "HEADERS on even stream id");
            return;
        }

        let kind = match self.registry.get(id).map(|s| (s.state(), s.locally_reset())) {
            Some((StreamState::Open, _)) | Some((StreamState::HalfClosedLocal, _)) => {
                // A second header block is trailers and must end the stream.
                if !frame.end_stream {
                    self.connection_error(
                        ErrorCode::ProtocolError,
                        "trailers without END_STREAM",
                    );
                    return;
                }
                BlockKind::Trailers
            }
            // In flight when our RST_STREAM crossed it; tolerated silently.
            Some((StreamState::Closed, true)) => BlockKind::Discard,
            Some((StreamState::HalfClosedRemote, _)) | Some((StreamState::Closed, false)) => {
                self.stream_error(id, ErrorCode::StreamClosed);
                BlockKind::Discard
            }
            Some(_) => {
                self.connection_error(ErrorCode::ProtocolError, "HEADERS in invalid stream state");
                return;
            }
            None if !self.registry.is_idle_client_id(id) => {
                // Closed and retired; tolerated but answered with RST.
                self.stream_error(id, ErrorCode::StreamClosed);
                BlockKind::Discard
            }
            None => {
                let max_concurrent = self.local_settings.max_concurrent_streams;
                let send_window = self.remote_settings.initial_window_size;
                let recv_window = self.local_settings.initial_window_size;
                match self
                    .registry
                    .admit_client(id, max_concurrent, send_window, recv_window)
                {
                    Ok(_) => BlockKind::Request,
                    Err(AdmitError::NotMonotonic) => {
                        self.connection_error(
                            ErrorCode::ProtocolError,
                            "stream id not greater than previous",
                        );
                        return;
                    }
                    Err(AdmitError::Refused) | Err(AdmitError::Exhausted) => {
                        self.stream_error(id, ErrorCode::RefusedStream);
                        BlockKind::Discard
                    }
                }
            }
        };

        let block = HeaderBlock {
            stream_id: id,
            kind,
            end_stream: frame.end_stream,
            fragments: BytesMut::from(&frame.header_block[..]),
        };

        if frame.end_headers {
            self.finish_header_block(block);
        } else {
            self.continuation = Some(block);
        }
    }

    /// Handle CONTINUATION for the open header block.
    fn handle_continuation(&mut self, frame: ContinuationFrame) {
        let Some(mut block) = self.continuation.take() else {
            self.connection_error(ErrorCode::ProtocolError, "CONTINUATION without HEADERS");
            return;
        };

        block.fragments.extend_from_slice(&frame.header_block);

        if frame.end_headers {
            self.finish_header_block(block);
        } else {
            self.continuation = Some(block);
        }
    }

    /// Decode a complete header block and act on it. Decoding always runs,
    /// even for discarded blocks: the compression context is shared and
    /// strictly ordered.
    fn finish_header_block(&mut self, block: HeaderBlock) {
        let headers = match self.hpack_decoder.decode(&block.fragments) {
            Ok(h) => h,
            Err(e) => {
                let reason = e.to_string();
                self.connection_error(ErrorCode::CompressionError, &reason);
                return;
            }
        };

        match block.kind {
            BlockKind::Discard => {}
            BlockKind::Request => self.finish_request(block.stream_id, headers, block.end_stream),
            BlockKind::Trailers => self.finish_trailers(block.stream_id, headers),
        }
    }

    /// Validate a completed request header block and surface the request.
    fn finish_request(&mut self, id: StreamId, headers: Vec<HeaderField>, end_stream: bool) {
        if stream::header_list_size(&headers)
            > self.local_settings.max_header_list_size as usize
        {
            self.stream_error(id, ErrorCode::ProtocolError);
            return;
        }

        let head = match stream::validate_request(&headers) {
            Ok(head) => head,
            Err(_) => {
                // Malformed request (RFC 7540 Section 8.1.2.6).
                self.stream_error(id, ErrorCode::ProtocolError);
                return;
            }
        };

        let mut length_mismatch = false;
        if let Some(stream) = self.registry.get_mut(id) {
            stream.set_content_length(head.content_length);
            if end_stream {
                stream.recv_end_stream();
                length_mismatch = !stream.content_length_ok();
            }
        }
        if length_mismatch {
            self.stream_error(id, ErrorCode::ProtocolError);
            return;
        }

        self.events.push(ServerEvent::Request {
            stream_id: id,
            head,
            headers,
            end_stream,
        });
    }

    /// Validate a completed trailer block and surface it.
    fn finish_trailers(&mut self, id: StreamId, headers: Vec<HeaderField>) {
        if stream::validate_trailers(&headers).is_err() {
            self.stream_error(id, ErrorCode::ProtocolError);
            return;
        }

        let mut length_mismatch = false;
        if let Some(stream) = self.registry.get_mut(id) {
            stream.recv_end_stream();
            length_mismatch = !stream.content_length_ok();
        }
        if length_mismatch {
            self.stream_error(id, ErrorCode::ProtocolError);
            return;
        }

        self.events.push(ServerEvent::Trailers {
            stream_id: id,
            headers,
        });
    }

    /// Handle DATA frame.
    fn handle_data(&mut self, frame: DataFrame) {
        let id = frame.stream_id;

        if self.is_idle(id) {
            self.connection_error(ErrorCode::ProtocolError, "DATA on idle stream");
            return;
        }

        // The connection window is debited first, padding included, no
        // matter what happens to the stream.
        if self.recv_window.consume(frame.flow_len).is_err() {
            self.connection_error(
                ErrorCode::FlowControlError,
                "connection flow control window exceeded",
            );
            return;
        }

        enum Outcome {
            Deliver,
            Tolerate,
            StreamError(ErrorCode),
        }

        let mut stream_update = None;
        let outcome = match self.registry.get_mut(id) {
            Some(stream) if !stream.can_recv() && stream.locally_reset() => Outcome::Tolerate,
            Some(stream) if stream.can_recv() => {
                if stream.recv_window().consume(frame.flow_len).is_err() {
                    Outcome::StreamError(ErrorCode::FlowControlError)
                } else if !stream.recv_body_bytes(frame.data.len()) {
                    Outcome::StreamError(ErrorCode::ProtocolError)
                } else if frame.end_stream {
                    stream.recv_end_stream();
                    if stream.content_length_ok() {
                        Outcome::Deliver
                    } else {
                        Outcome::StreamError(ErrorCode::ProtocolError)
                    }
                } else {
                    if stream.recv_window().should_update() {
                        stream_update = Some(stream.recv_window().take_update());
                    }
                    Outcome::Deliver
                }
            }
            _ => Outcome::StreamError(ErrorCode::StreamClosed),
        };

        if let Some(increment) = stream_update {
            self.queue_frame(&Frame::WindowUpdate(WindowUpdateFrame {
                stream_id: id,
                increment,
            }));
        }

        // Replenish the connection window on the same threshold scheme.
        if self.recv_window.should_update() {
            let increment = self.recv_window.take_update();
            self.queue_frame(&Frame::WindowUpdate(WindowUpdateFrame {
                stream_id: StreamId::CONNECTION,
                increment,
            }));
        }

        match outcome {
            Outcome::Deliver => self.events.push(ServerEvent::Data {
                stream_id: id,
                data: frame.data,
                end_stream: frame.end_stream,
            }),
            Outcome::Tolerate => {}
            Outcome::StreamError(code) => self.stream_error(id, code),
        }
    }

    /// Handle RST_STREAM frame.
    fn handle_rst_stream(&mut self, frame: RstStreamFrame) {
        let id = frame.stream_id;

        if self.is_idle(id) {
            self.connection_error(ErrorCode::ProtocolError, "RST_STREAM on idle stream");
            return;
        }

        let Some(stream) = self.registry.get_mut(id) else {
            return; // closed and retired: tolerated
        };
        if stream.is_closed() {
            return;
        }
        stream.reset();

        self.events.push(ServerEvent::StreamReset {
            stream_id: id,
            error_code: ErrorCode::from_u32(frame.error_code),
        });

        // Pushed streams have no handler task whose exit would retire them.
        if id.is_server_initiated() {
            self.registry.remove(id);
        }
    }

    /// Whether a stream id refers to a stream in idle state.
    fn is_idle(&self, id: StreamId) -> bool {
        if id.is_client_initiated() {
            self.registry.is_idle_client_id(id)
        } else {
            self.registry.is_idle_server_id(id)
        }
    }

    // -- send-side API, called by the dispatch layer on behalf of handlers --

    /// HPACK-encode a header list and queue it as HEADERS + CONTINUATION
    /// frames. Header blocks are never interleaved: the whole block is
    /// queued back-to-back in one call.
    pub fn send_headers(
        &mut self,
        id: StreamId,
        headers: &[HeaderField],
        end_stream: bool,
    ) -> Result<(), SendError> {
        if self.state == ConnectionState::Closed {
            return Err(SendError::ConnectionClosed);
        }
        let Some(stream) = self.registry.get_mut(id) else {
            return Err(SendError::StreamClosed);
        };
        if stream.is_closed() {
            return Err(SendError::StreamClosed);
        }
        if !stream.can_send() {
            return Err(SendError::InvalidState);
        }
        let was_reserved = stream.state() == StreamState::ReservedLocal;

        let mut block = Vec::new();
        self.hpack_encoder.encode(headers, &mut block);
        let mut block = Bytes::from(block);

        let max = self.remote_settings.max_frame_size as usize;
        let first = block.split_to(block.len().min(max));
        let end_headers = block.is_empty();
        self.frame_encoder.encode(
            &Frame::Headers(HeadersFrame {
                stream_id: id,
                end_stream,
                end_headers,
                priority: None,
                header_block: first,
            }),
            &mut self.write_buf,
        );
        while !block.is_empty() {
            let fragment = block.split_to(block.len().min(max));
            self.frame_encoder.encode(
                &Frame::Continuation(ContinuationFrame {
                    stream_id: id,
                    end_headers: block.is_empty(),
                    header_block: fragment,
                }),
                &mut self.write_buf,
            );
        }

        if was_reserved {
            stream.sent_push_headers();
        }
        if end_stream {
            stream.send_end_stream();
        }
        self.retire_pushed(id);
        Ok(())
    }

    /// Queue body data under flow control.
    ///
    /// Writes `min(connection window, stream window, max frame size)` at a
    /// time. A payload that does not fully fit is parked on the stream;
    /// [`ServerEvent::SendUnblocked`] fires when the remainder has flushed.
    pub fn send_data(
        &mut self,
        id: StreamId,
        data: Bytes,
        end_stream: bool,
    ) -> Result<SendOutcome, SendError> {
        if self.state == ConnectionState::Closed {
            return Err(SendError::ConnectionClosed);
        }
        let Some(stream) = self.registry.get_mut(id) else {
            return Err(SendError::StreamClosed);
        };
        if stream.is_closed() {
            return Err(SendError::StreamClosed);
        }
        if !stream.can_send() || stream.state() == StreamState::ReservedLocal {
            return Err(SendError::InvalidState);
        }

        // Order within the stream is sacred: anything already parked means
        // this payload queues behind it.
        if stream.has_pending() {
            stream.park(data, end_stream);
            return Ok(SendOutcome::Parked);
        }

        // Zero-length frames are not subject to flow control.
        if data.is_empty() {
            self.frame_encoder.encode(
                &Frame::Data(DataFrame {
                    stream_id: id,
                    end_stream,
                    data,
                    flow_len: 0,
                }),
                &mut self.write_buf,
            );
            if end_stream {
                stream.send_end_stream();
            }
            self.retire_pushed(id);
            return Ok(SendOutcome::Sent);
        }

        let mut data = data;
        let max_frame = self.remote_settings.max_frame_size;
        while !data.is_empty() {
            let budget = self
                .send_window
                .available()
                .min(stream.send_window_available())
                .min(max_frame) as usize;
            if budget == 0 {
                stream.park(data, end_stream);
                return Ok(SendOutcome::Parked);
            }

            let chunk_len = data.len().min(budget);
            let chunk = data.split_to(chunk_len);
            let last = data.is_empty();

            self.send_window.debit(chunk_len as u32);
            stream.send_window().debit(chunk_len as u32);

            self.frame_encoder.encode(
                &Frame::Data(DataFrame {
                    stream_id: id,
                    end_stream: last && end_stream,
                    data: chunk,
                    flow_len: chunk_len as u32,
                }),
                &mut self.write_buf,
            );
        }

        if end_stream {
            stream.send_end_stream();
        }
        self.retire_pushed(id);
        Ok(SendOutcome::Sent)
    }

    /// Reserve a push stream and queue PUSH_PROMISE on its parent.
    ///
    /// Allowed only while the connection is open, push is enabled on both
    /// sides, and the parent is a live client stream.
    pub fn send_push(
        &mut self,
        parent: StreamId,
        headers: &[HeaderField],
    ) -> Result<StreamId, SendError> {
        match self.state {
            ConnectionState::Closed => return Err(SendError::ConnectionClosed),
            ConnectionState::Open => {}
            _ => return Err(SendError::InvalidState),
        }
        if !self.local_settings.enable_push || !self.remote_settings.enable_push {
            return Err(SendError::InvalidState);
        }
        if self.registry.active_server_count()
            >= self.remote_settings.max_concurrent_streams as usize
        {
            return Err(SendError::InvalidState);
        }

        let Some(parent_stream) = self.registry.get(parent) else {
            return Err(SendError::StreamClosed);
        };
        if !parent_stream.id().is_client_initiated() || !parent_stream.can_send() {
            return Err(SendError::InvalidState);
        }

        let promised = self.registry.reserve_push(
            self.remote_settings.initial_window_size,
            self.local_settings.initial_window_size,
        );

        let mut block = Vec::new();
        self.hpack_encoder.encode(headers, &mut block);
        let mut block = Bytes::from(block);

        let max = (self.remote_settings.max_frame_size as usize).saturating_sub(4).max(1);
        let first = block.split_to(block.len().min(max));
        let end_headers = block.is_empty();
        self.frame_encoder.encode(
            &Frame::PushPromise(PushPromiseFrame {
                stream_id: parent,
                end_headers,
                promised_stream_id: promised,
                header_block: first,
            }),
            &mut self.write_buf,
        );
        while !block.is_empty() {
            let fragment = block.split_to(block.len().min(max));
            self.frame_encoder.encode(
                &Frame::Continuation(ContinuationFrame {
                    stream_id: parent,
                    end_headers: block.is_empty(),
                    header_block: fragment,
                }),
                &mut self.write_buf,
            );
        }

        Ok(promised)
    }

    /// Reset a stream from the dispatch layer (handler abort, cancellation).
    pub fn reset_stream(&mut self, id: StreamId, code: ErrorCode) {
        let Some(stream) = self.registry.get_mut(id) else {
            return;
        };
        if stream.is_closed() {
            return;
        }
        stream.reset_local();
        self.queue_frame(&Frame::RstStream(RstStreamFrame {
            stream_id: id,
            error_code: code.to_u32(),
        }));
        if id.is_server_initiated() {
            self.registry.remove(id);
        }
    }

    /// The handler task for a stream exited.
    ///
    /// A failed handler resets the stream with INTERNAL_ERROR. A clean exit
    /// on a stream that never ended gets RST_STREAM(NO_ERROR) once any
    /// parked sends have flushed. The stream is retired either way.
    pub fn stream_terminated(&mut self, id: StreamId, clean: bool) {
        let Some(stream) = self.registry.get_mut(id) else {
            return;
        };

        if !clean {
            let was_closed = stream.is_closed();
            stream.reset();
            if !was_closed {
                self.queue_frame(&Frame::RstStream(RstStreamFrame {
                    stream_id: id,
                    error_code: ErrorCode::InternalError.to_u32(),
                }));
            }
            self.registry.remove(id);
            return;
        }

        if stream.has_pending() {
            // Retired once the parked sends drain.
            stream.set_handler_done();
            return;
        }

        if !stream.is_closed() {
            stream.reset();
            self.queue_frame(&Frame::RstStream(RstStreamFrame {
                stream_id: id,
                error_code: ErrorCode::NoError.to_u32(),
            }));
        }
        self.registry.remove(id);
    }

    /// Send GOAWAY and stop accepting new streams. With NO_ERROR the
    /// connection drains; any other code closes it.
    pub fn send_goaway(&mut self, code: ErrorCode, debug_data: &[u8]) {
        if matches!(self.state, ConnectionState::Closed) {
            return;
        }
        let last = StreamId::new(self.registry.max_client_id());
        self.queue_frame(&Frame::GoAway(GoAwayFrame {
            last_stream_id: last,
            error_code: code.to_u32(),
            debug_data: Bytes::copy_from_slice(debug_data),
        }));
        self.registry.set_cutoff(last);
        self.state = if code == ErrorCode::NoError {
            ConnectionState::Draining
        } else {
            ConnectionState::Closed
        };
    }

    // -- error plumbing --

    /// Stream error: queue RST_STREAM, close the stream, keep the
    /// connection.
    fn stream_error(&mut self, id: StreamId, code: ErrorCode) {
        self.queue_frame(&Frame::RstStream(RstStreamFrame {
            stream_id: id,
            error_code: code.to_u32(),
        }));
        if let Some(stream) = self.registry.get_mut(id) {
            stream.reset_local();
        }
        self.events.push(ServerEvent::StreamError {
            stream_id: id,
            error_code: code,
        });
    }

    /// Connection error: queue GOAWAY with the last processed client stream
    /// id, close everything.
    fn connection_error(&mut self, code: ErrorCode, reason: &str) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.queue_frame(&Frame::GoAway(GoAwayFrame {
            last_stream_id: StreamId::new(self.registry.max_client_id()),
            error_code: code.to_u32(),
            debug_data: Bytes::copy_from_slice(reason.as_bytes()),
        }));
        self.state = ConnectionState::Closed;
        self.continuation = None;
        for id in self.registry.ids() {
            if let Some(stream) = self.registry.get_mut(id) {
                stream.reset();
            }
        }
        self.events.push(ServerEvent::ConnectionError {
            code,
            reason: reason.to_string(),
        });
    }

    // -- parked-send draining --

    /// Drain parked sends across all streams, in stream-id order, while the
    /// connection window lasts.
    fn drain_parked(&mut self) {
        for id in self.registry.ids_with_pending() {
            if self.send_window.available() == 0 {
                break;
            }
            self.drain_stream(id);
        }
    }

    /// Drain one stream's parked sends as far as its windows allow.
    fn drain_stream(&mut self, id: StreamId) {
        let max_frame = self.remote_settings.max_frame_size;
        let mut flushed = false;

        loop {
            let Some(stream) = self.registry.get_mut(id) else {
                return;
            };
            if !stream.has_pending() {
                break;
            }

            let budget = self
                .send_window
                .available()
                .min(stream.send_window_available())
                .min(max_frame) as usize;
            if budget == 0 {
                return; // still parked
            }

            let Some(front) = stream.pending_front_mut() else {
                break;
            };
            let chunk_len = front.data.len().min(budget);
            let chunk = front.data.split_to(chunk_len);
            let item_done = front.data.is_empty();
            let end = item_done && front.end_stream;

            self.send_window.debit(chunk_len as u32);
            stream.send_window().debit(chunk_len as u32);

            self.frame_encoder.encode(
                &Frame::Data(DataFrame {
                    stream_id: id,
                    end_stream: end,
                    data: chunk,
                    flow_len: chunk_len as u32,
                }),
                &mut self.write_buf,
            );

            if item_done {
                stream.pop_pending();
                if end {
                    stream.send_end_stream();
                }
                if !stream.has_pending() {
                    flushed = true;
                    break;
                }
            }
        }

        if flushed {
            self.events.push(ServerEvent::SendUnblocked { stream_id: id });
            self.finish_drained_stream(id);
        }
    }

    /// A stream whose parked queue just emptied: retire it if nothing will
    /// come back for it.
    fn finish_drained_stream(&mut self, id: StreamId) {
        // Pushed streams have no handler task; closing is all it takes.
        if id.is_server_initiated() {
            self.retire_pushed(id);
            return;
        }

        let Some(stream) = self.registry.get_mut(id) else {
            return;
        };
        if !stream.handler_done() {
            return;
        }
        if !stream.is_closed() {
            stream.reset();
            self.queue_frame(&Frame::RstStream(RstStreamFrame {
                stream_id: id,
                error_code: ErrorCode::NoError.to_u32(),
            }));
        }
        self.registry.remove(id);
    }

    /// Retire a pushed stream once it is closed with nothing left to
    /// flush. Pushed streams never get a `stream_terminated` call.
    fn retire_pushed(&mut self, id: StreamId) {
        if !id.is_server_initiated() {
            return;
        }
        let done = self
            .registry
            .get(id)
            .is_some_and(|s| s.is_closed() && !s.has_pending());
        if done {
            self.registry.remove(id);
        }
    }

    // -- outbound buffer --

    fn queue_frame(&mut self, frame: &Frame) {
        self.frame_encoder.encode(frame, &mut self.write_buf);
    }

    /// Get pending events.
    pub fn poll_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Get data to send to the client.
    pub fn pending_send(&self) -> &[u8] {
        &self.write_buf
    }

    /// Mark data as sent.
    pub fn advance_send(&mut self, n: usize) {
        let _ = self.write_buf.split_to(n);
    }

    /// Check if there's data to send.
    pub fn has_pending_send(&self) -> bool {
        !self.write_buf.is_empty()
    }
}
