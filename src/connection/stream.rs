//! HTTP/2 stream state tracking and request-header validation.

use std::collections::VecDeque;

use bytes::Bytes;

use super::flow_control::FlowControl;
use crate::frame::StreamId;
use crate::hpack::HeaderField;

/// Stream state (RFC 7540 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Stream has not been used yet.
    Idle,
    /// Reserved by a PUSH_PROMISE we sent.
    ReservedLocal,
    /// Reserved by a PUSH_PROMISE the peer sent. A server never enters this
    /// state; clients cannot push.
    ReservedRemote,
    /// Open (can send and receive).
    Open,
    /// We sent END_STREAM.
    HalfClosedLocal,
    /// Peer sent END_STREAM.
    HalfClosedRemote,
    /// Terminal.
    Closed,
}

/// Outbound data parked behind flow control.
#[derive(Debug)]
pub struct PendingData {
    pub data: Bytes,
    pub end_stream: bool,
}

/// An HTTP/2 stream.
#[derive(Debug)]
pub struct Stream {
    /// Stream identifier.
    id: StreamId,
    /// Current state.
    state: StreamState,
    /// Send-side flow control window (peer's credit to us).
    send_window: FlowControl,
    /// Receive-side flow control window (our credit to the peer).
    recv_window: FlowControl,
    /// Declared request content-length, if any.
    content_length: Option<u64>,
    /// Data octets received so far (padding excluded).
    body_received: u64,
    /// Outbound data waiting for window credit, oldest first.
    pending: VecDeque<PendingData>,
    /// The handler task finished cleanly while sends were still parked.
    handler_done: bool,
    /// We reset this stream ourselves; frames still in flight from the
    /// peer are tolerated silently (RFC 7540 Section 5.1).
    locally_reset: bool,
}

impl Stream {
    /// Create a new idle stream.
    pub fn new(id: StreamId, send_window: u32, recv_window: u32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            send_window: FlowControl::new(send_window),
            recv_window: FlowControl::new(recv_window),
            content_length: None,
            body_received: 0,
            pending: VecDeque::new(),
            handler_done: false,
            locally_reset: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Idle -> Open on the first HEADERS.
    pub fn open(&mut self) {
        if self.state == StreamState::Idle {
            self.state = StreamState::Open;
        }
    }

    /// Idle -> ReservedLocal when we emit PUSH_PROMISE.
    pub fn reserve_local(&mut self) {
        if self.state == StreamState::Idle {
            self.state = StreamState::ReservedLocal;
        }
    }

    /// Whether we may send HEADERS or DATA.
    pub fn can_send(&self) -> bool {
        matches!(
            self.state,
            StreamState::Open | StreamState::HalfClosedRemote | StreamState::ReservedLocal
        )
    }

    /// Whether the peer may send HEADERS or DATA.
    pub fn can_recv(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    pub fn send_window(&mut self) -> &mut FlowControl {
        &mut self.send_window
    }

    pub fn recv_window(&mut self) -> &mut FlowControl {
        &mut self.recv_window
    }

    pub fn send_window_available(&self) -> u32 {
        self.send_window.available()
    }

    /// Record that we sent END_STREAM.
    pub fn send_end_stream(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
    }

    /// Record that we sent response HEADERS on a push stream.
    pub fn sent_push_headers(&mut self) {
        if self.state == StreamState::ReservedLocal {
            self.state = StreamState::HalfClosedRemote;
        }
    }

    /// Record that the peer sent END_STREAM.
    pub fn recv_end_stream(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    /// Mark the stream reset. Parked sends are dropped.
    pub fn reset(&mut self) {
        self.state = StreamState::Closed;
        self.pending.clear();
    }

    /// Mark the stream reset by our own RST_STREAM.
    pub fn reset_local(&mut self) {
        self.reset();
        self.locally_reset = true;
    }

    pub fn locally_reset(&self) -> bool {
        self.locally_reset
    }

    // -- content-length bookkeeping --

    pub fn set_content_length(&mut self, len: Option<u64>) {
        self.content_length = len;
    }

    /// Account received data octets against the declared content-length.
    /// Returns false once the body exceeds the declaration.
    pub fn recv_body_bytes(&mut self, n: usize) -> bool {
        self.body_received = self.body_received.saturating_add(n as u64);
        match self.content_length {
            Some(declared) => self.body_received <= declared,
            None => true,
        }
    }

    /// At END_STREAM: the body must match the declaration exactly.
    pub fn content_length_ok(&self) -> bool {
        match self.content_length {
            Some(declared) => self.body_received == declared,
            None => true,
        }
    }

    // -- parked sends --

    pub fn park(&mut self, data: Bytes, end_stream: bool) {
        self.pending.push_back(PendingData { data, end_stream });
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_front_mut(&mut self) -> Option<&mut PendingData> {
        self.pending.front_mut()
    }

    pub fn pop_pending(&mut self) -> Option<PendingData> {
        self.pending.pop_front()
    }

    pub fn set_handler_done(&mut self) {
        self.handler_done = true;
    }

    pub fn handler_done(&self) -> bool {
        self.handler_done
    }
}

// -- request-header validation (RFC 7540 Section 8.1.2) --

/// Pseudo-header fields extracted from a validated request header list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Vec<u8>,
    pub scheme: Vec<u8>,
    pub path: Vec<u8>,
    pub authority: Option<Vec<u8>>,
    pub content_length: Option<u64>,
}

/// Validate a decoded request header list and extract its pseudo-headers.
///
/// Violations make the request malformed: the caller answers with a stream
/// error of type PROTOCOL_ERROR.
pub fn validate_request(headers: &[HeaderField]) -> Result<RequestHead, &'static str> {
    let mut method = None;
    let mut scheme = None;
    let mut path = None;
    let mut authority = None;
    let mut content_length: Option<u64> = None;
    let mut seen_regular = false;

    for h in headers {
        if h.name.starts_with(b":") {
            if seen_regular {
                return Err("pseudo-header after regular header");
            }
            let slot = match h.name.as_slice() {
                b":method" => &mut method,
                b":scheme" => &mut scheme,
                b":path" => &mut path,
                b":authority" => &mut authority,
                _ => return Err("unknown pseudo-header"),
            };
            if slot.is_some() {
                return Err("duplicate pseudo-header");
            }
            *slot = Some(h.value.clone());
        } else {
            seen_regular = true;
            validate_field_name(&h.name)?;

            match h.name.as_slice() {
                b"connection" | b"keep-alive" | b"proxy-connection" | b"transfer-encoding"
                | b"upgrade" => return Err("connection-specific header"),
                b"te" => {
                    if h.value != b"trailers" {
                        return Err("te header other than trailers");
                    }
                }
                b"content-length" => {
                    let parsed = parse_content_length(&h.value)?;
                    if let Some(existing) = content_length
                        && existing != parsed
                    {
                        return Err("conflicting content-length");
                    }
                    content_length = Some(parsed);
                }
                _ => {}
            }
        }
    }

    let method = method.ok_or(":method missing")?;
    let scheme = scheme.ok_or(":scheme missing")?;
    let path = path.ok_or(":path missing")?;
    if path.is_empty() {
        return Err(":path empty");
    }

    Ok(RequestHead {
        method,
        scheme,
        path,
        authority,
        content_length,
    })
}

/// Validate a trailer header list: no pseudo-headers, lowercase names.
pub fn validate_trailers(headers: &[HeaderField]) -> Result<(), &'static str> {
    for h in headers {
        if h.name.starts_with(b":") {
            return Err("pseudo-header in trailers");
        }
        validate_field_name(&h.name)?;
    }
    Ok(())
}

/// Field names must be non-empty and lowercase on the wire.
fn validate_field_name(name: &[u8]) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty header name");
    }
    if name.iter().any(u8::is_ascii_uppercase) {
        return Err("uppercase header name");
    }
    Ok(())
}

fn parse_content_length(value: &[u8]) -> Result<u64, &'static str> {
    if value.is_empty() {
        return Err("invalid content-length");
    }
    let mut n: u64 = 0;
    for &b in value {
        if !b.is_ascii_digit() {
            return Err("invalid content-length");
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_add(u64::from(b - b'0')))
            .ok_or("invalid content-length")?;
    }
    Ok(n)
}

/// Decoded size of a header list for SETTINGS_MAX_HEADER_LIST_SIZE
/// accounting (RFC 7540 Section 10.5.1).
pub fn header_list_size(headers: &[HeaderField]) -> usize {
    headers.iter().map(HeaderField::size).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, value: &str) -> HeaderField {
        HeaderField::new(name, value)
    }

    fn request_headers() -> Vec<HeaderField> {
        vec![
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":path", "/"),
            field(":authority", "example.com"),
        ]
    }

    #[test]
    fn stream_lifecycle() {
        let mut stream = Stream::new(StreamId::new(1), 65535, 65535);
        assert_eq!(stream.state(), StreamState::Idle);

        stream.open();
        assert_eq!(stream.state(), StreamState::Open);
        assert!(stream.can_send());
        assert!(stream.can_recv());

        stream.recv_end_stream();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);
        assert!(stream.can_send());
        assert!(!stream.can_recv());

        stream.send_end_stream();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(!stream.can_send());
        assert!(!stream.can_recv());
    }

    #[test]
    fn stream_lifecycle_send_first() {
        let mut stream = Stream::new(StreamId::new(1), 65535, 65535);
        stream.open();

        stream.send_end_stream();
        assert_eq!(stream.state(), StreamState::HalfClosedLocal);
        assert!(!stream.can_send());
        assert!(stream.can_recv());

        stream.recv_end_stream();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn push_stream_lifecycle() {
        let mut stream = Stream::new(StreamId::new(2), 65535, 65535);
        stream.reserve_local();
        assert_eq!(stream.state(), StreamState::ReservedLocal);
        assert!(stream.can_send());
        assert!(!stream.can_recv());

        stream.sent_push_headers();
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);

        stream.send_end_stream();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn reset_clears_pending() {
        let mut stream = Stream::new(StreamId::new(1), 65535, 65535);
        stream.open();
        stream.park(Bytes::from_static(b"queued"), true);
        assert!(stream.has_pending());

        stream.reset();
        assert!(stream.is_closed());
        assert!(!stream.has_pending());
    }

    #[test]
    fn content_length_tracking() {
        let mut stream = Stream::new(StreamId::new(1), 65535, 65535);
        stream.open();
        stream.set_content_length(Some(10));

        assert!(stream.recv_body_bytes(6));
        assert!(!stream.content_length_ok());

        assert!(stream.recv_body_bytes(4));
        assert!(stream.content_length_ok());

        assert!(!stream.recv_body_bytes(1));
    }

    #[test]
    fn validate_request_accepts_minimal() {
        let head = validate_request(&request_headers()).unwrap();
        assert_eq!(head.method, b"GET");
        assert_eq!(head.scheme, b"https");
        assert_eq!(head.path, b"/");
        assert_eq!(head.authority.as_deref(), Some(&b"example.com"[..]));
        assert_eq!(head.content_length, None);
    }

    #[test]
    fn validate_request_missing_path() {
        let headers = vec![field(":method", "GET"), field(":scheme", "https")];
        assert!(validate_request(&headers).is_err());
    }

    #[test]
    fn validate_request_empty_path() {
        let headers = vec![
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":path", ""),
        ];
        assert!(validate_request(&headers).is_err());
    }

    #[test]
    fn validate_request_duplicate_method() {
        let mut headers = request_headers();
        headers.push(field(":method", "POST"));
        assert!(validate_request(&headers).is_err());
    }

    #[test]
    fn validate_request_pseudo_after_regular() {
        let headers = vec![
            field(":method", "GET"),
            field(":scheme", "https"),
            field("accept", "*/*"),
            field(":path", "/"),
        ];
        assert!(validate_request(&headers).is_err());
    }

    #[test]
    fn validate_request_unknown_pseudo() {
        let mut headers = request_headers();
        headers.push(field(":protocol", "websocket"));
        assert!(validate_request(&headers).is_err());
    }

    #[test]
    fn validate_request_connection_specific() {
        for name in [
            "connection",
            "keep-alive",
            "proxy-connection",
            "transfer-encoding",
            "upgrade",
        ] {
            let mut headers = request_headers();
            headers.push(field(name, "x"));
            assert!(validate_request(&headers).is_err(), "{name} accepted");
        }
    }

    #[test]
    fn validate_request_te() {
        let mut headers = request_headers();
        headers.push(field("te", "trailers"));
        assert!(validate_request(&headers).is_ok());

        let mut headers = request_headers();
        headers.push(field("te", "gzip"));
        assert!(validate_request(&headers).is_err());
    }

    #[test]
    fn validate_request_uppercase_name() {
        let mut headers = request_headers();
        headers.push(field("X-Custom", "1"));
        assert!(validate_request(&headers).is_err());
    }

    #[test]
    fn validate_request_content_length() {
        let mut headers = request_headers();
        headers.push(field("content-length", "42"));
        let head = validate_request(&headers).unwrap();
        assert_eq!(head.content_length, Some(42));

        let mut headers = request_headers();
        headers.push(field("content-length", "4x"));
        assert!(validate_request(&headers).is_err());

        // Duplicate but consistent declarations are tolerated.
        let mut headers = request_headers();
        headers.push(field("content-length", "7"));
        headers.push(field("content-length", "7"));
        assert!(validate_request(&headers).is_ok());

        let mut headers = request_headers();
        headers.push(field("content-length", "7"));
        headers.push(field("content-length", "8"));
        assert!(validate_request(&headers).is_err());
    }

    #[test]
    fn validate_trailers_rejects_pseudo() {
        assert!(validate_trailers(&[field("grpc-status", "0")]).is_ok());
        assert!(validate_trailers(&[field(":status", "200")]).is_err());
    }

    #[test]
    fn header_list_size_accounting() {
        let headers = vec![field("a", "b")];
        // 1 + 1 + 32
        assert_eq!(header_list_size(&headers), 34);
    }
}
