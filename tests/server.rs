//! Loopback end-to-end tests: a real connection task over TCP against a
//! hand-rolled HTTP/2 client.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use h2core::frame::{
    self, DataFrame, ErrorCode, Frame, FrameDecoder, FrameEncoder, HeadersFrame, Setting,
    SettingId, SettingsFrame, StreamId, WindowUpdateFrame,
};
use h2core::hpack::{HeaderField, HpackDecoder};
use h2core::server::{ConnectionDriver, HandlerError, Request, ResponseWriter, ServerConfig};

/// Minimal test client: frame codec plus an inbound frame queue.
struct TestClient {
    socket: TcpStream,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    hpack: HpackDecoder,
    buf: BytesMut,
}

impl TestClient {
    fn connect(addr: std::net::SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).expect("connect");
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("set timeout");
        let mut decoder = FrameDecoder::new();
        decoder.set_max_frame_size(frame::MAX_FRAME_SIZE);
        Self {
            socket,
            encoder: FrameEncoder::new(),
            decoder,
            hpack: HpackDecoder::new(),
            buf: BytesMut::new(),
        }
    }

    fn handshake(&mut self, settings: Vec<Setting>) {
        self.socket
            .write_all(frame::CONNECTION_PREFACE)
            .expect("write preface");
        self.send(&Frame::Settings(SettingsFrame {
            ack: false,
            settings,
        }));
    }

    fn send(&mut self, frame: &Frame) {
        let mut buf = BytesMut::new();
        self.encoder.encode(frame, &mut buf);
        self.socket.write_all(&buf).expect("write frame");
    }

    fn send_request(&mut self, stream_id: u32, end_stream: bool) {
        // :method GET, :scheme https, :path / from the static table.
        self.send(&Frame::Headers(HeadersFrame {
            stream_id: StreamId::new(stream_id),
            end_stream,
            end_headers: true,
            priority: None,
            header_block: Bytes::from_static(&[0x82, 0x87, 0x84]),
        }));
    }

    /// Read frames until `pred` matches one; panics on timeout or EOF.
    fn recv_until(&mut self, pred: impl Fn(&Frame) -> bool) -> Frame {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            while let Some(frame) = self.decoder.decode(&mut self.buf).expect("bad frame") {
                if pred(&frame) {
                    return frame;
                }
            }
            assert!(Instant::now() < deadline, "timed out waiting for frame");

            let mut chunk = [0u8; 16384];
            let n = self.socket.read(&mut chunk).expect("read");
            assert!(n > 0, "connection closed while waiting for frame");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn decode_headers(&mut self, block: &[u8]) -> Vec<HeaderField> {
        self.hpack.decode(block).expect("bad header block")
    }
}

fn spawn_server<H>(handler: H, config: ServerConfig) -> std::net::SocketAddr
where
    H: h2core::server::Handler,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    thread::spawn(move || {
        let (socket, _) = listener.accept().expect("accept");
        let driver = ConnectionDriver::new(handler, config);
        let _ = driver.serve_tcp(socket);
    });
    addr
}

fn hello_handler(_request: Request, response: ResponseWriter) -> Result<(), HandlerError> {
    response.send_headers(
        &[
            HeaderField::new(":status", "200"),
            HeaderField::new("content-type", "text/plain"),
        ],
        false,
    )?;
    response.send_data(&b"hello, h2"[..], true)?;
    Ok(())
}

#[test]
fn get_roundtrip() {
    let addr = spawn_server(
        hello_handler as fn(Request, ResponseWriter) -> Result<(), HandlerError>,
        ServerConfig::default(),
    );

    let mut client = TestClient::connect(addr);
    client.handshake(vec![]);
    client.send_request(1, true);

    let headers = client.recv_until(|f| matches!(f, Frame::Headers(_)));
    let block = match headers {
        Frame::Headers(h) => {
            assert_eq!(h.stream_id.value(), 1);
            assert!(h.end_headers);
            h.header_block
        }
        _ => unreachable!(),
    };
    let decoded = client.decode_headers(&block);
    assert_eq!(decoded[0], HeaderField::new(":status", "200"));

    let data = client.recv_until(|f| matches!(f, Frame::Data(_)));
    match data {
        Frame::Data(d) => {
            assert_eq!(d.data.as_ref(), b"hello, h2");
            assert!(d.end_stream);
        }
        _ => unreachable!(),
    }
}

#[test]
fn post_echo_with_trailers() {
    fn echo(request: Request, response: ResponseWriter) -> Result<(), HandlerError> {
        let (body, _trailers) = request.body.read_to_end();
        response.send_headers(&[HeaderField::new(":status", "200")], false)?;
        response.send_data(body.clone(), false)?;
        response.send_trailers(&[HeaderField::new(
            "x-body-len",
            body.len().to_string(),
        )])?;
        Ok(())
    }

    let addr = spawn_server(
        echo as fn(Request, ResponseWriter) -> Result<(), HandlerError>,
        ServerConfig::default(),
    );

    let mut client = TestClient::connect(addr);
    client.handshake(vec![]);

    // POST / with a body.
    client.send(&Frame::Headers(HeadersFrame {
        stream_id: StreamId::new(1),
        end_stream: false,
        end_headers: true,
        priority: None,
        header_block: Bytes::from_static(&[0x83, 0x87, 0x84]),
    }));
    client.send(&Frame::Data(DataFrame {
        stream_id: StreamId::new(1),
        end_stream: true,
        data: Bytes::from_static(b"echo this"),
        flow_len: 9,
    }));

    // Header blocks must be decoded in wire order: response headers first.
    let headers = client.recv_until(|f| matches!(f, Frame::Headers(_)));
    let block = match headers {
        Frame::Headers(h) => {
            assert!(!h.end_stream);
            h.header_block
        }
        _ => unreachable!(),
    };
    let decoded = client.decode_headers(&block);
    assert_eq!(decoded[0], HeaderField::new(":status", "200"));

    let data = client.recv_until(|f| matches!(f, Frame::Data(_)));
    match data {
        Frame::Data(d) => assert_eq!(d.data.as_ref(), b"echo this"),
        _ => unreachable!(),
    }

    // Trailers arrive as a final HEADERS with END_STREAM.
    let trailers = client.recv_until(
        |f| matches!(f, Frame::Headers(h) if h.end_stream && h.stream_id.value() == 1),
    );
    let block = match trailers {
        Frame::Headers(h) => h.header_block,
        _ => unreachable!(),
    };
    let decoded = client.decode_headers(&block);
    assert!(decoded.contains(&HeaderField::new("x-body-len", "9")));
}

#[test]
fn parked_send_resumes_on_window_update() {
    fn big_body(_request: Request, response: ResponseWriter) -> Result<(), HandlerError> {
        response.send_headers(&[HeaderField::new(":status", "200")], false)?;
        // Larger than the client's tiny stream window; blocks until the
        // client grants credit.
        response.send_data(vec![0x61u8; 2000], true)?;
        Ok(())
    }

    let addr = spawn_server(
        big_body as fn(Request, ResponseWriter) -> Result<(), HandlerError>,
        ServerConfig::default(),
    );

    let mut client = TestClient::connect(addr);
    client.handshake(vec![Setting {
        id: SettingId::InitialWindowSize,
        value: 100,
    }]);
    client.send_request(1, true);

    // First chunk is capped by the 100-byte stream window.
    let mut received = 0usize;
    let first = client.recv_until(|f| matches!(f, Frame::Data(_)));
    if let Frame::Data(d) = first {
        assert!(d.data.len() <= 100);
        assert!(!d.end_stream);
        received += d.data.len();
    }

    // Grant credit until the stream completes.
    loop {
        client.send(&Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: StreamId::new(1),
            increment: 500,
        }));
        let frame = client.recv_until(|f| matches!(f, Frame::Data(_)));
        if let Frame::Data(d) = frame {
            received += d.data.len();
            if d.end_stream {
                break;
            }
        }
    }
    assert_eq!(received, 2000);
}

#[test]
fn idle_client_gets_goaway_timeout() {
    let config = ServerConfig {
        read_timeout: Duration::from_millis(100),
        ..ServerConfig::default()
    };
    let addr = spawn_server(
        hello_handler as fn(Request, ResponseWriter) -> Result<(), HandlerError>,
        config,
    );

    let mut client = TestClient::connect(addr);
    client.handshake(vec![]);

    // Do nothing; the server's read timeout fires.
    let goaway = client.recv_until(|f| matches!(f, Frame::GoAway(_)));
    match goaway {
        Frame::GoAway(g) => {
            assert_eq!(g.error_code, ErrorCode::NoError.to_u32());
            assert_eq!(g.debug_data.as_ref(), b"Client timeout");
        }
        _ => unreachable!(),
    }
}

#[test]
fn malformed_frame_closes_connection_with_goaway() {
    let addr = spawn_server(
        hello_handler as fn(Request, ResponseWriter) -> Result<(), HandlerError>,
        ServerConfig::default(),
    );

    let mut client = TestClient::connect(addr);
    client.handshake(vec![]);

    // PING with 7-byte payload: FRAME_SIZE_ERROR.
    client
        .socket
        .write_all(&[
            0x00, 0x00, 0x07, // Length: 7
            0x06, // Type: PING
            0x00, // Flags
            0x00, 0x00, 0x00, 0x00, // Stream 0
            1, 2, 3, 4, 5, 6, 7,
        ])
        .expect("write");

    let goaway = client.recv_until(|f| matches!(f, Frame::GoAway(_)));
    match goaway {
        Frame::GoAway(g) => {
            assert_eq!(g.error_code, ErrorCode::FrameSizeError.to_u32());
        }
        _ => unreachable!(),
    }
}
