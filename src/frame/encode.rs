//! HTTP/2 frame encoding.

use bytes::{BufMut, BytesMut};

use super::types::*;
use super::{FRAME_HEADER_SIZE, flags};

/// Frame encoder that writes HTTP/2 frames to a byte buffer.
pub struct FrameEncoder {
    max_frame_size: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    /// Create a new frame encoder with default settings.
    pub fn new() -> Self {
        Self {
            max_frame_size: super::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the maximum frame size (SETTINGS_MAX_FRAME_SIZE the peer advertised).
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Get the maximum frame size.
    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Encode a frame to the buffer.
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) {
        match frame {
            Frame::Data(f) => self.encode_data(f, buf),
            Frame::Headers(f) => self.encode_headers(f, buf),
            Frame::Priority(f) => self.encode_priority(f, buf),
            Frame::RstStream(f) => self.encode_rst_stream(f, buf),
            Frame::Settings(f) => self.encode_settings(f, buf),
            Frame::PushPromise(f) => self.encode_push_promise(f, buf),
            Frame::Ping(f) => self.encode_ping(f, buf),
            Frame::GoAway(f) => self.encode_goaway(f, buf),
            Frame::WindowUpdate(f) => self.encode_window_update(f, buf),
            Frame::Continuation(f) => self.encode_continuation(f, buf),
            Frame::Unknown(f) => self.encode_unknown(f, buf),
        }
    }

    /// Write a frame header to the buffer.
    #[inline]
    fn write_header(
        &self,
        buf: &mut BytesMut,
        length: u32,
        frame_type: FrameType,
        flags: u8,
        stream_id: StreamId,
    ) {
        // Length (24 bits, big-endian)
        buf.put_u8((length >> 16) as u8);
        buf.put_u8((length >> 8) as u8);
        buf.put_u8(length as u8);

        // Type
        buf.put_u8(frame_type as u8);

        // Flags
        buf.put_u8(flags);

        // Stream ID (31 bits, big-endian, reserved bit zero on send)
        buf.put_u32(stream_id.value() & 0x7FFF_FFFF);
    }

    /// Encode a DATA frame. Outbound DATA is never padded.
    fn encode_data(&self, frame: &DataFrame, buf: &mut BytesMut) {
        let mut frame_flags = 0u8;
        if frame.end_stream {
            frame_flags |= flags::END_STREAM;
        }

        let length = frame.data.len() as u32;
        buf.reserve(FRAME_HEADER_SIZE + length as usize);

        self.write_header(buf, length, FrameType::Data, frame_flags, frame.stream_id);
        buf.extend_from_slice(&frame.data);
    }

    /// Encode a HEADERS frame.
    fn encode_headers(&self, frame: &HeadersFrame, buf: &mut BytesMut) {
        let mut frame_flags = 0u8;
        if frame.end_stream {
            frame_flags |= flags::END_STREAM;
        }
        if frame.end_headers {
            frame_flags |= flags::END_HEADERS;
        }
        if frame.priority.is_some() {
            frame_flags |= flags::PRIORITY;
        }

        let priority_len = if frame.priority.is_some() { 5 } else { 0 };
        let length = priority_len + frame.header_block.len() as u32;

        buf.reserve(FRAME_HEADER_SIZE + length as usize);

        self.write_header(
            buf,
            length,
            FrameType::Headers,
            frame_flags,
            frame.stream_id,
        );

        if let Some(priority) = &frame.priority {
            let mut dep = priority.dependency.value();
            if priority.exclusive {
                dep |= 0x8000_0000;
            }
            buf.put_u32(dep);
            buf.put_u8(priority.weight);
        }

        buf.extend_from_slice(&frame.header_block);
    }

    /// Encode a PRIORITY frame.
    fn encode_priority(&self, frame: &PriorityFrame, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE + 5);

        self.write_header(buf, 5, FrameType::Priority, 0, frame.stream_id);

        let mut dep = frame.priority.dependency.value();
        if frame.priority.exclusive {
            dep |= 0x8000_0000;
        }
        buf.put_u32(dep);
        buf.put_u8(frame.priority.weight);
    }

    /// Encode a RST_STREAM frame.
    fn encode_rst_stream(&self, frame: &RstStreamFrame, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE + 4);

        self.write_header(buf, 4, FrameType::RstStream, 0, frame.stream_id);
        buf.put_u32(frame.error_code);
    }

    /// Encode a SETTINGS frame.
    fn encode_settings(&self, frame: &SettingsFrame, buf: &mut BytesMut) {
        let frame_flags = if frame.ack { flags::ACK } else { 0 };
        let length = if frame.ack {
            0
        } else {
            (frame.settings.len() * 6) as u32
        };

        buf.reserve(FRAME_HEADER_SIZE + length as usize);

        self.write_header(
            buf,
            length,
            FrameType::Settings,
            frame_flags,
            StreamId::CONNECTION,
        );

        if !frame.ack {
            for setting in &frame.settings {
                buf.put_u16(setting.id.to_u16());
                buf.put_u32(setting.value);
            }
        }
    }

    /// Encode a PUSH_PROMISE frame.
    fn encode_push_promise(&self, frame: &PushPromiseFrame, buf: &mut BytesMut) {
        let mut frame_flags = 0u8;
        if frame.end_headers {
            frame_flags |= flags::END_HEADERS;
        }

        let length = 4 + frame.header_block.len() as u32;

        buf.reserve(FRAME_HEADER_SIZE + length as usize);

        self.write_header(
            buf,
            length,
            FrameType::PushPromise,
            frame_flags,
            frame.stream_id,
        );

        buf.put_u32(frame.promised_stream_id.value() & 0x7FFF_FFFF);
        buf.extend_from_slice(&frame.header_block);
    }

    /// Encode a PING frame.
    fn encode_ping(&self, frame: &PingFrame, buf: &mut BytesMut) {
        let frame_flags = if frame.ack { flags::ACK } else { 0 };

        buf.reserve(FRAME_HEADER_SIZE + 8);

        self.write_header(buf, 8, FrameType::Ping, frame_flags, StreamId::CONNECTION);
        buf.extend_from_slice(&frame.data);
    }

    /// Encode a GOAWAY frame.
    fn encode_goaway(&self, frame: &GoAwayFrame, buf: &mut BytesMut) {
        let length = 8 + frame.debug_data.len() as u32;

        buf.reserve(FRAME_HEADER_SIZE + length as usize);

        self.write_header(buf, length, FrameType::GoAway, 0, StreamId::CONNECTION);

        buf.put_u32(frame.last_stream_id.value() & 0x7FFF_FFFF);
        buf.put_u32(frame.error_code);
        buf.extend_from_slice(&frame.debug_data);
    }

    /// Encode a WINDOW_UPDATE frame.
    fn encode_window_update(&self, frame: &WindowUpdateFrame, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE + 4);

        self.write_header(buf, 4, FrameType::WindowUpdate, 0, frame.stream_id);
        buf.put_u32(frame.increment & 0x7FFF_FFFF);
    }

    /// Encode a CONTINUATION frame.
    fn encode_continuation(&self, frame: &ContinuationFrame, buf: &mut BytesMut) {
        let mut frame_flags = 0u8;
        if frame.end_headers {
            frame_flags |= flags::END_HEADERS;
        }

        let length = frame.header_block.len() as u32;

        buf.reserve(FRAME_HEADER_SIZE + length as usize);

        self.write_header(
            buf,
            length,
            FrameType::Continuation,
            frame_flags,
            frame.stream_id,
        );

        buf.extend_from_slice(&frame.header_block);
    }

    /// Encode an unknown frame.
    fn encode_unknown(&self, frame: &UnknownFrame, buf: &mut BytesMut) {
        let length = frame.payload.len() as u32;

        buf.reserve(FRAME_HEADER_SIZE + length as usize);

        // Write header manually for unknown type
        buf.put_u8((length >> 16) as u8);
        buf.put_u8((length >> 8) as u8);
        buf.put_u8(length as u8);
        buf.put_u8(frame.frame_type);
        buf.put_u8(frame.flags);
        buf.put_u32(frame.stream_id.value() & 0x7FFF_FFFF);

        buf.extend_from_slice(&frame.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ErrorCode, FrameDecoder};
    use bytes::Bytes;

    fn roundtrip(frame: Frame) -> Frame {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode(&frame, &mut buf);

        let mut decoder = FrameDecoder::new();
        decoder.set_max_frame_size(crate::frame::MAX_FRAME_SIZE);
        decoder.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn data_roundtrip() {
        match roundtrip(Frame::Data(DataFrame {
            stream_id: StreamId::new(1),
            end_stream: true,
            data: Bytes::from_static(b"hello"),
            flow_len: 5,
        })) {
            Frame::Data(f) => {
                assert_eq!(f.stream_id.value(), 1);
                assert!(f.end_stream);
                assert_eq!(f.data.as_ref(), b"hello");
                assert_eq!(f.flow_len, 5);
            }
            _ => panic!("expected DATA frame"),
        }
    }

    #[test]
    fn headers_roundtrip() {
        match roundtrip(Frame::Headers(HeadersFrame {
            stream_id: StreamId::new(3),
            end_stream: false,
            end_headers: true,
            priority: None,
            header_block: Bytes::from_static(&[0x82, 0x86, 0x84]),
        })) {
            Frame::Headers(f) => {
                assert_eq!(f.stream_id.value(), 3);
                assert!(f.end_headers);
                assert!(!f.end_stream);
                assert!(f.priority.is_none());
                assert_eq!(f.header_block.as_ref(), &[0x82, 0x86, 0x84]);
            }
            _ => panic!("expected HEADERS frame"),
        }
    }

    #[test]
    fn headers_with_priority_roundtrip() {
        match roundtrip(Frame::Headers(HeadersFrame {
            stream_id: StreamId::new(1),
            end_stream: true,
            end_headers: true,
            priority: Some(Priority {
                exclusive: true,
                dependency: StreamId::new(0),
                weight: 255,
            }),
            header_block: Bytes::from_static(&[0x82]),
        })) {
            Frame::Headers(f) => {
                let pri = f.priority.expect("priority present");
                assert!(pri.exclusive);
                assert_eq!(pri.dependency.value(), 0);
                assert_eq!(pri.weight, 255);
            }
            _ => panic!("expected HEADERS frame"),
        }
    }

    #[test]
    fn rst_stream_roundtrip() {
        match roundtrip(Frame::RstStream(RstStreamFrame {
            stream_id: StreamId::new(1),
            error_code: ErrorCode::Cancel.to_u32(),
        })) {
            Frame::RstStream(f) => {
                assert_eq!(f.stream_id.value(), 1);
                assert_eq!(f.error_code, 8);
            }
            _ => panic!("expected RST_STREAM frame"),
        }
    }

    #[test]
    fn push_promise_roundtrip() {
        match roundtrip(Frame::PushPromise(PushPromiseFrame {
            stream_id: StreamId::new(1),
            end_headers: true,
            promised_stream_id: StreamId::new(2),
            header_block: Bytes::from_static(&[0x82, 0x84]),
        })) {
            Frame::PushPromise(f) => {
                assert_eq!(f.stream_id.value(), 1);
                assert_eq!(f.promised_stream_id.value(), 2);
                assert_eq!(f.header_block.as_ref(), &[0x82, 0x84]);
            }
            _ => panic!("expected PUSH_PROMISE frame"),
        }
    }

    #[test]
    fn continuation_roundtrip() {
        match roundtrip(Frame::Continuation(ContinuationFrame {
            stream_id: StreamId::new(5),
            end_headers: true,
            header_block: Bytes::from_static(&[0x84]),
        })) {
            Frame::Continuation(f) => {
                assert_eq!(f.stream_id.value(), 5);
                assert!(f.end_headers);
            }
            _ => panic!("expected CONTINUATION frame"),
        }
    }

    #[test]
    fn window_update_roundtrip() {
        match roundtrip(Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: StreamId::new(1),
            increment: 1000,
        })) {
            Frame::WindowUpdate(f) => {
                assert_eq!(f.stream_id.value(), 1);
                assert_eq!(f.increment, 1000);
            }
            _ => panic!("expected WINDOW_UPDATE frame"),
        }
    }

    #[test]
    fn reserved_bit_cleared_on_send() {
        let encoder = FrameEncoder::new();
        let mut buf = BytesMut::new();
        encoder.encode(
            &Frame::Data(DataFrame {
                stream_id: StreamId(0xFFFF_FFFF),
                end_stream: false,
                data: Bytes::new(),
                flow_len: 0,
            }),
            &mut buf,
        );

        // High bit of the stream id must be zero on the wire.
        assert_eq!(buf[5] & 0x80, 0);
    }

    #[test]
    fn unknown_frame_roundtrip() {
        match roundtrip(Frame::Unknown(UnknownFrame {
            frame_type: 0xfe,
            flags: 0x42,
            stream_id: StreamId::new(7),
            payload: Bytes::from_static(b"abc"),
        })) {
            Frame::Unknown(f) => {
                assert_eq!(f.frame_type, 0xfe);
                assert_eq!(f.flags, 0x42);
                assert_eq!(f.payload.as_ref(), b"abc");
            }
            _ => panic!("expected Unknown frame"),
        }
    }
}
