//! HTTP/2 frame decoding.

use bytes::{Buf, Bytes, BytesMut};

use super::error::FrameError;
use super::types::*;
use super::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, flags};

/// Frame decoder that parses HTTP/2 frames from a byte buffer.
pub struct FrameDecoder {
    max_frame_size: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Create a new frame decoder with default settings.
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the maximum frame size (SETTINGS_MAX_FRAME_SIZE we advertised).
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Try to decode a frame from the buffer.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed, or `Err` on protocol error.
    ///
    /// On success, the consumed bytes are removed from the buffer.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        // Need at least the header
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Parse header without consuming
        let header = self.peek_header(buf);

        // Check frame size limit
        if header.length > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: header.length,
                max: self.max_frame_size,
            });
        }

        // Check if we have the full frame
        let total_len = FRAME_HEADER_SIZE + header.length as usize;
        if buf.len() < total_len {
            return Ok(None);
        }

        // Consume the header
        buf.advance(FRAME_HEADER_SIZE);

        // Extract payload
        let payload = buf.split_to(header.length as usize).freeze();

        // Parse the frame based on type
        let frame = self.parse_frame(header, payload)?;

        Ok(Some(frame))
    }

    /// Peek at the frame header without consuming bytes.
    fn peek_header(&self, buf: &[u8]) -> FrameHeader {
        debug_assert!(buf.len() >= FRAME_HEADER_SIZE);

        // Length is 24 bits (3 bytes), big-endian
        let length = ((buf[0] as u32) << 16) | ((buf[1] as u32) << 8) | (buf[2] as u32);

        let frame_type = buf[3];
        let flags = buf[4];

        // Stream ID is 31 bits (4 bytes), big-endian, high bit reserved
        let stream_id = StreamId::new(
            ((buf[5] as u32) << 24)
                | ((buf[6] as u32) << 16)
                | ((buf[7] as u32) << 8)
                | (buf[8] as u32),
        );

        FrameHeader {
            length,
            frame_type,
            flags,
            stream_id,
        }
    }

    /// Parse a frame given its header and payload.
    fn parse_frame(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        match FrameType::from_u8(header.frame_type) {
            Some(FrameType::Data) => self.parse_data(header, payload),
            Some(FrameType::Headers) => self.parse_headers(header, payload),
            Some(FrameType::Priority) => self.parse_priority(header, payload),
            Some(FrameType::RstStream) => self.parse_rst_stream(header, payload),
            Some(FrameType::Settings) => self.parse_settings(header, payload),
            Some(FrameType::PushPromise) => self.parse_push_promise(header, payload),
            Some(FrameType::Ping) => self.parse_ping(header, payload),
            Some(FrameType::GoAway) => self.parse_goaway(header, payload),
            Some(FrameType::WindowUpdate) => self.parse_window_update(header, payload),
            Some(FrameType::Continuation) => self.parse_continuation(header, payload),
            None => Ok(Frame::Unknown(UnknownFrame {
                frame_type: header.frame_type,
                flags: header.flags,
                stream_id: header.stream_id,
                payload,
            })),
        }
    }

    /// Parse DATA frame.
    fn parse_data(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        // DATA frames must not be sent on stream 0
        if header.stream_id.is_connection_level() {
            return Err(FrameError::StreamIdRequired {
                frame_type: header.frame_type,
            });
        }

        let end_stream = header.has_flag(flags::END_STREAM);
        let padded = header.has_flag(flags::PADDED);

        // Flow control charges the whole payload, padding included.
        let flow_len = payload.len() as u32;

        let data = if padded {
            self.remove_padding(payload)?
        } else {
            payload
        };

        Ok(Frame::Data(DataFrame {
            stream_id: header.stream_id,
            end_stream,
            data,
            flow_len,
        }))
    }

    /// Parse HEADERS frame.
    fn parse_headers(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        // HEADERS frames must not be sent on stream 0
        if header.stream_id.is_connection_level() {
            return Err(FrameError::StreamIdRequired {
                frame_type: header.frame_type,
            });
        }

        let end_stream = header.has_flag(flags::END_STREAM);
        let end_headers = header.has_flag(flags::END_HEADERS);
        let padded = header.has_flag(flags::PADDED);
        let has_priority = header.has_flag(flags::PRIORITY);

        let mut payload = if padded {
            self.remove_padding(payload)?
        } else {
            payload
        };

        let priority = if has_priority {
            if payload.len() < 5 {
                return Err(FrameError::InvalidPayloadLength {
                    frame_type: header.frame_type,
                    expected: 5,
                    actual: payload.len(),
                });
            }

            let first = payload.get_u32();
            let exclusive = (first & 0x8000_0000) != 0;
            let dependency = StreamId::new(first & 0x7FFF_FFFF);
            let weight = payload.get_u8();

            Some(Priority {
                exclusive,
                dependency,
                weight,
            })
        } else {
            None
        };

        Ok(Frame::Headers(HeadersFrame {
            stream_id: header.stream_id,
            end_stream,
            end_headers,
            priority,
            header_block: payload,
        }))
    }

    /// Parse PRIORITY frame.
    fn parse_priority(&self, header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
        // PRIORITY frames must not be sent on stream 0
        if header.stream_id.is_connection_level() {
            return Err(FrameError::StreamIdRequired {
                frame_type: header.frame_type,
            });
        }

        // PRIORITY frame payload is exactly 5 bytes
        if payload.len() != 5 {
            return Err(FrameError::InvalidPayloadLength {
                frame_type: header.frame_type,
                expected: 5,
                actual: payload.len(),
            });
        }

        let first = payload.get_u32();
        let exclusive = (first & 0x8000_0000) != 0;
        let dependency = StreamId::new(first & 0x7FFF_FFFF);
        let weight = payload.get_u8();

        Ok(Frame::Priority(PriorityFrame {
            stream_id: header.stream_id,
            priority: Priority {
                exclusive,
                dependency,
                weight,
            },
        }))
    }

    /// Parse RST_STREAM frame.
    fn parse_rst_stream(
        &self,
        header: FrameHeader,
        mut payload: Bytes,
    ) -> Result<Frame, FrameError> {
        // RST_STREAM frames must not be sent on stream 0
        if header.stream_id.is_connection_level() {
            return Err(FrameError::StreamIdRequired {
                frame_type: header.frame_type,
            });
        }

        // RST_STREAM frame payload is exactly 4 bytes
        if payload.len() != 4 {
            return Err(FrameError::InvalidPayloadLength {
                frame_type: header.frame_type,
                expected: 4,
                actual: payload.len(),
            });
        }

        let error_code = payload.get_u32();

        Ok(Frame::RstStream(RstStreamFrame {
            stream_id: header.stream_id,
            error_code,
        }))
    }

    /// Parse SETTINGS frame.
    fn parse_settings(&self, header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
        // SETTINGS frames must be sent on stream 0
        if !header.stream_id.is_connection_level() {
            return Err(FrameError::InvalidStreamZero {
                frame_type: header.frame_type,
            });
        }

        let ack = header.has_flag(flags::ACK);

        // ACK SETTINGS must have empty payload
        if ack && !payload.is_empty() {
            return Err(FrameError::InvalidPayloadLength {
                frame_type: header.frame_type,
                expected: 0,
                actual: payload.len(),
            });
        }

        // SETTINGS payload must be a multiple of 6 bytes
        if !payload.len().is_multiple_of(6) {
            return Err(FrameError::InvalidPayloadLength {
                frame_type: header.frame_type,
                expected: (payload.len() / 6) * 6,
                actual: payload.len(),
            });
        }

        let mut settings = Vec::with_capacity(payload.len() / 6);

        while payload.has_remaining() {
            let id = SettingId::from_u16(payload.get_u16());
            let value = payload.get_u32();

            // Validate certain settings
            self.validate_setting(id, value)?;

            settings.push(Setting { id, value });
        }

        Ok(Frame::Settings(SettingsFrame { ack, settings }))
    }

    /// Validate a setting value (RFC 7540 Section 6.5.2).
    fn validate_setting(&self, id: SettingId, value: u32) -> Result<(), FrameError> {
        match id {
            SettingId::EnablePush => {
                if value > 1 {
                    return Err(FrameError::InvalidSettingValue {
                        id: id.to_u16(),
                        value,
                    });
                }
            }
            SettingId::InitialWindowSize => {
                // Must not exceed 2^31 - 1
                if value > 0x7FFF_FFFF {
                    return Err(FrameError::InvalidSettingValue {
                        id: id.to_u16(),
                        value,
                    });
                }
            }
            SettingId::MaxFrameSize => {
                // Must be between 16384 and 16777215
                if !(16_384..=16_777_215).contains(&value) {
                    return Err(FrameError::InvalidSettingValue {
                        id: id.to_u16(),
                        value,
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Parse PUSH_PROMISE frame.
    fn parse_push_promise(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        // PUSH_PROMISE frames must not be sent on stream 0
        if header.stream_id.is_connection_level() {
            return Err(FrameError::StreamIdRequired {
                frame_type: header.frame_type,
            });
        }

        let end_headers = header.has_flag(flags::END_HEADERS);
        let padded = header.has_flag(flags::PADDED);

        let mut payload = if padded {
            self.remove_padding(payload)?
        } else {
            payload
        };

        if payload.len() < 4 {
            return Err(FrameError::InvalidPayloadLength {
                frame_type: header.frame_type,
                expected: 4,
                actual: payload.len(),
            });
        }

        let promised_stream_id = StreamId::new(payload.get_u32() & 0x7FFF_FFFF);

        Ok(Frame::PushPromise(PushPromiseFrame {
            stream_id: header.stream_id,
            end_headers,
            promised_stream_id,
            header_block: payload,
        }))
    }

    /// Parse PING frame.
    fn parse_ping(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        // PING frames must be sent on stream 0
        if !header.stream_id.is_connection_level() {
            return Err(FrameError::InvalidStreamZero {
                frame_type: header.frame_type,
            });
        }

        // PING frame payload is exactly 8 bytes
        if payload.len() != 8 {
            return Err(FrameError::InvalidPayloadLength {
                frame_type: header.frame_type,
                expected: 8,
                actual: payload.len(),
            });
        }

        let ack = header.has_flag(flags::ACK);
        let mut data = [0u8; 8];
        data.copy_from_slice(&payload[..8]);

        Ok(Frame::Ping(PingFrame { ack, data }))
    }

    /// Parse GOAWAY frame.
    fn parse_goaway(&self, header: FrameHeader, mut payload: Bytes) -> Result<Frame, FrameError> {
        // GOAWAY frames must be sent on stream 0
        if !header.stream_id.is_connection_level() {
            return Err(FrameError::InvalidStreamZero {
                frame_type: header.frame_type,
            });
        }

        // GOAWAY frame payload is at least 8 bytes
        if payload.len() < 8 {
            return Err(FrameError::InvalidPayloadLength {
                frame_type: header.frame_type,
                expected: 8,
                actual: payload.len(),
            });
        }

        let last_stream_id = StreamId::new(payload.get_u32() & 0x7FFF_FFFF);
        let error_code = payload.get_u32();
        let debug_data = payload;

        Ok(Frame::GoAway(GoAwayFrame {
            last_stream_id,
            error_code,
            debug_data,
        }))
    }

    /// Parse WINDOW_UPDATE frame.
    ///
    /// A zero increment is left for the connection layer to classify: it is a
    /// connection error on stream 0 and a stream error otherwise.
    fn parse_window_update(
        &self,
        header: FrameHeader,
        mut payload: Bytes,
    ) -> Result<Frame, FrameError> {
        // WINDOW_UPDATE frame payload is exactly 4 bytes
        if payload.len() != 4 {
            return Err(FrameError::InvalidPayloadLength {
                frame_type: header.frame_type,
                expected: 4,
                actual: payload.len(),
            });
        }

        let increment = payload.get_u32() & 0x7FFF_FFFF;

        Ok(Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: header.stream_id,
            increment,
        }))
    }

    /// Parse CONTINUATION frame.
    fn parse_continuation(&self, header: FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        // CONTINUATION frames must not be sent on stream 0
        if header.stream_id.is_connection_level() {
            return Err(FrameError::StreamIdRequired {
                frame_type: header.frame_type,
            });
        }

        let end_headers = header.has_flag(flags::END_HEADERS);

        Ok(Frame::Continuation(ContinuationFrame {
            stream_id: header.stream_id,
            end_headers,
            header_block: payload,
        }))
    }

    /// Remove padding from a padded frame payload.
    ///
    /// The pad bytes must be present; their contents are not inspected.
    fn remove_padding(&self, mut payload: Bytes) -> Result<Bytes, FrameError> {
        if payload.is_empty() {
            return Err(FrameError::InvalidPadding {
                pad_length: 0,
                payload_length: 0,
            });
        }

        let pad_length = payload.get_u8() as usize;

        // Padding length must not exceed remaining payload
        if pad_length >= payload.len() + 1 {
            return Err(FrameError::InvalidPadding {
                pad_length: pad_length as u8,
                payload_length: payload.len() + 1,
            });
        }

        // Remove padding bytes from the end
        let data_len = payload.len() - pad_length;
        Ok(payload.slice(..data_len))
    }
}
