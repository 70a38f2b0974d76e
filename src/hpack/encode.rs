//! HPACK header encoding.

use super::huffman;
use super::table::{DynamicTable, HeaderField, StaticTable};

/// HPACK encoder.
///
/// One per connection, producing every outbound header block. When the peer
/// lowers SETTINGS_HEADER_TABLE_SIZE, the size change is announced in-band
/// with a dynamic-table-size-update instruction at the start of the next
/// block (RFC 7541 Section 4.2).
pub struct HpackEncoder {
    /// Dynamic table for encoding.
    dynamic_table: DynamicTable,
    /// Whether to use Huffman encoding for strings.
    use_huffman: bool,
    /// Table size to announce at the start of the next header block.
    pending_size_update: Option<usize>,
}

impl Default for HpackEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackEncoder {
    /// Create a new HPACK encoder with default settings.
    pub fn new() -> Self {
        Self {
            dynamic_table: DynamicTable::new(super::DEFAULT_TABLE_SIZE),
            use_huffman: true,
            pending_size_update: None,
        }
    }

    /// Set whether to use Huffman encoding.
    pub fn set_huffman(&mut self, use_huffman: bool) {
        self.use_huffman = use_huffman;
    }

    /// Apply the peer's SETTINGS_HEADER_TABLE_SIZE. The table shrinks or
    /// grows immediately; the instruction announcing it precedes the next
    /// header field emitted.
    pub fn set_table_size(&mut self, size: usize) {
        self.dynamic_table.set_max_size(size);
        self.pending_size_update = Some(size);
    }

    /// Encode a list of headers into an HPACK header block.
    pub fn encode(&mut self, headers: &[HeaderField], buf: &mut Vec<u8>) {
        if let Some(size) = self.pending_size_update.take() {
            encode_integer(size, 5, 0x20, buf);
        }

        for header in headers {
            self.encode_header(header, buf);
        }
    }

    /// Encode a single header field.
    fn encode_header(&mut self, header: &HeaderField, buf: &mut Vec<u8>) {
        let static_match = StaticTable::find(&header.name, &header.value);
        let dynamic_match = self.dynamic_table.find(&header.name, &header.value);

        match (static_match, dynamic_match) {
            // Exact match in static table - indexed representation
            (Some((idx, true)), _) => {
                encode_integer(idx, 7, 0x80, buf);
            }
            // Exact match in dynamic table
            (_, Some((dyn_idx, true))) => {
                let idx = StaticTable::len() + 1 + dyn_idx;
                encode_integer(idx, 7, 0x80, buf);
            }
            // Name match in static table - literal with incremental indexing
            (Some((idx, false)), _) => {
                encode_integer(idx, 6, 0x40, buf);
                self.encode_string(&header.value, buf);
                self.dynamic_table.insert(header.clone());
            }
            // Name match in dynamic table
            (_, Some((dyn_idx, false))) => {
                let idx = StaticTable::len() + 1 + dyn_idx;
                encode_integer(idx, 6, 0x40, buf);
                self.encode_string(&header.value, buf);
                self.dynamic_table.insert(header.clone());
            }
            // No match - literal with new name, incrementally indexed
            (None, None) => {
                buf.push(0x40);
                self.encode_string(&header.name, buf);
                self.encode_string(&header.value, buf);
                self.dynamic_table.insert(header.clone());
            }
        }
    }

    /// Encode a string, Huffman-coded when that is shorter.
    fn encode_string(&self, data: &[u8], buf: &mut Vec<u8>) {
        if self.use_huffman {
            let huffman_len = huffman::encoded_len(data);
            if huffman_len < data.len() {
                encode_integer(huffman_len, 7, 0x80, buf);
                huffman::encode(data, buf);
                return;
            }
        }

        encode_integer(data.len(), 7, 0x00, buf);
        buf.extend_from_slice(data);
    }
}

/// Encode an integer with a prefix (RFC 7541 Section 5.1).
fn encode_integer(mut value: usize, prefix_bits: u8, prefix: u8, buf: &mut Vec<u8>) {
    let max_prefix: usize = (1 << prefix_bits) - 1;

    if value < max_prefix {
        buf.push(prefix | (value as u8));
    } else {
        buf.push(prefix | (max_prefix as u8));
        value -= max_prefix;
        while value >= 128 {
            buf.push((value % 128) as u8 | 0x80);
            value /= 128;
        }
        buf.push(value as u8);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hpack::HpackDecoder;

    #[test]
    fn encode_integer_small() {
        let mut buf = Vec::new();
        encode_integer(10, 5, 0x00, &mut buf);
        assert_eq!(buf, vec![10]);
    }

    #[test]
    fn encode_integer_max_prefix() {
        let mut buf = Vec::new();
        encode_integer(31, 5, 0x00, &mut buf);
        assert_eq!(buf, vec![31, 0]);
    }

    #[test]
    fn encode_integer_large() {
        // 1337 with 5-bit prefix (RFC 7541 C.1.2)
        let mut buf = Vec::new();
        encode_integer(1337, 5, 0x00, &mut buf);
        assert_eq!(buf, vec![31, 154, 10]);
    }

    #[test]
    fn static_exact_match_is_indexed() {
        let mut encoder = HpackEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&[HeaderField::new(":method", "GET")], &mut buf);

        // Static index 2
        assert_eq!(buf, vec![0x82]);
    }

    #[test]
    fn repeated_header_hits_dynamic_table() {
        let mut encoder = HpackEncoder::new();
        encoder.set_huffman(false);

        let headers = [HeaderField::new("x-custom", "abc")];

        let mut first = Vec::new();
        encoder.encode(&headers, &mut first);

        let mut second = Vec::new();
        encoder.encode(&headers, &mut second);

        // Second occurrence is a one- or two-byte indexed reference.
        assert!(second.len() < first.len());
        assert_eq!(second, vec![0xbe]); // dynamic index 62
    }

    #[test]
    fn table_size_update_precedes_fields() {
        let mut encoder = HpackEncoder::new();
        encoder.set_table_size(0);

        let mut buf = Vec::new();
        encoder.encode(&[HeaderField::new(":method", "GET")], &mut buf);

        // 0x20 = size update to 0, then the indexed field.
        assert_eq!(buf, vec![0x20, 0x82]);

        // Announced once only.
        let mut buf = Vec::new();
        encoder.encode(&[HeaderField::new(":method", "GET")], &mut buf);
        assert_eq!(buf, vec![0x82]);
    }

    #[test]
    fn size_zero_table_disables_indexing_additions() {
        let mut encoder = HpackEncoder::new();
        encoder.set_table_size(0);
        encoder.set_huffman(false);

        let headers = [HeaderField::new("x-a", "1")];
        let mut first = Vec::new();
        encoder.encode(&headers, &mut first);
        let mut second = Vec::new();
        encoder.encode(&headers, &mut second);

        // Nothing fits a zero-size table, so no dynamic reference appears.
        let mut decoder = HpackDecoder::new();
        assert_eq!(decoder.decode(&first).unwrap(), headers);
        assert_eq!(decoder.decode(&second).unwrap(), headers);
    }

    #[test]
    fn huffman_used_when_shorter() {
        let mut encoder = HpackEncoder::new();
        let mut buf = Vec::new();
        // Lowercase alphanumerics compress well.
        encoder.encode(&[HeaderField::new("x-token", "aaaaaaaaaaaaaaaa")], &mut buf);

        let mut decoder = HpackDecoder::new();
        let headers = decoder.decode(&buf).unwrap();
        assert_eq!(headers[0].value, b"aaaaaaaaaaaaaaaa");
        // Value string is flagged Huffman (0x80 on its length octet).
        // Find it: skip 0x40, name string, then the value length octet.
        assert!(buf.len() < 1 + 1 + 7 + 1 + 16);
    }
}
