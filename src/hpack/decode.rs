//! HPACK header decoding.

use super::huffman;
use super::table::{DynamicTable, HeaderField, StaticTable};

/// HPACK decoding error. All variants fail the connection with
/// COMPRESSION_ERROR; a shared compression context cannot survive a
/// partially applied header block.
#[derive(Debug)]
pub enum HpackError {
    /// Header block ended mid-representation.
    Incomplete,
    /// Invalid integer encoding.
    InvalidInteger,
    /// Invalid Huffman encoding.
    InvalidHuffman(huffman::HuffmanError),
    /// Index 0 or beyond the static + dynamic table bounds.
    InvalidIndex(usize),
    /// Table size update above the negotiated maximum.
    InvalidTableSize,
    /// Table size update after the first header field in a block.
    LateTableSizeUpdate,
}

impl std::fmt::Display for HpackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HpackError::Incomplete => write!(f, "incomplete HPACK data"),
            HpackError::InvalidInteger => write!(f, "invalid HPACK integer encoding"),
            HpackError::InvalidHuffman(e) => write!(f, "invalid Huffman encoding: {}", e),
            HpackError::InvalidIndex(idx) => write!(f, "invalid table index: {}", idx),
            HpackError::InvalidTableSize => write!(f, "invalid table size update"),
            HpackError::LateTableSizeUpdate => {
                write!(f, "table size update after first header field")
            }
        }
    }
}

impl std::error::Error for HpackError {}

impl From<huffman::HuffmanError> for HpackError {
    fn from(e: huffman::HuffmanError) -> Self {
        HpackError::InvalidHuffman(e)
    }
}

/// HPACK decoder.
///
/// One per connection, fed every inbound header block in wire order.
pub struct HpackDecoder {
    /// Dynamic table for decoding.
    dynamic_table: DynamicTable,
    /// Maximum table size allowed by our SETTINGS_HEADER_TABLE_SIZE.
    max_table_size: usize,
}

impl Default for HpackDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl HpackDecoder {
    /// Create a new HPACK decoder with default settings.
    pub fn new() -> Self {
        Self {
            dynamic_table: DynamicTable::new(super::DEFAULT_TABLE_SIZE),
            max_table_size: super::DEFAULT_TABLE_SIZE,
        }
    }

    /// Set the maximum allowed table size from our SETTINGS_HEADER_TABLE_SIZE.
    pub fn set_max_table_size(&mut self, size: usize) {
        if size < self.max_table_size {
            // The peer may never announce the shrink in-band; cap eagerly so
            // the negotiated memory bound holds.
            self.dynamic_table.set_max_size(size);
        }
        self.max_table_size = size;
    }

    /// Decode an HPACK header block into a list of headers.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
        let mut headers = Vec::new();
        let mut pos = 0;
        let mut saw_field = false;

        while pos < data.len() {
            let (header, consumed) = self.decode_header(&data[pos..], saw_field)?;
            if let Some(h) = header {
                saw_field = true;
                headers.push(h);
            }
            pos += consumed;
        }

        Ok(headers)
    }

    /// Decode a single header representation.
    /// Returns (Option<HeaderField>, bytes_consumed).
    fn decode_header(
        &mut self,
        data: &[u8],
        saw_field: bool,
    ) -> Result<(Option<HeaderField>, usize), HpackError> {
        if data.is_empty() {
            return Err(HpackError::Incomplete);
        }

        let first_byte = data[0];

        if first_byte & 0x80 != 0 {
            // Indexed Header Field (Section 6.1)
            // Format: 1xxxxxxx
            self.decode_indexed(data)
        } else if first_byte & 0x40 != 0 {
            // Literal Header Field with Incremental Indexing (Section 6.2.1)
            // Format: 01xxxxxx
            self.decode_literal_indexed(data)
        } else if first_byte & 0x20 != 0 {
            // Dynamic Table Size Update (Section 6.3)
            // Format: 001xxxxx; must precede any header field in the block.
            if saw_field {
                return Err(HpackError::LateTableSizeUpdate);
            }
            self.decode_table_size_update(data)
        } else {
            // Literal Header Field without Indexing (Section 6.2.2)
            // or Never Indexed (Section 6.2.3)
            // Format: 0000xxxx or 0001xxxx
            self.decode_literal_not_indexed(data)
        }
    }

    /// Decode an indexed header field.
    fn decode_indexed(&mut self, data: &[u8]) -> Result<(Option<HeaderField>, usize), HpackError> {
        let (index, consumed) = decode_integer(data, 7)?;

        if index == 0 {
            return Err(HpackError::InvalidIndex(0));
        }

        let header = self.get_header(index)?;
        Ok((Some(header), consumed))
    }

    /// Decode a literal header field with incremental indexing.
    fn decode_literal_indexed(
        &mut self,
        data: &[u8],
    ) -> Result<(Option<HeaderField>, usize), HpackError> {
        let (name_index, mut consumed) = decode_integer(data, 6)?;

        let name = if name_index > 0 {
            self.get_header(name_index)?.name
        } else {
            let (n, c) = decode_string(&data[consumed..])?;
            consumed += c;
            n
        };

        let (value, c) = decode_string(&data[consumed..])?;
        consumed += c;

        let header = HeaderField::new(name, value);
        self.dynamic_table.insert(header.clone());

        Ok((Some(header), consumed))
    }

    /// Decode a literal header field without indexing.
    fn decode_literal_not_indexed(
        &mut self,
        data: &[u8],
    ) -> Result<(Option<HeaderField>, usize), HpackError> {
        let (name_index, mut consumed) = decode_integer(data, 4)?;

        let name = if name_index > 0 {
            self.get_header(name_index)?.name
        } else {
            let (n, c) = decode_string(&data[consumed..])?;
            consumed += c;
            n
        };

        let (value, c) = decode_string(&data[consumed..])?;
        consumed += c;

        // Not added to dynamic table
        Ok((Some(HeaderField::new(name, value)), consumed))
    }

    /// Decode a dynamic table size update.
    fn decode_table_size_update(
        &mut self,
        data: &[u8],
    ) -> Result<(Option<HeaderField>, usize), HpackError> {
        let (new_size, consumed) = decode_integer(data, 5)?;

        if new_size > self.max_table_size {
            return Err(HpackError::InvalidTableSize);
        }

        self.dynamic_table.set_max_size(new_size);

        Ok((None, consumed))
    }

    /// Get a header from the static or dynamic table by index.
    fn get_header(&self, index: usize) -> Result<HeaderField, HpackError> {
        let static_len = StaticTable::len();

        if index <= static_len {
            let (name, value) = StaticTable::get(index).ok_or(HpackError::InvalidIndex(index))?;
            Ok(HeaderField::new(name, value))
        } else {
            let dyn_index = index - static_len - 1;
            self.dynamic_table
                .get(dyn_index)
                .cloned()
                .ok_or(HpackError::InvalidIndex(index))
        }
    }
}

/// Decode an HPACK integer (RFC 7541 Section 5.1).
fn decode_integer(data: &[u8], prefix_bits: u8) -> Result<(usize, usize), HpackError> {
    if data.is_empty() {
        return Err(HpackError::Incomplete);
    }

    let max_prefix = (1usize << prefix_bits) - 1;
    let mut value = (data[0] as usize) & max_prefix;
    let mut consumed = 1;

    if value < max_prefix {
        return Ok((value, consumed));
    }

    let mut shift = 0;
    loop {
        if consumed >= data.len() {
            return Err(HpackError::Incomplete);
        }

        let byte = data[consumed] as usize;
        consumed += 1;

        value += (byte & 0x7f) << shift;
        shift += 7;

        if byte & 0x80 == 0 {
            break;
        }

        if shift > 28 {
            return Err(HpackError::InvalidInteger);
        }
    }

    Ok((value, consumed))
}

/// Decode an HPACK string (RFC 7541 Section 5.2).
fn decode_string(data: &[u8]) -> Result<(Vec<u8>, usize), HpackError> {
    if data.is_empty() {
        return Err(HpackError::Incomplete);
    }

    let huffman = (data[0] & 0x80) != 0;
    let (length, mut consumed) = decode_integer(data, 7)?;

    if consumed + length > data.len() {
        return Err(HpackError::Incomplete);
    }

    let string_data = &data[consumed..consumed + length];
    consumed += length;

    let result = if huffman {
        let mut decoded = Vec::with_capacity(length * 2);
        huffman::decode(string_data, &mut decoded)?;
        decoded
    } else {
        string_data.to_vec()
    };

    Ok((result, consumed))
}
