//! HPACK static and dynamic tables.

use std::collections::VecDeque;

/// A header field (name-value pair).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Vec<u8>,
    pub value: Vec<u8>,
}

impl HeaderField {
    /// Create a new header field.
    pub fn new(name: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Get the size of this header field for table accounting.
    /// Size = length of name + length of value + 32 (RFC 7541 Section 4.1)
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

/// The HPACK static table (RFC 7541 Appendix A).
///
/// Indices are 1-based; index 0 is invalid.
pub struct StaticTable;

/// Static table entries as (name, value) pairs. Slot 0 is an unused
/// placeholder so that wire indices map directly.
const ENTRIES: [(&[u8], &[u8]); 62] = [
    (b"", b""),
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

impl StaticTable {
    /// Get a static table entry by index (1-61).
    pub fn get(index: usize) -> Option<(&'static [u8], &'static [u8])> {
        if index == 0 || index > 61 {
            None
        } else {
            Some(ENTRIES[index])
        }
    }

    /// Find an entry in the static table.
    /// Returns (index, exact_match) where exact_match is true if both name and value match.
    pub fn find(name: &[u8], value: &[u8]) -> Option<(usize, bool)> {
        let mut name_match = None;

        for (i, (entry_name, entry_value)) in ENTRIES.iter().enumerate().skip(1) {
            if *entry_name == name {
                if *entry_value == value {
                    return Some((i, true));
                }
                if name_match.is_none() {
                    name_match = Some(i);
                }
            }
        }

        name_match.map(|i| (i, false))
    }

    /// Get the number of entries in the static table.
    pub const fn len() -> usize {
        61
    }
}

/// The HPACK dynamic table.
///
/// The dynamic table is a FIFO queue of header fields, with newest entries
/// at the front. Entries are evicted from the back when the table exceeds
/// its maximum size.
pub struct DynamicTable {
    /// Header entries, newest first.
    entries: VecDeque<HeaderField>,
    /// Current size in bytes.
    size: usize,
    /// Maximum size in bytes.
    max_size: usize,
}

impl DynamicTable {
    /// Create a new dynamic table with the given maximum size.
    pub(super) fn new(max_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            max_size,
        }
    }

    /// Set the maximum size of the table, evicting entries as needed.
    pub(super) fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict();
    }

    /// Get an entry by index (0 = newest entry).
    pub(super) fn get(&self, index: usize) -> Option<&HeaderField> {
        self.entries.get(index)
    }

    /// Insert a new entry at the front of the table.
    pub(super) fn insert(&mut self, field: HeaderField) {
        let entry_size = field.size();

        // An entry larger than the table empties it (RFC 7541 Section 4.4).
        if entry_size > self.max_size {
            self.entries.clear();
            self.size = 0;
            return;
        }

        // Evict entries until there's room
        while self.size + entry_size > self.max_size {
            if let Some(evicted) = self.entries.pop_back() {
                self.size -= evicted.size();
            } else {
                break;
            }
        }

        self.entries.push_front(field);
        self.size += entry_size;
    }

    /// Find an entry in the dynamic table.
    /// Returns (index, exact_match) where index is 0-based within the dynamic table.
    pub(super) fn find(&self, name: &[u8], value: &[u8]) -> Option<(usize, bool)> {
        let mut name_match = None;

        for (i, entry) in self.entries.iter().enumerate() {
            if entry.name == name {
                if entry.value == value {
                    return Some((i, true));
                }
                if name_match.is_none() {
                    name_match = Some(i);
                }
            }
        }

        name_match.map(|i| (i, false))
    }

    /// Evict entries until the table is within its maximum size.
    fn evict(&mut self) {
        while self.size > self.max_size {
            if let Some(evicted) = self.entries.pop_back() {
                self.size -= evicted.size();
            } else {
                break;
            }
        }
    }

    /// Get the number of entries in the table.
    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }
}
