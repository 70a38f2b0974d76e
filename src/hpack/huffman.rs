//! Huffman coding for HPACK string literals (RFC 7541 Appendix B).

use std::fmt;
use std::sync::OnceLock;

/// Huffman decoding errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HuffmanError {
    /// Bit sequence does not correspond to any symbol, or decodes EOS.
    InvalidCode,
    /// Trailing bits are not a most-significant prefix of EOS, or exceed 7 bits.
    InvalidPadding,
}

impl fmt::Display for HuffmanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HuffmanError::InvalidCode => write!(f, "invalid Huffman code"),
            HuffmanError::InvalidPadding => write!(f, "invalid Huffman padding"),
        }
    }
}

/// Code table indexed by symbol (0-255, plus EOS at 256): (code, bit length).
#[rustfmt::skip]
const CODES: [(u32, u8); 257] = [
    (0x1ff8, 13), (0x7fffd8, 23), (0xfffffe2, 28), (0xfffffe3, 28),
    (0xfffffe4, 28), (0xfffffe5, 28), (0xfffffe6, 28), (0xfffffe7, 28),
    (0xfffffe8, 28), (0xffffea, 24), (0x3ffffffc, 30), (0xfffffe9, 28),
    (0xfffffea, 28), (0x3ffffffd, 30), (0xfffffeb, 28), (0xfffffec, 28),
    (0xfffffed, 28), (0xfffffee, 28), (0xfffffef, 28), (0xffffff0, 28),
    (0xffffff1, 28), (0xffffff2, 28), (0x3ffffffe, 30), (0xffffff3, 28),
    (0xffffff4, 28), (0xffffff5, 28), (0xffffff6, 28), (0xffffff7, 28),
    (0xffffff8, 28), (0xffffff9, 28), (0xffffffa, 28), (0xffffffb, 28),
    (0x14, 6), (0x3f8, 10), (0x3f9, 10), (0xffa, 12),
    (0x1ff9, 13), (0x15, 6), (0xf8, 8), (0x7fa, 11),
    (0x3fa, 10), (0x3fb, 10), (0xf9, 8), (0x7fb, 11),
    (0xfa, 8), (0x16, 6), (0x17, 6), (0x18, 6),
    (0x0, 5), (0x1, 5), (0x2, 5), (0x19, 6),
    (0x1a, 6), (0x1b, 6), (0x1c, 6), (0x1d, 6),
    (0x1e, 6), (0x1f, 6), (0x5c, 7), (0xfb, 8),
    (0x7ffc, 15), (0x20, 6), (0xffb, 12), (0x3fc, 10),
    (0x1ffa, 13), (0x21, 6), (0x5d, 7), (0x5e, 7),
    (0x5f, 7), (0x60, 7), (0x61, 7), (0x62, 7),
    (0x63, 7), (0x64, 7), (0x65, 7), (0x66, 7),
    (0x67, 7), (0x68, 7), (0x69, 7), (0x6a, 7),
    (0x6b, 7), (0x6c, 7), (0x6d, 7), (0x6e, 7),
    (0x6f, 7), (0x70, 7), (0x71, 7), (0x72, 7),
    (0xfc, 8), (0x73, 7), (0xfd, 8), (0x1ffb, 13),
    (0x7fff0, 19), (0x1ffc, 13), (0x3ffc, 14), (0x22, 6),
    (0x7ffd, 15), (0x3, 5), (0x23, 6), (0x4, 5),
    (0x24, 6), (0x5, 5), (0x25, 6), (0x26, 6),
    (0x27, 6), (0x6, 5), (0x74, 7), (0x75, 7),
    (0x28, 6), (0x29, 6), (0x2a, 6), (0x7, 5),
    (0x2b, 6), (0x76, 7), (0x2c, 6), (0x8, 5),
    (0x9, 5), (0x2d, 6), (0x77, 7), (0x78, 7),
    (0x79, 7), (0x7a, 7), (0x7b, 7), (0x7ffe, 15),
    (0x7fc, 11), (0x3ffd, 14), (0x1ffd, 13), (0xffffffc, 28),
    (0xfffe6, 20), (0x3fffd2, 22), (0xfffe7, 20), (0xfffe8, 20),
    (0x3fffd3, 22), (0x3fffd4, 22), (0x3fffd5, 22), (0x7fffd9, 23),
    (0x3fffd6, 22), (0x7fffda, 23), (0x7fffdb, 23), (0x7fffdc, 23),
    (0x7fffdd, 23), (0x7fffde, 23), (0xffffeb, 24), (0x7fffdf, 23),
    (0xffffec, 24), (0xffffed, 24), (0x3fffd7, 22), (0x7fffe0, 23),
    (0xffffee, 24), (0x7fffe1, 23), (0x7fffe2, 23), (0x7fffe3, 23),
    (0x7fffe4, 23), (0x1fffdc, 21), (0x3fffd8, 22), (0x7fffe5, 23),
    (0x3fffd9, 22), (0x7fffe6, 23), (0x7fffe7, 23), (0xffffef, 24),
    (0x3fffda, 22), (0x1fffdd, 21), (0xfffe9, 20), (0x3fffdb, 22),
    (0x3fffdc, 22), (0x7fffe8, 23), (0x7fffe9, 23), (0x1fffde, 21),
    (0x7fffea, 23), (0x3fffdd, 22), (0x3fffde, 22), (0xfffff0, 24),
    (0x1fffdf, 21), (0x3fffdf, 22), (0x7fffeb, 23), (0x7fffec, 23),
    (0x1fffe0, 21), (0x1fffe1, 21), (0x3fffe0, 22), (0x1fffe2, 21),
    (0x7fffed, 23), (0x3fffe1, 22), (0x7fffee, 23), (0x7fffef, 23),
    (0xfffea, 20), (0x3fffe2, 22), (0x3fffe3, 22), (0x3fffe4, 22),
    (0x7ffff0, 23), (0x3fffe5, 22), (0x3fffe6, 22), (0x7ffff1, 23),
    (0x3ffffe0, 26), (0x3ffffe1, 26), (0xfffeb, 20), (0x7fff1, 19),
    (0x3fffe7, 22), (0x7ffff2, 23), (0x3fffe8, 22), (0x1ffffec, 25),
    (0x3ffffe2, 26), (0x3ffffe3, 26), (0x3ffffe4, 26), (0x7ffffde, 27),
    (0x7ffffdf, 27), (0x3ffffe5, 26), (0xfffff1, 24), (0x1ffffed, 25),
    (0x7fff2, 19), (0x1fffe3, 21), (0x3ffffe6, 26), (0x7ffffe0, 27),
    (0x7ffffe1, 27), (0x3ffffe7, 26), (0x7ffffe2, 27), (0xfffff2, 24),
    (0x1fffe4, 21), (0x1fffe5, 21), (0x3ffffe8, 26), (0x3ffffe9, 26),
    (0xffffffd, 28), (0x7ffffe3, 27), (0x7ffffe4, 27), (0x7ffffe5, 27),
    (0xfffec, 20), (0xfffff3, 24), (0xfffed, 20), (0x1fffe6, 21),
    (0x3fffe9, 22), (0x1fffe7, 21), (0x1fffe8, 21), (0x7ffff3, 23),
    (0x3fffea, 22), (0x3fffeb, 22), (0x1ffffee, 25), (0x1ffffef, 25),
    (0xfffff4, 24), (0xfffff5, 24), (0x3ffffea, 26), (0x7ffff4, 23),
    (0x3ffffeb, 26), (0x7ffffe6, 27), (0x3ffffec, 26), (0x3ffffed, 26),
    (0x7ffffe7, 27), (0x7ffffe8, 27), (0x7ffffe9, 27), (0x7ffffea, 27),
    (0x7ffffeb, 27), (0xffffffe, 28), (0x7ffffec, 27), (0x7ffffed, 27),
    (0x7ffffee, 27), (0x7ffffef, 27), (0x7fffff0, 27), (0x3ffffee, 26),
    (0x3fffffff, 30),
];

/// EOS symbol index.
const EOS: u16 = 256;

/// Binary decode tree node. Child index 0 means "no child" (the root is
/// never a child).
#[derive(Clone, Copy)]
enum Node {
    Internal { zero: u16, one: u16 },
    Leaf { sym: u16 },
}

fn decode_tree() -> &'static [Node] {
    static TREE: OnceLock<Vec<Node>> = OnceLock::new();
    TREE.get_or_init(build_decode_tree)
}

fn build_decode_tree() -> Vec<Node> {
    let mut nodes = vec![Node::Internal { zero: 0, one: 0 }];

    for (sym, &(code, bits)) in CODES.iter().enumerate() {
        let mut node_idx = 0usize;

        for bit_pos in (0..bits).rev() {
            let bit = (code >> bit_pos) & 1;
            let is_last = bit_pos == 0;

            let (zero, one) = match nodes[node_idx] {
                Node::Internal { zero, one } => (zero, one),
                Node::Leaf { .. } => unreachable!("prefix-free code table"),
            };

            let child = if bit == 0 { zero } else { one };

            if is_last {
                let leaf_idx = nodes.len() as u16;
                nodes.push(Node::Leaf { sym: sym as u16 });
                nodes[node_idx] = if bit == 0 {
                    Node::Internal {
                        zero: leaf_idx,
                        one,
                    }
                } else {
                    Node::Internal {
                        zero,
                        one: leaf_idx,
                    }
                };
            } else if child == 0 {
                let new_idx = nodes.len() as u16;
                nodes.push(Node::Internal { zero: 0, one: 0 });
                nodes[node_idx] = if bit == 0 {
                    Node::Internal { zero: new_idx, one }
                } else {
                    Node::Internal { zero, one: new_idx }
                };
                node_idx = new_idx as usize;
            } else {
                node_idx = child as usize;
            }
        }
    }

    nodes
}

/// Return the Huffman-encoded length of `data` in bytes.
pub(super) fn encoded_len(data: &[u8]) -> usize {
    let mut bits = 0usize;
    for &byte in data {
        bits += CODES[byte as usize].1 as usize;
    }
    bits.div_ceil(8)
}

/// Huffman-encode `data` and append to `out`.
pub(super) fn encode(data: &[u8], out: &mut Vec<u8>) {
    let mut acc: u64 = 0;
    let mut acc_bits = 0u8;

    for &byte in data {
        let (code, bits) = CODES[byte as usize];
        acc = (acc << bits) | u64::from(code);
        acc_bits += bits;

        while acc_bits >= 8 {
            acc_bits -= 8;
            out.push((acc >> acc_bits) as u8);
        }
    }

    // Pad the final byte with the most-significant bits of EOS (all ones).
    if acc_bits > 0 {
        acc <<= 8 - acc_bits;
        acc |= (1u64 << (8 - acc_bits)) - 1;
        out.push(acc as u8);
    }
}

/// Decode a Huffman-encoded byte slice, appending plaintext to `out`.
pub(super) fn decode(data: &[u8], out: &mut Vec<u8>) -> Result<(), HuffmanError> {
    let tree = decode_tree();

    let mut node_idx = 0u16;
    // Bits consumed since the last emitted symbol, and whether they were
    // all ones. Legal padding is a 1-7 bit prefix of EOS, which is all ones.
    let mut residual_bits = 0u32;
    let mut residual_ones = true;

    for &byte in data {
        for shift in (0..8).rev() {
            let bit = (byte >> shift) & 1;
            residual_bits += 1;
            if bit == 0 {
                residual_ones = false;
            }

            node_idx = match tree[node_idx as usize] {
                Node::Internal { zero, one } => {
                    if bit == 0 {
                        zero
                    } else {
                        one
                    }
                }
                Node::Leaf { .. } => unreachable!("walk restarts at root after a leaf"),
            };
            if node_idx == 0 {
                return Err(HuffmanError::InvalidCode);
            }

            if let Node::Leaf { sym } = tree[node_idx as usize] {
                // A complete EOS in the stream is a decoding error.
                if sym == EOS {
                    return Err(HuffmanError::InvalidCode);
                }
                out.push(sym as u8);
                node_idx = 0;
                residual_bits = 0;
                residual_ones = true;
            }
        }
    }

    if node_idx != 0 && (residual_bits > 7 || !residual_ones) {
        return Err(HuffmanError::InvalidPadding);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(input: &[u8]) -> Vec<u8> {
        let mut encoded = Vec::new();
        encode(input, &mut encoded);
        let mut decoded = Vec::new();
        decode(&encoded, &mut decoded).unwrap();
        decoded
    }

    #[test]
    fn rfc7541_appendix_c_examples() {
        // www.example.com (RFC 7541 C.4.1)
        let mut encoded = Vec::new();
        encode(b"www.example.com", &mut encoded);
        assert_eq!(
            encoded,
            [0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff]
        );

        // no-cache (RFC 7541 C.4.2)
        let mut encoded = Vec::new();
        encode(b"no-cache", &mut encoded);
        assert_eq!(encoded, [0xa8, 0xeb, 0x10, 0x64, 0x9c, 0xbf]);
    }

    #[test]
    fn simple_strings_roundtrip() {
        let cases: &[&[u8]] = &[
            b"",
            b"a",
            b"hello",
            b"www.example.com",
            b"Mon, 21 Oct 2013 20:13:21 GMT",
            b"text/html; charset=utf-8",
        ];

        for &input in cases {
            assert_eq!(roundtrip(input), input);
        }
    }

    #[test]
    fn all_bytes_roundtrip() {
        let input: Vec<u8> = (0..=255).collect();
        assert_eq!(roundtrip(&input), input);
    }

    #[test]
    fn encoded_len_matches_output() {
        let data = b"Mon, 21 Oct 2013 20:13:21 GMT";
        let mut encoded = Vec::new();
        encode(data, &mut encoded);
        assert_eq!(encoded_len(data), encoded.len());
    }

    #[test]
    fn zero_padding_rejected() {
        // 'a' is 00011 (5 bits); padding the byte with zeros instead of the
        // EOS prefix must be rejected.
        let mut out = Vec::new();
        assert_eq!(
            decode(&[0b0001_1000], &mut out),
            Err(HuffmanError::InvalidPadding)
        );
    }

    #[test]
    fn overlong_padding_rejected() {
        // A full byte of ones after a symbol is 8 bits of padding.
        let mut encoded = Vec::new();
        encode(b"0", &mut encoded); // '0' is 00000 (5 bits), padded to 1 byte
        encoded.push(0xff);

        let mut out = Vec::new();
        assert_eq!(
            decode(&encoded, &mut out),
            Err(HuffmanError::InvalidPadding)
        );
    }
}
