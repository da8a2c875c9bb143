//! HPACK block encoder.

use super::huffman;
use super::table::{DynamicTable, STATIC_TABLE};

/// Encodes header lists, maintaining the dynamic table across blocks.
///
/// Strategy: exact matches become indexed fields, name matches become
/// literals with an indexed name, everything else a full literal. Literals
/// use incremental indexing so repeated headers compress on later blocks,
/// and Huffman coding whenever it is shorter.
#[derive(Debug)]
pub(crate) struct Encoder {
    table: DynamicTable,
    /// Size update to announce at the start of the next block.
    pending_size_update: Option<usize>,
}

impl Encoder {
    pub(crate) fn new(header_table_size: usize) -> Encoder {
        Encoder {
            table: DynamicTable::new(header_table_size),
            pending_size_update: None,
        }
    }

    /// Applies the peer's `SETTINGS_HEADER_TABLE_SIZE`; the corresponding
    /// size update is emitted on the next encoded block as RFC 7541 §4.2
    /// requires.
    pub(crate) fn set_max_table_size(&mut self, size: usize) {
        self.table.set_max_size(size);
        self.pending_size_update = Some(size);
    }

    /// Encodes one header list as a header block.
    pub(crate) fn encode<'h>(
        &mut self,
        headers: impl Iterator<Item = (&'h [u8], &'h [u8])>,
        dst: &mut Vec<u8>,
    ) {
        if let Some(size) = self.pending_size_update.take() {
            encode_integer(size as u64, 5, 0x20, dst);
        }
        for (name, value) in headers {
            self.encode_field(name, value, dst);
        }
    }

    fn encode_field(&mut self, name: &[u8], value: &[u8], dst: &mut Vec<u8>) {
        if let Some(index) = find_static(name, value) {
            encode_integer(index as u64, 7, 0x80, dst);
            return;
        }
        if let Some(position) = self.table.find(name, value) {
            let index = STATIC_TABLE.len() + 1 + position;
            encode_integer(index as u64, 7, 0x80, dst);
            return;
        }

        let name_index = find_static_name(name)
            .or_else(|| self.table.find_name(name).map(|p| STATIC_TABLE.len() + 1 + p));
        match name_index {
            Some(index) => encode_integer(index as u64, 6, 0x40, dst),
            None => {
                dst.push(0x40);
                encode_string(name, dst);
            }
        }
        encode_string(value, dst);
        self.table.insert(name.to_vec(), value.to_vec());
    }
}

fn find_static(name: &[u8], value: &[u8]) -> Option<usize> {
    STATIC_TABLE
        .iter()
        .position(|&(n, v)| n.as_bytes() == name && v.as_bytes() == value)
        .map(|idx| idx + 1)
}

fn find_static_name(name: &[u8]) -> Option<usize> {
    STATIC_TABLE
        .iter()
        .position(|&(n, _)| n.as_bytes() == name)
        .map(|idx| idx + 1)
}

/// N-bit prefix integer encoding (RFC 7541 §5.1). `pattern` carries the
/// representation bits above the prefix.
fn encode_integer(value: u64, prefix_bits: u8, pattern: u8, dst: &mut Vec<u8>) {
    let mask = (1u64 << prefix_bits) - 1;
    if value < mask {
        dst.push(pattern | value as u8);
        return;
    }
    dst.push(pattern | mask as u8);
    let mut rest = value - mask;
    while rest >= 0x80 {
        dst.push((rest as u8 & 0x7f) | 0x80);
        rest >>= 7;
    }
    dst.push(rest as u8);
}

fn encode_string(value: &[u8], dst: &mut Vec<u8>) {
    let huffman_len = huffman::encoded_len(value);
    if huffman_len < value.len() {
        encode_integer(huffman_len as u64, 7, 0x80, dst);
        huffman::encode(value, dst);
    } else {
        encode_integer(value.len() as u64, 7, 0x00, dst);
        dst.extend_from_slice(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_full_match_is_one_byte() {
        let mut encoder = Encoder::new(4096);
        let mut dst = Vec::new();
        encoder.encode([(&b":method"[..], &b"GET"[..])].into_iter(), &mut dst);
        assert_eq!(dst, [0x82]);
    }

    #[test]
    fn static_name_match_uses_indexed_name() {
        let mut encoder = Encoder::new(4096);
        let mut dst = Vec::new();
        encoder.encode([(&b":path"[..], &b"/x"[..])].into_iter(), &mut dst);
        // 0x44 = literal with indexing, name index 4 (:path).
        assert_eq!(dst[0], 0x44);
    }

    #[test]
    fn repeated_field_compresses_to_index() {
        let mut encoder = Encoder::new(4096);
        let mut first = Vec::new();
        encoder.encode([(&b"x-trace-id"[..], &b"abc123"[..])].into_iter(), &mut first);
        let mut second = Vec::new();
        encoder.encode([(&b"x-trace-id"[..], &b"abc123"[..])].into_iter(), &mut second);
        // Second occurrence is a single indexed byte: index 62.
        assert_eq!(second, [0x80 | 62]);
        assert!(first.len() > second.len());
    }

    #[test]
    fn integer_examples_from_rfc() {
        // C.1.1: 10 with 5-bit prefix.
        let mut dst = Vec::new();
        encode_integer(10, 5, 0, &mut dst);
        assert_eq!(dst, [0x0a]);
        // C.1.2: 1337 with 5-bit prefix.
        let mut dst = Vec::new();
        encode_integer(1337, 5, 0, &mut dst);
        assert_eq!(dst, [0x1f, 0x9a, 0x0a]);
    }

    #[test]
    fn size_update_emitted_once() {
        let mut encoder = Encoder::new(4096);
        encoder.set_max_table_size(256);
        let mut dst = Vec::new();
        encoder.encode([(&b":method"[..], &b"GET"[..])].into_iter(), &mut dst);
        // 0x3f 0xe1 0x01 = size update to 256, then indexed :method GET.
        assert_eq!(dst, [0x3f, 0xe1, 0x01, 0x82]);
        let mut dst = Vec::new();
        encoder.encode([(&b":method"[..], &b"GET"[..])].into_iter(), &mut dst);
        assert_eq!(dst, [0x82]);
    }
}
