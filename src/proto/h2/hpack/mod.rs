//! HPACK header compression (RFC 7541).

pub(crate) mod decode;
pub(crate) mod encode;
pub(crate) mod huffman;
pub(crate) mod table;

pub(crate) use self::decode::Decoder;
pub(crate) use self::encode::Encoder;

/// Errors raised while decoding a header block. All of them are terminal for
/// the stream carrying the block (`COMPRESSION_ERROR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecoderError {
    /// Index 0 or past both tables.
    InvalidIndex,
    /// Integer continuation overflowed or ran past the block.
    InvalidInteger,
    /// String literal ran past the block.
    StringUnderflow,
    /// Invalid Huffman code or padding.
    InvalidHuffman,
    /// Size update above the negotiated SETTINGS bound, or mid-block.
    InvalidSizeUpdate,
    /// Decoded header list exceeded SETTINGS_MAX_HEADER_LIST_SIZE.
    HeaderListTooLarge,
}

impl std::fmt::Display for DecoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DecoderError::InvalidIndex => "hpack: invalid table index",
            DecoderError::InvalidInteger => "hpack: invalid integer encoding",
            DecoderError::StringUnderflow => "hpack: truncated string literal",
            DecoderError::InvalidHuffman => "hpack: invalid huffman coding",
            DecoderError::InvalidSizeUpdate => "hpack: invalid table size update",
            DecoderError::HeaderListTooLarge => "hpack: header list too large",
        })
    }
}

impl std::error::Error for DecoderError {}
