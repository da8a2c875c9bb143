//! Outgoing response bodies.

use std::fmt;
use std::fs::File;

use bytes::Bytes;

/// Body of an outgoing response.
///
/// Inline bytes are written from the send buffer; file ranges are streamed
/// from the file handle by the connection layer so large files never sit in
/// memory whole.
pub enum Body {
    Empty,
    Bytes(Bytes),
    /// A range of a regular file: `(handle, offset, length)`.
    File {
        file: File,
        offset: u64,
        len: u64,
    },
}

impl Body {
    pub fn empty() -> Body {
        Body::Empty
    }

    pub fn bytes(data: impl Into<Bytes>) -> Body {
        Body::Bytes(data.into())
    }

    pub fn file_range(file: File, offset: u64, len: u64) -> Body {
        Body::File { file, offset, len }
    }

    /// Content length this body will produce.
    pub fn len(&self) -> u64 {
        match *self {
            Body::Empty => 0,
            Body::Bytes(ref data) => data.len() as u64,
            Body::File { len, .. } => len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Body {
    fn default() -> Body {
        Body::Empty
    }
}

impl From<Bytes> for Body {
    fn from(data: Bytes) -> Body {
        Body::Bytes(data)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Body {
        Body::Bytes(data.into())
    }
}

impl From<&'static str> for Body {
    fn from(data: &'static str) -> Body {
        Body::Bytes(Bytes::from_static(data.as_bytes()))
    }
}

impl From<String> for Body {
    fn from(data: String) -> Body {
        Body::Bytes(data.into())
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(ref data) => f.debug_tuple("Body::Bytes").field(&data.len()).finish(),
            Body::File { offset, len, .. } => f
                .debug_struct("Body::File")
                .field("offset", &offset)
                .field("len", &len)
                .finish(),
        }
    }
}
