//! Response head serialization and chunked body encoding.

use http::header::{HeaderMap, HeaderValue};
use http::{StatusCode, Version};

use super::date;

const AVERAGE_HEADER_SIZE: usize = 30;

/// Framing chosen for an outgoing response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseFraming {
    /// No framing header at all (204 / 304).
    None,
    Length(u64),
    Chunked,
}

/// Serializes a response head into `dst`: status line, cached `Date`,
/// framing header, `Connection: close` when requested, then user headers.
pub(crate) fn encode_head(
    dst: &mut Vec<u8>,
    version: Version,
    status: StatusCode,
    reason: &str,
    headers: &HeaderMap<HeaderValue>,
    framing: ResponseFraming,
    close: bool,
) {
    dst.reserve(64 + headers.len() * AVERAGE_HEADER_SIZE);

    if version == Version::HTTP_11 && status == StatusCode::OK && reason == "OK" {
        dst.extend_from_slice(b"HTTP/1.1 200 OK\r\n");
    } else {
        match version {
            Version::HTTP_10 => dst.extend_from_slice(b"HTTP/1.0 "),
            _ => dst.extend_from_slice(b"HTTP/1.1 "),
        }
        dst.extend_from_slice(status.as_str().as_bytes());
        dst.push(b' ');
        dst.extend_from_slice(reason.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    dst.extend_from_slice(b"Date: ");
    date::extend(dst);
    dst.extend_from_slice(b"\r\n");

    match framing {
        ResponseFraming::None => {}
        ResponseFraming::Length(len) => {
            let mut itoa_buf = itoa::Buffer::new();
            dst.extend_from_slice(b"Content-Length: ");
            dst.extend_from_slice(itoa_buf.format(len).as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        ResponseFraming::Chunked => {
            dst.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
    }

    if close {
        dst.extend_from_slice(b"Connection: close\r\n");
    }

    for (name, value) in headers {
        dst.extend_from_slice(name.as_str().as_bytes());
        dst.extend_from_slice(b": ");
        dst.extend_from_slice(value.as_bytes());
        dst.extend_from_slice(b"\r\n");
    }

    dst.extend_from_slice(b"\r\n");
}

/// Emits `HTTP/1.1 100 Continue` ahead of reading an expected body.
pub(crate) fn encode_continue(dst: &mut Vec<u8>) {
    dst.extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
}

/// Frames one chunk of a chunked body.
pub(crate) fn encode_chunk(dst: &mut Vec<u8>, data: &[u8]) {
    debug_assert!(!data.is_empty(), "zero-size chunk would terminate the body");
    let mut start = [0u8; 16];
    let mut pos = start.len();
    let mut len = data.len();
    loop {
        pos -= 1;
        start[pos] = b"0123456789abcdef"[len % 16];
        len /= 16;
        if len == 0 {
            break;
        }
    }
    dst.extend_from_slice(&start[pos..]);
    dst.extend_from_slice(b"\r\n");
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

/// Terminates a chunked body, emitting trailers if present.
pub(crate) fn encode_final_chunk(dst: &mut Vec<u8>, trailers: Option<&HeaderMap<HeaderValue>>) {
    dst.extend_from_slice(b"0\r\n");
    if let Some(trailers) = trailers {
        for (name, value) in trailers {
            dst.extend_from_slice(name.as_str().as_bytes());
            dst.extend_from_slice(b": ");
            dst.extend_from_slice(value.as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
    }
    dst.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderName;

    #[test]
    fn head_layout() {
        date::update();
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-answer"),
            HeaderValue::from_static("42"),
        );
        let mut dst = Vec::new();
        encode_head(
            &mut dst,
            Version::HTTP_11,
            StatusCode::NOT_FOUND,
            "Not Found",
            &headers,
            ResponseFraming::Length(9),
            true,
        );
        let text = String::from_utf8(dst).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("\r\nDate: "));
        assert!(text.contains("\r\nContent-Length: 9\r\n"));
        assert!(text.contains("\r\nConnection: close\r\n"));
        assert!(text.contains("\r\nx-answer: 42\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn fast_path_200() {
        let mut dst = Vec::new();
        encode_head(
            &mut dst,
            Version::HTTP_11,
            StatusCode::OK,
            "OK",
            &HeaderMap::new(),
            ResponseFraming::Length(0),
            false,
        );
        assert!(dst.starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(!String::from_utf8(dst).unwrap().contains("Connection"));
    }

    #[test]
    fn not_modified_has_no_framing_header() {
        let mut dst = Vec::new();
        encode_head(
            &mut dst,
            Version::HTTP_11,
            StatusCode::NOT_MODIFIED,
            "Not Modified",
            &HeaderMap::new(),
            ResponseFraming::None,
            false,
        );
        let text = String::from_utf8(dst).unwrap();
        assert!(!text.contains("Content-Length"), "{text}");
        assert!(!text.contains("Transfer-Encoding"), "{text}");
    }

    #[test]
    fn chunk_framing() {
        let mut dst = Vec::new();
        encode_chunk(&mut dst, b"Wiki");
        encode_chunk(&mut dst, &[b'x'; 26]);
        encode_final_chunk(&mut dst, None);
        let text = String::from_utf8(dst).unwrap();
        assert!(text.starts_with("4\r\nWiki\r\n1a\r\n"));
        assert!(text.ends_with("\r\n0\r\n\r\n"));
    }

    #[test]
    fn trailers_after_final_chunk() {
        let mut trailers = HeaderMap::new();
        trailers.insert(
            HeaderName::from_static("x-checksum"),
            HeaderValue::from_static("abc123"),
        );
        let mut dst = Vec::new();
        encode_final_chunk(&mut dst, Some(&trailers));
        assert_eq!(&dst[..], b"0\r\nx-checksum: abc123\r\n\r\n");
    }
}
