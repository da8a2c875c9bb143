use http::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::request::HeadersView;

/// Response headers owned by the framework; user values are rejected.
pub(crate) const RESERVED_RESPONSE_HEADERS: &[HeaderName] = &[
    header::CONNECTION,
    header::CONTENT_LENGTH,
    header::DATE,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Names that must not appear in chunked trailers (RFC 7230 §4.1.2).
pub(crate) const FORBIDDEN_TRAILER_HEADERS: &[HeaderName] = &[
    header::AUTHORIZATION,
    header::CACHE_CONTROL,
    header::CONTENT_ENCODING,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::CONTENT_TYPE,
    header::COOKIE,
    header::EXPECT,
    header::EXPIRES,
    header::HOST,
    header::IF_MATCH,
    header::IF_MODIFIED_SINCE,
    header::IF_NONE_MATCH,
    header::IF_UNMODIFIED_SINCE,
    header::PRAGMA,
    header::RANGE,
    header::SET_COOKIE,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::VARY,
];

pub(crate) fn is_reserved_response_header(name: &HeaderName) -> bool {
    RESERVED_RESPONSE_HEADERS.contains(name)
}

pub(crate) fn is_forbidden_trailer(name: &HeaderName) -> bool {
    FORBIDDEN_TRAILER_HEADERS.contains(name)
}

fn value_has_token(value: &[u8], needle: &str) -> bool {
    if let Ok(s) = std::str::from_utf8(value) {
        for token in s.split(',') {
            if token.trim().eq_ignore_ascii_case(needle) {
                return true;
            }
        }
    }
    false
}

pub(crate) fn connection_keep_alive(headers: &HeadersView) -> bool {
    headers
        .get("connection")
        .is_some_and(|value| value_has_token(value, "keep-alive"))
}

pub(crate) fn connection_close(headers: &HeadersView) -> bool {
    headers
        .get("connection")
        .is_some_and(|value| value_has_token(value, "close"))
}

pub(crate) fn content_length_parse(headers: &HeadersView) -> Option<Result<u64, ()>> {
    headers.get("content-length").map(|value| {
        std::str::from_utf8(value)
            .ok()
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse().ok())
            .ok_or(())
    })
}

/// Returns whether `Transfer-Encoding` names `chunked` as its final coding.
/// Any other final coding is a 501 per the framing rules.
pub(crate) fn transfer_encoding_is_chunked(value: &[u8]) -> bool {
    if let Ok(s) = std::str::from_utf8(value) {
        if let Some(encoding) = s.rsplit(',').next() {
            return encoding.trim().eq_ignore_ascii_case("chunked");
        }
    }
    false
}

pub(crate) fn expects_continue(headers: &HeadersView) -> bool {
    headers
        .get("expect")
        .is_some_and(|value| value.eq_ignore_ascii_case(b"100-continue"))
}

pub(crate) fn header_map_connection_close(headers: &HeaderMap<HeaderValue>) -> bool {
    headers
        .get(header::CONNECTION)
        .is_some_and(|value| value_has_token(value.as_bytes(), "close"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::HeaderIndices;
    use bytes::Bytes;

    fn single(name: &str, value: &str) -> HeadersView {
        let raw = format!("{}: {}\r\n", name, value);
        let name_range = (0, name.len());
        let value_start = name.len() + 2;
        let entries = vec![HeaderIndices {
            name: name_range,
            value: (value_start, value_start + value.len()),
        }];
        HeadersView::new(Bytes::from(raw), entries)
    }

    #[test]
    fn keep_alive_token_detection() {
        assert!(connection_keep_alive(&single("Connection", "keep-alive")));
        assert!(connection_keep_alive(&single(
            "Connection",
            "Upgrade, Keep-Alive"
        )));
        assert!(!connection_keep_alive(&single("Connection", "close")));
        assert!(connection_close(&single("Connection", "close")));
    }

    #[test]
    fn content_length_strictness() {
        assert_eq!(content_length_parse(&single("Content-Length", "42")), Some(Ok(42)));
        assert_eq!(content_length_parse(&single("Content-Length", "4x")), Some(Err(())));
        assert_eq!(content_length_parse(&single("Content-Length", "-1")), Some(Err(())));
        assert_eq!(content_length_parse(&single("Host", "h")), None);
    }

    #[test]
    fn chunked_must_be_final() {
        assert!(transfer_encoding_is_chunked(b"chunked"));
        assert!(transfer_encoding_is_chunked(b"gzip, chunked"));
        assert!(!transfer_encoding_is_chunked(b"chunked, gzip"));
        assert!(!transfer_encoding_is_chunked(b"gzip"));
    }
}
