//! Request head parsing, in place inside the receive buffer.

use bytes::{Bytes, BytesMut};
use http::{Method, Version};
use tracing::trace;

use super::merge::coalesce_headers;
use crate::error::{Error, Parse, Result};
use crate::request::{HeaderIndices, HeadersView};

pub(crate) const MAX_HEADERS: usize = 100;

/// A fully parsed request head. The target and every header view borrow the
/// frozen head bytes; the body bytes stay behind in the receive buffer.
#[derive(Debug)]
pub(crate) struct ParsedHead {
    pub(crate) method: Method,
    pub(crate) target: Bytes,
    pub(crate) version: Version,
    pub(crate) headers: HeadersView,
}

/// Tries to parse a complete head from the front of `buf`.
///
/// Returns `Ok(None)` until the `\r\n\r\n` separator has arrived. Once it
/// has, the head is split off `buf`, duplicates are merged in place, and the
/// head is frozen. Over-long heads fail with [`Parse::TooLarge`] (431).
pub(crate) fn parse_head(
    buf: &mut BytesMut,
    max_header_bytes: usize,
    merge_unknown: bool,
) -> Result<Option<ParsedHead>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut indices = [HeaderIndices {
        name: (0, 0),
        value: (0, 0),
    }; MAX_HEADERS];

    let (len, method, target_range, version, headers_len) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        trace!(buf_len = buf.len(), "parse_head");
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                if len > max_header_bytes {
                    return Err(Error::new_parse(Parse::TooLarge));
                }
                let method = Method::from_bytes(req.method.unwrap_or("").as_bytes())
                    .map_err(|_| Error::new_parse(Parse::Method))?;
                let version = match req.version {
                    Some(0) => Version::HTTP_10,
                    Some(1) => Version::HTTP_11,
                    _ => return Err(Error::new_parse(Parse::Version)),
                };
                let path = req.path.ok_or_else(|| Error::new_parse(Parse::Uri))?;
                let base = buf.as_ptr() as usize;
                let target_start = path.as_ptr() as usize - base;
                let target_range = (target_start, target_start + path.len());

                record_header_indices(buf, req.headers, &mut indices);
                (len, method, target_range, version, req.headers.len())
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > max_header_bytes {
                    return Err(Error::new_parse(Parse::TooLarge));
                }
                return Ok(None);
            }
            Err(httparse::Error::Version) => return Err(Error::new_parse(Parse::Version)),
            Err(httparse::Error::Token) => return Err(Error::new_parse(Parse::Method)),
            Err(_) => return Err(Error::new_parse(Parse::Header)),
        }
    };

    let mut head = buf.split_to(len);
    let mut entries = indices[..headers_len].to_vec();
    coalesce_headers(&mut head, &mut entries, merge_unknown)
        .map_err(|_| Error::new_parse(Parse::Header))?;

    let head = head.freeze();
    let target = head.slice(target_range.0..target_range.1);
    Ok(Some(ParsedHead {
        method,
        target,
        version,
        headers: HeadersView::new(head, entries),
    }))
}

fn record_header_indices(
    bytes: &[u8],
    headers: &[httparse::Header<'_>],
    indices: &mut [HeaderIndices],
) {
    let base = bytes.as_ptr() as usize;
    for (header, index) in headers.iter().zip(indices.iter_mut()) {
        let name_start = header.name.as_ptr() as usize - base;
        index.name = (name_start, name_start + header.name.len());
        let value_start = header.value.as_ptr() as usize - base;
        index.value = (value_start, value_start + header.value.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &[u8]) -> Result<Option<ParsedHead>> {
        let mut buf = BytesMut::from(raw);
        parse_head(&mut buf, 8192, true)
    }

    #[test]
    fn simple_get() {
        let head = parse(b"GET /ping HTTP/1.1\r\nHost: h\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(&head.target[..], b"/ping");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.get("host"), Some(&b"h"[..]));
    }

    #[test]
    fn partial_returns_none() {
        assert!(parse(b"GET /ping HTTP/1.1\r\nHos").unwrap().is_none());
    }

    #[test]
    fn body_left_in_buffer() {
        let mut buf = BytesMut::from(&b"POST /x HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody"[..]);
        let head = parse_head(&mut buf, 8192, true).unwrap().unwrap();
        assert_eq!(head.method, Method::POST);
        assert_eq!(&buf[..], b"body");
    }

    #[test]
    fn oversize_head_rejected_while_partial() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend_from_slice(b"X-Filler: ");
        raw.extend(std::iter::repeat(b'a').take(9000));
        let mut buf = BytesMut::from(&raw[..]);
        let err = parse_head(&mut buf, 8192, true).unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn bad_version_rejected() {
        assert!(parse(b"GET / HTTP/2.0\r\n\r\n").is_err());
    }

    #[test]
    fn duplicate_accept_encoding_merges() {
        let head = parse(
            b"GET / HTTP/1.1\r\nAccept-Encoding: gzip\r\nAccept-Encoding: br\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert_eq!(head.headers.get("accept-encoding"), Some(&b"gzip,br"[..]));
        assert_eq!(head.headers.len(), 1);
    }

    #[test]
    fn duplicate_host_is_malformed() {
        let err = parse(b"GET / HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n").unwrap_err();
        assert!(err.is_parse());
    }

    #[test]
    fn merged_views_follow_frozen_head() {
        let head = parse(
            b"GET / HTTP/1.1\r\nAccept: a\r\nHost: h\r\nAccept: b\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        // After the in-place merge, every view resolves inside the head buffer.
        for (name, value) in head.headers.iter() {
            assert!(!name.is_empty());
            assert!(value.len() <= head.headers.buf().len());
        }
        assert_eq!(head.headers.get("accept"), Some(&b"a,b"[..]));
        assert_eq!(head.headers.get("host"), Some(&b"h"[..]));
    }
}
