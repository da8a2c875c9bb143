//! Incoming request representation.
//!
//! An HTTP/1.1 request is a view over the connection receive buffer: the
//! method, target, and every header name/value are byte ranges into the
//! frozen head. An HTTP/2 request uses the same shape over a per-stream
//! scratch buffer filled by the HPACK decoder. Storing offsets instead of
//! pointers keeps the in-place duplicate-header merge trivially safe.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Version};

/// A single header entry: name and value ranges into the head buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HeaderIndices {
    pub(crate) name: (usize, usize),
    pub(crate) value: (usize, usize),
}

/// Insertion-ordered header map resolving byte ranges at access time.
#[derive(Clone, Default)]
pub struct HeadersView {
    buf: Bytes,
    entries: Vec<HeaderIndices>,
}

impl HeadersView {
    pub(crate) fn new(buf: Bytes, entries: Vec<HeaderIndices>) -> Self {
        HeadersView { buf, entries }
    }

    /// Number of distinct headers (after duplicate merging).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Case-insensitive lookup returning the merged value bytes.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries.iter().find_map(|entry| {
            let entry_name = &self.buf[entry.name.0..entry.name.1];
            if entry_name.eq_ignore_ascii_case(name.as_bytes()) {
                Some(&self.buf[entry.value.0..entry.value.1])
            } else {
                None
            }
        })
    }

    /// Like [`get`](Self::get), but lossy-decoded for text-valued headers.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|value| std::str::from_utf8(value).ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(move |entry| {
            let name = &self.buf[entry.name.0..entry.name.1];
            // Header names were validated as tokens during parsing.
            let name = unsafe { std::str::from_utf8_unchecked(name) };
            (name, &self.buf[entry.value.0..entry.value.1])
        })
    }

    #[cfg(test)]
    pub(crate) fn buf(&self) -> &Bytes {
        &self.buf
    }
}

impl fmt::Debug for HeadersView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in self.iter() {
            map.entry(&name, &String::from_utf8_lossy(value));
        }
        map.finish()
    }
}

/// A request-scoped cancellation token.
///
/// Set when the owning connection closes while a handler is still running;
/// long-lived handlers should poll it and abandon work once cancelled.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// An incoming HTTP request, dispatched to handlers by the router.
pub struct Request {
    pub(crate) method: Method,
    pub(crate) target: Bytes,
    pub(crate) version: Version,
    pub(crate) headers: HeadersView,
    pub(crate) body: Bytes,
    /// HTTP/2 only.
    pub(crate) stream_id: Option<u32>,
    pub(crate) scheme: Option<Bytes>,
    pub(crate) authority: Option<Bytes>,
    pub(crate) path_params: Vec<(String, String)>,
    pub(crate) cancel: CancelToken,
}

impl Request {
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The raw request target, including any query string.
    pub fn target(&self) -> &[u8] {
        &self.target
    }

    /// The path component of the target, excluding the query string.
    pub fn path(&self) -> &str {
        let target = match self.target.iter().position(|&b| b == b'?') {
            Some(idx) => &self.target[..idx],
            None => &self.target[..],
        };
        std::str::from_utf8(target).unwrap_or("/")
    }

    /// The query string, without the leading `?`.
    pub fn query(&self) -> Option<&[u8]> {
        self.target
            .iter()
            .position(|&b| b == b'?')
            .map(|idx| &self.target[idx + 1..])
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeadersView {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The HTTP/2 stream this request arrived on, if any.
    pub fn stream_id(&self) -> Option<u32> {
        self.stream_id
    }

    /// `:scheme` pseudo-header (HTTP/2) or the transport scheme.
    pub fn scheme(&self) -> Option<&[u8]> {
        self.scheme.as_deref()
    }

    /// `:authority` pseudo-header (HTTP/2) or the `Host` header (HTTP/1.1).
    pub fn authority(&self) -> Option<&[u8]> {
        match self.authority {
            Some(ref authority) => Some(authority),
            None => self.headers.get("host"),
        }
    }

    /// Value captured by a `{name}` pattern segment in the matched route.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, value)| value.as_str())
    }

    /// Token observed by handlers that need to notice connection teardown.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub(crate) fn new_h1(
        method: Method,
        target: Bytes,
        version: Version,
        headers: HeadersView,
        body: Bytes,
    ) -> Self {
        Request {
            method,
            target,
            version,
            headers,
            body,
            stream_id: None,
            scheme: None,
            authority: None,
            path_params: Vec::new(),
            cancel: CancelToken::new(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("target", &String::from_utf8_lossy(&self.target))
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("stream_id", &self.stream_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(raw: &str, entries: &[((usize, usize), (usize, usize))]) -> HeadersView {
        HeadersView::new(
            Bytes::copy_from_slice(raw.as_bytes()),
            entries
                .iter()
                .map(|&(name, value)| HeaderIndices { name, value })
                .collect(),
        )
    }

    #[test]
    fn get_is_case_insensitive() {
        let headers = view("Host: example.com\r\n", &[((0, 4), (6, 17))]);
        assert_eq!(headers.get("host"), Some(&b"example.com"[..]));
        assert_eq!(headers.get("HOST"), Some(&b"example.com"[..]));
        assert_eq!(headers.get("hos"), None);
    }

    #[test]
    fn path_splits_query() {
        let req = Request::new_h1(
            Method::GET,
            Bytes::from_static(b"/search?q=rust"),
            Version::HTTP_11,
            HeadersView::default(),
            Bytes::new(),
        );
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query(), Some(&b"q=rust"[..]));
    }
}
