//! Outgoing response representation.

use std::borrow::Cow;
use std::fmt;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;

use crate::body::Body;
use crate::error::{Error, Result, User};
use crate::headers;

/// An outgoing HTTP response.
///
/// The framework owns `Date`, `Content-Length`, `Connection`,
/// `Transfer-Encoding`, `TE`, `Trailer`, and `Upgrade`; attempts to set them
/// through [`with_header`](Response::with_header) are rejected.
pub struct Response {
    pub(crate) status: StatusCode,
    pub(crate) reason: Option<Cow<'static, str>>,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Body,
    pub(crate) trailers: Option<HeaderMap>,
}

impl Response {
    pub fn new(status: StatusCode) -> Response {
        Response {
            status,
            reason: None,
            headers: HeaderMap::new(),
            body: Body::Empty,
            trailers: None,
        }
    }

    /// A `200 OK` response with no body.
    pub fn ok() -> Response {
        Response::new(StatusCode::OK)
    }

    /// A plain-text response with `Content-Type: text/plain`.
    pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Response {
        let mut response = Response::new(status);
        response.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response.body = Body::Bytes(body.into());
        response
    }

    /// An HTML response with `Content-Type: text/html`.
    pub fn html(status: StatusCode, body: impl Into<Bytes>) -> Response {
        let mut response = Response::new(status);
        response.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        response.body = Body::Bytes(body.into());
        response
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Override the status line reason phrase.
    pub fn with_reason(mut self, reason: impl Into<Cow<'static, str>>) -> Response {
        self.reason = Some(reason.into());
        self
    }

    /// Adds a user header, rejecting names the framework owns.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Result<Response> {
        if headers::is_reserved_response_header(&name) {
            return Err(Error::new_user(User::ReservedHeader).with(name.as_str().to_owned()));
        }
        self.headers.append(name, value);
        Ok(self)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn with_body(mut self, body: impl Into<Body>) -> Response {
        self.body = body.into();
        self
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Attaches trailers, which require a non-empty body and must not use
    /// forbidden names.
    pub fn with_trailers(mut self, trailers: HeaderMap) -> Result<Response> {
        if self.body.is_empty() {
            return Err(Error::new_user(User::InvalidTrailer).with("trailers require a body"));
        }
        for name in trailers.keys() {
            if headers::is_forbidden_trailer(name) {
                return Err(
                    Error::new_user(User::InvalidTrailer).with(name.as_str().to_owned())
                );
            }
        }
        self.trailers = Some(trailers);
        Ok(self)
    }

    pub(crate) fn reason_phrase(&self) -> &str {
        match self.reason {
            Some(ref reason) => reason,
            None => self.status.canonical_reason().unwrap_or(""),
        }
    }

    /// Short plain-text error response used for request-scoped failures.
    pub(crate) fn error_status(status: StatusCode) -> Response {
        let mut text = String::with_capacity(32);
        text.push_str(status.canonical_reason().unwrap_or("Error"));
        text.push('\n');
        Response::text(status, text)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

/// Incremental response writer handed to streaming handlers.
///
/// Chunks queue against the connection's outbound budget; once the budget is
/// exhausted or the connection has closed, writes fail and the handler should
/// stop producing.
pub struct ResponseWriter {
    status: StatusCode,
    headers: HeaderMap,
    chunks: Vec<Bytes>,
    queued: usize,
    budget: usize,
    ended: bool,
    failed: bool,
}

impl fmt::Debug for ResponseWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseWriter")
            .field("status", &self.status)
            .field("queued", &self.queued)
            .field("budget", &self.budget)
            .field("ended", &self.ended)
            .finish()
    }
}

impl ResponseWriter {
    pub(crate) fn new(budget: usize) -> ResponseWriter {
        ResponseWriter {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            chunks: Vec::new(),
            queued: 0,
            budget,
            ended: false,
            failed: false,
        }
    }

    /// Sets the status line; must be called before the first write.
    pub fn status(&mut self, status: StatusCode) -> Result<()> {
        if !self.chunks.is_empty() || self.ended {
            return Err(Error::new_user(User::WriteAfterClose).with("status after first write"));
        }
        self.status = status;
        Ok(())
    }

    pub fn add_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<()> {
        if headers::is_reserved_response_header(&name) {
            return Err(Error::new_user(User::ReservedHeader).with(name.as_str().to_owned()));
        }
        if !self.chunks.is_empty() || self.ended {
            return Err(Error::new_user(User::WriteAfterClose).with("header after first write"));
        }
        self.headers.append(name, value);
        Ok(())
    }

    /// Queues a body chunk. Empty chunks are ignored.
    pub fn write(&mut self, data: impl Into<Bytes>) -> Result<()> {
        if self.ended || self.failed {
            return Err(Error::new_user(User::WriteAfterClose));
        }
        let data = data.into();
        if data.is_empty() {
            return Ok(());
        }
        if self.queued + data.len() > self.budget {
            self.failed = true;
            return Err(Error::new(crate::error::Kind::OutboundOverflow));
        }
        self.queued += data.len();
        self.chunks.push(data);
        Ok(())
    }

    /// Marks the response complete. Further writes fail.
    pub fn end(&mut self) {
        self.ended = true;
    }

    pub(crate) fn finish(self) -> (StatusCode, HeaderMap, Vec<Bytes>, bool) {
        (self.status, self.headers, self.chunks, self.failed)
    }
}
