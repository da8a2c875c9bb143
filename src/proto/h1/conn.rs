//! HTTP/1.1 connection driver: head parsing, body framing, dispatch,
//! response serialization, and the keep-alive loop.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use super::decode::{body_framing, BodyFraming, ChunkedDecoder};
use super::encode::{self, ResponseFraming};
use super::parse::{parse_head, ParsedHead};
use super::{date, INIT_BUFFER_SIZE};
use crate::body::Body;
use crate::config::ServerConfig;
use crate::error::{Error, Kind, Parse, Result};
use crate::headers;
use crate::proto::{dispatch, Dispatched};
use crate::request::Request;
use crate::response::Response;
use crate::router::{RouteHandler, Router};

const FILE_CHUNK_SIZE: usize = 64 * 1024;

pub(crate) struct Http1Conn<T> {
    io: T,
    buf: BytesMut,
    config: Arc<ServerConfig>,
    router: Arc<Router>,
    connect_handler: Option<RouteHandler>,
    requests_served: u32,
}

enum HeadOutcome {
    Parsed(ParsedHead),
    /// Peer closed cleanly between requests.
    Eof,
}

impl<T> Http1Conn<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        io: T,
        initial: BytesMut,
        config: Arc<ServerConfig>,
        router: Arc<Router>,
        connect_handler: Option<RouteHandler>,
    ) -> Self {
        let mut buf = initial;
        buf.reserve(INIT_BUFFER_SIZE);
        Http1Conn {
            io,
            buf,
            config,
            router,
            connect_handler,
            requests_served: 0,
        }
    }

    /// Serves requests until the peer goes away, keep-alive ends, or an
    /// error closes the connection.
    pub(crate) async fn serve(mut self) -> Result<()> {
        loop {
            date::update();
            let head = match self.read_head().await {
                Ok(HeadOutcome::Parsed(head)) => head,
                Ok(HeadOutcome::Eof) => return Ok(()),
                Err(err) => {
                    self.reject(&err).await;
                    return Err(err);
                }
            };

            let body = match self.read_body(&head).await {
                Ok(body) => body,
                Err(err) => {
                    self.reject(&err).await;
                    return Err(err);
                }
            };

            self.requests_served += 1;
            let mut close = !self.keep_alive_allowed(&head);

            let is_head = head.method == Method::HEAD;
            let req = Request::new_h1(head.method, head.target, head.version, head.headers, body);
            let version = req.version();
            let cancel = req.cancel_token().clone();

            let dispatched = dispatch(
                &self.router,
                self.connect_handler.as_ref(),
                req,
                self.config.max_outbound_buffer_bytes,
            )
            .await;

            let written = self
                .write_response(version, dispatched, is_head, &mut close)
                .await;
            let overflowed = match written {
                Ok(overflowed) => overflowed,
                Err(err) => {
                    // The peer is gone; anything a handler spawned with a
                    // cloned token should stop producing.
                    cancel.cancel();
                    return Err(err);
                }
            };
            self.io.flush().await?;

            if overflowed {
                debug!("closing connection after outbound overflow");
                return Err(Error::new(Kind::OutboundOverflow));
            }
            if close {
                trace!("closing connection (keep-alive off)");
                return Ok(());
            }
        }
    }

    /// Reads until a complete head is buffered and parsed.
    ///
    /// Waiting for the first byte is bounded by the keep-alive idle budget;
    /// finishing the head is bounded by `header_read_timeout`, measured from
    /// the first byte after quiescence.
    async fn read_head(&mut self) -> Result<HeadOutcome> {
        let mut header_deadline: Option<Instant> = if self.buf.is_empty() {
            None
        } else {
            deadline_in(self.config.header_read_timeout)
        };

        loop {
            if let Some(head) = parse_head(
                &mut self.buf,
                self.config.max_header_bytes,
                self.config.merge_unknown_request_headers,
            )? {
                return Ok(HeadOutcome::Parsed(head));
            }

            let was_quiescent = self.buf.is_empty();
            let budget = if was_quiescent {
                self.keep_alive_idle_budget()
            } else {
                header_deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
            };
            let timeout_kind = if was_quiescent {
                Kind::IdleTimeout
            } else {
                Kind::HeaderTimeout
            };

            let read = self.read_more(budget, timeout_kind).await?;
            if read == 0 {
                if self.buf.is_empty() {
                    return Ok(HeadOutcome::Eof);
                }
                return Err(Error::new(Kind::IncompleteMessage));
            }
            if was_quiescent && header_deadline.is_none() {
                // First byte after quiescence starts the slow-header clock.
                header_deadline = deadline_in(self.config.header_read_timeout);
            }
        }
    }

    async fn read_more(&mut self, budget: Option<Duration>, kind: Kind) -> Result<usize> {
        self.buf.reserve(INIT_BUFFER_SIZE);
        let read = match budget {
            Some(budget) => timeout(budget, self.io.read_buf(&mut self.buf))
                .await
                .map_err(|_| Error::new(kind))??,
            None => self.io.read_buf(&mut self.buf).await?,
        };
        trace!(read, "transport read");
        Ok(read)
    }

    async fn read_body(&mut self, head: &ParsedHead) -> Result<Bytes> {
        let framing = body_framing(head)?;
        if framing != BodyFraming::None
            && head.version == Version::HTTP_11
            && headers::expects_continue(&head.headers)
        {
            let mut interim = Vec::with_capacity(25);
            encode::encode_continue(&mut interim);
            self.io.write_all(&interim).await?;
            self.io.flush().await?;
        }

        match framing {
            BodyFraming::None => Ok(Bytes::new()),
            BodyFraming::Length(len) => {
                if len > self.config.max_body_bytes as u64 {
                    return Err(Error::new_parse(Parse::BodyTooLarge));
                }
                let len = len as usize;
                while self.buf.len() < len {
                    if self.read_more(None, Kind::Io).await? == 0 {
                        return Err(Error::new(Kind::IncompleteMessage));
                    }
                }
                Ok(self.buf.split_to(len).freeze())
            }
            BodyFraming::Chunked => {
                let mut decoder = ChunkedDecoder::new(self.config.max_body_bytes);
                loop {
                    if let Some(body) = decoder.decode(&mut self.buf)? {
                        return Ok(body);
                    }
                    if self.read_more(None, Kind::Io).await? == 0 {
                        return Err(Error::new(Kind::IncompleteMessage));
                    }
                }
            }
        }
    }

    fn keep_alive_idle_budget(&self) -> Option<Duration> {
        if self.config.keep_alive_timeout.is_zero() {
            None
        } else {
            Some(self.config.keep_alive_timeout)
        }
    }

    fn keep_alive_allowed(&self, head: &ParsedHead) -> bool {
        if !self.config.enable_keep_alive {
            return false;
        }
        if self.requests_served >= self.config.max_requests_per_connection {
            return false;
        }
        match head.version {
            Version::HTTP_11 => !headers::connection_close(&head.headers),
            Version::HTTP_10 => headers::connection_keep_alive(&head.headers),
            _ => false,
        }
    }

    /// Serializes and writes the dispatched response. Returns whether the
    /// streaming writer hit the outbound cap (connection must close after
    /// the drain).
    async fn write_response(
        &mut self,
        version: Version,
        dispatched: Dispatched,
        is_head: bool,
        close: &mut bool,
    ) -> Result<bool> {
        let Dispatched {
            response,
            chunks,
            suppress_body,
            overflowed: writer_overflowed,
        } = dispatched;
        let suppress_body = suppress_body || is_head;
        let mut overflowed = writer_overflowed;

        if headers::header_map_connection_close(response.headers()) {
            // Reserved headers are rejected upstream, but double check.
            *close = true;
        }

        match chunks {
            Some(chunks) => {
                // Streaming output. HTTP/1.0 cannot frame chunks; fall back
                // to close-delimited.
                let total: usize = chunks.iter().map(Bytes::len).sum();
                let framing = if version == Version::HTTP_10 {
                    *close = true;
                    ResponseFraming::Length(total as u64)
                } else {
                    ResponseFraming::Chunked
                };
                if total >= self.config.max_outbound_buffer_bytes {
                    overflowed = true;
                }
                if overflowed {
                    *close = true;
                }
                let mut head = Vec::new();
                encode::encode_head(
                    &mut head,
                    version,
                    response.status,
                    response.reason_phrase(),
                    &response.headers,
                    framing,
                    *close,
                );
                self.io.write_all(&head).await?;
                if !suppress_body {
                    let mut out = Vec::new();
                    for chunk in &chunks {
                        match framing {
                            ResponseFraming::Chunked => encode::encode_chunk(&mut out, chunk),
                            ResponseFraming::Length(_) | ResponseFraming::None => {
                                out.extend_from_slice(chunk)
                            }
                        }
                    }
                    if framing == ResponseFraming::Chunked {
                        encode::encode_final_chunk(&mut out, None);
                    }
                    self.io.write_all(&out).await?;
                }
            }
            None => {
                let no_framing = matches!(
                    response.status,
                    StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED
                );
                let use_chunked =
                    !no_framing && response.trailers.is_some() && version == Version::HTTP_11;
                let framing = if no_framing {
                    ResponseFraming::None
                } else if use_chunked {
                    ResponseFraming::Chunked
                } else {
                    ResponseFraming::Length(response.body.len())
                };
                let mut head = Vec::new();
                encode::encode_head(
                    &mut head,
                    version,
                    response.status,
                    response.reason_phrase(),
                    &response.headers,
                    framing,
                    *close,
                );
                self.io.write_all(&head).await?;
                if !suppress_body && !no_framing {
                    self.write_body(&response, use_chunked).await?;
                }
            }
        }
        Ok(overflowed)
    }

    async fn write_body(&mut self, response: &Response, chunked: bool) -> Result<()> {
        match response.body {
            Body::Empty => {
                if chunked {
                    // Trailers require a body, so this cannot be reached via
                    // the public Response API.
                    let mut out = Vec::new();
                    encode::encode_final_chunk(&mut out, response.trailers.as_ref());
                    self.io.write_all(&out).await?;
                }
            }
            Body::Bytes(ref data) => {
                if chunked {
                    let mut out = Vec::with_capacity(data.len() + 32);
                    encode::encode_chunk(&mut out, data);
                    encode::encode_final_chunk(&mut out, response.trailers.as_ref());
                    self.io.write_all(&out).await?;
                } else {
                    self.io.write_all(data).await?;
                }
            }
            Body::File {
                ref file,
                offset,
                len,
            } => {
                let std_file = file.try_clone().map_err(Error::new_io)?;
                let mut file = tokio::fs::File::from_std(std_file);
                file.seek(SeekFrom::Start(offset)).await?;
                let mut remaining = len;
                let mut chunk = vec![0u8; FILE_CHUNK_SIZE.min(len as usize).max(1)];
                while remaining > 0 {
                    let want = chunk.len().min(remaining as usize);
                    let read = file.read(&mut chunk[..want]).await?;
                    if read == 0 {
                        return Err(Error::new(Kind::IncompleteMessage)
                            .with("file body shorter than advertised"));
                    }
                    if chunked {
                        let mut out = Vec::with_capacity(read + 16);
                        encode::encode_chunk(&mut out, &chunk[..read]);
                        self.io.write_all(&out).await?;
                    } else {
                        self.io.write_all(&chunk[..read]).await?;
                    }
                    remaining -= read as u64;
                }
                if chunked {
                    let mut out = Vec::new();
                    encode::encode_final_chunk(&mut out, response.trailers.as_ref());
                    self.io.write_all(&out).await?;
                }
            }
        }
        Ok(())
    }

    /// Best-effort error response before closing.
    async fn reject(&mut self, err: &Error) {
        let status = match err.kind() {
            Kind::Parse(Parse::TooLarge) => StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            Kind::Parse(Parse::BodyTooLarge) => StatusCode::PAYLOAD_TOO_LARGE,
            Kind::Parse(Parse::UnsupportedTransferEncoding) => StatusCode::NOT_IMPLEMENTED,
            Kind::Parse(_) => StatusCode::BAD_REQUEST,
            Kind::IdleTimeout | Kind::HeaderTimeout => return,
            Kind::IncompleteMessage | Kind::Io => return,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let response = Response::error_status(status);
        let mut head = Vec::new();
        encode::encode_head(
            &mut head,
            Version::HTTP_11,
            response.status,
            response.reason_phrase(),
            &response.headers,
            ResponseFraming::Length(response.body.len()),
            true,
        );
        if self.io.write_all(&head).await.is_ok() {
            if let Body::Bytes(ref data) = response.body {
                let _ = self.io.write_all(data).await;
            }
            let _ = self.io.flush().await;
        }
    }
}

fn deadline_in(budget: Duration) -> Option<Instant> {
    if budget.is_zero() {
        None
    } else {
        Some(Instant::now() + budget)
    }
}
