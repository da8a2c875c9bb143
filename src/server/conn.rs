//! Per-connection driver: transport setup, protocol selection, and the
//! HTTP/2 transport pump around the sans-io state machine.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::body::Body;
use crate::config::ServerConfig;
use crate::error::{Error, Kind, Result};
use crate::proto::h1::conn::Http1Conn;
use crate::proto::h1::date;
use crate::proto::h2::conn::{Connection, ConnectionState, Event};
use crate::proto::h2::frame::{Reason, StreamId, PREFACE};
use crate::proto::{dispatch, Dispatched};
use crate::request::{HeaderIndices, HeadersView, Request};
use crate::response::Response;
use crate::router::{RouteHandler, Router};
use crate::tls::Acceptor;

/// State shared by every connection of one reactor.
pub(crate) struct Shared {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) router: Arc<Router>,
    pub(crate) connect_handler: Option<RouteHandler>,
    pub(crate) tls: Option<Acceptor>,
    /// Flips to `true` when the server begins shutting down.
    pub(crate) shutdown: tokio::sync::watch::Receiver<bool>,
}

/// Accept-side entry point: sets transport options, runs the TLS handshake
/// when configured, sniffs the protocol, and hands off to the right loop.
pub(crate) async fn serve_connection(tcp: TcpStream, shared: Arc<Shared>) -> Result<()> {
    tcp.set_nodelay(true)?;

    if let Some(acceptor) = shared.tls.clone() {
        let handshake = acceptor.accept(tcp);
        let budget = shared.config.tls_handshake_timeout;
        let (stream, info) = if budget.is_zero() {
            handshake.await?
        } else {
            timeout(budget, handshake)
                .await
                .map_err(|_| Error::new(Kind::HandshakeTimeout))??
        };
        if info.alpn_is_h2() && shared.config.http2.enable {
            return serve_h2(stream, BytesMut::new(), true, shared).await;
        }
        return serve_h1(stream, BytesMut::new(), shared).await;
    }

    // Cleartext: h2c prior knowledge means the 24-byte magic arrives first.
    let mut tcp = tcp;
    let mut buf = BytesMut::with_capacity(crate::proto::h1::INIT_BUFFER_SIZE);
    if shared.config.http2.enable && shared.config.http2.enable_h2c {
        loop {
            let seen = buf.len().min(PREFACE.len());
            if buf[..seen] != PREFACE[..seen] {
                break;
            }
            if buf.len() >= PREFACE.len() {
                trace!("h2c prior-knowledge preface sniffed");
                return serve_h2(tcp, buf, false, shared).await;
            }
            let idle = shared.config.keep_alive_timeout;
            let read = if idle.is_zero() {
                tcp.read_buf(&mut buf).await?
            } else {
                timeout(idle, tcp.read_buf(&mut buf))
                    .await
                    .map_err(|_| Error::new(Kind::IdleTimeout))??
            };
            if read == 0 {
                if buf.is_empty() {
                    return Ok(());
                }
                break;
            }
        }
    }
    serve_h1(tcp, buf, shared).await
}

async fn serve_h1<T>(io: T, initial: BytesMut, shared: Arc<Shared>) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    Http1Conn::new(
        io,
        initial,
        shared.config.clone(),
        shared.router.clone(),
        shared.connect_handler.clone(),
    )
    .serve()
    .await
}

/// The HTTP/2 transport pump: reads feed the state machine, events dispatch
/// handlers, queued output flushes between steps.
async fn serve_h2<T>(
    mut io: T,
    initial: BytesMut,
    alpn_h2: bool,
    shared: Arc<Shared>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let config = &shared.config;
    let mut conn = Connection::new(&config.http2, config.max_body_bytes, true);
    if alpn_h2 {
        // Over ALPN the server speaks first.
        conn.send_initial_settings();
    }

    let mut buf = initial;
    let mut events = Vec::new();
    let mut shutdown = shared.shutdown.clone();
    let mut shutting_down = false;

    loop {
        date::update();
        flush_output(&mut io, &mut conn).await?;

        if conn.state() == ConnectionState::Closed {
            return Ok(());
        }
        if conn.is_draining() && !conn.has_active_streams() && !conn.has_pending_output() {
            trace!("h2 drain complete");
            return Ok(());
        }

        let recv_result = conn.recv(&mut buf, &mut events);
        for event in events.drain(..) {
            handle_event(&mut conn, event, &shared).await;
        }
        if let Err(err) = recv_result {
            // GOAWAY is already queued; drain it before closing.
            let _ = flush_output(&mut io, &mut conn).await;
            return Err(err);
        }
        flush_output(&mut io, &mut conn).await?;

        buf.reserve(crate::proto::h1::INIT_BUFFER_SIZE);
        let idle = config.keep_alive_timeout;
        let apply_idle = !idle.is_zero() && !conn.has_active_streams();
        let step = tokio::select! {
            biased;
            _ = shutdown.changed(), if !shutting_down => Step::Shutdown,
            result = async {
                if apply_idle {
                    timeout(idle, io.read_buf(&mut buf)).await.map_err(|_| ())
                } else {
                    Ok(io.read_buf(&mut buf).await)
                }
            } => match result {
                Ok(read) => Step::Read(read?),
                Err(()) => Step::Idle,
            },
        };
        match step {
            Step::Shutdown => {
                debug!("server shutting down, sending GOAWAY");
                shutting_down = true;
                conn.go_away(Reason::NO_ERROR);
            }
            Step::Idle => {
                debug!("h2 connection idle, sending GOAWAY");
                conn.go_away(Reason::NO_ERROR);
                let _ = flush_output(&mut io, &mut conn).await;
                return Err(Error::new(Kind::IdleTimeout));
            }
            Step::Read(0) => {
                trace!("h2 peer closed");
                return Ok(());
            }
            Step::Read(_) => {}
        }
    }
}

enum Step {
    Read(usize),
    Idle,
    Shutdown,
}

async fn flush_output<T>(io: &mut T, conn: &mut Connection) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    while conn.has_pending_output() {
        let out = conn.take_output();
        io.write_all(&out).await?;
    }
    io.flush().await?;
    Ok(())
}

async fn handle_event(conn: &mut Connection, event: Event, shared: &Arc<Shared>) {
    match event {
        Event::Request {
            stream_id,
            headers,
            body,
        } => {
            let request = match build_request(stream_id, headers, body) {
                Some(request) => request,
                None => {
                    conn.reset_stream(stream_id, Reason::PROTOCOL_ERROR);
                    return;
                }
            };
            let is_head = request.method() == Method::HEAD;
            let dispatched = dispatch(
                &shared.router,
                shared.connect_handler.as_ref(),
                request,
                shared.config.max_outbound_buffer_bytes,
            )
            .await;
            send_dispatched(conn, stream_id, dispatched, is_head, shared).await;
        }
        Event::RequestTooLarge(stream_id) => {
            let response = Response::error_status(StatusCode::PAYLOAD_TOO_LARGE);
            let dispatched = Dispatched {
                response,
                chunks: None,
                suppress_body: false,
                overflowed: false,
            };
            send_dispatched(conn, stream_id, dispatched, false, shared).await;
        }
        Event::StreamReset(stream_id, reason) => {
            debug!(stream_id, reason = %reason, "stream closed");
        }
        Event::GoAwayReceived(reason) => {
            debug!(reason = %reason, "peer is going away");
        }
    }
}

async fn send_dispatched(
    conn: &mut Connection,
    stream_id: StreamId,
    dispatched: Dispatched,
    is_head: bool,
    shared: &Arc<Shared>,
) {
    let Dispatched {
        response,
        chunks,
        suppress_body,
        overflowed,
    } = dispatched;
    let suppress_body = suppress_body || is_head;

    // Content-Length advertises the full entity even when HEAD drops it.
    let full_len: u64 = match chunks {
        Some(ref chunks) => chunks.iter().map(|chunk| chunk.len() as u64).sum(),
        None => response.body.len(),
    };

    let body = if suppress_body {
        Bytes::new()
    } else {
        match chunks {
            Some(chunks) => {
                let mut joined = BytesMut::with_capacity(full_len as usize);
                for chunk in chunks {
                    joined.extend_from_slice(&chunk);
                }
                joined.freeze()
            }
            None => match read_full_body(&response, shared).await {
                Ok(body) => body,
                Err(err) => {
                    warn!(stream_id, error = %err, "response body unavailable");
                    conn.reset_stream(stream_id, Reason::INTERNAL_ERROR);
                    return;
                }
            },
        }
    };

    let mut headers: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(response.headers.len() + 3);
    headers.push((
        b":status".to_vec(),
        response.status.as_str().as_bytes().to_vec(),
    ));
    headers.push((b"date".to_vec(), date::header_value()));
    if response.status != StatusCode::NO_CONTENT && response.status != StatusCode::NOT_MODIFIED {
        let mut itoa_buf = itoa::Buffer::new();
        headers.push((
            b"content-length".to_vec(),
            itoa_buf.format(full_len).as_bytes().to_vec(),
        ));
    }
    for (name, value) in response.headers.iter() {
        headers.push((name.as_str().as_bytes().to_vec(), value.as_bytes().to_vec()));
    }

    let trailers = response.trailers.as_ref().filter(|_| !body.is_empty()).map(|map| {
        map.iter()
            .map(|(name, value)| {
                (name.as_str().as_bytes().to_vec(), value.as_bytes().to_vec())
            })
            .collect()
    });

    let mut events = Vec::new();
    if let Err(err) = conn.send_response(stream_id, headers, body, trailers, &mut events) {
        warn!(stream_id, error = %err, "failed to queue response");
    }
    for event in events {
        if let Event::StreamReset(id, reason) = event {
            debug!(stream_id = id, reason = %reason, "stream closed while responding");
        }
    }
    if overflowed {
        debug!(stream_id, "streaming handler breached the outbound budget");
        conn.go_away(Reason::ENHANCE_YOUR_CALM);
    }
}

/// HTTP/2 responses frame DATA from memory; file bodies are read whole,
/// bounded by the outbound cap.
async fn read_full_body(response: &Response, shared: &Arc<Shared>) -> Result<Bytes> {
    match response.body {
        Body::Empty => Ok(Bytes::new()),
        Body::Bytes(ref data) => Ok(data.clone()),
        Body::File {
            ref file,
            offset,
            len,
        } => {
            if len as usize > shared.config.max_outbound_buffer_bytes {
                return Err(Error::new(Kind::OutboundOverflow));
            }
            use std::io::{Seek, SeekFrom};
            let mut std_file = file.try_clone().map_err(Error::new_io)?;
            std_file
                .seek(SeekFrom::Start(offset))
                .map_err(Error::new_io)?;
            let mut data = vec![0u8; len as usize];
            std::io::Read::read_exact(&mut std_file, &mut data).map_err(Error::new_io)?;
            Ok(data.into())
        }
    }
}

/// Converts a decoded header list into the crate [`Request`], separating
/// pseudo-headers and laying regular fields into one scratch buffer.
fn build_request(
    stream_id: StreamId,
    headers: Vec<(Vec<u8>, Vec<u8>)>,
    body: Bytes,
) -> Option<Request> {
    let mut method = None;
    let mut path = None;
    let mut scheme = None;
    let mut authority = None;

    let mut scratch = BytesMut::new();
    let mut entries = Vec::new();
    for (name, value) in &headers {
        match name.as_slice() {
            b":method" => method = Method::from_bytes(value).ok(),
            b":path" => path = Some(value.clone()),
            b":scheme" => scheme = Some(value.clone()),
            b":authority" => authority = Some(value.clone()),
            _ => {
                let name_start = scratch.len();
                scratch.extend_from_slice(name);
                let value_start = scratch.len();
                scratch.extend_from_slice(value);
                entries.push(HeaderIndices {
                    name: (name_start, name_start + name.len()),
                    value: (value_start, value_start + value.len()),
                });
            }
        }
    }

    let method = method?;
    let target = match path {
        Some(path) => Bytes::from(path),
        None if method == Method::CONNECT => Bytes::new(),
        None => return None,
    };

    let mut request = Request::new_h1(
        method,
        target,
        Version::HTTP_2,
        HeadersView::new(scratch.freeze(), entries),
        body,
    );
    request.stream_id = Some(stream_id);
    request.scheme = scheme.map(Bytes::from);
    request.authority = authority.map(Bytes::from);
    Some(request)
}
