#![deny(warnings)]

use std::io::Read;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aeronet::{
    MethodSet, Response, RouteHandler, Router, ServerConfig, StatusCode,
};

mod support;
use support::{connect, read_response, read_until_close, serve, write_all};

fn pong_router() -> Router {
    let mut router = Router::new();
    router
        .set_path(
            "/ping",
            MethodSet::GET,
            RouteHandler::sync(|_req| Response::text(StatusCode::OK, "pong")),
        )
        .unwrap();
    router
}

#[test]
fn simple_get_keep_alive() {
    let handle = serve(ServerConfig::new(), pong_router());
    let mut stream = connect(handle.local_addr());

    for _ in 0..2 {
        write_all(&mut stream, b"GET /ping HTTP/1.1\r\nHost: h\r\n\r\n");
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{head}");
        assert!(head.contains("Content-Length: 4"), "{head}");
        assert!(head.contains("\r\nDate: "), "{head}");
        assert!(!head.to_ascii_lowercase().contains("connection: close"), "{head}");
        assert_eq!(body, b"pong");
    }
    drop(stream);
    handle.shutdown();
}

#[test]
fn duplicate_accept_encoding_is_merged() {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let tx = Arc::new(Mutex::new(tx));
    let mut router = Router::new();
    router
        .set_path(
            "/observe",
            MethodSet::GET,
            RouteHandler::sync(move |req| {
                let merged = req.headers().get("accept-encoding").unwrap_or(b"").to_vec();
                tx.lock().unwrap().send(merged).unwrap();
                Response::ok()
            }),
        )
        .unwrap();
    let handle = serve(ServerConfig::new(), router);

    let mut stream = connect(handle.local_addr());
    write_all(
        &mut stream,
        b"GET /observe HTTP/1.1\r\nHost: h\r\nAccept-Encoding: gzip\r\nAccept-Encoding: br\r\n\r\n",
    );
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    let merged = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(merged, b"gzip,br");
    drop(stream);
    handle.shutdown();
}

#[test]
fn duplicate_host_is_400_and_closes() {
    let handle = serve(ServerConfig::new(), pong_router());
    let mut stream = connect(handle.local_addr());
    write_all(
        &mut stream,
        b"GET /ping HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n",
    );
    let raw = read_until_close(&mut stream);
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{text}");
    assert!(text.to_ascii_lowercase().contains("connection: close"), "{text}");
    drop(stream);
    handle.shutdown();
}

#[test]
fn chunked_request_body_is_decoded() {
    let mut router = Router::new();
    router
        .set_path(
            "/echo",
            MethodSet::POST,
            RouteHandler::sync(|req| {
                Response::text(StatusCode::OK, req.body().to_vec())
            }),
        )
        .unwrap();
    let handle = serve(ServerConfig::new(), router);

    let mut stream = connect(handle.local_addr());
    write_all(
        &mut stream,
        b"POST /echo HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n\
          4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
    );
    let (head, body) = read_response(&mut stream);
    assert!(head.contains("Content-Length: 9"), "{head}");
    assert_eq!(body, b"Wikipedia");
    drop(stream);
    handle.shutdown();
}

#[test]
fn head_falls_back_to_get_without_body() {
    let handle = serve(ServerConfig::new(), pong_router());
    let mut stream = connect(handle.local_addr());
    write_all(&mut stream, b"HEAD /ping HTTP/1.1\r\nHost: h\r\n\r\n");
    let (head, body) = {
        // A HEAD response advertises Content-Length but carries no body;
        // read the head only, then confirm nothing follows.
        let mut raw = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).unwrap();
            raw.extend_from_slice(&chunk[..n]);
            if raw.windows(4).any(|w| w == b"\r\n\r\n") || n == 0 {
                break;
            }
        }
        let idx = raw.windows(4).position(|w| w == b"\r\n\r\n").unwrap();
        (
            String::from_utf8(raw[..idx].to_vec()).unwrap(),
            raw[idx + 4..].to_vec(),
        )
    };
    assert!(head.starts_with("HTTP/1.1 200 OK"), "{head}");
    assert!(head.contains("Content-Length: 4"), "{head}");
    assert!(body.is_empty());

    // The connection stays usable for a follow-up GET.
    write_all(&mut stream, b"GET /ping HTTP/1.1\r\nHost: h\r\n\r\n");
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"pong");
    drop(stream);
    handle.shutdown();
}

#[test]
fn not_found_and_method_not_allowed() {
    let handle = serve(ServerConfig::new(), pong_router());
    let mut stream = connect(handle.local_addr());
    write_all(&mut stream, b"GET /missing HTTP/1.1\r\nHost: h\r\n\r\n");
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404"), "{head}");

    write_all(&mut stream, b"POST /ping HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n");
    let (head, _) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 405"), "{head}");
    assert!(head.contains("allow: GET"), "{head}");
    drop(stream);
    handle.shutdown();
}

#[test]
fn oversize_header_is_431() {
    let config = ServerConfig::new().with_max_header_bytes(256);
    let handle = serve(config, pong_router());
    let mut stream = connect(handle.local_addr());
    let mut request = b"GET /ping HTTP/1.1\r\nHost: h\r\nX-Filler: ".to_vec();
    request.extend(std::iter::repeat(b'a').take(512));
    request.extend_from_slice(b"\r\n\r\n");
    write_all(&mut stream, &request);
    let raw = read_until_close(&mut stream);
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 431"), "{text}");
    drop(stream);
    handle.shutdown();
}

#[test]
fn body_limit_is_exact() {
    let mut router = Router::new();
    router
        .set_path(
            "/upload",
            MethodSet::POST,
            RouteHandler::sync(|req| {
                Response::text(StatusCode::OK, req.body().len().to_string())
            }),
        )
        .unwrap();
    let config = ServerConfig::new().with_max_body_bytes(8);
    let handle = serve(config, router);

    // One under the cap is accepted.
    let mut stream = connect(handle.local_addr());
    write_all(
        &mut stream,
        b"POST /upload HTTP/1.1\r\nHost: h\r\nContent-Length: 8\r\n\r\n12345678",
    );
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"8");

    // One over triggers 413.
    let mut stream = connect(handle.local_addr());
    write_all(
        &mut stream,
        b"POST /upload HTTP/1.1\r\nHost: h\r\nContent-Length: 9\r\n\r\n123456789",
    );
    let raw = read_until_close(&mut stream);
    assert!(
        String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 413"),
        "{:?}",
        String::from_utf8_lossy(&raw)
    );
    drop(stream);
    handle.shutdown();
}

#[test]
fn expect_continue_interim_response() {
    let mut router = Router::new();
    router
        .set_path(
            "/upload",
            MethodSet::POST,
            RouteHandler::sync(|req| Response::text(StatusCode::OK, req.body().to_vec())),
        )
        .unwrap();
    let handle = serve(ServerConfig::new(), router);

    let mut stream = connect(handle.local_addr());
    write_all(
        &mut stream,
        b"POST /upload HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n",
    );
    let mut interim = [0u8; 25];
    stream.read_exact(&mut interim).unwrap();
    assert_eq!(&interim[..], b"HTTP/1.1 100 Continue\r\n\r\n");
    write_all(&mut stream, b"hello");
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");
    assert_eq!(body, b"hello");
    drop(stream);
    handle.shutdown();
}

#[test]
fn transfer_encoding_gzip_is_501() {
    let handle = serve(ServerConfig::new(), pong_router());
    let mut stream = connect(handle.local_addr());
    write_all(
        &mut stream,
        b"POST /ping HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: gzip\r\n\r\n",
    );
    let raw = read_until_close(&mut stream);
    assert!(
        String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 501"),
        "{:?}",
        String::from_utf8_lossy(&raw)
    );
    drop(stream);
    handle.shutdown();
}

#[test]
fn streaming_handler_emits_chunked_body() {
    let mut router = Router::new();
    router
        .set_path(
            "/stream",
            MethodSet::GET,
            RouteHandler::streaming(|_req, writer| {
                writer.status(StatusCode::OK)?;
                writer.add_header(
                    http::header::CONTENT_TYPE,
                    http::header::HeaderValue::from_static("text/plain"),
                )?;
                writer.write("Wiki")?;
                writer.write("pedia")?;
                writer.end();
                Ok(())
            }),
        )
        .unwrap();
    let handle = serve(ServerConfig::new(), router);

    let mut stream = connect(handle.local_addr());
    write_all(
        &mut stream,
        b"GET /stream HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n",
    );
    let raw = read_until_close(&mut stream);
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200"), "{text}");
    assert!(text.contains("Transfer-Encoding: chunked"), "{text}");
    assert!(text.contains("4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n"), "{text}");
    drop(stream);
    handle.shutdown();
}

#[test]
fn response_trailers_after_chunked_body() {
    let mut router = Router::new();
    router
        .set_path(
            "/trailers",
            MethodSet::GET,
            RouteHandler::sync(|_req| {
                let mut trailers = http::HeaderMap::new();
                trailers.insert(
                    http::header::HeaderName::from_static("x-checksum"),
                    http::header::HeaderValue::from_static("abc123"),
                );
                Response::text(StatusCode::OK, "data")
                    .with_trailers(trailers)
                    .unwrap()
            }),
        )
        .unwrap();
    let handle = serve(ServerConfig::new(), router);

    let mut stream = connect(handle.local_addr());
    write_all(
        &mut stream,
        b"GET /trailers HTTP/1.1\r\nHost: h\r\nConnection: close\r\n\r\n",
    );
    let raw = read_until_close(&mut stream);
    let text = String::from_utf8_lossy(&raw);
    assert!(text.contains("Transfer-Encoding: chunked"), "{text}");
    assert!(text.contains("4\r\ndata\r\n0\r\nx-checksum: abc123\r\n\r\n"), "{text}");
    drop(stream);
    handle.shutdown();
}

#[test]
fn outbound_cap_drains_then_closes() {
    let mut router = Router::new();
    router
        .set_path(
            "/firehose",
            MethodSet::GET,
            RouteHandler::streaming(|_req, writer| {
                writer.write("0123456789")?;
                // Second write breaches the 16-byte cap; stop producing.
                writer.write("0123456789")?;
                writer.end();
                Ok(())
            }),
        )
        .unwrap();
    let config = ServerConfig::new().with_max_outbound_buffer_bytes(16);
    let handle = serve(config, router);

    let mut stream = connect(handle.local_addr());
    write_all(&mut stream, b"GET /firehose HTTP/1.1\r\nHost: h\r\n\r\n");
    let raw = read_until_close(&mut stream);
    let text = String::from_utf8_lossy(&raw);
    // The queued chunk drains, nothing past the cap, then the close.
    assert!(text.to_ascii_lowercase().contains("connection: close"), "{text}");
    assert!(text.contains("a\r\n0123456789\r\n"), "{text}");
    assert_eq!(text.matches("0123456789").count(), 1, "{text}");
    drop(stream);
    handle.shutdown();
}

#[test]
fn max_requests_per_connection_closes() {
    let config = ServerConfig::new().with_max_requests_per_connection(2);
    let handle = serve(config, pong_router());
    let mut stream = connect(handle.local_addr());

    write_all(&mut stream, b"GET /ping HTTP/1.1\r\nHost: h\r\n\r\n");
    let (head, _) = read_response(&mut stream);
    assert!(!head.to_ascii_lowercase().contains("connection: close"), "{head}");

    write_all(&mut stream, b"GET /ping HTTP/1.1\r\nHost: h\r\n\r\n");
    let raw = read_until_close(&mut stream);
    let text = String::from_utf8_lossy(&raw);
    assert!(text.to_ascii_lowercase().contains("connection: close"), "{text}");
    drop(stream);
    handle.shutdown();
}

#[test]
fn http10_defaults_to_close() {
    let handle = serve(ServerConfig::new(), pong_router());
    let mut stream = connect(handle.local_addr());
    write_all(&mut stream, b"GET /ping HTTP/1.0\r\n\r\n");
    let raw = read_until_close(&mut stream);
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.0 200"), "{text}");
    assert!(text.to_ascii_lowercase().contains("connection: close"), "{text}");
    drop(stream);
    handle.shutdown();
}

#[test]
fn path_params_are_captured() {
    let mut router = Router::new();
    router
        .set_path(
            "/users/{id}",
            MethodSet::GET,
            RouteHandler::sync(|req| {
                Response::text(
                    StatusCode::OK,
                    req.path_param("id").unwrap_or("none").to_owned(),
                )
            }),
        )
        .unwrap();
    let handle = serve(ServerConfig::new(), router);

    let mut stream = connect(handle.local_addr());
    write_all(&mut stream, b"GET /users/42 HTTP/1.1\r\nHost: h\r\n\r\n");
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"42");
    drop(stream);
    handle.shutdown();
}

#[test]
fn async_handler_runs_on_reactor() {
    let mut router = Router::new();
    router
        .set_path(
            "/slow",
            MethodSet::GET,
            RouteHandler::asynchronous(|_req| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Response::text(StatusCode::OK, "eventually")
            }),
        )
        .unwrap();
    let handle = serve(ServerConfig::new(), router);

    let mut stream = connect(handle.local_addr());
    write_all(&mut stream, b"GET /slow HTTP/1.1\r\nHost: h\r\n\r\n");
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"eventually");
    drop(stream);
    handle.shutdown();
}
