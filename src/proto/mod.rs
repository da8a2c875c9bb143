//! Protocol implementations: request dispatch plus the HTTP/1.1 pipeline and
//! the HTTP/2 state machine.

pub(crate) mod h1;
pub(crate) mod h2;

use bytes::Bytes;
use http::header::HeaderValue;
use http::{Method, StatusCode};
use tracing::{debug, warn};

use crate::request::Request;
use crate::response::{Response, ResponseWriter};
use crate::router::{Router, RouteHandler, RoutingResult};

/// Outcome of routing and running a handler for one request.
pub(crate) struct Dispatched {
    pub(crate) response: Response,
    /// Chunked writer output, when a streaming handler ran.
    pub(crate) chunks: Option<Vec<Bytes>>,
    /// Send head only (HEAD request or GET-fallback).
    pub(crate) suppress_body: bool,
    /// A streaming handler breached the outbound budget; the connection
    /// drains what was queued and then closes.
    pub(crate) overflowed: bool,
}

impl Dispatched {
    fn full(response: Response, suppress_body: bool) -> Dispatched {
        Dispatched {
            response,
            chunks: None,
            suppress_body,
            overflowed: false,
        }
    }
}

/// Routes `req` and runs the matched handler.
///
/// `writer_budget` caps what a streaming handler may queue. CONNECT bypasses
/// the router entirely and goes to the dedicated tunnel handler, or 501.
pub(crate) async fn dispatch(
    router: &Router,
    connect_handler: Option<&RouteHandler>,
    mut req: Request,
    writer_budget: usize,
) -> Dispatched {
    let is_head = req.method() == Method::HEAD;

    if req.method() == Method::CONNECT {
        return match connect_handler {
            Some(handler) => run_handler(handler, req, writer_budget, false).await,
            None => {
                debug!("CONNECT received without a tunnel handler");
                Dispatched::full(Response::error_status(StatusCode::NOT_IMPLEMENTED), false)
            }
        };
    }

    match router.match_route(req.method(), req.path()) {
        RoutingResult::Handler {
            handler,
            path_params,
            head_fallback,
        } => {
            req.path_params = path_params;
            run_handler(handler, req, writer_budget, is_head || head_fallback).await
        }
        RoutingResult::MethodNotAllowed { allowed } => {
            let response = match HeaderValue::from_str(&allowed.to_allow_header()) {
                Ok(allow) => Response::error_status(StatusCode::METHOD_NOT_ALLOWED)
                    .with_header(http::header::ALLOW, allow)
                    .unwrap_or_else(|_| Response::error_status(StatusCode::METHOD_NOT_ALLOWED)),
                Err(_) => Response::error_status(StatusCode::METHOD_NOT_ALLOWED),
            };
            Dispatched::full(response, is_head)
        }
        RoutingResult::RedirectAddSlash => {
            Dispatched::full(slash_redirect(&req, true), is_head)
        }
        RoutingResult::RedirectRemoveSlash => {
            Dispatched::full(slash_redirect(&req, false), is_head)
        }
        RoutingResult::NotFound => {
            Dispatched::full(Response::error_status(StatusCode::NOT_FOUND), is_head)
        }
    }
}

async fn run_handler(
    handler: &RouteHandler,
    req: Request,
    writer_budget: usize,
    suppress_body: bool,
) -> Dispatched {
    match handler {
        RouteHandler::Sync(handler) => Dispatched::full(handler(&req), suppress_body),
        RouteHandler::Async(handler) => Dispatched::full(handler(req).await, suppress_body),
        RouteHandler::Streaming(handler) => {
            let mut writer = ResponseWriter::new(writer_budget);
            let result = handler(&req, &mut writer);
            let (status, headers, chunks, overflowed) = writer.finish();
            if let Err(err) = result {
                if chunks.is_empty() && !overflowed {
                    debug!(error = %err, "streaming handler failed before output");
                    return Dispatched::full(
                        Response::error_status(StatusCode::INTERNAL_SERVER_ERROR),
                        suppress_body,
                    );
                }
                warn!(error = %err, "streaming handler failed mid-stream");
            }
            let mut response = Response::new(status);
            response.headers = headers;
            Dispatched {
                response,
                chunks: Some(chunks),
                suppress_body,
                overflowed,
            }
        }
    }
}

fn slash_redirect(req: &Request, add: bool) -> Response {
    let path = req.path();
    let mut location = String::with_capacity(path.len() + 1);
    if add {
        location.push_str(path);
        location.push('/');
    } else {
        location.push_str(path.trim_end_matches('/'));
        if location.is_empty() {
            location.push('/');
        }
    }
    if let Some(query) = req.query() {
        location.push('?');
        location.push_str(&String::from_utf8_lossy(query));
    }
    match HeaderValue::from_str(&location) {
        Ok(value) => Response::error_status(StatusCode::MOVED_PERMANENTLY)
            .with_header(http::header::LOCATION, value)
            .unwrap_or_else(|_| Response::error_status(StatusCode::BAD_REQUEST)),
        Err(_) => Response::error_status(StatusCode::BAD_REQUEST),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::MethodSet;
    use bytes::Bytes;
    use http::Version;

    fn request(method: Method, target: &'static [u8]) -> Request {
        Request::new_h1(
            method,
            Bytes::from_static(target),
            Version::HTTP_11,
            Default::default(),
            Bytes::new(),
        )
    }

    #[tokio::test]
    async fn not_found_and_405() {
        let mut router = Router::new();
        router
            .set_path("/a", MethodSet::GET, RouteHandler::sync(|_| Response::ok()))
            .unwrap();
        let out = dispatch(&router, None, request(Method::GET, b"/missing"), 1024).await;
        assert_eq!(out.response.status(), StatusCode::NOT_FOUND);

        let out = dispatch(&router, None, request(Method::POST, b"/a"), 1024).await;
        assert_eq!(out.response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            out.response.headers().get(http::header::ALLOW).unwrap(),
            "GET"
        );
    }

    #[tokio::test]
    async fn connect_without_tunnel_is_501() {
        let router = Router::new();
        let out = dispatch(&router, None, request(Method::CONNECT, b"example.com:443"), 1024).await;
        assert_eq!(out.response.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[tokio::test]
    async fn redirect_keeps_query() {
        let mut router = Router::with_policy(crate::router::TrailingSlashPolicy::Redirect);
        router
            .set_path("/dir/", MethodSet::GET, RouteHandler::sync(|_| Response::ok()))
            .unwrap();
        let out = dispatch(&router, None, request(Method::GET, b"/dir?q=1"), 1024).await;
        assert_eq!(out.response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            out.response.headers().get(http::header::LOCATION).unwrap(),
            "/dir/?q=1"
        );
    }

    #[tokio::test]
    async fn streaming_failure_before_output_is_500() {
        let mut router = Router::new();
        router
            .set_path(
                "/s",
                MethodSet::GET,
                RouteHandler::streaming(|_req, _writer| {
                    Err(crate::error::Error::new_user(crate::error::User::Handler))
                }),
            )
            .unwrap();
        let out = dispatch(&router, None, request(Method::GET, b"/s"), 1024).await;
        assert_eq!(out.response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
