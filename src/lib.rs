//! # aeronet
//!
//! An embeddable HTTP/1.1 + HTTP/2 server for Linux.
//!
//! The protocol core is a set of single-threaded reactors: each one owns a
//! listening socket (shared across reactors via `SO_REUSEPORT`), an epoll
//! set driven by a current-thread runtime, and a disjoint table of
//! connections. HTTP/1.1 request heads are parsed in place inside the
//! per-connection receive buffer; HTTP/2 runs as a sans-io state machine
//! with HPACK compression and full flow control. Matched requests dispatch
//! to user handlers through a `(method, path)` router with pattern
//! parameters.
//!
//! ```no_run
//! use aeronet::{MethodSet, Response, RouteHandler, Router, Server, ServerConfig};
//! use http::StatusCode;
//!
//! fn main() -> aeronet::Result<()> {
//!     let mut router = Router::new();
//!     router.set_path(
//!         "/ping",
//!         MethodSet::GET,
//!         RouteHandler::sync(|_req| Response::text(StatusCode::OK, "pong")),
//!     )?;
//!
//!     let server = Server::bind(ServerConfig::new().with_port(8080))?;
//!     let handle = server.start(router)?;
//!     // ... later:
//!     handle.shutdown();
//!     Ok(())
//! }
//! ```

#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod body;
mod config;
mod error;
mod headers;
mod proto;
mod request;
mod response;
mod router;
mod server;
mod static_files;
mod tls;

pub use crate::body::Body;
pub use crate::config::{Http2Config, ServerConfig, TlsConfig, TlsVersion};
pub use crate::error::{Error, Result};
pub use crate::proto::h2::frame::Reason;
pub use crate::request::{CancelToken, HeadersView, Request};
pub use crate::response::{Response, ResponseWriter};
pub use crate::router::{
    AsyncHandler, Handler, MethodSet, RouteHandler, Router, RoutingResult, StreamingHandler,
    TrailingSlashPolicy,
};
pub use crate::server::{Server, ServerHandle};
pub use crate::static_files::{ContentTypeResolver, StaticFileConfig, StaticFileHandler};
pub use crate::tls::HandshakeInfo;

/// Re-exported `http` types used throughout the public API.
pub use http::{Method, StatusCode, Version};
