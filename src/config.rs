//! Server, HTTP/2, TLS, and static file configuration.
//!
//! All types use builder-style `with_*` setters and are validated once by
//! [`ServerConfig::validate`] before a listener starts. Invalid combinations
//! fail fast instead of surfacing mid-connection.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default HPACK dynamic table size (RFC 9113 default).
pub(crate) const DEFAULT_HEADER_TABLE_SIZE: u32 = 4096;
/// Default per-stream initial flow control window (RFC 9113 default).
pub(crate) const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
/// Minimum legal SETTINGS_MAX_FRAME_SIZE.
pub(crate) const MIN_MAX_FRAME_SIZE: u32 = 16_384;
/// Maximum legal SETTINGS_MAX_FRAME_SIZE.
pub(crate) const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;
/// Maximum legal flow-control window.
pub(crate) const MAX_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// Top-level listener configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind. `0` requests an ephemeral port, queryable after start.
    pub port: u16,
    /// Bind with `SO_REUSEPORT` so multiple reactors can share the port.
    pub reuse_port: bool,
    /// Number of reactor threads, each with its own listener and epoll set.
    pub num_reactors: usize,
    /// Reject request heads larger than this many bytes with 431.
    pub max_header_bytes: usize,
    /// Reject decoded request bodies larger than this many bytes with 413.
    pub max_body_bytes: usize,
    /// Close the connection once this many outbound bytes are queued.
    pub max_outbound_buffer_bytes: usize,
    /// Close a keep-alive connection after serving this many requests.
    pub max_requests_per_connection: u32,
    /// Merge duplicate occurrences of unknown request headers with a comma
    /// (optimistic `1#element` assumption) instead of rejecting them.
    pub merge_unknown_request_headers: bool,
    pub enable_keep_alive: bool,
    pub keep_alive_timeout: Duration,
    /// Budget for reading a full request head, from the first byte after
    /// quiescence. Zero disables the check.
    pub header_read_timeout: Duration,
    pub tls: Option<TlsConfig>,
    /// Budget for the TLS handshake. Zero disables the check.
    pub tls_handshake_timeout: Duration,
    pub http2: Http2Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            port: 0,
            reuse_port: false,
            num_reactors: 1,
            max_header_bytes: 8 * 1024,
            max_body_bytes: 1024 * 1024,
            max_outbound_buffer_bytes: 4 * 1024 * 1024,
            max_requests_per_connection: 100,
            merge_unknown_request_headers: true,
            enable_keep_alive: true,
            keep_alive_timeout: Duration::from_secs(5),
            header_read_timeout: Duration::ZERO,
            tls: None,
            tls_handshake_timeout: Duration::ZERO,
            http2: Http2Config::default(),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_reuse_port(mut self, on: bool) -> Self {
        self.reuse_port = on;
        self
    }

    pub fn with_num_reactors(mut self, n: usize) -> Self {
        self.num_reactors = n;
        self
    }

    pub fn with_max_header_bytes(mut self, max: usize) -> Self {
        self.max_header_bytes = max;
        self
    }

    pub fn with_max_body_bytes(mut self, max: usize) -> Self {
        self.max_body_bytes = max;
        self
    }

    pub fn with_max_outbound_buffer_bytes(mut self, max: usize) -> Self {
        self.max_outbound_buffer_bytes = max;
        self
    }

    pub fn with_max_requests_per_connection(mut self, max: u32) -> Self {
        self.max_requests_per_connection = max;
        self
    }

    pub fn with_merge_unknown_request_headers(mut self, on: bool) -> Self {
        self.merge_unknown_request_headers = on;
        self
    }

    pub fn with_keep_alive(mut self, on: bool) -> Self {
        self.enable_keep_alive = on;
        self
    }

    pub fn with_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.keep_alive_timeout = timeout;
        self
    }

    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_tls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.tls_handshake_timeout = timeout;
        self
    }

    pub fn with_http2(mut self, http2: Http2Config) -> Self {
        self.http2 = http2;
        self
    }

    /// Checks the whole configuration, failing fast on invalid combinations.
    pub fn validate(&self) -> Result<()> {
        if self.num_reactors == 0 {
            return Err(Error::new_config("num_reactors must be at least 1"));
        }
        if self.num_reactors > 1 && !self.reuse_port {
            return Err(Error::new_config(
                "multiple reactors require reuse_port",
            ));
        }
        if self.max_header_bytes == 0 {
            return Err(Error::new_config("max_header_bytes must be non-zero"));
        }
        if let Some(ref tls) = self.tls {
            tls.validate()?;
        }
        self.http2.validate()
    }
}

/// Minimum TLS protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

/// TLS listener configuration.
///
/// The certificate and key may come from files or inline PEM; exactly one
/// source must be set.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub cert_pem: Option<String>,
    pub key_pem: Option<String>,
    /// ALPN protocols to advertise, most preferred first. `h2` enables
    /// HTTP/2 over TLS.
    pub alpn_protocols: Vec<Vec<u8>>,
    pub min_version: TlsVersion,
    pub max_version: TlsVersion,
    pub request_client_cert: bool,
    pub require_client_cert: bool,
    /// PEM bundle of CAs trusted for client certificates.
    pub trusted_client_cas_pem: Option<String>,
    /// Log handshake outcomes (ALPN, cipher, version, peer subject) at debug.
    pub log_handshake: bool,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            cert_file: None,
            key_file: None,
            cert_pem: None,
            key_pem: None,
            alpn_protocols: vec![b"h2".to_vec(), b"http/1.1".to_vec()],
            min_version: TlsVersion::Tls12,
            max_version: TlsVersion::Tls13,
            request_client_cert: false,
            require_client_cert: false,
            trusted_client_cas_pem: None,
            log_handshake: false,
        }
    }
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cert_files(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(cert.into());
        self.key_file = Some(key.into());
        self.cert_pem = None;
        self.key_pem = None;
        self
    }

    pub fn with_cert_pem(mut self, cert_pem: impl Into<String>, key_pem: impl Into<String>) -> Self {
        self.cert_pem = Some(cert_pem.into());
        self.key_pem = Some(key_pem.into());
        self.cert_file = None;
        self.key_file = None;
        self
    }

    pub fn with_alpn_protocols<I, P>(mut self, protos: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        self.alpn_protocols = protos.into_iter().map(|p| p.as_ref().to_vec()).collect();
        self
    }

    pub fn with_min_version(mut self, ver: TlsVersion) -> Self {
        self.min_version = ver;
        self
    }

    pub fn with_max_version(mut self, ver: TlsVersion) -> Self {
        self.max_version = ver;
        self
    }

    pub fn with_request_client_cert(mut self, on: bool) -> Self {
        self.request_client_cert = on;
        self
    }

    pub fn with_require_client_cert(mut self, on: bool) -> Self {
        self.require_client_cert = on;
        if on {
            self.request_client_cert = true;
        }
        self
    }

    pub fn with_trusted_client_cas_pem(mut self, pem: impl Into<String>) -> Self {
        self.trusted_client_cas_pem = Some(pem.into());
        self
    }

    pub fn with_log_handshake(mut self, on: bool) -> Self {
        self.log_handshake = on;
        self
    }

    fn validate(&self) -> Result<()> {
        let from_files = self.cert_file.is_some() && self.key_file.is_some();
        let from_pem = self.cert_pem.is_some() && self.key_pem.is_some();
        if !from_files && !from_pem {
            return Err(Error::new_config(
                "TLS enabled but no certificate/key configured",
            ));
        }
        if from_files && from_pem {
            return Err(Error::new_config(
                "TLS certificate configured from both files and inline PEM",
            ));
        }
        if self.min_version > self.max_version {
            return Err(Error::new_config("TLS min_version exceeds max_version"));
        }
        if self.alpn_protocols.iter().any(|p| p.is_empty() || p.len() > 255) {
            return Err(Error::new_config(
                "ALPN protocol entries must be 1..=255 bytes",
            ));
        }
        if self.require_client_cert && self.trusted_client_cas_pem.is_none() {
            return Err(Error::new_config(
                "require_client_cert needs trusted_client_cas_pem",
            ));
        }
        Ok(())
    }
}

/// HTTP/2 protocol configuration (RFC 9113 SETTINGS plus local limits).
#[derive(Debug, Clone)]
pub struct Http2Config {
    /// Whether HTTP/2 is offered at all (ALPN `h2` and h2c prior knowledge).
    pub enable: bool,
    /// SETTINGS_HEADER_TABLE_SIZE: HPACK dynamic table bound.
    pub header_table_size: u32,
    /// SETTINGS_MAX_CONCURRENT_STREAMS.
    pub max_concurrent_streams: u32,
    /// SETTINGS_INITIAL_WINDOW_SIZE, per stream.
    pub initial_window_size: u32,
    /// SETTINGS_MAX_FRAME_SIZE, in `[16384, 16777215]`.
    pub max_frame_size: u32,
    /// SETTINGS_MAX_HEADER_LIST_SIZE: uncompressed header block bound.
    pub max_header_list_size: u32,
    /// Connection-level receive window, topped up right after the preface.
    pub connection_window_size: u32,
    /// Lifetime stream cap; exceeding it triggers a graceful GOAWAY.
    /// Zero means unlimited.
    pub max_streams_per_connection: u32,
    /// Accept cleartext HTTP/2 via the 24-byte prior-knowledge preface.
    pub enable_h2c: bool,
}

impl Default for Http2Config {
    fn default() -> Self {
        Http2Config {
            enable: true,
            header_table_size: DEFAULT_HEADER_TABLE_SIZE,
            max_concurrent_streams: 100,
            initial_window_size: DEFAULT_INITIAL_WINDOW_SIZE,
            max_frame_size: MIN_MAX_FRAME_SIZE,
            max_header_list_size: 8 * 1024,
            connection_window_size: 1 << 20,
            max_streams_per_connection: 0,
            enable_h2c: true,
        }
    }
}

impl Http2Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enable(mut self, on: bool) -> Self {
        self.enable = on;
        self
    }

    pub fn with_header_table_size(mut self, size: u32) -> Self {
        self.header_table_size = size;
        self
    }

    pub fn with_max_concurrent_streams(mut self, max: u32) -> Self {
        self.max_concurrent_streams = max;
        self
    }

    pub fn with_initial_window_size(mut self, size: u32) -> Self {
        self.initial_window_size = size;
        self
    }

    pub fn with_max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_max_header_list_size(mut self, size: u32) -> Self {
        self.max_header_list_size = size;
        self
    }

    pub fn with_connection_window_size(mut self, size: u32) -> Self {
        self.connection_window_size = size;
        self
    }

    pub fn with_max_streams_per_connection(mut self, max: u32) -> Self {
        self.max_streams_per_connection = max;
        self
    }

    pub fn with_h2c(mut self, on: bool) -> Self {
        self.enable_h2c = on;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(MIN_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(Error::new_config(
                "max_frame_size outside [16384, 16777215]",
            ));
        }
        if self.initial_window_size > MAX_WINDOW_SIZE {
            return Err(Error::new_config("initial_window_size exceeds 2^31-1"));
        }
        if self.connection_window_size > MAX_WINDOW_SIZE {
            return Err(Error::new_config("connection_window_size exceeds 2^31-1"));
        }
        if self.connection_window_size < DEFAULT_INITIAL_WINDOW_SIZE {
            return Err(Error::new_config(
                "connection_window_size below the RFC 9113 initial 65535",
            ));
        }
        Ok(())
    }
}
