//! TLS transport adapter.
//!
//! Wraps rustls behind a narrow seam: build an acceptor from [`TlsConfig`],
//! run the handshake, and expose the few post-handshake facts the server
//! cares about (selected ALPN protocol, cipher, version, client cert).

use std::fmt;
use std::io::Cursor;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::config::{TlsConfig, TlsVersion};
use crate::error::{Error, Kind, Result};

/// Facts recorded once the handshake completes.
#[derive(Debug, Clone, Default)]
pub struct HandshakeInfo {
    /// ALPN protocol selected, e.g. `b"h2"`.
    pub alpn: Option<Vec<u8>>,
    pub cipher: Option<String>,
    pub version: Option<String>,
    /// DER bytes of the client certificate, when one was presented.
    pub peer_cert: Option<Vec<u8>>,
}

impl HandshakeInfo {
    pub fn alpn_is_h2(&self) -> bool {
        self.alpn.as_deref() == Some(b"h2")
    }
}

/// A built TLS listener context.
#[derive(Clone)]
pub(crate) struct Acceptor {
    inner: TlsAcceptor,
    log_handshake: bool,
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("log_handshake", &self.log_handshake)
            .finish_non_exhaustive()
    }
}

impl Acceptor {
    /// Builds the rustls server context from the validated configuration.
    pub(crate) fn new(config: &TlsConfig) -> Result<Acceptor> {
        let certs = load_certs(config)?;
        let key = load_key(config)?;

        let versions = supported_versions(config);
        let builder = rustls::ServerConfig::builder_with_protocol_versions(&versions);

        let builder = if config.request_client_cert || config.require_client_cert {
            let mut roots = RootCertStore::empty();
            if let Some(ref pem) = config.trusted_client_cas_pem {
                for cert in rustls_pemfile::certs(&mut Cursor::new(pem.as_bytes())) {
                    let cert = cert.map_err(|err| {
                        Error::new_config("invalid trusted client CA bundle").with(err)
                    })?;
                    roots.add(cert).map_err(|err| {
                        Error::new_config("invalid trusted client CA certificate").with(err)
                    })?;
                }
            }
            let verifier_builder = WebPkiClientVerifier::builder(Arc::new(roots));
            let verifier = if config.require_client_cert {
                verifier_builder.build()
            } else {
                verifier_builder.allow_unauthenticated().build()
            }
            .map_err(|err| Error::new_config("client certificate verifier").with(err.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let mut server_config = builder
            .with_single_cert(certs, key)
            .map_err(|err| Error::new_config("invalid TLS certificate or key").with(err))?;
        server_config.alpn_protocols = config.alpn_protocols.clone();

        Ok(Acceptor {
            inner: TlsAcceptor::from(Arc::new(server_config)),
            log_handshake: config.log_handshake,
        })
    }

    /// Runs the handshake; the caller bounds it with the handshake timeout.
    pub(crate) async fn accept(&self, tcp: TcpStream) -> Result<(TlsStream<TcpStream>, HandshakeInfo)> {
        let stream = self
            .inner
            .accept(tcp)
            .await
            .map_err(|err| Error::new(Kind::TlsHandshake).with(err))?;

        let (_, session) = stream.get_ref();
        let info = HandshakeInfo {
            alpn: session.alpn_protocol().map(|proto| proto.to_vec()),
            cipher: session
                .negotiated_cipher_suite()
                .map(|suite| format!("{:?}", suite.suite())),
            version: session
                .protocol_version()
                .map(|version| format!("{:?}", version)),
            peer_cert: session
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.as_ref().to_vec()),
        };
        if self.log_handshake {
            debug!(
                alpn = ?info.alpn.as_deref().map(String::from_utf8_lossy),
                cipher = ?info.cipher,
                version = ?info.version,
                client_cert = info.peer_cert.is_some(),
                "TLS handshake complete"
            );
        }
        Ok((stream, info))
    }
}

fn supported_versions(config: &TlsConfig) -> Vec<&'static rustls::SupportedProtocolVersion> {
    let mut versions = Vec::with_capacity(2);
    if config.min_version <= TlsVersion::Tls12 && config.max_version >= TlsVersion::Tls12 {
        versions.push(&rustls::version::TLS12);
    }
    if config.max_version >= TlsVersion::Tls13 {
        versions.push(&rustls::version::TLS13);
    }
    versions
}

fn load_certs(config: &TlsConfig) -> Result<Vec<CertificateDer<'static>>> {
    let pem = match (&config.cert_pem, &config.cert_file) {
        (Some(pem), _) => pem.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|err| Error::new_config("cannot read TLS certificate file").with(err))?,
        (None, None) => return Err(Error::new_config("no TLS certificate configured")),
    };
    let certs: std::result::Result<Vec<_>, _> =
        rustls_pemfile::certs(&mut Cursor::new(pem.as_bytes())).collect();
    let certs = certs.map_err(|err| Error::new_config("invalid TLS certificate PEM").with(err))?;
    if certs.is_empty() {
        return Err(Error::new_config("TLS certificate PEM holds no certificates"));
    }
    Ok(certs)
}

fn load_key(config: &TlsConfig) -> Result<PrivateKeyDer<'static>> {
    let pem = match (&config.key_pem, &config.key_file) {
        (Some(pem), _) => pem.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map_err(|err| Error::new_config("cannot read TLS key file").with(err))?,
        (None, None) => return Err(Error::new_config("no TLS key configured")),
    };
    rustls_pemfile::private_key(&mut Cursor::new(pem.as_bytes()))
        .map_err(|err| Error::new_config("invalid TLS key PEM").with(err))?
        .ok_or_else(|| Error::new_config("TLS key PEM holds no private key"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_context_builds() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let config = TlsConfig::new()
            .with_cert_pem(cert.cert.pem(), cert.key_pair.serialize_pem())
            .with_alpn_protocols(["h2", "http/1.1"]);
        let acceptor = Acceptor::new(&config);
        assert!(acceptor.is_ok());
    }

    #[test]
    fn garbage_pem_rejected() {
        let config = TlsConfig::new().with_cert_pem("not a cert", "not a key");
        assert!(Acceptor::new(&config).unwrap_err().is_config());
    }
}
