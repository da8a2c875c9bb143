//! The server: listener binding, reactor threads, accept loops, shutdown.
//!
//! Each reactor is one OS thread running a current-thread runtime with its
//! own `SO_REUSEPORT` listener and a disjoint connection set; no mutable
//! state crosses reactors. The router and configuration are shared read-only.

pub(crate) mod conn;
pub(crate) mod tcp;

use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::router::{RouteHandler, Router};
use crate::tls::Acceptor;

use self::conn::{serve_connection, Shared};

/// How long a reactor waits for in-flight connections when shutting down.
const DRAIN_BUDGET: Duration = Duration::from_secs(5);

/// An aeronet server, bound but not yet running.
pub struct Server {
    config: Arc<ServerConfig>,
    listeners: Vec<std::net::TcpListener>,
    local_addr: SocketAddr,
    tls: Option<Acceptor>,
    connect_handler: Option<RouteHandler>,
}

impl Server {
    /// Validates the configuration and binds one listener per reactor.
    ///
    /// With `port: 0` the first bind resolves the ephemeral port and the
    /// remaining reactors share it via `SO_REUSEPORT`.
    pub fn bind(config: ServerConfig) -> Result<Server> {
        config.validate()?;

        let tls = match config.tls {
            Some(ref tls_config) => Some(Acceptor::new(tls_config)?),
            None => None,
        };

        let mut listeners = Vec::with_capacity(config.num_reactors);
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
        let first = tcp::bind_listener(addr, config.reuse_port)?;
        let local_addr = first.local_addr().map_err(Error::new_listen)?;
        listeners.push(first);
        for _ in 1..config.num_reactors {
            listeners.push(tcp::bind_listener(local_addr, true)?);
        }

        info!(%local_addr, reactors = config.num_reactors, "server bound");
        Ok(Server {
            config: Arc::new(config),
            listeners,
            local_addr,
            tls,
            connect_handler: None,
        })
    }

    /// The bound address; resolves port `0` to the real ephemeral port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Installs the dedicated CONNECT tunnel handler. Without one, CONNECT
    /// requests are answered with 501.
    pub fn set_connect_handler(&mut self, handler: RouteHandler) {
        self.connect_handler = Some(handler);
    }

    /// Spawns the reactor threads and returns a handle for shutdown.
    pub fn start(self, router: Router) -> Result<ServerHandle> {
        let router = Arc::new(router);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut threads = Vec::with_capacity(self.listeners.len());
        for (idx, listener) in self.listeners.into_iter().enumerate() {
            let shared = Arc::new(Shared {
                config: self.config.clone(),
                router: router.clone(),
                connect_handler: self.connect_handler.clone(),
                tls: self.tls.clone(),
                shutdown: shutdown_rx.clone(),
            });
            let shutdown = shutdown_rx.clone();
            let thread = std::thread::Builder::new()
                .name(format!("aeronet-reactor-{idx}"))
                .spawn(move || run_reactor(listener, shared, shutdown))
                .map_err(|err| Error::new_listen(err))?;
            threads.push(thread);
        }

        Ok(ServerHandle {
            local_addr: self.local_addr,
            shutdown: shutdown_tx,
            threads,
        })
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("reactors", &self.listeners.len())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    threads: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, lets in-flight connections drain, joins the
    /// reactors.
    pub fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for thread in self.threads {
            if thread.join().is_err() {
                error!("reactor thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("reactors", &self.threads.len())
            .finish()
    }
}

/// One reactor: a current-thread runtime driving accept + connections.
fn run_reactor(
    listener: std::net::TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "cannot build reactor runtime");
            return;
        }
    };
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let listener = match tokio::net::TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(err) => {
                error!(error = %err, "cannot register listener");
                return;
            }
        };

        let active = Rc::new(std::cell::Cell::new(0usize));
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp, peer)) => {
                            debug!(%peer, "accepted connection");
                            let shared = shared.clone();
                            let active = active.clone();
                            active.set(active.get() + 1);
                            tokio::task::spawn_local(async move {
                                if let Err(err) = serve_connection(tcp, shared).await {
                                    log_close(&err);
                                }
                                active.set(active.get() - 1);
                            });
                        }
                        Err(err) => {
                            // Transient accept failures close only that
                            // connection attempt.
                            warn!(error = %Error::new_accept(err), "accept failed");
                        }
                    }
                }
            }
        }

        // Drain in-flight connections, bounded.
        let deadline = tokio::time::Instant::now() + DRAIN_BUDGET;
        while active.get() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        if active.get() > 0 {
            warn!(remaining = active.get(), "closing with connections in flight");
        }
    });
}

fn log_close(err: &Error) {
    if err.is_io() || err.is_incomplete_message() {
        debug!(error = %err, "connection closed");
    } else {
        warn!(error = %err, "connection closed");
    }
}
