//! Listener socket setup.

use std::net::{SocketAddr, TcpListener as StdTcpListener};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Error, Result};

const BACKLOG: i32 = 1024;

/// Binds a non-blocking listener, optionally with `SO_REUSEPORT` so several
/// reactors can share one port with kernel-side load balancing.
pub(crate) fn bind_listener(addr: SocketAddr, reuse_port: bool) -> Result<StdTcpListener> {
    let domain = Domain::for_address(addr);
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::new_listen)?;
    socket.set_reuse_address(true).map_err(Error::new_listen)?;
    if reuse_port {
        socket.set_reuse_port(true).map_err(Error::new_listen)?;
    }
    socket.set_nonblocking(true).map_err(Error::new_listen)?;
    socket.bind(&addr.into()).map_err(Error::new_listen)?;
    socket.listen(BACKLOG).map_err(Error::new_listen)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ephemeral_port_resolves() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn reuse_port_allows_second_bind() {
        let first = bind_listener("127.0.0.1:0".parse().unwrap(), true).unwrap();
        let addr = first.local_addr().unwrap();
        let second = bind_listener(addr, true);
        assert!(second.is_ok());
    }
}
