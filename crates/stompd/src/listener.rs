use std::{
    io,
    net::{IpAddr, SocketAddr},
    os::fd::AsRawFd,
};

use mio::net::{TcpListener, TcpStream};
use thiserror::Error;
use tracing::info;

/// Pending-connection backlog handed to the kernel.
const LISTEN_BACKLOG: libc::c_int = 10;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("cannot bind {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("cannot listen on {addr}: {source}")]
    Listen { addr: SocketAddr, source: io::Error },
    #[error("cannot set up poll: {0}")]
    Poll(#[source] io::Error),
    #[error("cannot register listener: {0}")]
    Register(#[source] io::Error),
}

/// Bound, non-blocking TCP listener producing new broker connections.
pub struct Listener {
    inner: TcpListener,
    addr: SocketAddr,
}

impl Listener {
    /// Binds `addr:port` with SO_REUSEADDR, non-blocking mode, and a short
    /// backlog. Accepts IPv4 and IPv6 addresses alike.
    pub fn bind(addr: IpAddr, port: u16) -> Result<Self, BindError> {
        let addr = SocketAddr::new(addr, port);
        // mio binds with SO_REUSEADDR and O_NONBLOCK already set.
        let inner = TcpListener::bind(addr).map_err(|source| BindError::Bind { addr, source })?;

        // Re-issue listen() to shrink the kernel backlog to ours.
        let rc = unsafe { libc::listen(inner.as_raw_fd(), LISTEN_BACKLOG) };
        if rc != 0 {
            return Err(BindError::Listen { addr, source: io::Error::last_os_error() });
        }

        // The kernel fills in the port when asked for port 0.
        let addr = inner.local_addr().map_err(|source| BindError::Bind { addr, source })?;

        info!(%addr, "listening");
        Ok(Self { inner, addr })
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accepts one pending connection. `None` means nothing is waiting; an
    /// error is unexpected and fatal to the broker.
    pub fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self.inner.accept() {
            Ok((stream, peer)) => Ok(Some((stream, peer))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn source_mut(&mut self) -> &mut TcpListener {
        &mut self.inner
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn binds_v4_and_v6_and_reports_addr() {
        let v6 = Listener::bind("::1".parse().unwrap(), 0).unwrap();
        assert!(v6.local_addr().is_ipv6());
        assert_ne!(v6.local_addr().port(), 0);

        let v4 = Listener::bind("127.0.0.1".parse().unwrap(), 0).unwrap();
        assert!(v4.local_addr().is_ipv4());
        assert_ne!(v4.local_addr().port(), 0);
    }

    #[test]
    fn accept_with_nothing_pending_is_none() {
        let listener = Listener::bind("127.0.0.1".parse().unwrap(), 0).unwrap();
        assert!(listener.accept().unwrap().is_none());
    }
}
