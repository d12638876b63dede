//! Listening sockets shared by the workers.
//!
//! # Responsibilities
//! - Bind the configured TCP address or Unix socket path once, up front
//! - Hand each worker its own clone of the bound socket
//! - Accept connections bounded by a per-worker `max_connections` semaphore

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

#[cfg(unix)]
use std::path::PathBuf;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::config::ListenerConfig;
use crate::http::exchange::PeerAddr;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid bind address `{0}`")]
    InvalidAddress(String),
    #[error("unix sockets are not supported on this platform")]
    UnixUnsupported,
    #[error("failed to bind: {0}")]
    Bind(#[source] std::io::Error),
    #[error("failed to accept: {0}")]
    Accept(#[source] std::io::Error),
}

/// A socket bound in the parent, not yet attached to any event loop.
#[derive(Debug)]
pub enum BoundSocket {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixListener, PathBuf),
}

impl BoundSocket {
    /// Bind the configured address.
    ///
    /// A stale Unix socket file left by a previous run is removed first.
    pub fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let address = config.bind_address.as_str();

        if let Some(path) = address.strip_prefix("unix:") {
            return Self::bind_unix(path);
        }

        let addr: SocketAddr = address
            .parse()
            .map_err(|_| ListenerError::InvalidAddress(address.to_string()))?;
        let listener = std::net::TcpListener::bind(addr).map_err(ListenerError::Bind)?;
        listener.set_nonblocking(true).map_err(ListenerError::Bind)?;

        tracing::info!(address = %addr, "Listener bound");
        Ok(BoundSocket::Tcp(listener))
    }

    #[cfg(unix)]
    fn bind_unix(path: &str) -> Result<Self, ListenerError> {
        use std::os::unix::fs::FileTypeExt;

        if path.is_empty() {
            return Err(ListenerError::InvalidAddress("unix:".to_string()));
        }
        let path = PathBuf::from(path);
        if let Ok(meta) = std::fs::metadata(&path) {
            if meta.file_type().is_socket() {
                std::fs::remove_file(&path).map_err(ListenerError::Bind)?;
            }
        }

        let listener =
            std::os::unix::net::UnixListener::bind(&path).map_err(ListenerError::Bind)?;
        listener.set_nonblocking(true).map_err(ListenerError::Bind)?;

        tracing::info!(path = %path.display(), "Listener bound");
        Ok(BoundSocket::Unix(listener, path))
    }

    #[cfg(not(unix))]
    fn bind_unix(_path: &str) -> Result<Self, ListenerError> {
        Err(ListenerError::UnixUnsupported)
    }

    /// Duplicate the socket for another worker.
    pub fn try_clone(&self) -> Result<Self, ListenerError> {
        match self {
            BoundSocket::Tcp(l) => l.try_clone().map(BoundSocket::Tcp),
            #[cfg(unix)]
            BoundSocket::Unix(l, path) => l
                .try_clone()
                .map(|l| BoundSocket::Unix(l, path.clone())),
        }
        .map_err(ListenerError::Bind)
    }

    /// Local TCP address, if this is a TCP socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            BoundSocket::Tcp(l) => l.local_addr().ok(),
            #[cfg(unix)]
            BoundSocket::Unix(..) => None,
        }
    }

    /// Human-readable form of the bound address.
    pub fn describe(&self) -> String {
        match self {
            BoundSocket::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp".to_string()),
            #[cfg(unix)]
            BoundSocket::Unix(_, path) => format!("unix:{}", path.display()),
        }
    }
}

enum Inner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// An accepted transport stream.
#[derive(Debug)]
pub enum Accepted {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// A bounded listener attached to the current worker's event loop.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections wait until a slot becomes available.
pub struct Listener {
    inner: Inner,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Attach a bound socket to the running event loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_bound(socket: BoundSocket, max_connections: usize) -> Result<Self, ListenerError> {
        let inner = match socket {
            BoundSocket::Tcp(l) => Inner::Tcp(TcpListener::from_std(l).map_err(ListenerError::Bind)?),
            #[cfg(unix)]
            BoundSocket::Unix(l, _) => {
                Inner::Unix(UnixListener::from_std(l).map_err(ListenerError::Bind)?)
            }
        };

        Ok(Self {
            inner,
            connection_limit: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Returns the stream, the peer address and a permit that must be held
    /// for the connection's lifetime.
    pub async fn accept(&self) -> Result<(Accepted, PeerAddr, ConnectionPermit), ListenerError> {
        // Acquire permit first (backpressure)
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|e| ListenerError::Accept(std::io::Error::other(e)))?;

        let (stream, peer) = match &self.inner {
            Inner::Tcp(l) => {
                let (stream, addr) = l.accept().await.map_err(ListenerError::Accept)?;
                let _ = stream.set_nodelay(true);
                (Accepted::Tcp(stream), PeerAddr::Socket(addr))
            }
            #[cfg(unix)]
            Inner::Unix(l) => {
                let (stream, addr) = l.accept().await.map_err(ListenerError::Accept)?;
                let peer = addr
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default();
                (Accepted::Unix(stream), PeerAddr::Opaque(peer))
            }
        };

        tracing::trace!(
            peer_addr = %peer,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, peer, ConnectionPermit { _permit: permit }))
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(bind_address: &str) -> ListenerConfig {
        ListenerConfig {
            bind_address: bind_address.to_string(),
            ..ListenerConfig::default()
        }
    }

    #[test]
    fn rejects_garbage_address() {
        assert!(matches!(
            BoundSocket::bind(&config("not-an-address")),
            Err(ListenerError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn tcp_accept_reports_socket_peer() {
        let bound = BoundSocket::bind(&config("127.0.0.1:0")).unwrap();
        let addr = bound.local_addr().unwrap();
        let listener = Listener::from_bound(bound.try_clone().unwrap(), 2).unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, peer, _permit) = listener.accept().await.unwrap();

        assert!(matches!(stream, Accepted::Tcp(_)));
        assert_eq!(peer.host(), "127.0.0.1");
        assert_eq!(listener.available_permits(), 1);
        assert_eq!(listener.max_connections(), 2);
    }

    #[tokio::test]
    async fn permit_released_on_drop() {
        let bound = BoundSocket::bind(&config("127.0.0.1:0")).unwrap();
        let addr = bound.local_addr().unwrap();
        let listener = Listener::from_bound(bound, 1).unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (_, _, permit) = listener.accept().await.unwrap();
        assert_eq!(listener.available_permits(), 0);
        drop(permit);
        assert_eq!(listener.available_permits(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_peer_is_empty_opaque_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.sock");
        let bound = BoundSocket::bind(&config(&format!("unix:{}", path.display()))).unwrap();
        assert!(bound.describe().starts_with("unix:"));
        let listener = Listener::from_bound(bound, 4).unwrap();

        let _client = UnixStream::connect(&path).await.unwrap();
        let (stream, peer, _permit) = listener.accept().await.unwrap();

        assert!(matches!(stream, Accepted::Unix(_)));
        assert_eq!(peer, PeerAddr::Opaque(String::new()));
    }
}
