//! TCP and Unix socket listener with backpressure.
//!
//! # Responsibilities
//! - Bind to the configured address or socket path
//! - Enforce max_connections via semaphore
//! - Apply permissions to Unix sockets and clean them up on drop

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::schema::TransportConfig;
use crate::config::validation::parse_permissions;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to set permissions on {path}: {source}")]
    Permissions {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept: {0}")]
    Accept(#[source] io::Error),

    /// The connection semaphore was closed, the listener is going away.
    #[error("listener closed")]
    Closed,
}

/// Where a listener ended up bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl BoundAddr {
    /// The TCP address, if any. Tests use it to find ephemeral ports.
    pub fn as_tcp(&self) -> Option<SocketAddr> {
        match self {
            BoundAddr::Tcp(addr) => Some(*addr),
            BoundAddr::Unix(_) => None,
        }
    }
}

impl fmt::Display for BoundAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundAddr::Tcp(addr) => write!(f, "{}", addr),
            BoundAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

enum Inner {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A bounded listener that limits concurrent connections.
///
/// When the limit is reached, `accept` waits until a slot frees up.
pub struct Listener {
    inner: Inner,
    bound: BoundAddr,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Bind according to the transport configuration. A socket path takes
    /// precedence over the TCP address.
    pub async fn bind(config: &TransportConfig) -> Result<Self, ListenerError> {
        let (inner, bound) = match &config.socket_path {
            Some(path) => bind_unix(Path::new(path), config.socket_permissions.as_deref())?,
            None => {
                let bind_err = |source| ListenerError::Bind {
                    address: config.bind_address.clone(),
                    source,
                };
                let addr: SocketAddr = config
                    .bind_address
                    .parse()
                    .map_err(|e| bind_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
                let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
                let local = listener.local_addr().map_err(bind_err)?;
                (Inner::Tcp(listener), BoundAddr::Tcp(local))
            }
        };

        tracing::info!(
            address = %bound,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner,
            bound,
            connection_limit: Arc::new(Semaphore::new(config.max_connections.max(1))),
            max_connections: config.max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// The returned permit must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(Stream, Peer, ConnectionPermit), ListenerError> {
        let permit = Arc::clone(&self.connection_limit)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;

        let (stream, peer) = match &self.inner {
            Inner::Tcp(listener) => {
                let (stream, addr) = listener.accept().await.map_err(ListenerError::Accept)?;
                let _ = stream.set_nodelay(true);
                (Stream::Tcp(stream), Peer(Some(addr)))
            }
            Inner::Unix(listener) => {
                let (stream, _) = listener.accept().await.map_err(ListenerError::Accept)?;
                (Stream::Unix(stream), Peer(None))
            }
        };

        tracing::debug!(
            peer_addr = %peer,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, peer, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> &BoundAddr {
        &self.bound
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let BoundAddr::Unix(path) = &self.bound {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn bind_unix(path: &Path, permissions: Option<&str>) -> Result<(Inner, BoundAddr), ListenerError> {
    let address = path.display().to_string();
    // A stale socket from an earlier run would make bind fail.
    if path.exists() {
        std::fs::remove_file(path).map_err(|source| ListenerError::Bind {
            address: address.clone(),
            source,
        })?;
    }
    let listener = UnixListener::bind(path).map_err(|source| ListenerError::Bind {
        address: address.clone(),
        source,
    })?;

    if let Some(mode) = permissions.and_then(parse_permissions) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|source| ListenerError::Permissions { path: address, source })?;
    }

    Ok((Inner::Unix(listener), BoundAddr::Unix(path.to_path_buf())))
}

/// Remote side of an accepted connection. Unix peers have no address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer(pub Option<SocketAddr>);

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{}", addr),
            None => f.write_str("unix"),
        }
    }
}

/// An accepted TCP or Unix stream.
pub enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A permit representing a connection slot.
///
/// Dropping it releases the slot, even if the connection task panicked.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: OwnedSemaphorePermit,
}
