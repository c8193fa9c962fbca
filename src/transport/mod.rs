//! Wire transports.
//!
//! # Data Flow
//! ```text
//! Listener (net) → accept_loop → per-connection task
//!     → decode request (HTTP via hyper/axum, or FastCGI records)
//!     → RequestView + ChannelSink → Dispatcher::submit
//!     → worker runs the pipeline, flushes FlushChunks
//!     → transport encodes chunks back onto the socket
//! ```
//!
//! # Design Decisions
//! - Transports never run user code; they only move bytes and requests
//! - A job that ends without any output (queue full, dropped at stop)
//!   is answered with 503 by the transport
//! - Per-connection I/O errors are logged and close that connection only

pub mod fastcgi;
pub mod http;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::Instrument;

use crate::config::schema::{EngineConfig, TransportKind};
use crate::connection::status;
use crate::connection::ResponseHead;
use crate::engine::pool::Dispatcher;
use crate::engine::snapshot::SnapshotCell;
use crate::lifecycle::Shutdown;
use crate::net::{BoundAddr, ConnectionTracker, Listener, ListenerError, Peer, Stream};

pub use fastcgi::FastCgiTransport;
pub use http::HttpTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Frame(#[from] fastcgi::record::FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// What a transport needs from the engine while serving.
pub(crate) struct ServeContext {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) snapshots: Arc<SnapshotCell>,
    pub(crate) shutdown: Shutdown,
    pub(crate) tracker: ConnectionTracker,
}

/// A bound transport, ready to serve.
pub enum Transport {
    Http(HttpTransport),
    FastCgi(FastCgiTransport),
}

impl Transport {
    /// Bind the socket the configuration asks for.
    pub async fn bind(config: &EngineConfig) -> Result<Self, TransportError> {
        let listener = Listener::bind(&config.transport).await?;
        Ok(match config.transport.kind {
            TransportKind::Http => Transport::Http(HttpTransport::new(listener, config)),
            TransportKind::FastCgi => Transport::FastCgi(FastCgiTransport::new(listener, config)),
        })
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Http(_) => TransportKind::Http,
            Transport::FastCgi(_) => TransportKind::FastCgi,
        }
    }

    pub fn local_addr(&self) -> &BoundAddr {
        match self {
            Transport::Http(t) => t.local_addr(),
            Transport::FastCgi(t) => t.local_addr(),
        }
    }

    /// Accept until shutdown triggers. Open connections keep running
    /// and are drained by the caller through the tracker.
    pub(crate) async fn serve(self, ctx: ServeContext) {
        match self {
            Transport::Http(t) => t.serve(ctx).await,
            Transport::FastCgi(t) => t.serve(ctx).await,
        }
    }
}

/// Accept connections and spawn `on_conn` for each until shutdown.
pub(crate) async fn accept_loop<F, Fut>(
    listener: &Listener,
    shutdown: &Shutdown,
    tracker: &ConnectionTracker,
    mut on_conn: F,
) where
    F: FnMut(Stream, Peer, broadcast::Receiver<()>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut stop = shutdown.subscribe();
    loop {
        // Subscribed before accepting so a trigger racing the accept
        // still reaches the new connection.
        let conn_stop = shutdown.subscribe();
        let accepted = tokio::select! {
            _ = crate::lifecycle::shutdown::triggered(&mut stop) => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer, permit)) => {
                let guard = tracker.track();
                let span = tracing::info_span!("connection", id = %guard.id(), peer = %peer);
                let conn = on_conn(stream, peer, conn_stop);
                tokio::spawn(
                    async move {
                        conn.await;
                        drop(permit);
                        drop(guard);
                    }
                    .instrument(span),
                );
            }
            Err(ListenerError::Closed) => break,
            Err(e) => {
                // Usually fd exhaustion; back off instead of spinning.
                tracing::warn!(error = %e, "Accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    tracing::info!(address = %listener.local_addr(), "Stopped accepting connections");
}

/// Head and body a transport sends on its own, without a worker.
pub(crate) fn error_response(status: u16) -> (ResponseHead, String) {
    let head = ResponseHead {
        status,
        headers: vec![(
            "content-type".to_string(),
            crate::connection::response::DEFAULT_CONTENT_TYPE.to_string(),
        )],
    };
    (head, status::error_page(status))
}
