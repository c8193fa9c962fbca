//! The request engine: lifecycle, snapshots, workers and dispatch.
//!
//! # Data Flow
//! ```text
//! RequestHandler::start
//!     → Transport::bind (net listener)
//!     → WorkerPool::start (N threads, bounded queue)
//!     → transport accept loop + session sweeper
//!
//! transport → Dispatcher::submit(Job) → queue → worker
//!     → dispatch.rs: load snapshot once
//!         → filters (Block / Forward / Auth)
//!         → handler (errors and panics → 500)
//!         → final flush
//!
//! RequestHandler::reconfigure → SnapshotCell::publish (one atomic swap)
//! ```
//!
//! # Design Decisions
//! - Control-plane calls return `Result`, nothing here panics
//! - A request holds one snapshot from dispatch to completion
//! - Transport and worker settings apply at the next start; the rest
//!   applies to the next dispatched request
//! - Stop never interrupts a running handler; queued jobs are answered 503

pub(crate) mod dispatch;
pub mod pool;
pub mod snapshot;
pub mod state;

use std::sync::Arc;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use self::dispatch::DispatchContext;
use self::pool::WorkerPool;
use self::snapshot::{Overlay, Snapshot, SnapshotCell};
use self::state::StateCell;
use crate::config::{validate_config, EngineConfig, ValidationError};
use crate::filter::AccessFilterList;
use crate::handler::HandlerRef;
use crate::lifecycle::Shutdown;
use crate::net::{BoundAddr, ConnectionTracker};
use crate::session::SessionStore;
use crate::transport::{ServeContext, Transport, TransportError};

pub use self::pool::{DispatchError, Dispatcher, Job};
pub use self::state::EngineState;

/// Control-plane failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid configuration: {}", join_errors(.0))]
    InvalidConfig(Vec<ValidationError>),

    #[error("failed to bind transport: {0}")]
    Bind(#[source] TransportError),

    #[error("failed to start worker threads: {0}")]
    Workers(#[source] std::io::Error),

    #[error("engine is {0}")]
    InvalidState(EngineState),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Owns the active snapshot, the session store and, while running, the
/// transport and worker pool. Cheap to clone.
#[derive(Clone)]
pub struct RequestHandler {
    inner: Arc<Inner>,
}

struct Inner {
    snapshots: Arc<SnapshotCell>,
    sessions: SessionStore,
    state: StateCell,
    /// Serializes start/stop/restart.
    running: Mutex<Option<Running>>,
}

/// Everything one start..stop run owns.
struct Running {
    pool: WorkerPool,
    shutdown: Shutdown,
    serve_task: JoinHandle<()>,
    sweeper: JoinHandle<()>,
    tracker: ConnectionTracker,
    local_addr: BoundAddr,
}

impl RequestHandler {
    /// Build a stopped engine. The configuration is validated here.
    pub fn new(
        handler: HandlerRef,
        filters: AccessFilterList,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        validate_config(&config).map_err(EngineError::InvalidConfig)?;
        Ok(Self {
            inner: Arc::new(Inner {
                snapshots: Arc::new(SnapshotCell::new(handler, filters, config)),
                sessions: SessionStore::new(),
                state: StateCell::new(),
                running: Mutex::new(None),
            }),
        })
    }

    pub fn state(&self) -> EngineState {
        self.inner.state.load()
    }

    /// The snapshot the next request will use.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshots.load()
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.inner.sessions
    }

    /// Where the transport is bound, while running.
    pub async fn local_addr(&self) -> Option<BoundAddr> {
        self.inner
            .running
            .lock()
            .await
            .as_ref()
            .map(|run| run.local_addr.clone())
    }

    /// Bind the transport and start the workers. Starting a running
    /// engine is a no-op.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut running = self.inner.running.lock().await;
        match self
            .inner
            .state
            .transition(EngineState::Stopped, EngineState::Starting)
        {
            Ok(()) => {}
            Err(EngineState::Running) => return Ok(()),
            Err(other) => return Err(EngineError::InvalidState(other)),
        }

        match self.launch().await {
            Ok(run) => {
                info!(
                    address = %run.local_addr,
                    generation = self.inner.snapshots.load().generation,
                    "Engine started"
                );
                *running = Some(run);
                self.inner.state.set(EngineState::Running);
                Ok(())
            }
            Err(e) => {
                self.inner.state.set(EngineState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<Running, EngineError> {
        let snapshot = self.inner.snapshots.load();
        let config = &snapshot.config;

        let transport = Transport::bind(config).await.map_err(EngineError::Bind)?;
        let local_addr = transport.local_addr().clone();

        let context = DispatchContext {
            snapshots: Arc::clone(&self.inner.snapshots),
            sessions: self.inner.sessions.clone(),
        };
        let pool = WorkerPool::start(
            config.workers.concurrency,
            config.workers.queue_capacity,
            Handle::current(),
            move |job| context.run(job),
        )
        .map_err(EngineError::Workers)?;

        let shutdown = Shutdown::new();
        let tracker = ConnectionTracker::new();
        let serve_task = tokio::spawn(transport.serve(ServeContext {
            dispatcher: pool.dispatcher(),
            snapshots: Arc::clone(&self.inner.snapshots),
            shutdown: shutdown.clone(),
            tracker: tracker.clone(),
        }));

        let snapshots = Arc::clone(&self.inner.snapshots);
        let sweeper = self.inner.sessions.spawn_sweeper(
            config.session.sweep_interval(),
            move || snapshots.load().config.session.ttl(),
            shutdown.subscribe(),
        );

        Ok(Running {
            pool,
            shutdown,
            serve_task,
            sweeper,
            tracker,
            local_addr,
        })
    }

    /// Stop accepting, let running handlers finish, join the workers and
    /// release the socket. Stopping a stopped engine is a no-op.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut running = self.inner.running.lock().await;
        let Some(run) = running.take() else {
            return Ok(());
        };
        self.inner.state.set(EngineState::Stopping);
        info!(address = %run.local_addr, "Engine stopping");

        run.shutdown.trigger();
        if let Err(e) = run.serve_task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }

        run.pool.signal_stop();
        let pool = run.pool;
        if let Err(e) = tokio::task::spawn_blocking(move || pool.join()).await {
            warn!(error = %e, "Joining workers failed");
        }

        let grace = self.inner.snapshots.load().config.lifecycle.termination_timeout();
        if !run.tracker.wait_idle(grace).await {
            warn!(
                open = run.tracker.active_count(),
                "Connections still open after termination timeout"
            );
        }
        if let Err(e) = run.sweeper.await {
            warn!(error = %e, "Session sweeper ended abnormally");
        }

        self.inner.state.set(EngineState::Stopped);
        info!("Engine stopped");
        Ok(())
    }

    /// Stop, then start again with the current snapshot, rebinding the
    /// socket. Picks up transport and worker changes.
    pub async fn restart(&self) -> Result<(), EngineError> {
        self.stop().await?;
        self.start().await
    }

    /// Publish a new snapshot with the given parts replaced. Never blocks
    /// on traffic; requests already dispatched keep their snapshot. An
    /// invalid configuration is rejected and nothing changes.
    pub fn reconfigure(
        &self,
        handler: Option<HandlerRef>,
        filters: Option<AccessFilterList>,
        config: Option<EngineConfig>,
    ) -> Result<(), EngineError> {
        if let Some(config) = &config {
            validate_config(config).map_err(EngineError::InvalidConfig)?;
            let current = self.inner.snapshots.load();
            if config.transport != current.config.transport
                || config.workers != current.config.workers
            {
                info!("Transport and worker changes take effect at the next restart");
            }
        }

        let snapshot = self.inner.snapshots.publish(Overlay {
            handler,
            filters: filters.map(Arc::new),
            config: config.map(Arc::new),
        });
        info!(generation = snapshot.generation, "Configuration published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::handler::{handler_ref, HandlerResult};

    fn engine_on(address: &str) -> RequestHandler {
        let mut config = EngineConfig::default();
        config.transport.bind_address = address.to_string();
        config.workers.concurrency = 2;
        RequestHandler::new(
            handler_ref(|_: &mut Connection| -> HandlerResult { Ok(()) }),
            AccessFilterList::default(),
            config,
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.workers.concurrency = 0;
        let err = RequestHandler::new(
            handler_ref(|_: &mut Connection| -> HandlerResult { Ok(()) }),
            AccessFilterList::default(),
            config,
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("workers.concurrency"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_stop_cycle() {
        let engine = engine_on("127.0.0.1:0");
        assert_eq!(engine.state(), EngineState::Stopped);

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        let first = engine.local_addr().await.unwrap();
        // Already running: no-op.
        engine.start().await.unwrap();

        engine.restart().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.local_addr().await.is_some());

        engine.stop().await.unwrap();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.local_addr().await.is_none());
        engine.stop().await.unwrap();

        // The first socket was released.
        let addr = first.as_tcp().unwrap();
        assert!(std::net::TcpListener::bind(addr).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bind_failure_leaves_engine_stopped() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let engine = engine_on(&taken.local_addr().unwrap().to_string());

        let err = engine.start().await.err().unwrap();
        assert!(matches!(err, EngineError::Bind(_)));
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_invalid_reconfigure_keeps_snapshot() {
        let engine = engine_on("127.0.0.1:0");
        let before = engine.snapshot();

        let mut bad = EngineConfig::default();
        bad.session.cookie_name = "bad name".into();
        assert!(matches!(
            engine.reconfigure(None, Some(AccessFilterList::default()), Some(bad)),
            Err(EngineError::InvalidConfig(_))
        ));
        assert_eq!(engine.snapshot().generation, before.generation);

        engine
            .reconfigure(None, Some(AccessFilterList::default().with_enabled(false)), None)
            .unwrap();
        let after = engine.snapshot();
        assert_eq!(after.generation, before.generation + 1);
        assert!(!after.filters.is_enabled());
        assert!(Arc::ptr_eq(&after.config, &before.config));
    }
}
