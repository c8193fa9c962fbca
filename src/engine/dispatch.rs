//! The per-request pipeline run on a worker thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::pool::Job;
use super::snapshot::{Snapshot, SnapshotCell};
use crate::connection::Connection;
use crate::filter::FilterVerdict;
use crate::handler::HandlerRef;
use crate::observability::metrics;
use crate::session::SessionStore;

/// Shared state every worker needs to run a job.
#[derive(Clone)]
pub(crate) struct DispatchContext {
    pub(crate) snapshots: Arc<SnapshotCell>,
    pub(crate) sessions: SessionStore,
}

impl DispatchContext {
    /// Snapshot once, then filters, handler and final flush.
    pub(crate) fn run(&self, job: Job) {
        let Job {
            request,
            sink,
            transport,
            accepted_at,
        } = job;

        // The whole request runs against this one snapshot, whatever
        // reconfiguration happens meanwhile.
        let snapshot = self.snapshots.load();

        let span = tracing::info_span!(
            "request",
            request_id = %request.request_id(),
            method = %request.method(),
            path = %request.path_string(),
            generation = snapshot.generation,
        );
        let _entered = span.enter();

        let mut conn = Connection::new(
            request,
            Arc::clone(&snapshot.config),
            self.sessions.clone(),
            sink,
        );

        // One boundary for everything that can call into user code.
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| pipeline(&snapshot, &mut conn)));
        if let Err(payload) = outcome {
            error!(panic = %panic_message(payload.as_ref()), "request panicked");
            metrics::record_handler_failure("panic");
            conn.send_error(500);
        }

        let status = conn.response().status();
        conn.finish();
        debug!(status, elapsed_ms = accepted_at.elapsed().as_millis() as u64, "request finished");
        metrics::record_request(transport.as_str(), status, accepted_at);
    }
}

fn pipeline(snapshot: &Snapshot, conn: &mut Connection) {
    if snapshot.config.session.autostart {
        if let Err(e) = conn.session().start() {
            warn!(error = %e, "session autostart failed");
        }
    }

    match snapshot.filters.evaluate(conn) {
        FilterVerdict::Responded(kind) => {
            metrics::record_filtered(kind.as_str());
        }
        FilterVerdict::Forwarded | FilterVerdict::Continue => {
            invoke(&snapshot.handler, conn);
        }
    }
}

/// Run the handler, turning an error into a 500 when possible.
fn invoke(handler: &HandlerRef, conn: &mut Connection) {
    if let Err(e) = handler.handle(conn) {
        error!(error = %e, "handler failed");
        metrics::record_handler_failure("error");
        conn.send_error(500);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
