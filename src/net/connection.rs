//! Open-connection bookkeeping for one engine run.
//!
//! Every accepted socket gets a [`ConnectionGuard`] from the run's
//! [`ConnectionTracker`]. The guard names the connection in log spans and,
//! when dropped, lets `stop` know the socket is gone.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Sequence number of a connection within its tracker, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Counts {
    issued: AtomicU64,
    open: AtomicU64,
    drained: Notify,
}

/// Counts open connections so shutdown can wait for them.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    counts: Arc<Counts>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self) -> ConnectionGuard {
        let id = ConnectionId(self.counts.issued.fetch_add(1, Ordering::Relaxed) + 1);
        self.counts.open.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            counts: Arc::clone(&self.counts),
            id,
        }
    }

    pub fn active_count(&self) -> u64 {
        self.counts.open.load(Ordering::Acquire)
    }

    /// Resolve once no connection is open. `false` if `timeout` passed first.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                // Register before checking so a close in between is not missed.
                let wake = self.counts.drained.notified();
                if self.active_count() == 0 {
                    break;
                }
                wake.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

/// Held by a connection task for as long as its socket is open.
#[derive(Debug)]
pub struct ConnectionGuard {
    counts: Arc<Counts>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let before = self.counts.open.fetch_sub(1, Ordering::AcqRel);
        tracing::trace!(connection = %self.id, open = before - 1, "connection released");
        if before == 1 {
            self.counts.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_follow_accept_order() {
        let tracker = ConnectionTracker::new();
        let first = tracker.track();
        let second = tracker.track();
        assert_eq!(first.id().get(), 1);
        assert_eq!(second.id().get(), 2);
        assert_eq!(second.id().to_string(), "#2");

        // A fresh run numbers from 1 again.
        assert_eq!(ConnectionTracker::new().track().id().get(), 1);
    }

    #[test]
    fn test_open_count_follows_guards() {
        let tracker = ConnectionTracker::new();
        let guards: Vec<_> = (0..3).map(|_| tracker.track()).collect();
        assert_eq!(tracker.active_count(), 3);
        drop(guards);
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let tracker = ConnectionTracker::new();
        assert!(tracker.wait_idle(Duration::from_millis(1)).await);

        let guard = tracker.track();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
        assert!(waiter.await.unwrap());

        let _open = tracker.track();
        assert!(!tracker.wait_idle(Duration::from_millis(20)).await);
    }
}
