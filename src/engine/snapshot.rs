//! Immutable configuration snapshots and the cell that publishes them.
//!
//! A request loads the current snapshot once, at dispatch, and uses it
//! until it finishes. Reconfiguration publishes a new snapshot with a
//! single atomic pointer swap, so readers never block and never observe
//! a half-applied change.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::schema::EngineConfig;
use crate::filter::AccessFilterList;
use crate::handler::HandlerRef;

/// Everything a request needs from the engine's mutable configuration.
#[derive(Clone)]
pub struct Snapshot {
    pub config: Arc<EngineConfig>,
    pub filters: Arc<AccessFilterList>,
    pub handler: HandlerRef,
    /// Increments with every publish.
    pub generation: u64,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("generation", &self.generation)
            .field("filters", &self.filters.len())
            .finish_non_exhaustive()
    }
}

/// Partial replacement applied by [`SnapshotCell::publish`]. `None` keeps
/// the current value.
#[derive(Default, Clone)]
pub struct Overlay {
    pub handler: Option<HandlerRef>,
    pub filters: Option<Arc<AccessFilterList>>,
    pub config: Option<Arc<EngineConfig>>,
}

impl Snapshot {
    fn overlay(&self, overlay: &Overlay) -> Snapshot {
        Snapshot {
            config: overlay
                .config
                .clone()
                .unwrap_or_else(|| Arc::clone(&self.config)),
            filters: overlay
                .filters
                .clone()
                .unwrap_or_else(|| Arc::clone(&self.filters)),
            handler: overlay
                .handler
                .clone()
                .unwrap_or_else(|| Arc::clone(&self.handler)),
            generation: self.generation + 1,
        }
    }
}

pub struct SnapshotCell {
    current: ArcSwap<Snapshot>,
}

impl SnapshotCell {
    pub fn new(handler: HandlerRef, filters: AccessFilterList, config: EngineConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(Snapshot {
                config: Arc::new(config),
                filters: Arc::new(filters),
                handler,
                generation: 0,
            }),
        }
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Publish `overlay` on top of the current snapshot. Concurrent
    /// publishers are serialized by retrying, so no update is lost.
    pub fn publish(&self, overlay: Overlay) -> Arc<Snapshot> {
        let previous = self.current.rcu(|current| current.overlay(&overlay));
        Arc::new(previous.overlay(&overlay))
    }
}

impl fmt::Debug for SnapshotCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SnapshotCell").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::filter::AccessFilter;
    use crate::handler::{handler_ref, HandlerResult};

    fn noop() -> HandlerRef {
        handler_ref(|_: &mut Connection| -> HandlerResult { Ok(()) })
    }

    #[test]
    fn test_overlay_keeps_unspecified_parts() {
        let cell = SnapshotCell::new(noop(), AccessFilterList::default(), EngineConfig::default());
        let before = cell.load();

        let filters = AccessFilterList::new(vec![AccessFilter::block(403)]).unwrap();
        cell.publish(Overlay {
            filters: Some(Arc::new(filters)),
            ..Overlay::default()
        });

        let after = cell.load();
        assert_eq!(after.generation, 1);
        assert_eq!(after.filters.len(), 1);
        assert!(Arc::ptr_eq(&before.config, &after.config));
        assert!(Arc::ptr_eq(&before.handler, &after.handler));
        // The earlier snapshot is untouched.
        assert!(before.filters.is_empty());
    }

    #[test]
    fn test_concurrent_publishers_do_not_lose_updates() {
        let cell = Arc::new(SnapshotCell::new(
            noop(),
            AccessFilterList::default(),
            EngineConfig::default(),
        ));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        cell.publish(Overlay::default());
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(cell.load().generation, 400);
    }
}
