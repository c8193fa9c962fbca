//! Process-wide session table.
//!
//! Entries live in a sharded `DashMap`; each entry carries its own
//! `parking_lot` mutex, so operations on one session ID are serialized
//! while unrelated sessions never contend. Shard guards are always
//! released before a slot lock is taken, which keeps the two lock levels
//! free of cycles.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::id;
use super::value::SessionValue;
use super::SessionError;
use crate::config::schema::{IpValidation, SessionConfig};
use crate::observability::metrics;

/// Mutable part of a session, guarded by the slot lock.
#[derive(Debug)]
pub(crate) struct SlotState {
    pub(crate) values: HashMap<String, SessionValue>,
    pub(crate) last_access: Instant,
    /// Set when the slot was removed from the table. Holders of a stale
    /// reference must treat the session as gone.
    pub(crate) invalidated: bool,
}

impl SlotState {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.invalidated || self.last_access.elapsed() > ttl
    }
}

#[derive(Debug)]
pub(crate) struct SessionSlot {
    pub(crate) id: String,
    source_ip: Option<IpAddr>,
    established: AtomicBool,
    state: Mutex<SlotState>,
}

impl SessionSlot {
    fn new(id: String, source_ip: Option<IpAddr>) -> Self {
        Self {
            id,
            source_ip,
            established: AtomicBool::new(false),
            state: Mutex::new(SlotState {
                values: HashMap::new(),
                last_access: Instant::now(),
                invalidated: false,
            }),
        }
    }

    /// Lock the slot, waiting at most `timeout`.
    pub(crate) fn lock(&self, timeout: Duration) -> Result<MutexGuard<'_, SlotState>, SessionError> {
        self.state
            .try_lock_for(timeout)
            .ok_or(SessionError::LockTimeout(timeout))
    }

    pub(crate) fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    pub(crate) fn mark_established(&self) {
        self.established.store(true, Ordering::Release);
    }
}

/// Result of [`SessionStore::acquire`].
#[derive(Debug)]
pub(crate) struct Acquired {
    pub(crate) slot: Arc<SessionSlot>,
    pub(crate) created: bool,
}

/// Snapshot of store counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub active: usize,
    pub established: usize,
}

/// Shared session table. Cloning is cheap and yields a handle to the
/// same table.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    entries: Arc<DashMap<String, Arc<SessionSlot>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (not yet swept) sessions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats::default();
        for entry in self.entries.iter() {
            stats.active += 1;
            if entry.value().is_established() {
                stats.established += 1;
            }
        }
        stats
    }

    /// Resolve the session a request presented, or create a new one.
    ///
    /// Unknown, corrupt, expired or (per `validate_ip`) foreign IDs never
    /// fail the request; the caller silently gets a fresh session.
    pub(crate) fn acquire(
        &self,
        presented: Option<&str>,
        remote: Option<IpAddr>,
        config: &SessionConfig,
    ) -> Result<Acquired, SessionError> {
        if let Some(id) = presented.filter(|id| id::is_well_formed(id)) {
            // Clone out of the shard so its guard is released before locking.
            let existing = self.entries.get(id).map(|entry| Arc::clone(entry.value()));
            if let Some(slot) = existing {
                if let Some(slot) = self.reuse(slot, remote, config)? {
                    return Ok(Acquired {
                        slot,
                        created: false,
                    });
                }
            }
        }
        Ok(Acquired {
            slot: self.create(remote),
            created: true,
        })
    }

    fn reuse(
        &self,
        slot: Arc<SessionSlot>,
        remote: Option<IpAddr>,
        config: &SessionConfig,
    ) -> Result<Option<Arc<SessionSlot>>, SessionError> {
        let mut state = slot.lock(config.lock_timeout())?;
        if state.is_expired(config.ttl()) {
            debug!(session = %slot.id, "presented session expired");
            state.invalidated = true;
            self.remove_slot(&slot);
            return Ok(None);
        }
        let foreign = slot.source_ip.is_some() && remote.is_some() && slot.source_ip != remote;
        match config.validate_ip {
            IpValidation::Strict if foreign => {
                debug!(session = %slot.id, "session used from another address, removing");
                state.invalidated = true;
                self.remove_slot(&slot);
                return Ok(None);
            }
            IpValidation::Lax if foreign => {
                debug!(session = %slot.id, "session used from another address, ignoring");
                return Ok(None);
            }
            _ => {}
        }
        state.last_access = Instant::now();
        drop(state);
        Ok(Some(slot))
    }

    fn create(&self, remote: Option<IpAddr>) -> Arc<SessionSlot> {
        loop {
            match self.entries.entry(id::generate()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    let slot = Arc::new(SessionSlot::new(vacant.key().clone(), remote));
                    vacant.insert(Arc::clone(&slot));
                    metrics::set_sessions_active(self.entries.len());
                    return slot;
                }
            }
        }
    }

    /// Remove `slot` from the table, unless the ID has since been reused
    /// by a different slot.
    pub(crate) fn remove_slot(&self, slot: &Arc<SessionSlot>) {
        self.entries
            .remove_if(&slot.id, |_, current| Arc::ptr_eq(current, slot));
        metrics::set_sessions_active(self.entries.len());
    }

    /// Drop every session idle longer than `ttl`. Returns how many were
    /// evicted.
    ///
    /// A session locked by an in-flight request is waited for, then its
    /// idle time is checked again, so a session touched while the sweep
    /// waited survives.
    pub fn sweep(&self, ttl: Duration) -> usize {
        let candidates: Vec<Arc<SessionSlot>> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut evicted = 0;
        for slot in candidates {
            let mut state = slot.state.lock();
            if state.is_expired(ttl) {
                state.invalidated = true;
                self.remove_slot(&slot);
                evicted += 1;
            }
        }
        if evicted > 0 {
            metrics::record_sessions_evicted(evicted);
            debug!(evicted, remaining = self.entries.len(), "session sweep finished");
        }
        evicted
    }

    /// Run [`sweep`](Self::sweep) every `interval` until `shutdown` fires.
    /// `ttl` is asked on every tick so reconfiguration takes effect.
    pub fn spawn_sweeper<F>(
        &self,
        interval: Duration,
        ttl: F,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        let store = self.clone();
        let ttl = Arc::new(ttl);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let store = store.clone();
                        let ttl = Arc::clone(&ttl);
                        // Sweeping may wait on slot locks; keep it off the reactor.
                        let _ = tokio::task::spawn_blocking(move || store.sweep(ttl())).await;
                    }
                    _ = shutdown.recv() => {
                        info!("session sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}
