//! Per-request session handle.
//!
//! A [`Session`] belongs to one connection. It holds only a weak
//! reference to the shared slot, so a sweep can drop the session while
//! the request runs; the next operation then quietly issues a fresh one.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

use super::store::{SessionSlot, SessionStore, SlotState};
use super::value::{FromSessionValue, SessionValue};
use super::SessionError;
use crate::config::schema::SessionConfig;
use crate::connection::cookie::Cookie;

/// Cookie change the connection applies to the response head.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CookieCommand {
    Set { name: String, cookie: Cookie },
    Remove { name: String },
}

#[derive(Debug)]
pub struct Session {
    store: SessionStore,
    config: SessionConfig,
    presented: Option<String>,
    remote: Option<IpAddr>,
    id: Option<String>,
    current: Option<Weak<SessionSlot>>,
    cookie: Option<CookieCommand>,
}

impl Session {
    pub(crate) fn new(
        store: SessionStore,
        config: SessionConfig,
        presented: Option<String>,
        remote: Option<IpAddr>,
    ) -> Self {
        Self {
            store,
            config,
            presented,
            remote,
            id: None,
            current: None,
            cookie: None,
        }
    }

    /// Attach to the session the client presented, or create one.
    /// Calling it again on a started session is a no-op.
    pub fn start(&mut self) -> Result<&str, SessionError> {
        let alive = self
            .current
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some();
        if !alive {
            // Keep the presented ID until acquired, so a lock timeout can
            // be retried against the same session.
            let acquired = self
                .store
                .acquire(self.presented.as_deref(), self.remote, &self.config)?;
            self.presented = None;
            if acquired.created {
                debug!(session = %acquired.slot.id, "session created");
            }
            self.adopt(&acquired.slot);
        }
        Ok(self.id.as_deref().unwrap_or_default())
    }

    pub fn is_started(&self) -> bool {
        self.id.is_some()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Whether the session cookie has reached the client at least once.
    pub fn is_established(&self) -> bool {
        self.current
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|slot| slot.is_established())
            .unwrap_or(false)
    }

    /// Value stored under `key`. Without a presented ID, reading does not
    /// create a session and finds nothing.
    pub fn get(&mut self, key: &str) -> Result<Option<SessionValue>, SessionError> {
        if !self.attach_for_read()? {
            return Ok(None);
        }
        self.with_state(|state| state.values.get(key).cloned())
    }

    /// Typed read. A value of another kind is an error, not `None`.
    pub fn get_as<T: FromSessionValue>(&mut self, key: &str) -> Result<Option<T>, SessionError> {
        match self.get(key)? {
            None => Ok(None),
            Some(value) => T::from_session_value(&value).map(Some).ok_or_else(|| {
                SessionError::TypeMismatch {
                    key: key.to_string(),
                    expected: T::KIND,
                    found: value.kind(),
                }
            }),
        }
    }

    pub fn contains(&mut self, key: &str) -> Result<bool, SessionError> {
        if !self.attach_for_read()? {
            return Ok(false);
        }
        self.with_state(|state| state.values.contains_key(key))
    }

    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Into<SessionValue>,
    ) -> Result<(), SessionError> {
        let (key, value) = (key.into(), value.into());
        self.with_state(move |state| {
            state.values.insert(key, value);
        })
    }

    pub fn unset(&mut self, key: &str) -> Result<Option<SessionValue>, SessionError> {
        if !self.attach_for_read()? {
            return Ok(None);
        }
        self.with_state(|state| state.values.remove(key))
    }

    pub fn keys(&mut self) -> Result<Vec<String>, SessionError> {
        if !self.attach_for_read()? {
            return Ok(Vec::new());
        }
        self.with_state(|state| state.values.keys().cloned().collect())
    }

    /// Read-modify-write under a single acquisition of the session lock.
    pub fn update<R>(
        &mut self,
        f: impl FnOnce(&mut HashMap<String, SessionValue>) -> R,
    ) -> Result<R, SessionError> {
        self.with_state(|state| f(&mut state.values))
    }

    /// Drop the session's data, remove it from the store and tell the
    /// client to forget the cookie. A later `start` creates a new session.
    pub fn invalidate(&mut self) {
        if let Some(slot) = self.current.take().and_then(|weak| weak.upgrade()) {
            if let Ok(mut state) = slot.lock(self.config.lock_timeout()) {
                state.values.clear();
                state.invalidated = true;
            }
            self.store.remove_slot(&slot);
            debug!(session = %slot.id, "session invalidated");
        }
        if self.id.take().is_some() {
            self.cookie = Some(CookieCommand::Remove {
                name: self.config.cookie_name.clone(),
            });
        }
    }

    /// Cookie change waiting for the response head, if any.
    pub(crate) fn take_cookie(&mut self) -> Option<CookieCommand> {
        self.cookie.take()
    }

    pub(crate) fn mark_established(&self) {
        if let Some(slot) = self.current.as_ref().and_then(Weak::upgrade) {
            slot.mark_established();
        }
    }

    /// Start the session if the client presented one. `false` when there
    /// is nothing to read from.
    fn attach_for_read(&mut self) -> Result<bool, SessionError> {
        if self.is_started() {
            return Ok(true);
        }
        if self.presented.is_none() {
            return Ok(false);
        }
        self.start()?;
        Ok(true)
    }

    /// Run `f` under the slot lock, starting the session on first touch.
    fn with_state<R>(&mut self, f: impl FnOnce(&mut SlotState) -> R) -> Result<R, SessionError> {
        if !self.is_started() {
            self.start()?;
        }
        let timeout = self.config.lock_timeout();
        loop {
            let slot = match self.current.as_ref().and_then(Weak::upgrade) {
                Some(slot) => slot,
                None => self.reissue()?,
            };
            let mut state = slot.lock(timeout)?;
            if state.invalidated {
                drop(state);
                self.reissue()?;
                continue;
            }
            state.last_access = Instant::now();
            return Ok(f(&mut *state));
        }
    }

    fn reissue(&mut self) -> Result<Arc<SessionSlot>, SessionError> {
        let acquired = self.store.acquire(None, self.remote, &self.config)?;
        debug!(session = %acquired.slot.id, "session vanished during request, issued a new one");
        self.adopt(&acquired.slot);
        Ok(acquired.slot)
    }

    fn adopt(&mut self, slot: &Arc<SessionSlot>) {
        self.id = Some(slot.id.clone());
        self.current = Some(Arc::downgrade(slot));
        self.cookie = Some(CookieCommand::Set {
            name: self.config.cookie_name.clone(),
            cookie: self.session_cookie(&slot.id),
        });
    }

    fn session_cookie(&self, id: &str) -> Cookie {
        let mut cookie = Cookie::new(id)
            .with_path("/")
            .secure(self.config.cookie_secure)
            .http_only(self.config.cookie_http_only)
            .with_same_site(self.config.cookie_same_site);
        if self.config.cookie_expires {
            let expires = i64::try_from(self.config.ttl_secs)
                .ok()
                .and_then(TimeDelta::try_seconds)
                .and_then(|ttl| Utc::now().checked_add_signed(ttl));
            // Past the calendar's range Max-Age alone still bounds the cookie.
            if let Some(at) = expires {
                cookie = cookie.with_expires(at);
            }
            cookie = cookie.with_max_age(self.config.ttl_secs);
        }
        cookie
    }
}

/// Cookie that makes a client discard the named one.
pub(crate) fn removal_cookie() -> Cookie {
    Cookie::new("")
        .with_path("/")
        .with_expires(DateTime::<Utc>::UNIX_EPOCH)
        .with_max_age(0)
}
