//! HTTP Basic authentication gate and the registry of credential checks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::connection::Connection;

/// Credential check: `(user, password) -> accepted`.
pub type AuthPredicate = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

const DEFAULT_REALM: &str = "Restricted";

/// Basic auth gate used by auth filters.
#[derive(Clone)]
pub struct AuthGate {
    predicate: AuthPredicate,
    realm: String,
    use_sessions: bool,
    failure_status: u16,
    failure_body: Option<String>,
}

impl fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGate")
            .field("realm", &self.realm)
            .field("use_sessions", &self.use_sessions)
            .field("failure_status", &self.failure_status)
            .finish_non_exhaustive()
    }
}

impl AuthGate {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        Self::from_predicate(Arc::new(predicate))
    }

    pub fn from_predicate(predicate: AuthPredicate) -> Self {
        Self {
            predicate,
            realm: DEFAULT_REALM.to_string(),
            use_sessions: false,
            failure_status: 403,
            failure_body: None,
        }
    }

    pub fn realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    /// Remember a successful login in the session.
    pub fn use_sessions(mut self, enabled: bool) -> Self {
        self.use_sessions = enabled;
        self
    }

    /// Status for rejected credentials (default 403).
    pub fn failure_status(mut self, status: u16) -> Self {
        self.failure_status = status;
        self
    }

    pub(crate) fn set_failure_body(&mut self, body: String) {
        self.failure_body = Some(body);
    }

    pub(crate) fn failure_status_code(&self) -> u16 {
        self.failure_status
    }

    /// Check the request. On failure the response is prepared and `false`
    /// returned; `slot` distinguishes filters sharing one session.
    pub(crate) fn check(&self, conn: &mut Connection, slot: usize) -> bool {
        let session_key = format!("_auth_filter.{}", slot);

        if self.use_sessions {
            let started = conn.session().start().map(|_| ());
            let remembered = started.and_then(|()| conn.session().contains(&session_key));
            match remembered {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "cannot consult session for auth filter"),
            }
        }

        let credentials = conn
            .request()
            .header("authorization")
            .and_then(parse_basic);
        let Some((user, password)) = credentials else {
            self.challenge(conn);
            return false;
        };

        if !(self.predicate)(&user, &password) {
            debug!(user = %user, "credentials rejected");
            conn.send_error(self.failure_status);
            if let Some(body) = &self.failure_body {
                conn.response_mut().set_body(body);
            }
            return false;
        }

        if self.use_sessions {
            if let Err(e) = conn.session().set(session_key, user.as_str()) {
                warn!(error = %e, "cannot remember login in session");
            }
        }
        true
    }

    fn challenge(&self, conn: &mut Connection) {
        conn.send_error(401);
        conn.response_mut().set_header(
            "www-authenticate",
            format!("Basic realm=\"{}\"", self.realm.replace('"', "")),
        );
        if let Some(body) = &self.failure_body {
            conn.response_mut().set_body(body);
        }
    }
}

/// Decode an `Authorization: Basic ...` header into user and password.
pub fn parse_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// Named credential checks that configured auth filters refer to.
#[derive(Clone, Default)]
pub struct PredicateRegistry {
    predicates: HashMap<String, AuthPredicate>,
}

impl fmt::Debug for PredicateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.predicates.keys()).finish()
    }
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, predicate: F) -> &mut Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.predicates.insert(name.into(), Arc::new(predicate));
        self
    }

    pub fn get(&self, name: &str) -> Option<AuthPredicate> {
        self.predicates.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.predicates.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let header = format!("Basic {}", STANDARD.encode("ada:secret:with:colons"));
        assert_eq!(
            parse_basic(&header),
            Some(("ada".into(), "secret:with:colons".into()))
        );
        assert_eq!(parse_basic("Bearer abc"), None);
        assert_eq!(parse_basic("Basic !!!"), None);
        assert_eq!(parse_basic(&format!("basic {}", STANDARD.encode("nocolon"))), None);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = PredicateRegistry::new();
        registry.register("admin", |user, pass| user == "admin" && pass == "pw");
        let predicate = registry.get("admin").unwrap();
        assert!(predicate("admin", "pw"));
        assert!(!predicate("admin", "nope"));
        assert!(registry.get("missing").is_none());
    }
}
