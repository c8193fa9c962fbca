//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files, and
//! every section has defaults so a minimal (or empty) file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::cookie::SameSite;

/// Root configuration for the request engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Transport selection and socket settings.
    pub transport: TransportConfig,

    /// Worker pool sizing.
    pub workers: WorkerConfig,

    /// Socket and request timeouts.
    pub timeouts: TimeoutConfig,

    /// Session store and cookie settings.
    pub session: SessionConfig,

    /// Request body limits.
    pub post: PostConfig,

    /// Access filter declarations.
    pub filters: FiltersConfig,

    /// Log output settings.
    pub logging: LoggingConfig,

    /// Metrics settings.
    pub observability: ObservabilityConfig,

    /// Runner lifecycle settings.
    pub lifecycle: LifecycleConfig,
}

/// Which protocol the engine speaks on its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    FastCgi,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::FastCgi => "fastcgi",
        }
    }
}

/// Transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Protocol to serve.
    pub kind: TransportKind,

    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind_address: String,

    /// Unix socket path. Takes precedence over `bind_address` when set.
    pub socket_path: Option<String>,

    /// Octal permissions applied to the Unix socket (e.g., "660").
    pub socket_permissions: Option<String>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Http,
            bind_address: "127.0.0.1:8080".to_string(),
            socket_path: None,
            socket_permissions: None,
            max_connections: 10_000,
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of worker threads running handlers.
    pub concurrency: usize,

    /// Capacity of the shared job queue. A full queue answers 503.
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            queue_capacity: 1024,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Socket read timeout in seconds.
    pub read_secs: u64,

    /// Socket write timeout in seconds.
    pub write_secs: u64,

    /// Time until the response head must be ready, in seconds (HTTP).
    pub request_secs: u64,
}

impl TimeoutConfig {
    pub fn read(&self) -> Duration {
        Duration::from_secs(self.read_secs)
    }

    pub fn write(&self) -> Duration {
        Duration::from_secs(self.write_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_secs: 30,
            write_secs: 30,
            request_secs: 60,
        }
    }
}

/// How strictly a session is bound to the client address that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IpValidation {
    #[default]
    Off,
    /// Mismatching requests get a new session; the old one survives.
    Lax,
    /// Mismatching requests get a new session; the old one is removed.
    Strict,
}

/// Session configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Name of the session cookie.
    pub cookie_name: String,

    /// Idle time after which a session expires, in seconds.
    pub ttl_secs: u64,

    /// Interval between sweeps of expired sessions, in seconds.
    pub sweep_interval_secs: u64,

    /// Bound on waiting for a session held by another request, in milliseconds.
    pub lock_timeout_ms: u64,

    /// Start a session for every request before filters run.
    pub autostart: bool,

    /// Mark the session cookie `Secure`.
    pub cookie_secure: bool,

    /// Mark the session cookie `HttpOnly`.
    pub cookie_http_only: bool,

    /// `SameSite` attribute of the session cookie.
    pub cookie_same_site: SameSite,

    /// Send `Expires`/`Max-Age` on the session cookie (otherwise it lives
    /// for the browser session).
    pub cookie_expires: bool,

    /// Bind sessions to the creating client's address.
    pub validate_ip: IpValidation,
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: "SESSION".to_string(),
            ttl_secs: 1800,
            sweep_interval_secs: 60,
            lock_timeout_ms: 5000,
            autostart: false,
            cookie_secure: false,
            cookie_http_only: true,
            cookie_same_site: SameSite::Lax,
            cookie_expires: false,
            validate_ip: IpValidation::Off,
        }
    }
}

/// Request body configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PostConfig {
    /// Maximum accepted request body in KiB. Larger bodies get 413.
    pub max_size_kb: usize,
}

impl PostConfig {
    pub fn max_bytes(&self) -> usize {
        self.max_size_kb.saturating_mul(1024)
    }
}

impl Default for PostConfig {
    fn default() -> Self {
        Self { max_size_kb: 1024 }
    }
}

/// Access filter declarations.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FiltersConfig {
    /// Global switch; when false no filter runs.
    pub enabled: bool,

    /// Filters in evaluation order.
    pub rules: Vec<FilterConfig>,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rules: Vec::new(),
        }
    }
}

/// Filter action kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterKind {
    Block,
    Forward,
    Auth,
}

impl FilterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKind::Block => "block",
            FilterKind::Forward => "forward",
            FilterKind::Auth => "auth",
        }
    }
}

/// How a forward filter builds the new path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardMode {
    /// Replace the matched prefix with the target, keep the rest.
    #[default]
    ReplacePrefix,
    /// Target followed by the last path segment.
    ByFilename,
    /// Target followed by the whole path.
    ByPath,
}

/// One declared filter.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct FilterConfig {
    /// Action taken when the filter matches.
    pub kind: FilterKind,

    /// Disabled filters are skipped.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path prefixes, matched segment-wise; any one suffices.
    #[serde(default)]
    pub paths: Vec<String>,

    /// Extensions of the last path segment; any one suffices.
    #[serde(default)]
    pub extensions: Vec<String>,

    /// Regular expression matched against the whole `/seg/seg` path.
    #[serde(default)]
    pub regex: Option<String>,

    /// Invert the result of the whole match.
    #[serde(default)]
    pub invert: bool,

    #[serde(default)]
    pub invert_paths: bool,

    #[serde(default)]
    pub invert_extensions: bool,

    /// Response status for block filters, or the failure status for auth.
    #[serde(default)]
    pub status: Option<u16>,

    /// Response body. Defaults to the generated error page.
    #[serde(default)]
    pub response: Option<String>,

    /// Forward target path (must start with `/`).
    #[serde(default)]
    pub target: Option<String>,

    #[serde(default)]
    pub mode: ForwardMode,

    /// Basic auth realm.
    #[serde(default)]
    pub realm: Option<String>,

    /// Name of the credential predicate registered with the engine.
    #[serde(default)]
    pub predicate: Option<String>,

    /// Remember successful logins in the session.
    #[serde(default)]
    pub use_sessions: bool,
}

fn default_true() -> bool {
    true
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins if set.
    pub level: String,

    pub format: LogFormat,

    /// Access log path for applications that write one.
    pub access_log: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            access_log: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Runner lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Upper bound on a graceful stop, in seconds.
    pub termination_timeout_secs: u64,

    /// Reload when the config file changes on disk.
    pub watch_config: bool,
}

impl LifecycleConfig {
    pub fn termination_timeout(&self) -> Duration {
        Duration::from_secs(self.termination_timeout_secs)
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            termination_timeout_secs: 10,
            watch_config: false,
        }
    }
}
