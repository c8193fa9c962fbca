//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (concurrency > 0, statuses in range)
//! - Check addresses and permissions parse
//! - Check filter declarations are complete and their regexes compile
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: EngineConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system
//! - Auth predicate names are resolved later, against the registry

use std::fmt;
use std::net::SocketAddr;

use regex::Regex;

use crate::config::schema::{EngineConfig, FilterConfig, FilterKind};

/// Longest accepted session lifetime: ten years.
pub const MAX_SESSION_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field, e.g. `filters.rules[2].regex`.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &EngineConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let transport = &config.transport;
    if transport.socket_path.is_none() && transport.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "transport.bind_address",
            format!("{:?} is not a host:port socket address", transport.bind_address),
        ));
    }
    if let Some(perms) = &transport.socket_permissions {
        if parse_permissions(perms).is_none() {
            errors.push(ValidationError::new(
                "transport.socket_permissions",
                format!("{:?} is not an octal mode", perms),
            ));
        }
    }
    if transport.max_connections == 0 {
        errors.push(ValidationError::new("transport.max_connections", "must be at least 1"));
    }

    if config.workers.concurrency == 0 {
        errors.push(ValidationError::new("workers.concurrency", "must be at least 1"));
    }
    if config.workers.queue_capacity == 0 {
        errors.push(ValidationError::new("workers.queue_capacity", "must be at least 1"));
    }

    if config.timeouts.read_secs == 0 {
        errors.push(ValidationError::new("timeouts.read_secs", "must be at least 1"));
    }
    if config.timeouts.write_secs == 0 {
        errors.push(ValidationError::new("timeouts.write_secs", "must be at least 1"));
    }

    let session = &config.session;
    if session.cookie_name.is_empty()
        || crate::connection::cookie::validate(&session.cookie_name, "").is_err()
    {
        errors.push(ValidationError::new(
            "session.cookie_name",
            format!("{:?} is not a valid cookie name", session.cookie_name),
        ));
    }
    if session.ttl_secs > MAX_SESSION_TTL_SECS {
        errors.push(ValidationError::new(
            "session.ttl_secs",
            format!("must be at most {}", MAX_SESSION_TTL_SECS),
        ));
    }
    if session.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("session.sweep_interval_secs", "must be at least 1"));
    }

    if let Err(e) = config.observability.metrics_address.parse::<SocketAddr>() {
        if config.observability.metrics_enabled {
            errors.push(ValidationError::new("observability.metrics_address", e.to_string()));
        }
    }

    for (index, rule) in config.filters.rules.iter().enumerate() {
        validate_rule(index, rule, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_rule(index: usize, rule: &FilterConfig, errors: &mut Vec<ValidationError>) {
    let field = |name: &str| format!("filters.rules[{}].{}", index, name);

    if let Some(pattern) = &rule.regex {
        if let Err(e) = Regex::new(&format!("^(?:{})$", pattern)) {
            errors.push(ValidationError::new(field("regex"), e.to_string()));
        }
    }
    if let Some(status) = rule.status {
        if !(100..=599).contains(&status) {
            errors.push(ValidationError::new(
                field("status"),
                format!("{} is not a valid HTTP status", status),
            ));
        }
    }

    match rule.kind {
        FilterKind::Block => {}
        FilterKind::Forward => match &rule.target {
            Some(target) if target.starts_with('/') => {}
            Some(target) => errors.push(ValidationError::new(
                field("target"),
                format!("{:?} must start with '/'", target),
            )),
            None => errors.push(ValidationError::new(field("target"), "forward filters need a target")),
        },
        FilterKind::Auth => {
            if rule.predicate.as_deref().map_or(true, str::is_empty) {
                errors.push(ValidationError::new(
                    field("predicate"),
                    "auth filters need a predicate name",
                ));
            }
        }
    }
}

/// Parse an octal permission string such as `"660"` or `"0o660"`.
pub fn parse_permissions(value: &str) -> Option<u32> {
    let digits = value.trim_start_matches("0o");
    u32::from_str_radix(digits, 8).ok().filter(|mode| *mode <= 0o7777)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ForwardMode;

    fn rule(kind: FilterKind) -> FilterConfig {
        FilterConfig {
            kind,
            enabled: true,
            paths: Vec::new(),
            extensions: Vec::new(),
            regex: None,
            invert: false,
            invert_paths: false,
            invert_extensions: false,
            status: None,
            response: None,
            target: None,
            mode: ForwardMode::ReplacePrefix,
            realm: None,
            predicate: None,
            use_sessions: false,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&EngineConfig::default()).is_ok());
    }

    #[test]
    fn test_collects_all_filter_errors() {
        let mut config = EngineConfig::default();
        let mut bad_regex = rule(FilterKind::Block);
        bad_regex.regex = Some("(".into());
        bad_regex.status = Some(42);
        let mut relative = rule(FilterKind::Forward);
        relative.target = Some("new".into());
        config.filters.rules = vec![bad_regex, relative, rule(FilterKind::Auth)];

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "filters.rules[0].regex",
                "filters.rules[0].status",
                "filters.rules[1].target",
                "filters.rules[2].predicate",
            ]
        );
    }

    #[test]
    fn test_bind_address_and_permissions() {
        let mut config = EngineConfig::default();
        config.transport.bind_address = "not an address".into();
        config.transport.socket_permissions = Some("999".into());
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);

        config.transport.socket_path = Some("/tmp/x.sock".into());
        config.transport.socket_permissions = Some("0o660".into());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_session_ttl_is_capped() {
        let mut config = EngineConfig::default();
        config.session.cookie_expires = true;
        config.session.ttl_secs = MAX_SESSION_TTL_SECS;
        assert!(validate_config(&config).is_ok());

        config.session.ttl_secs = u64::MAX / 2;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "session.ttl_secs");
    }

    #[test]
    fn test_parse_permissions() {
        assert_eq!(parse_permissions("660"), Some(0o660));
        assert_eq!(parse_permissions("0o755"), Some(0o755));
        assert_eq!(parse_permissions("8"), None);
    }
}
