//! A single access filter: match conditions plus the action taken on a match.

use std::fmt;

use regex::Regex;

use super::auth::AuthGate;
use super::FilterError;
use crate::config::schema::{FilterKind, ForwardMode};
use crate::connection::request::{join_path, split_path};
use crate::connection::Connection;

/// Conditions a request path must satisfy. Every condition that is set
/// must hold; unset conditions match everything.
#[derive(Debug, Clone, Default)]
pub struct MatchConditions {
    prefixes: Vec<Vec<String>>,
    invert_prefixes: bool,
    extensions: Vec<String>,
    invert_extensions: bool,
    regex: Option<Regex>,
}

impl MatchConditions {
    pub fn matches(&self, path: &[String]) -> bool {
        if !self.prefixes.is_empty() {
            let hit = self.matched_prefix(path).is_some();
            if hit == self.invert_prefixes {
                return false;
            }
        }

        if !self.extensions.is_empty() {
            let hit = path
                .last()
                .and_then(|last| last.rsplit_once('.'))
                .map(|(_, ext)| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
                .unwrap_or(false);
            if hit == self.invert_extensions {
                return false;
            }
        }

        if let Some(regex) = &self.regex {
            if !regex.is_match(&join_path(path)) {
                return false;
            }
        }

        true
    }

    /// First configured prefix the path starts with, compared segment-wise.
    fn matched_prefix(&self, path: &[String]) -> Option<&[String]> {
        self.prefixes
            .iter()
            .find(|prefix| path.starts_with(prefix))
            .map(Vec::as_slice)
    }
}

/// Answer the request directly.
#[derive(Debug, Clone)]
pub struct BlockAction {
    pub status: u16,
    /// Custom body; the generated error page when `None`.
    pub body: Option<String>,
}

impl BlockAction {
    pub(crate) fn respond(&self, conn: &mut Connection) {
        conn.send_error(self.status);
        if let Some(body) = &self.body {
            conn.response_mut().set_body(body);
        }
    }
}

/// Rewrite the request path and hand it to the handler.
#[derive(Debug, Clone)]
pub struct ForwardAction {
    pub target: String,
    pub mode: ForwardMode,
}

impl ForwardAction {
    pub(crate) fn rewrite(&self, path: &[String], conditions: &MatchConditions) -> Vec<String> {
        let mut out = split_path(&self.target);
        match self.mode {
            ForwardMode::ReplacePrefix => {
                let skip = if conditions.invert_prefixes {
                    0
                } else {
                    conditions.matched_prefix(path).map_or(0, <[String]>::len)
                };
                out.extend_from_slice(&path[skip..]);
            }
            ForwardMode::ByFilename => out.extend(path.last().cloned()),
            ForwardMode::ByPath => out.extend_from_slice(path),
        }
        out
    }
}

#[derive(Clone)]
pub enum FilterAction {
    Block(BlockAction),
    Forward(ForwardAction),
    Auth(AuthGate),
}

impl fmt::Debug for FilterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterAction::Block(block) => f.debug_tuple("Block").field(block).finish(),
            FilterAction::Forward(forward) => f.debug_tuple("Forward").field(forward).finish(),
            FilterAction::Auth(gate) => f.debug_tuple("Auth").field(gate).finish(),
        }
    }
}

/// A filter as evaluated by [`AccessFilterList`](super::AccessFilterList).
///
/// Built with the constructors plus chained modifiers:
///
/// ```
/// use request_engine::filter::AccessFilter;
///
/// let filter = AccessFilter::block(403).extension("php");
/// ```
#[derive(Debug, Clone)]
pub struct AccessFilter {
    conditions: MatchConditions,
    invert: bool,
    enabled: bool,
    action: FilterAction,
}

impl AccessFilter {
    fn with_action(action: FilterAction) -> Self {
        Self {
            conditions: MatchConditions::default(),
            invert: false,
            enabled: true,
            action,
        }
    }

    /// Answer matching requests with `status` and the generated error page.
    pub fn block(status: u16) -> Self {
        Self::with_action(FilterAction::Block(BlockAction { status, body: None }))
    }

    /// Send matching requests to `target`, replacing the matched prefix.
    pub fn forward(target: impl Into<String>) -> Self {
        Self::with_action(FilterAction::Forward(ForwardAction {
            target: target.into(),
            mode: ForwardMode::default(),
        }))
    }

    pub fn auth(gate: AuthGate) -> Self {
        Self::with_action(FilterAction::Auth(gate))
    }

    /// Add a path prefix such as `/admin`; any configured prefix suffices.
    pub fn prefix(mut self, prefix: &str) -> Self {
        self.conditions.prefixes.push(split_path(prefix));
        self
    }

    /// Add an extension for the last path segment (leading dot optional).
    pub fn extension(mut self, ext: &str) -> Self {
        self.conditions
            .extensions
            .push(ext.trim_start_matches('.').to_string());
        self
    }

    /// Require the whole `/seg/seg` path to match `pattern`.
    pub fn regex(mut self, pattern: &str) -> Result<Self, FilterError> {
        let anchored = format!("^(?:{})$", pattern);
        let regex = Regex::new(&anchored).map_err(|source| FilterError::Regex {
            pattern: pattern.to_string(),
            source,
        })?;
        self.conditions.regex = Some(regex);
        Ok(self)
    }

    pub fn invert_prefixes(mut self, invert: bool) -> Self {
        self.conditions.invert_prefixes = invert;
        self
    }

    pub fn invert_extensions(mut self, invert: bool) -> Self {
        self.conditions.invert_extensions = invert;
        self
    }

    /// Invert the combined match result.
    pub fn invert(mut self, invert: bool) -> Self {
        self.invert = invert;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Custom body for block filters and for auth failures.
    pub fn response(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        match &mut self.action {
            FilterAction::Block(block) => block.body = Some(body),
            FilterAction::Auth(gate) => gate.set_failure_body(body),
            FilterAction::Forward(_) => {}
        }
        self
    }

    /// Forward mode; ignored by other kinds.
    pub fn mode(mut self, mode: ForwardMode) -> Self {
        if let FilterAction::Forward(forward) = &mut self.action {
            forward.mode = mode;
        }
        self
    }

    pub fn kind(&self) -> FilterKind {
        match self.action {
            FilterAction::Block(_) => FilterKind::Block,
            FilterAction::Forward(_) => FilterKind::Forward,
            FilterAction::Auth(_) => FilterKind::Auth,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn action(&self) -> &FilterAction {
        &self.action
    }

    pub(crate) fn conditions(&self) -> &MatchConditions {
        &self.conditions
    }

    /// Whether this filter fires for `path`.
    pub fn applies_to(&self, path: &[String]) -> bool {
        self.enabled && (self.conditions.matches(path) != self.invert)
    }

    /// Static checks run before a filter list is accepted.
    pub fn validate(&self) -> Result<(), FilterError> {
        match &self.action {
            FilterAction::Block(block) => check_status(block.status),
            FilterAction::Forward(forward) => {
                if forward.target.starts_with('/') {
                    Ok(())
                } else {
                    Err(FilterError::ForwardTarget(forward.target.clone()))
                }
            }
            FilterAction::Auth(gate) => check_status(gate.failure_status_code()),
        }
    }
}

fn check_status(status: u16) -> Result<(), FilterError> {
    if (100..=599).contains(&status) {
        Ok(())
    } else {
        Err(FilterError::Status(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> Vec<String> {
        split_path(p)
    }

    #[test]
    fn test_no_conditions_match_everything() {
        let filter = AccessFilter::block(404);
        assert!(filter.applies_to(&path("/")));
        assert!(filter.applies_to(&path("/a/b.c")));
    }

    #[test]
    fn test_prefix_compares_whole_segments() {
        let filter = AccessFilter::block(403).prefix("/admin");
        assert!(filter.applies_to(&path("/admin")));
        assert!(filter.applies_to(&path("/admin/users")));
        assert!(!filter.applies_to(&path("/administrator")));
        assert!(!filter.applies_to(&path("/public/admin")));
    }

    #[test]
    fn test_extension_with_or_without_dot() {
        let filter = AccessFilter::block(403).extension(".php").extension("inc");
        assert!(filter.applies_to(&path("/x/index.php")));
        assert!(filter.applies_to(&path("/lib.INC")));
        assert!(!filter.applies_to(&path("/php")));
        assert!(!filter.applies_to(&path("/index.php/extra")));
    }

    #[test]
    fn test_regex_is_anchored() {
        let filter = AccessFilter::block(403).regex("/a/[0-9]+").unwrap();
        assert!(filter.applies_to(&path("/a/123")));
        assert!(!filter.applies_to(&path("/a/123/b")));
        assert!(!filter.applies_to(&path("/x/a/123")));
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let err = AccessFilter::block(403).regex("(unclosed").unwrap_err();
        assert!(matches!(err, FilterError::Regex { .. }));
    }

    #[test]
    fn test_conditions_are_anded_and_invertible() {
        let filter = AccessFilter::block(403).prefix("/static").extension("css");
        assert!(filter.applies_to(&path("/static/site.css")));
        assert!(!filter.applies_to(&path("/static/site.js")));
        assert!(!filter.applies_to(&path("/site.css")));

        let outside_static = AccessFilter::block(403)
            .prefix("/static")
            .invert_prefixes(true);
        assert!(outside_static.applies_to(&path("/api")));
        assert!(!outside_static.applies_to(&path("/static/x")));

        let all_but_css = AccessFilter::block(403).extension("css").invert(true);
        assert!(all_but_css.applies_to(&path("/x.js")));
        assert!(!all_but_css.applies_to(&path("/x.css")));
    }

    #[test]
    fn test_disabled_filter_never_applies() {
        let filter = AccessFilter::block(403).enabled(false);
        assert!(!filter.applies_to(&path("/anything")));
    }

    #[test]
    fn test_forward_modes() {
        let base = AccessFilter::forward("/new").prefix("/old");
        let rewrite = |filter: &AccessFilter, p: &str| match filter.action() {
            FilterAction::Forward(fwd) => join_path(&fwd.rewrite(&path(p), filter.conditions())),
            _ => unreachable!(),
        };
        assert_eq!(rewrite(&base, "/old/x/y"), "/new/x/y");
        let by_filename = base.clone().mode(ForwardMode::ByFilename);
        assert_eq!(rewrite(&by_filename, "/old/x/y"), "/new/y");
        let by_path = base.mode(ForwardMode::ByPath);
        assert_eq!(rewrite(&by_path, "/old/x/y"), "/new/old/x/y");
    }

    #[test]
    fn test_validate_rejects_bad_status_and_relative_target() {
        assert!(matches!(
            AccessFilter::block(99).validate(),
            Err(FilterError::Status(99))
        ));
        assert!(matches!(
            AccessFilter::forward("relative").validate(),
            Err(FilterError::ForwardTarget(_))
        ));
        assert!(AccessFilter::forward("/ok").validate().is_ok());
    }
}
