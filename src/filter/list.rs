//! Ordered filter list and its evaluation.

use tracing::debug;

use super::rule::{AccessFilter, FilterAction};
use super::FilterError;
use crate::config::schema::FilterKind;
use crate::connection::request::join_path;
use crate::connection::Connection;

/// What the pipeline does after filter evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// No filter answered; invoke the handler.
    Continue,
    /// The path was rewritten; invoke the handler without re-filtering.
    Forwarded,
    /// A filter prepared the response; skip the handler.
    Responded(FilterKind),
}

/// Filters evaluated in declaration order. Immutable once published in
/// a snapshot; replace the whole list to change it.
#[derive(Debug, Clone)]
pub struct AccessFilterList {
    enabled: bool,
    filters: Vec<AccessFilter>,
}

impl Default for AccessFilterList {
    fn default() -> Self {
        Self {
            enabled: true,
            filters: Vec::new(),
        }
    }
}

impl AccessFilterList {
    /// Validate and wrap `filters`.
    pub fn new(filters: Vec<AccessFilter>) -> Result<Self, FilterError> {
        for (index, filter) in filters.iter().enumerate() {
            filter.validate().map_err(|e| e.at(index))?;
        }
        Ok(Self {
            enabled: true,
            filters,
        })
    }

    /// Global switch. A disabled list lets every request through.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn filters(&self) -> &[AccessFilter] {
        &self.filters
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run the filters against `conn`. The first Block, Forward or failing
    /// Auth filter that matches ends evaluation; a passing Auth filter
    /// lets later filters run.
    pub fn evaluate(&self, conn: &mut Connection) -> FilterVerdict {
        if !self.enabled {
            return FilterVerdict::Continue;
        }

        for (index, filter) in self.filters.iter().enumerate() {
            if !filter.applies_to(conn.request().path()) {
                continue;
            }

            match filter.action() {
                FilterAction::Block(block) => {
                    debug!(filter = index, status = block.status, "request blocked");
                    block.respond(conn);
                    return FilterVerdict::Responded(FilterKind::Block);
                }
                FilterAction::Forward(forward) => {
                    let target = forward.rewrite(conn.request().path(), filter.conditions());
                    debug!(
                        filter = index,
                        from = %conn.request().path_string(),
                        to = %join_path(&target),
                        "request forwarded"
                    );
                    conn.request_mut().forward_to(target);
                    return FilterVerdict::Forwarded;
                }
                FilterAction::Auth(gate) => {
                    if !gate.check(conn, index) {
                        return FilterVerdict::Responded(FilterKind::Auth);
                    }
                }
            }
        }
        FilterVerdict::Continue
    }
}
