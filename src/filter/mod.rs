//! Access filter subsystem.
//!
//! # Data Flow
//! ```text
//! [filters] config section
//!     → build.rs (declarations + predicate registry → AccessFilter)
//!     → list.rs (validated AccessFilterList, published in a snapshot)
//!
//! per request (worker thread):
//!     → AccessFilterList::evaluate(conn)
//!     → rule.rs (conditions: prefix AND extension AND regex, then invert)
//!     → Block  → response prepared, handler skipped
//!     → Forward → path rewritten, handler invoked
//!     → Auth   → auth.rs (Basic credentials / session) → pass or respond
//! ```
//!
//! # Design Decisions
//! - Declaration order decides; the first deciding filter wins
//! - A passing Auth filter does not decide, later filters still run
//! - Forwarded requests are not filtered a second time
//! - Regexes are compiled once, anchored to the whole path

pub mod auth;
pub mod build;
pub mod list;
pub mod rule;

use thiserror::Error;

pub use auth::{AuthGate, AuthPredicate, PredicateRegistry};
pub use list::{AccessFilterList, FilterVerdict};
pub use rule::{AccessFilter, FilterAction};

/// Errors raised while building a filter list.
#[derive(Debug, Error)]
pub enum FilterError {
    /// Regex condition failed to compile.
    #[error("invalid regex {pattern:?}: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Status code outside 100..=599.
    #[error("status {0} is not a valid HTTP status")]
    Status(u16),

    /// Forward target that is not an absolute path.
    #[error("forward target {0:?} must start with '/'")]
    ForwardTarget(String),

    /// Forward rule declared without a target.
    #[error("forward filter has no target")]
    MissingTarget,

    /// Auth rule declared without a predicate name.
    #[error("auth filter has no predicate")]
    MissingPredicate,

    /// Auth rule naming a predicate nobody registered.
    #[error("unknown auth predicate {0:?}")]
    UnknownPredicate(String),

    /// Any of the above, tagged with the filter's position.
    #[error("filter #{index}: {source}")]
    Rule {
        index: usize,
        #[source]
        source: Box<FilterError>,
    },
}

impl FilterError {
    pub(crate) fn at(self, index: usize) -> Self {
        match self {
            FilterError::Rule { .. } => self,
            other => FilterError::Rule {
                index,
                source: Box::new(other),
            },
        }
    }
}
