//! Building filter lists from configuration declarations.

use super::auth::{AuthGate, PredicateRegistry};
use super::list::AccessFilterList;
use super::rule::AccessFilter;
use super::FilterError;
use crate::config::schema::{FilterConfig, FilterKind, FiltersConfig};

impl AccessFilterList {
    /// Compile declared rules. Auth rules look their predicate up in
    /// `registry`.
    pub fn from_config(
        config: &FiltersConfig,
        registry: &PredicateRegistry,
    ) -> Result<Self, FilterError> {
        let filters = config
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| build_filter(rule, registry).map_err(|e| e.at(index)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(AccessFilterList::new(filters)?.with_enabled(config.enabled))
    }
}

fn build_filter(rule: &FilterConfig, registry: &PredicateRegistry) -> Result<AccessFilter, FilterError> {
    let mut filter = match rule.kind {
        FilterKind::Block => AccessFilter::block(rule.status.unwrap_or(404)),
        FilterKind::Forward => {
            let target = rule.target.as_deref().ok_or(FilterError::MissingTarget)?;
            AccessFilter::forward(target).mode(rule.mode)
        }
        FilterKind::Auth => {
            let name = rule
                .predicate
                .as_deref()
                .ok_or(FilterError::MissingPredicate)?;
            let predicate = registry
                .get(name)
                .ok_or_else(|| FilterError::UnknownPredicate(name.to_string()))?;
            let mut gate = AuthGate::from_predicate(predicate)
                .use_sessions(rule.use_sessions)
                .failure_status(rule.status.unwrap_or(403));
            if let Some(realm) = &rule.realm {
                gate = gate.realm(realm);
            }
            AccessFilter::auth(gate)
        }
    };

    for prefix in &rule.paths {
        filter = filter.prefix(prefix);
    }
    for ext in &rule.extensions {
        filter = filter.extension(ext);
    }
    if let Some(pattern) = &rule.regex {
        filter = filter.regex(pattern)?;
    }
    if let Some(body) = &rule.response {
        filter = filter.response(body.clone());
    }

    Ok(filter
        .invert_prefixes(rule.invert_paths)
        .invert_extensions(rule.invert_extensions)
        .invert(rule.invert)
        .enabled(rule.enabled))
}
