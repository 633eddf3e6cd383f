//! Rendering overlay threaded through every symbol evaluation.
//!
//! A context is a plain value: nested renders receive a modified copy and the
//! caller keeps its own, so nothing has to be restored afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{CubePlanError, Result};
use crate::time::Granularity;

#[derive(Debug, Clone, Default)]
pub(crate) struct RenderContext {
    /// Measures render as their per-row expression (cumulative base queries).
    pub ungrouped: bool,
    pub over_time_series_aggregate: bool,
    /// Time dimensions truncate to this instead of the requested granularity.
    pub granularity_override: Option<Granularity>,
    pub rollup_query: bool,
    pub rollup_granularity: Option<Granularity>,
    pub cube_alias_prefix: Option<String>,
    /// Member path to SQL that replaces its normal rendering verbatim.
    pub rendered_reference: Arc<HashMap<String, String>>,
    /// Measure path to the grouped column it is re-aggregated from.
    pub ungrouped_aliases_for_cumulative: Arc<HashMap<String, String>>,
    visiting: Vec<String>,
}

impl RenderContext {
    pub fn with_cube_alias_prefix(&self, prefix: impl Into<String>) -> Self {
        Self {
            cube_alias_prefix: Some(prefix.into()),
            ..self.clone()
        }
    }

    pub fn with_rendered_reference(&self, references: HashMap<String, String>) -> Self {
        let mut merged = (*self.rendered_reference).clone();
        merged.extend(references);
        Self {
            rendered_reference: Arc::new(merged),
            ..self.clone()
        }
    }

    pub fn with_ungrouped(&self, ungrouped: bool) -> Self {
        Self {
            ungrouped,
            ..self.clone()
        }
    }

    pub fn with_over_time_series(&self, granularity_override: Option<Granularity>) -> Self {
        Self {
            over_time_series_aggregate: true,
            granularity_override,
            ..self.clone()
        }
    }

    pub fn with_rollup(&self, granularity: Option<Granularity>) -> Self {
        Self {
            rollup_query: true,
            rollup_granularity: granularity,
            ..self.clone()
        }
    }

    pub fn with_cumulative_aliases(&self, aliases: HashMap<String, String>) -> Self {
        Self {
            ungrouped_aliases_for_cumulative: Arc::new(aliases),
            ..self.clone()
        }
    }

    /// Enter the evaluation of `path`, failing on reference cycles.
    pub fn visit(&self, path: &str) -> Result<Self> {
        if self.visiting.iter().any(|p| p == path) {
            let mut chain = self.visiting.clone();
            chain.push(path.to_string());
            return Err(CubePlanError::Schema(format!(
                "circular reference detected: {}",
                chain.join(" -> ")
            )));
        }
        let mut next = self.clone();
        next.visiting.push(path.to_string());
        Ok(next)
    }

    pub fn reference(&self, path: &str) -> Option<&String> {
        self.rendered_reference.get(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_contexts_leave_the_parent_untouched() {
        let root = RenderContext::default();
        let nested = root
            .with_cube_alias_prefix("main")
            .with_rendered_reference(HashMap::from([("A.x".to_string(), "\"a__x\"".to_string())]));
        assert!(root.cube_alias_prefix.is_none());
        assert!(root.reference("A.x").is_none());
        assert_eq!(nested.reference("A.x").map(String::as_str), Some("\"a__x\""));
    }

    #[test]
    fn cycles_are_reported_with_the_chain() {
        let ctx = RenderContext::default().visit("A.x").unwrap().visit("A.y").unwrap();
        let err = ctx.visit("A.x").unwrap_err();
        assert!(err.to_string().contains("A.x -> A.y -> A.x"));
    }
}
