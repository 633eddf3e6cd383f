//! Configuration system for the compiler.
//!
//! Supports TOML-based configuration with compiler defaults and per-dialect overrides.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CubePlanError, Result};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CompilerConfig {
    pub query: QueryConfig,
    pub pre_aggregations: PreAggregationConfig,
    pub cache: CacheConfig,

    /// Per-dialect overrides (keyed by dialect name, e.g. `postgres`).
    #[serde(default)]
    pub dialects: HashMap<String, DialectConfig>,
}

/// Query compilation defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Timezone used when the query does not carry one (default: UTC).
    pub timezone: String,
    /// Skip the primary key check for ungrouped queries.
    pub allow_ungrouped_without_primary_key: bool,
    /// Row limit applied to root queries that do not set one.
    pub default_row_limit: Option<u64>,
    /// Requests asking for more rows than this are rejected.
    pub max_row_limit: Option<u64>,
    /// Upper bound for generated date-bucket series (default: 10000).
    pub max_time_series_buckets: usize,
}

/// Pre-aggregation matching and description defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PreAggregationConfig {
    /// Match rollups at all (default: true).
    pub enabled: bool,
    /// Schema holding rollup tables (default: stb_pre_aggregations).
    pub schema: String,
    /// Default for pre-aggregations that do not declare `external`.
    pub external: bool,
    /// Renewal threshold in seconds when nothing more specific applies (default: 10).
    pub default_renewal_threshold: u64,
}

/// Compiler cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum cached entries (default: 10000). Full caches stop accepting writes.
    pub max_entries: usize,
}

/// Dialect-specific overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DialectConfig {
    pub max_identifier_length: Option<usize>,
    /// Fractional second digits in normalized date literals (3 or 6).
    pub timestamp_precision: Option<usize>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            allow_ungrouped_without_primary_key: false,
            default_row_limit: None,
            max_row_limit: None,
            max_time_series_buckets: 10_000,
        }
    }
}

impl Default for PreAggregationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schema: "stb_pre_aggregations".to_string(),
            external: false,
            default_renewal_threshold: 10,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 10_000,
        }
    }
}

impl CompilerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CubePlanError::Config(format!("failed to read config file: {e}")))?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| CubePlanError::Config(format!("failed to parse config: {e}")))
    }

    /// Load from default locations (env var, cwd, user config dir, or defaults).
    ///
    /// Search order:
    /// 1. `CUBEPLAN_CONFIG` environment variable
    /// 2. `./cubeplan.toml` (current directory)
    /// 3. `~/.config/cubeplan/config.toml` (user config dir)
    /// 4. Built-in defaults
    pub fn load_default() -> Self {
        if let Ok(path) = std::env::var("CUBEPLAN_CONFIG") {
            if let Ok(cfg) = Self::from_file(&path) {
                tracing::info!(path = %path, "loaded config from CUBEPLAN_CONFIG");
                return cfg;
            }
        }

        if let Ok(cfg) = Self::from_file("cubeplan.toml") {
            tracing::info!("loaded config from ./cubeplan.toml");
            return cfg;
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("cubeplan").join("config.toml");
            if let Ok(cfg) = Self::from_file(&user_config) {
                tracing::info!(path = %user_config.display(), "loaded config from user config dir");
                return cfg;
            }
        }

        tracing::debug!("no config file found, using defaults");
        Self::default()
    }

    /// Overrides for one dialect, empty when none are configured.
    pub fn for_dialect(&self, name: &str) -> DialectConfig {
        self.dialects.get(name).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = CompilerConfig::default();
        assert_eq!(cfg.query.timezone, "UTC");
        assert_eq!(cfg.query.max_time_series_buckets, 10_000);
        assert_eq!(cfg.pre_aggregations.schema, "stb_pre_aggregations");
        assert_eq!(cfg.pre_aggregations.default_renewal_threshold, 10);
        assert!(cfg.cache.enabled);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[query]
timezone = "America/New_York"
max_row_limit = 50000

[pre_aggregations]
schema = "rollups"
external = true
"#;
        let cfg = CompilerConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.query.timezone, "America/New_York");
        assert_eq!(cfg.query.max_row_limit, Some(50_000));
        assert_eq!(cfg.query.default_row_limit, None);
        assert_eq!(cfg.pre_aggregations.schema, "rollups");
        assert!(cfg.pre_aggregations.external);
        assert!(cfg.pre_aggregations.enabled);
    }

    #[test]
    fn test_dialect_override() {
        let toml = r#"
[dialects.postgres]
max_identifier_length = 32
"#;
        let cfg = CompilerConfig::from_toml(toml).unwrap();
        assert_eq!(cfg.for_dialect("postgres").max_identifier_length, Some(32));
        assert_eq!(cfg.for_dialect("duckdb").max_identifier_length, None);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = CompilerConfig::from_toml("[query\ntimezone = 1").unwrap_err();
        assert!(matches!(err, CubePlanError::Config(_)));
    }
}
