//! SQL dialect capabilities for different warehouses.
//!
//! Each dialect is implemented in its own file and gated behind a feature flag.
//! The compiler only ever talks to `&dyn Dialect`; a capability a warehouse
//! cannot express returns `CubePlanError::Unsupported` instead of degrading.

use serde_json::Value;

use crate::error::{CubePlanError, Result};
use crate::models::DimensionType;
use crate::time::{Granularity, SqlInterval};

/// Which side of a pattern the wildcard goes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeKind {
    Contains,
    StartsWith,
    EndsWith,
}

/// Dialects render identifiers and primitive expression pieces.
/// Query assembly lives in the query builder; the dialect only maps
/// logical constructs to SQL fragments.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote_ident(&self, ident: &str) -> String;

    fn placeholder(&self, _idx: usize) -> String {
        "?".to_string()
    }

    fn max_identifier_length(&self) -> usize {
        64
    }

    /// Fractional second digits the warehouse keeps.
    fn timestamp_precision(&self) -> usize {
        3
    }

    /// Column expression converted to wall-clock time in `timezone`.
    fn convert_tz(&self, field: &str, timezone: &str) -> String;

    /// Cast a bound value to a timezone-aware timestamp.
    fn time_stamp_cast(&self, value: &str) -> String;

    /// Cast a bound value to a wall-clock timestamp, comparable with `convert_tz` output.
    fn date_time_cast(&self, value: &str) -> String;

    fn time_grouped_column(&self, granularity: Granularity, dimension: &str) -> String;

    fn add_interval(&self, date: &str, interval: &SqlInterval) -> Result<String>;

    fn subtract_interval(&self, date: &str, interval: &SqlInterval) -> Result<String> {
        self.add_interval(date, &interval.negate())
    }

    /// Case-insensitive match of `column` against a bound `param`.
    fn like_ignore_case(&self, column: &str, negate: bool, param: &str, kind: LikeKind) -> String {
        let pattern = match kind {
            LikeKind::Contains => format!("'%' || {param} || '%'"),
            LikeKind::StartsWith => format!("{param} || '%'"),
            LikeKind::EndsWith => format!("'%' || {param}"),
        };
        let not = if negate { " NOT" } else { "" };
        format!("{column}{not} ILIKE {pattern}")
    }

    fn cast_parameter_for(&self, _dimension_type: DimensionType, param: &str) -> String {
        param.to_string()
    }

    fn count_distinct_approx(&self, sql: &str) -> Result<String>;

    /// Mergeable sketch stored in rollup tables for approximate distinct counts.
    fn hll_init(&self, _sql: &str) -> Result<String> {
        Err(unsupported("hll_init", self.name()))
    }

    fn hll_merge(&self, _sql: &str) -> Result<String> {
        Err(unsupported("hll_merge", self.name()))
    }

    fn render_limit(&self, limit: Option<u64>, offset: Option<u64>) -> String {
        let mut sql = String::new();
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        sql
    }

    /// Inline table of `(date_from, date_to)` rows.
    fn series_sql(&self, ranges: &[(String, String)]) -> String {
        let values: Vec<String> = ranges
            .iter()
            .map(|(from, to)| {
                format!(
                    "({}, {})",
                    self.render_literal(&Value::String(from.clone())),
                    self.render_literal(&Value::String(to.clone()))
                )
            })
            .collect();
        format!(
            "SELECT {} AS {}, {} AS {} FROM (VALUES {}) AS dates (date_from, date_to)",
            self.date_time_cast("date_from"),
            self.quote_ident("date_from"),
            self.date_time_cast("date_to"),
            self.quote_ident("date_to"),
            values.join(", ")
        )
    }

    fn unix_timestamp_sql(&self) -> String {
        "EXTRACT(EPOCH FROM NOW())".to_string()
    }

    fn now_timestamp_sql(&self) -> String {
        "NOW()".to_string()
    }

    fn cast_to_string(&self, sql: &str) -> String {
        format!("CAST({sql} AS TEXT)")
    }

    fn concat_strings(&self, parts: &[String]) -> String {
        parts.join(" || ")
    }

    fn render_literal(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Array(items) => {
                let rendered: Vec<String> = items.iter().map(|v| self.render_literal(v)).collect();
                rendered.join(", ")
            }
            Value::Object(_) => format!("'{}'", value.to_string().replace('\'', "''")),
        }
    }
}

pub(crate) fn unsupported(capability: &str, dialect: &str) -> CubePlanError {
    CubePlanError::Unsupported(format!("{capability} is not supported by {dialect}"))
}

/// `date + interval 'n unit'` arithmetic shared by Postgres-flavoured dialects.
#[cfg(any(feature = "duckdb", feature = "postgres"))]
pub(crate) fn interval_literal(interval: &SqlInterval) -> String {
    format!("interval '{interval}'")
}

/// Look a dialect up by name, among the ones compiled in.
pub fn dialect_for(name: &str) -> Result<Box<dyn Dialect>> {
    match name.to_ascii_lowercase().as_str() {
        #[cfg(feature = "postgres")]
        "postgres" | "postgresql" => Ok(Box::new(PostgresDialect)),
        #[cfg(feature = "duckdb")]
        "duckdb" => Ok(Box::new(DuckDbDialect)),
        #[cfg(feature = "bigquery")]
        "bigquery" => Ok(Box::new(BigQueryDialect)),
        other => Err(CubePlanError::Config(format!(
            "dialect '{other}' is unknown or not enabled"
        ))),
    }
}

// Feature-gated dialect implementations
#[cfg(feature = "duckdb")]
mod duckdb;
#[cfg(feature = "duckdb")]
pub use duckdb::DuckDbDialect;

#[cfg(feature = "postgres")]
mod postgres;
#[cfg(feature = "postgres")]
pub use postgres::PostgresDialect;

#[cfg(feature = "bigquery")]
mod bigquery;
#[cfg(feature = "bigquery")]
pub use bigquery::BigQueryDialect;
