//! DuckDB dialect implementation.

use crate::error::Result;
use crate::time::{Granularity, SqlInterval};

use super::{interval_literal, Dialect};

#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbDialect;

impl Dialect for DuckDbDialect {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn max_identifier_length(&self) -> usize {
        255
    }

    fn convert_tz(&self, field: &str, timezone: &str) -> String {
        format!("timezone('{}', {field}::timestamptz)", timezone.replace('\'', "''"))
    }

    fn time_stamp_cast(&self, value: &str) -> String {
        format!("{value}::timestamptz")
    }

    fn date_time_cast(&self, value: &str) -> String {
        format!("{value}::timestamp")
    }

    fn time_grouped_column(&self, granularity: Granularity, dimension: &str) -> String {
        format!("date_trunc('{granularity}', {dimension})")
    }

    fn add_interval(&self, date: &str, interval: &SqlInterval) -> Result<String> {
        Ok(format!("{date} + {}", interval_literal(interval)))
    }

    fn count_distinct_approx(&self, sql: &str) -> Result<String> {
        Ok(format!("approx_count_distinct({sql})"))
    }
}
