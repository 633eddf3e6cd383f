//! BigQuery dialect implementation.

use crate::error::Result;
use crate::models::DimensionType;
use crate::time::{Granularity, SqlInterval};

use super::{Dialect, LikeKind};

#[derive(Debug, Default, Clone, Copy)]
pub struct BigQueryDialect;

impl Dialect for BigQueryDialect {
    fn name(&self) -> &'static str {
        "bigquery"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "\\`"))
    }

    fn placeholder(&self, idx: usize) -> String {
        format!("@p{idx}") // BigQuery named parameters
    }

    fn max_identifier_length(&self) -> usize {
        300
    }

    fn timestamp_precision(&self) -> usize {
        6
    }

    fn convert_tz(&self, field: &str, timezone: &str) -> String {
        format!("DATETIME({field}, '{}')", timezone.replace('\'', "\\'"))
    }

    fn time_stamp_cast(&self, value: &str) -> String {
        format!("TIMESTAMP({value})")
    }

    fn date_time_cast(&self, value: &str) -> String {
        format!("DATETIME(TIMESTAMP({value}))")
    }

    fn time_grouped_column(&self, granularity: Granularity, dimension: &str) -> String {
        let unit = match granularity {
            Granularity::Week => "WEEK(MONDAY)".to_string(),
            other => other.as_str().to_ascii_uppercase(),
        };
        format!("DATETIME_TRUNC({dimension}, {unit})")
    }

    fn add_interval(&self, date: &str, interval: &SqlInterval) -> Result<String> {
        Ok(interval.parts.iter().fold(date.to_string(), |acc, (n, unit)| {
            let unit = unit.as_str().to_ascii_uppercase();
            if *n < 0 {
                format!("DATETIME_SUB({acc}, INTERVAL {} {unit})", -n)
            } else {
                format!("DATETIME_ADD({acc}, INTERVAL {n} {unit})")
            }
        }))
    }

    fn like_ignore_case(&self, column: &str, negate: bool, param: &str, kind: LikeKind) -> String {
        let pattern = match kind {
            LikeKind::Contains => format!("CONCAT('%', LOWER({param}), '%')"),
            LikeKind::StartsWith => format!("CONCAT(LOWER({param}), '%')"),
            LikeKind::EndsWith => format!("CONCAT('%', LOWER({param}))"),
        };
        let not = if negate { " NOT" } else { "" };
        format!("LOWER({column}){not} LIKE {pattern}")
    }

    fn cast_parameter_for(&self, dimension_type: DimensionType, param: &str) -> String {
        match dimension_type {
            DimensionType::Number => format!("CAST({param} AS FLOAT64)"),
            DimensionType::Boolean => format!("CAST({param} AS BOOL)"),
            _ => param.to_string(),
        }
    }

    fn count_distinct_approx(&self, sql: &str) -> Result<String> {
        Ok(format!("APPROX_COUNT_DISTINCT({sql})"))
    }

    fn hll_init(&self, sql: &str) -> Result<String> {
        Ok(format!("HLL_COUNT.INIT({sql})"))
    }

    fn hll_merge(&self, sql: &str) -> Result<String> {
        Ok(format!("HLL_COUNT.MERGE({sql})"))
    }

    fn series_sql(&self, ranges: &[(String, String)]) -> String {
        let rows: Vec<String> = ranges
            .iter()
            .map(|(from, to)| format!("STRUCT('{from}' AS f, '{to}' AS t)"))
            .collect();
        format!(
            "SELECT {} AS `date_from`, {} AS `date_to` FROM UNNEST([{}]) AS dates",
            self.date_time_cast("dates.f"),
            self.date_time_cast("dates.t"),
            rows.join(", ")
        )
    }

    fn unix_timestamp_sql(&self) -> String {
        "UNIX_SECONDS(CURRENT_TIMESTAMP())".to_string()
    }

    fn now_timestamp_sql(&self) -> String {
        "CURRENT_TIMESTAMP()".to_string()
    }

    fn cast_to_string(&self, sql: &str) -> String {
        format!("CAST({sql} AS STRING)")
    }

    fn concat_strings(&self, parts: &[String]) -> String {
        format!("CONCAT({})", parts.join(", "))
    }
}
