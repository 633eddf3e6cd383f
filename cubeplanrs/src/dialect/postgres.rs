//! PostgreSQL dialect implementation.

use crate::error::Result;
use crate::time::{Granularity, SqlInterval};

use super::{interval_literal, Dialect};

#[derive(Debug, Default, Clone, Copy)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn placeholder(&self, idx: usize) -> String {
        format!("${}", idx + 1) // PostgreSQL uses $1, $2, ...
    }

    fn max_identifier_length(&self) -> usize {
        63 // NAMEDATALEN - 1
    }

    fn convert_tz(&self, field: &str, timezone: &str) -> String {
        format!("({field}::timestamptz AT TIME ZONE '{}')", timezone.replace('\'', "''"))
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
        Ok(format!("round(hll_cardinality(hll_add_agg(hll_hash_any({sql}))))"))
    }

    fn hll_init(&self, sql: &str) -> Result<String> {
        Ok(format!("hll_add_agg(hll_hash_any({sql}))"))
    }

    fn hll_merge(&self, sql: &str) -> Result<String> {
        Ok(format!("round(hll_cardinality(hll_union_agg({sql})))"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_time_primitives() {
        let d = PostgresDialect;
        assert_eq!(d.placeholder(0), "$1");
        assert_eq!(
            d.convert_tz("orders.created_at", "UTC"),
            "(orders.created_at::timestamptz AT TIME ZONE 'UTC')"
        );
        assert_eq!(
            d.time_grouped_column(Granularity::Month, "x"),
            "date_trunc('month', x)"
        );
        let week = SqlInterval::parse("1 week").unwrap();
        assert_eq!(d.subtract_interval("x", &week).unwrap(), "x + interval '-1 week'");
    }

    #[test]
    fn quotes_identifiers() {
        assert_eq!(PostgresDialect.quote_ident("orders__count"), "\"orders__count\"");
        assert_eq!(PostgresDialect.quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn timezone_literal_is_escaped() {
        assert_eq!(
            PostgresDialect.convert_tz("x", "a'b"),
            "(x::timestamptz AT TIME ZONE 'a''b')"
        );
    }
}
