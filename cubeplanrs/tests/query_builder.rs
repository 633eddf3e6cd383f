//! Integration tests for query compilation.
//!
//! These tests exercise the public API: QueryCompiler, CubeRegistry, QuerySpec.

use chrono::NaiveDateTime;
use cubeplan::dialect::PostgresDialect;
use cubeplan::query_builder::OrderMember;
use cubeplan::{CubePlanError, QueryCompiler, QuerySpec};
use regex::Regex;
use serde_json::json;

// ============================================================================
// Test fixtures
// ============================================================================

mod fixtures {
    use cubeplan::models::{
        CubeDefinition, DimensionDefinition, JoinDefinition, JoinRelationship, MeasureDefinition,
        MeasureType, RollingWindow, SegmentDefinition,
    };
    use cubeplan::registry::CubeRegistry;

    fn join(relationship: JoinRelationship, sql: &str) -> JoinDefinition {
        JoinDefinition {
            relationship,
            sql: sql.to_string(),
        }
    }

    pub fn orders() -> CubeDefinition {
        let mut cube = CubeDefinition::new("Orders", "public.orders");
        cube.dimensions.insert("id".into(), DimensionDefinition::number("id").primary_key());
        cube.dimensions.insert("status".into(), DimensionDefinition::string("status"));
        cube.dimensions.insert("customerId".into(), DimensionDefinition::number("customer_id"));
        cube.dimensions.insert("createdAt".into(), DimensionDefinition::time("created_at"));
        cube.measures.insert("count".into(), MeasureDefinition::count());
        cube.measures.insert("totalAmount".into(), MeasureDefinition::sum("amount"));
        cube.measures.insert(
            "completedCount".into(),
            MeasureDefinition::count().with_filter("{CUBE}.status = 'completed'"),
        );
        cube.measures.insert(
            "rollingAmount".into(),
            MeasureDefinition::sum("amount").with_rolling_window(RollingWindow {
                trailing: Some("7 day".into()),
                ..RollingWindow::default()
            }),
        );
        cube.measures.insert(
            "runningAmount".into(),
            MeasureDefinition::new(MeasureType::RunningTotal, Some("amount")),
        );
        cube.segments.insert(
            "completed".into(),
            SegmentDefinition {
                sql: "{CUBE}.status = 'completed'".into(),
                description: None,
            },
        );
        cube.joins.insert(
            "LineItems".into(),
            join(JoinRelationship::HasMany, "{CUBE}.id = {LineItems.orderId}"),
        );
        cube.joins.insert(
            "Customers".into(),
            join(JoinRelationship::BelongsTo, "{CUBE}.customer_id = {Customers.id}"),
        );
        cube
    }

    pub fn line_items() -> CubeDefinition {
        let mut cube = CubeDefinition::new("LineItems", "public.line_items");
        cube.dimensions.insert("id".into(), DimensionDefinition::number("id").primary_key());
        cube.dimensions.insert("orderId".into(), DimensionDefinition::number("order_id"));
        cube.dimensions.insert("product".into(), DimensionDefinition::string("product"));
        cube.measures.insert("count".into(), MeasureDefinition::count());
        cube.measures.insert("totalPrice".into(), MeasureDefinition::sum("price"));
        cube
    }

    pub fn customers() -> CubeDefinition {
        let mut cube = CubeDefinition::new("Customers", "public.customers");
        cube.dimensions.insert("id".into(), DimensionDefinition::number("id").primary_key());
        cube.dimensions.insert("city".into(), DimensionDefinition::string("city"));
        cube.dimensions.insert(
            "lifetimeAmount".into(),
            DimensionDefinition::number("{Orders.totalAmount}").sub_query(),
        );
        cube.measures.insert("count".into(), MeasureDefinition::count());
        cube.joins.insert(
            "Orders".into(),
            join(JoinRelationship::HasMany, "{CUBE}.id = {Orders.customerId}"),
        );
        cube
    }

    pub fn registry() -> CubeRegistry {
        CubeRegistry::from_cubes(vec![orders(), line_items(), customers()]).unwrap()
    }
}

fn now() -> NaiveDateTime {
    cubeplan::time::parse_date_time("2021-06-15T12:00:00").unwrap()
}

fn spec(value: serde_json::Value) -> QuerySpec {
    serde_json::from_value(value).unwrap()
}

fn placeholders(sql: &str) -> Vec<usize> {
    Regex::new(r"\$(\d+)")
        .unwrap()
        .captures_iter(sql)
        .map(|c| c[1].parse().unwrap())
        .collect()
}

// ============================================================================
// Simple queries
// ============================================================================

#[test]
fn single_measure_without_dimensions() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let compiled = compiler.compile(&spec(json!({"measures": ["Orders.count"]}))).unwrap();

    assert_eq!(
        compiled.sql.0,
        "SELECT count(\"orders\".id) AS \"orders__count\" FROM public.orders AS \"orders\" ORDER BY 1 DESC"
    );
    assert!(compiled.sql.1.is_empty());
    assert_eq!(
        compiled.order,
        vec![OrderMember {
            id: "Orders.count".into(),
            desc: true
        }]
    );
    assert_eq!(compiled.alias_name_to_member["orders__count"], "Orders.count");
}

#[test]
fn grouped_time_dimension_is_truncated_and_ordered_first() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let compiled = compiler
        .compile(&spec(json!({
            "measures": ["Orders.count"],
            "dimensions": ["Orders.status"],
            "timeDimensions": [{
                "dimension": "Orders.createdAt",
                "granularity": "hour",
                "dateRange": ["2020-01-01", "2020-01-01"]
            }]
        })))
        .unwrap();

    let sql = &compiled.sql.0;
    assert!(sql.contains(
        "date_trunc('hour', (\"orders\".created_at::timestamptz AT TIME ZONE 'UTC')) AS \"orders__created_at_hour\""
    ));
    assert!(sql.contains("GROUP BY 1, 2"));
    assert!(sql.ends_with("ORDER BY 2 ASC"));
    assert_eq!(
        compiled.sql.1,
        vec![json!("2020-01-01T00:00:00.000"), json!("2020-01-01T23:59:59.999")]
    );
    assert_eq!(
        compiled.alias_name_to_member["orders__created_at_hour"],
        "Orders.createdAt.hour"
    );
}

#[test]
fn order_object_and_list_forms_compile_the_same() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let by_map = compiler
        .compile(&spec(json!({"measures": ["Orders.count"], "order": {"Orders.count": "asc"}})))
        .unwrap();
    let by_list = compiler
        .compile(&spec(json!({"measures": ["Orders.count"], "order": [["Orders.count", "asc"]]})))
        .unwrap();

    assert_eq!(by_map.order, by_list.order);
    assert_eq!(
        by_map.order,
        vec![OrderMember {
            id: "Orders.count".into(),
            desc: false
        }]
    );
    assert_eq!(by_map.sql, by_list.sql);
}

#[test]
fn compilation_is_deterministic() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let query = spec(json!({
        "measures": ["Orders.totalAmount", "LineItems.totalPrice"],
        "dimensions": ["Orders.status"],
        "filters": [{"member": "Orders.status", "operator": "equals", "values": ["shipped"]}]
    }));
    let first = compiler.compile(&query).unwrap();
    let second = compiler.compile(&query).unwrap();
    assert_eq!(first.sql, second.sql);
    assert_eq!(first, second);
}

#[test]
fn params_follow_placeholder_order() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let compiled = compiler
        .compile(&spec(json!({
            "measures": ["Orders.count"],
            "filters": [
                {"member": "Orders.status", "operator": "equals", "values": ["shipped", "returned"]}
            ],
            "timeDimensions": [{
                "dimension": "Orders.createdAt",
                "dateRange": ["2020-01-01", "2020-01-31"]
            }]
        })))
        .unwrap();

    let (sql, params) = &compiled.sql;
    let numbers = placeholders(sql);
    assert_eq!(numbers, (1..=params.len()).collect::<Vec<_>>());
    assert_eq!(
        params,
        &vec![
            json!("shipped"),
            json!("returned"),
            json!("2020-01-01T00:00:00.000"),
            json!("2020-01-31T23:59:59.999"),
        ]
    );
}

#[test]
fn segments_and_measure_filters() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let compiled = compiler
        .compile(&spec(json!({
            "measures": ["Orders.completedCount"],
            "dimensions": ["Orders.status"],
            "segments": ["Orders.completed"],
            "filters": [{"member": "Orders.count", "operator": "gt", "values": ["10"]}]
        })))
        .unwrap();

    let sql = &compiled.sql.0;
    assert!(sql.contains("count(CASE WHEN \"orders\".status = 'completed' THEN \"orders\".id END)"));
    assert!(sql.contains("WHERE \"orders\".status = 'completed'"));
    assert!(sql.contains("HAVING count(\"orders\".id) >"));
}

#[test]
fn limit_offset_and_total() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let compiled = compiler
        .compile(&spec(json!({
            "measures": ["Orders.count"],
            "dimensions": ["Orders.status"],
            "limit": 10,
            "offset": 20,
            "total": true
        })))
        .unwrap();

    assert!(compiled.sql.0.ends_with("LIMIT 10 OFFSET 20"));
    let (total, _) = compiled.total_sql.unwrap();
    assert!(total.starts_with("SELECT count(*) \"total_count\" FROM (SELECT"));
    assert!(total.ends_with(") \"original_query\""));
    assert!(!total.contains("LIMIT"));
    assert!(!total.contains("ORDER BY"));
}

// ============================================================================
// Fan-out
// ============================================================================

#[test]
fn count_over_fan_out_counts_distinct_primary_keys() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let compiled = compiler
        .compile(&spec(json!({
            "measures": ["Orders.count"],
            "dimensions": ["LineItems.product"]
        })))
        .unwrap();

    let sql = &compiled.sql.0;
    assert!(sql.contains("count(distinct \"orders\".id)"));
    assert!(sql.contains("LEFT JOIN public.line_items AS \"line_items\" ON \"orders\".id = \"line_items\".order_id"));
    assert!(!sql.contains("q_0"));
}

#[test]
fn multiplied_sum_is_aggregated_per_primary_key() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let compiled = compiler
        .compile(&spec(json!({
            "measures": ["Orders.totalAmount", "LineItems.totalPrice"],
            "dimensions": ["Orders.status"]
        })))
        .unwrap();

    let sql = &compiled.sql.0;
    assert!(sql.starts_with("SELECT q_0.\"orders__status\" AS \"orders__status\""));
    assert!(sql.contains("AS \"q_0\""));
    assert!(sql.contains("INNER JOIN (SELECT"));
    assert!(sql.contains("AS \"q_1\" ON (q_0.\"orders__status\" = q_1.\"orders__status\" OR (q_0.\"orders__status\" IS NULL AND q_1.\"orders__status\" IS NULL))"));
    assert!(sql.contains("SELECT DISTINCT"));
    assert!(sql.contains("AS \"keys\" LEFT JOIN public.orders AS \"orders_key__orders\""));
    assert!(sql.contains("sum(\"orders_key__orders\".amount)"));
    assert!(sql.contains("sum(\"main__line_items\".price)"));
    assert!(sql.ends_with("ORDER BY 2 DESC"));
}

#[test]
fn measures_across_fan_out_chain_use_sub_selects() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let compiled = compiler
        .compile(&spec(json!({
            "measures": ["Customers.count", "LineItems.totalPrice", "Orders.totalAmount"],
            "dimensions": ["Customers.city"]
        })))
        .unwrap();

    let sql = &compiled.sql.0;
    // Customers fan out through Orders: their count is taken over distinct keys,
    // Orders amounts get their own per-key sub query.
    assert!(sql.contains("count(distinct \"main__customers\".id)"));
    assert!(sql.contains("AS \"q_1\""));
    assert!(!sql.contains("q_2"));
}

// ============================================================================
// Cumulative measures
// ============================================================================

#[test]
fn rolling_window_joins_a_date_series() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let compiled = compiler
        .compile(&spec(json!({
            "measures": ["Orders.rollingAmount"],
            "timeDimensions": [{
                "dimension": "Orders.createdAt",
                "granularity": "day",
                "dateRange": ["2020-01-01", "2020-01-03"]
            }]
        })))
        .unwrap();

    let sql = &compiled.sql.0;
    assert!(sql.contains("FROM (VALUES ('2020-01-01T00:00:00.000', '2020-01-01T23:59:59.999')"));
    assert!(sql.contains("('2020-01-03T00:00:00.000', '2020-01-03T23:59:59.999')"));
    assert!(sql.contains("interval '"));
    assert!(sql.contains("LEFT JOIN (SELECT"));
    assert!(sql.contains("cumulative__base\".\"orders__rolling_amount\")"));
    assert!(compiled.used_pre_aggregation.is_none());
}

#[test]
fn running_total_alongside_regular_measure() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let compiled = compiler
        .compile(&spec(json!({
            "measures": ["Orders.count", "Orders.runningAmount"],
            "timeDimensions": [{
                "dimension": "Orders.createdAt",
                "granularity": "month",
                "dateRange": ["2020-01-01", "2020-03-31"]
            }]
        })))
        .unwrap();

    let sql = &compiled.sql.0;
    assert!(sql.contains("AS \"q_0\""));
    assert!(sql.contains("AS \"q_1\""));
    assert!(sql.contains("('2020-03-01T00:00:00.000', '2020-03-31T23:59:59.999')"));
}

#[test]
fn time_series_requires_a_date_range() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let err = compiler
        .compile(&spec(json!({
            "measures": ["Orders.rollingAmount"],
            "timeDimensions": [{"dimension": "Orders.createdAt", "granularity": "day"}]
        })))
        .unwrap_err();
    assert!(matches!(err, CubePlanError::Validation(_)));
}

// ============================================================================
// Sub query dimensions
// ============================================================================

#[test]
fn sub_query_dimension_joins_a_nested_query() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let compiled = compiler
        .compile(&spec(json!({
            "measures": ["Customers.count"],
            "dimensions": ["Customers.lifetimeAmount"]
        })))
        .unwrap();

    let sql = &compiled.sql.0;
    assert!(sql.contains(
        "\"customers_lifetime_amount_subquery\".\"customers__lifetime_amount\" AS \"customers__lifetime_amount\""
    ));
    assert!(sql.contains("LEFT JOIN (SELECT"));
    assert!(sql.contains(
        "AS \"customers_lifetime_amount_subquery\" ON \"customers_lifetime_amount_subquery\".\"customers__id\" = \"customers\".id"
    ));
    assert!(sql.contains("sum("));
}

// ============================================================================
// Ungrouped queries
// ============================================================================

#[test]
fn ungrouped_query_requires_primary_keys() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let err = compiler
        .compile(&spec(json!({
            "measures": ["Orders.count"],
            "dimensions": ["Orders.status"],
            "ungrouped": true
        })))
        .unwrap_err();
    assert!(matches!(err, CubePlanError::Schema(_)));
    assert!(err.is_user_error());

    let compiled = compiler
        .compile(&spec(json!({
            "measures": ["Orders.count"],
            "dimensions": ["Orders.id", "Orders.status"],
            "ungrouped": true
        })))
        .unwrap();
    assert!(!compiled.sql.0.contains("GROUP BY"));
    assert!(compiled.sql.0.contains("1 AS \"orders__count\""));
}

#[test]
fn ungrouped_query_rejects_measure_filters() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let err = compiler
        .compile(&spec(json!({
            "dimensions": ["Orders.id"],
            "filters": [{"member": "Orders.count", "operator": "gt", "values": ["1"]}],
            "ungrouped": true
        })))
        .unwrap_err();
    assert!(matches!(err, CubePlanError::Validation(_)));
}

// ============================================================================
// Compare date range and errors
// ============================================================================

#[test]
fn compare_date_range_compiles_one_query_per_range() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let compiled = compiler
        .compile_compare(&spec(json!({
            "measures": ["Orders.count"],
            "timeDimensions": [{
                "dimension": "Orders.createdAt",
                "granularity": "day",
                "compareDateRange": [["2020-01-01", "2020-01-07"], ["2020-01-08", "2020-01-14"]]
            }]
        })))
        .unwrap();

    assert_eq!(compiled.len(), 2);
    assert_eq!(
        compiled[0].compare_date_range,
        Some(("2020-01-01T00:00:00.000".into(), "2020-01-07T23:59:59.999".into()))
    );
    assert_eq!(compiled[1].sql.1[0], json!("2020-01-08T00:00:00.000"));
}

#[test]
fn compare_date_range_needs_compile_compare() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let err = compiler
        .compile(&spec(json!({
            "measures": ["Orders.count"],
            "timeDimensions": [{
                "dimension": "Orders.createdAt",
                "compareDateRange": [["2020-01-01", "2020-01-07"]]
            }]
        })))
        .unwrap_err();
    assert!(matches!(err, CubePlanError::Validation(_)));
}

#[test]
fn empty_query_is_rejected() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let err = compiler.compile(&QuerySpec::default()).unwrap_err();
    assert!(matches!(err, CubePlanError::Validation(_)));
}

#[test]
fn unknown_member_is_a_user_error() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let err = compiler
        .compile(&spec(json!({"measures": ["Orders.missing"]})))
        .unwrap_err();
    assert!(err.is_user_error());
}

#[test]
fn unknown_granularity_is_rejected() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let err = compiler
        .compile(&spec(json!({
            "measures": ["Orders.count"],
            "timeDimensions": [{"dimension": "Orders.createdAt", "granularity": "fortnight"}]
        })))
        .unwrap_err();
    assert!(err.is_user_error());
}

// ============================================================================
// Relative ranges and timezones
// ============================================================================

#[test]
fn relative_range_in_a_named_timezone() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let compiled = compiler
        .compile(&spec(json!({
            "measures": ["Orders.count"],
            "timeDimensions": [{
                "dimension": "Orders.createdAt",
                "granularity": "day",
                "dateRange": "last 7 days"
            }],
            "timezone": "America/New_York"
        })))
        .unwrap();

    let converted = "(\"orders\".created_at::timestamptz AT TIME ZONE 'America/New_York')";
    let sql = &compiled.sql.0;
    assert!(sql.contains(&format!("date_trunc('day', {converted})")));
    assert!(sql.contains(&format!("{converted} >= $1::timestamp")));
    assert!(sql.contains(&format!("{converted} <= $2::timestamp")));
    assert!(!sql.contains("'UTC'"));
    assert_eq!(
        compiled.sql.1,
        vec![json!("2021-06-08T00:00:00.000"), json!("2021-06-14T23:59:59.999")]
    );
}

#[test]
fn unknown_timezone_is_rejected() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    let err = compiler
        .compile(&spec(json!({
            "measures": ["Orders.count"],
            "timeDimensions": [{
                "dimension": "Orders.createdAt",
                "granularity": "day",
                "dateRange": ["2020-01-01", "2020-01-31"]
            }],
            "timezone": "UTC'; DROP TABLE orders; --"
        })))
        .unwrap_err();
    assert!(matches!(err, CubePlanError::Validation(_)));
    assert!(err.to_string().contains("unknown timezone"));
}

#[test]
fn oversized_relative_range_is_rejected() {
    let registry = fixtures::registry();
    let compiler = QueryCompiler::new(&registry, &PostgresDialect).unwrap().with_now(now());
    for phrase in ["last 400000000 years", "last 99999999 days"] {
        let err = compiler
            .compile(&spec(json!({
                "measures": ["Orders.count"],
                "timeDimensions": [{
                    "dimension": "Orders.createdAt",
                    "dateRange": phrase
                }]
            })))
            .unwrap_err();
        assert!(matches!(err, CubePlanError::Validation(_)), "{phrase}: {err}");
    }
}
