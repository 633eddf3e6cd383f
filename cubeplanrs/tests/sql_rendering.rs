//! Integration tests for SQL rendering and dialect fragments.

use cubeplan::dialect::{dialect_for, Dialect, DuckDbDialect};
use cubeplan::params::ParamAllocator;
use cubeplan::sql_ast::{Join, OrderItem, SelectItem, SelectQuery, SqlJoinType, SqlRenderer, TableRef};
use cubeplan::time::{Granularity, SqlInterval};
use serde_json::json;

#[test]
fn renders_joins_grouping_and_paging() {
    let dialect = DuckDbDialect;
    let query = SelectQuery {
        select: vec![
            SelectItem::aliased("\"orders\".status", "orders__status"),
            SelectItem::aliased("sum(\"line_items\".price)", "line_items__total_price"),
        ],
        from: TableRef::new("public.orders", "orders"),
        joins: vec![Join {
            join_type: SqlJoinType::Left,
            table: TableRef::new("public.line_items", "line_items"),
            on: vec!["\"orders\".id = \"line_items\".order_id".into()],
        }],
        group_by: vec!["1".into()],
        having: vec!["sum(\"line_items\".price) > ?".into()],
        order_by: vec![OrderItem {
            expr: "2".into(),
            desc: true,
        }],
        limit: Some(100),
        offset: Some(200),
        ..SelectQuery::default()
    };

    let sql = SqlRenderer::new(&dialect).render_select(&query);
    assert_eq!(
        sql,
        "SELECT \"orders\".status AS \"orders__status\", sum(\"line_items\".price) AS \"line_items__total_price\" \
         FROM public.orders AS \"orders\" \
         LEFT JOIN public.line_items AS \"line_items\" ON \"orders\".id = \"line_items\".order_id \
         GROUP BY 1 HAVING sum(\"line_items\".price) > ? ORDER BY 2 DESC LIMIT 100 OFFSET 200"
    );
}

#[test]
fn renders_distinct_subquery_sources() {
    let dialect = DuckDbDialect;
    let keys = SelectQuery {
        distinct: true,
        select: vec![SelectItem::aliased("\"orders\".id", "orders__id")],
        from: TableRef::new("public.orders", "orders"),
        ..SelectQuery::default()
    };
    let renderer = SqlRenderer::new(&dialect);
    let outer = SelectQuery {
        select: vec![SelectItem::aliased("count(*)", "n")],
        from: TableRef::subquery(&renderer.render_select(&keys), "keys"),
        ..SelectQuery::default()
    };
    assert_eq!(
        renderer.render_select(&outer),
        "SELECT count(*) AS \"n\" FROM (SELECT DISTINCT \"orders\".id AS \"orders__id\" FROM public.orders AS \"orders\") AS \"keys\""
    );
}

#[test]
fn looks_dialects_up_by_name() {
    assert_eq!(dialect_for("duckdb").unwrap().name(), "duckdb");
    #[cfg(feature = "postgres")]
    assert_eq!(dialect_for("postgres").unwrap().name(), "postgres");
    assert!(dialect_for("oracle").is_err());
}

#[test]
fn params_bind_in_text_order() {
    let params = ParamAllocator::new();
    let status = params.allocate_param("shipped");
    let from = params.allocate_param("2020-01-01T00:00:00.000");
    let annotated = format!("created_at >= {from} AND status = {status} AND status <> {status}");
    let (sql, values) = params.build_sql_and_params(&annotated, &DuckDbDialect).unwrap();

    assert_eq!(sql, "created_at >= ? AND status = ? AND status <> ?");
    assert_eq!(
        values,
        vec![json!("2020-01-01T00:00:00.000"), json!("shipped"), json!("shipped")]
    );
}

#[test]
fn date_series_is_an_inline_values_table() {
    let ranges = vec![
        ("2020-01-01T00:00:00.000".to_string(), "2020-01-01T23:59:59.999".to_string()),
        ("2020-01-02T00:00:00.000".to_string(), "2020-01-02T23:59:59.999".to_string()),
    ];
    assert_eq!(
        DuckDbDialect.series_sql(&ranges),
        "SELECT date_from::timestamp AS \"date_from\", date_to::timestamp AS \"date_to\" \
         FROM (VALUES ('2020-01-01T00:00:00.000', '2020-01-01T23:59:59.999'), \
         ('2020-01-02T00:00:00.000', '2020-01-02T23:59:59.999')) AS dates (date_from, date_to)"
    );
}

#[test]
fn interval_arithmetic() {
    let week = SqlInterval::parse("7 days").unwrap();
    assert_eq!(
        DuckDbDialect.subtract_interval("d", &week).unwrap(),
        "d + interval '-7 day'"
    );
    assert_eq!(
        DuckDbDialect.time_grouped_column(Granularity::Month, "d"),
        "date_trunc('month', d)"
    );
}

#[cfg(feature = "bigquery")]
mod bigquery {
    use cubeplan::dialect::{BigQueryDialect, Dialect};
    use cubeplan::time::{Granularity, SqlInterval};

    #[test]
    fn uses_named_params_and_datetime_functions() {
        let dialect = BigQueryDialect;
        assert_eq!(dialect.placeholder(0), "@p0");
        assert_eq!(dialect.quote_ident("orders"), "`orders`");
        assert_eq!(
            dialect.time_grouped_column(Granularity::Week, "d"),
            "DATETIME_TRUNC(d, WEEK(MONDAY))"
        );
        let interval = SqlInterval::parse("1 day").unwrap();
        assert_eq!(
            dialect.subtract_interval("d", &interval).unwrap(),
            "DATETIME_SUB(d, INTERVAL 1 DAY)"
        );
    }
}
