//! Integration tests for loading cube definitions from YAML.

use std::fs;

use cubeplan::dialect::DuckDbDialect;
use cubeplan::models::{JoinRelationship, PreAggregationType};
use cubeplan::registry::{CubeRegistry, MemberKind};
use cubeplan::time::Granularity;
use cubeplan::{CubePlanError, QueryCompiler, QuerySpec};
use serde_json::json;

const ORDERS_YAML: &str = r#"
cubes:
  - name: Orders
    sql_table: public.orders
    refresh_key:
      every: 10 minute
    joins:
      Users:
        relationship: belongs_to
        sql: "{CUBE}.user_id = {Users.id}"
    dimensions:
      id:
        sql: id
        type: number
        primary_key: true
      status:
        sql: status
        type: string
      createdAt:
        sql: created_at
        type: time
    measures:
      count:
        type: count
      revenue:
        sql: amount
        type: sum
        filters:
          - sql: "{CUBE}.status = 'completed'"
    pre_aggregations:
      byStatus:
        type: rollup
        measures: [count, revenue]
        dimensions: [status]
        time_dimension: createdAt
        granularity: day
      source:
        type: originalSql
"#;

const USERS_YAML: &str = r#"
cubes:
  - name: Users
    sql: SELECT * FROM public.users
    dimensions:
      id:
        sql: id
        type: number
        primary_key: true
      city:
        sql: city
        type: string
"#;

fn model_dir(files: &[(&str, &str)]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, contents) in files {
        fs::write(dir.path().join(name), contents).unwrap();
    }
    dir
}

#[test]
fn loads_cubes_from_yaml_files() {
    let dir = model_dir(&[("orders.yml", ORDERS_YAML), ("users.yaml", USERS_YAML)]);
    let registry = CubeRegistry::load_from_dir(dir.path()).unwrap();

    let orders = registry.cube("Orders").unwrap();
    assert_eq!(orders.sql_table.as_deref(), Some("public.orders"));
    assert_eq!(orders.joins["Users"].relationship, JoinRelationship::BelongsTo);
    assert_eq!(registry.primary_keys("Orders").unwrap(), vec!["Orders.id"]);
    assert_eq!(registry.member_kind("Orders.revenue").unwrap(), MemberKind::Measure);
    assert_eq!(registry.member_kind("Users.city").unwrap(), MemberKind::Dimension);

    let pre_aggregations = registry.pre_aggregations_for_cube("Orders").unwrap();
    assert_eq!(pre_aggregations["byStatus"].granularity, Some(Granularity::Day));
    assert_eq!(pre_aggregations["source"].pre_aggregation_type, PreAggregationType::OriginalSql);
}

#[test]
fn normalizes_pre_aggregation_members() {
    let dir = model_dir(&[("orders.yml", ORDERS_YAML), ("users.yml", USERS_YAML)]);
    let registry = CubeRegistry::load_from_dir(dir.path()).unwrap();
    assert_eq!(registry.normalize_member("Orders", "count").unwrap(), "Orders.count");
    assert_eq!(registry.normalize_member("Orders", "CUBE.status").unwrap(), "Orders.status");
    assert_eq!(registry.normalize_member("Orders", "Users.city").unwrap(), "Users.city");
    assert!(registry.normalize_member("Orders", "Users").is_err());
}

#[test]
fn select_star_cube_sql_is_used_as_a_table() {
    let dir = model_dir(&[("orders.yml", ORDERS_YAML), ("users.yml", USERS_YAML)]);
    let registry = CubeRegistry::load_from_dir(dir.path()).unwrap();
    let compiler = QueryCompiler::new(&registry, &DuckDbDialect).unwrap();
    let spec: QuerySpec = serde_json::from_value(json!({"dimensions": ["Users.city"]})).unwrap();
    let compiled = compiler.compile(&spec).unwrap();
    assert_eq!(
        compiled.sql.0,
        "SELECT \"users\".city AS \"users__city\" FROM public.users AS \"users\" GROUP BY 1 ORDER BY 1 ASC"
    );
}

#[test]
fn original_sql_pre_aggregation_replaces_the_cube_source() {
    let dir = model_dir(&[("orders.yml", ORDERS_YAML), ("users.yml", USERS_YAML)]);
    let registry = CubeRegistry::load_from_dir(dir.path()).unwrap();
    let compiler = QueryCompiler::new(&registry, &DuckDbDialect).unwrap();
    let spec: QuerySpec =
        serde_json::from_value(json!({"measures": ["Orders.count"], "dimensions": ["Users.city"]})).unwrap();
    let compiled = compiler.compile(&spec).unwrap();

    assert!(compiled.used_pre_aggregation.is_none());
    assert!(compiled
        .sql
        .0
        .contains("FROM stb_pre_aggregations.orders_source AS \"orders\""));
    let description = &compiled.pre_aggregations[0];
    assert_eq!(description.pre_aggregation_type, PreAggregationType::OriginalSql);
    assert_eq!(
        description.load_sql.0,
        "CREATE TABLE stb_pre_aggregations.orders_source AS SELECT * FROM public.orders AS \"orders\""
    );
    assert_eq!(description.refresh_key_renewal_thresholds, vec![60]);
}

#[test]
fn unknown_pre_aggregation_type_is_rejected() {
    let yaml = r#"
cubes:
  - name: Orders
    sql_table: public.orders
    dimensions:
      id:
        sql: id
        type: number
        primary_key: true
    measures:
      count:
        type: count
    pre_aggregations:
      main:
        type: materialized
        measures: [count]
"#;
    let dir = model_dir(&[("orders.yml", yaml)]);
    let err = CubeRegistry::load_from_dir(dir.path()).unwrap_err();
    assert!(matches!(err, CubePlanError::Yaml(_)));
    assert!(err.to_string().contains("unknown pre-aggregation type 'materialized'"));
}

#[test]
fn pre_aggregation_member_kinds_are_checked() {
    let yaml = ORDERS_YAML.replace("dimensions: [status]", "dimensions: [count]");
    let dir = model_dir(&[("orders.yml", &yaml), ("users.yml", USERS_YAML)]);
    let err = CubeRegistry::load_from_dir(dir.path()).unwrap_err();
    assert!(matches!(err, CubePlanError::Schema(_)));
}

#[test]
fn unknown_join_target_is_rejected() {
    let dir = model_dir(&[("orders.yml", ORDERS_YAML)]);
    let err = CubeRegistry::load_from_dir(dir.path()).unwrap_err();
    assert!(err.to_string().contains("joins unknown cube 'Users'"));
}

#[test]
fn duplicate_cubes_are_rejected() {
    let dir = model_dir(&[("a.yml", USERS_YAML), ("b.yml", USERS_YAML)]);
    let err = CubeRegistry::load_from_dir(dir.path()).unwrap_err();
    assert!(matches!(err, CubePlanError::Schema(_)));
}

#[test]
fn missing_model_directory() {
    let err = CubeRegistry::load_from_dir("/definitely/not/here").unwrap_err();
    assert!(err.is_user_error());
}
