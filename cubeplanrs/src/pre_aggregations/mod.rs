//! Pre-aggregations: matching rollups to queries and describing how to
//! build, read and invalidate them.

pub mod canonical;
pub mod matcher;
mod refresh_keys;
mod rollup;

use inflector::Inflector;
use serde::Serialize;
use serde_json::Value;

use crate::error::{CubePlanError, Result};
use crate::models::PreAggregationType;
use crate::query_builder::{CompileSession, Query, QueryOptions};
use crate::request::QuerySpec;
use crate::time::Granularity;

pub use canonical::{CanonicalQuery, CanonicalTimeDimension};
pub use matcher::{matches, MatchedPreAggregation, Partition, RollupReferences};
pub use refresh_keys::{every_renewal_threshold, RENEWAL_THRESHOLD_OUTSIDE_UPDATE_WINDOW};

pub(crate) use matcher::find_pre_aggregation_for_query;
pub(crate) use rollup::rollup_query_sql;

/// SQL text with its positional params.
pub type SqlAndParams = (String, Vec<Value>);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionDescription {
    pub table_name: String,
    pub date_range: (String, String),
    pub load_sql: SqlAndParams,
    pub invalidate_key_queries: Vec<SqlAndParams>,
}

/// Everything an executor needs to build, refresh and read one pre-aggregation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreAggregationDescription {
    pub pre_aggregation_id: String,
    pub pre_aggregations_schema: String,
    pub table_name: String,
    #[serde(rename = "type")]
    pub pre_aggregation_type: PreAggregationType,
    pub external: bool,
    pub sql: SqlAndParams,
    pub load_sql: SqlAndParams,
    pub preview_sql: SqlAndParams,
    pub invalidate_key_queries: Vec<SqlAndParams>,
    pub refresh_key_renewal_thresholds: Vec<u64>,
    pub renewal_threshold_outside_update_window: Option<u64>,
    pub update_window_seconds: Option<u64>,
    pub granularity: Option<Granularity>,
    pub partition_granularity: Option<Granularity>,
    pub matched_time_dimension_date_range: Option<(String, String)>,
    pub partitions: Vec<PartitionDescription>,
    /// `min` and `max` probes over the time dimension.
    pub refresh_range_sql: Vec<SqlAndParams>,
}

/// `{schema}.{cube alias}_{name}` in snake case.
pub(crate) fn table_name(session: CompileSession<'_>, cube: &str, name: &str) -> Result<String> {
    let definition = session.registry.cube(cube)?;
    let base = definition.sql_alias.as_deref().unwrap_or(cube).to_snake_case();
    let table = format!("{base}_{}", name.to_snake_case());
    if table.len() > session.max_identifier_length {
        return Err(CubePlanError::Validation(format!(
            "pre-aggregation table name '{table}' exceeds the {} character identifier limit of {}",
            session.max_identifier_length,
            session.dialect.name()
        )));
    }
    Ok(format!("{}.{table}", session.config.pre_aggregations.schema))
}

/// Minimal query over one cube, for rendering its source and columns.
pub(crate) fn cube_query<'a>(session: CompileSession<'a>, cube: &str) -> Result<Query<'a>> {
    let definition = session.registry.cube(cube)?;
    let anchor = definition
        .primary_keys()
        .first()
        .map(|pk| pk.to_string())
        .or_else(|| definition.dimensions.keys().next().cloned())
        .ok_or_else(|| CubePlanError::Schema(format!("cube '{cube}' has no dimensions")))?;
    let spec = QuerySpec {
        dimensions: vec![format!("{cube}.{anchor}")],
        ..QuerySpec::default()
    };
    let options = QueryOptions {
        nested: true,
        disable_pre_aggregations: true,
        ..QueryOptions::default()
    };
    session.new_query(&spec, options)
}

/// A declared pre-aggregation as a match candidate without a query range.
pub(crate) fn declared(
    session: CompileSession<'_>,
    cube: &str,
    name: &str,
) -> Result<MatchedPreAggregation> {
    let definition = session
        .registry
        .pre_aggregations_for_cube(cube)?
        .get(name)
        .ok_or_else(|| CubePlanError::Schema(format!("pre-aggregation '{cube}.{name}' not found")))?
        .clone();
    let references = match definition.pre_aggregation_type {
        PreAggregationType::OriginalSql => RollupReferences {
            measures: Vec::new(),
            dimensions: Vec::new(),
            segments: Vec::new(),
            time_dimension: None,
        },
        _ => RollupReferences::resolve(session.registry, cube, &definition)?,
    };
    Ok(MatchedPreAggregation {
        cube: cube.to_string(),
        name: name.to_string(),
        pre_aggregation_type: definition.pre_aggregation_type,
        table_name: table_name(session, cube, name)?,
        definition,
        references,
        date_range: None,
        partitions: Vec::new(),
    })
}

pub(crate) fn describe(
    session: CompileSession<'_>,
    timezone: &str,
    target: &MatchedPreAggregation,
) -> Result<PreAggregationDescription> {
    let registry = session.registry;
    let definition = &target.definition;
    let cube = target.cube.as_str();

    if definition.use_original_sql_pre_aggregations {
        let declares_original = registry
            .pre_aggregations_for_cube(cube)?
            .values()
            .any(|p| p.pre_aggregation_type == PreAggregationType::OriginalSql);
        if !declares_original {
            return Err(CubePlanError::PreAggregation(format!(
                "'{}' uses original sql pre-aggregations but '{cube}' declares no originalSql pre-aggregation",
                target.id()
            )));
        }
    }

    let references = &target.references;
    let time_dimension = references.time_dimension.as_ref().map(|(path, _)| path.as_str());
    let mut cubes = vec![cube.to_string()];
    let members = references
        .measures
        .iter()
        .chain(&references.dimensions)
        .chain(&references.segments)
        .map(String::as_str)
        .chain(time_dimension);
    for path in members {
        let (member_cube, _) = crate::registry::CubeRegistry::split_path(path)?;
        if !cubes.iter().any(|c| c == member_cube) {
            cubes.push(member_cube.to_string());
        }
    }

    let load = |range: Option<&(String, String)>| {
        rollup::load_select_sql(
            session,
            cube,
            target.pre_aggregation_type,
            definition.use_original_sql_pre_aggregations,
            references,
            timezone,
            range,
        )
    };
    let create = |table: &str, (sql, params): &SqlAndParams| (format!("CREATE TABLE {table} AS {sql}"), params.clone());

    let sql = load(target.date_range.as_ref())?;
    let keys = refresh_keys::refresh_keys(
        session,
        cube,
        definition,
        &cubes,
        time_dimension,
        target.partitions.last().map(|p| &p.date_range),
    )?;

    let mut partitions = Vec::with_capacity(target.partitions.len());
    for partition in &target.partitions {
        let partition_sql = load(Some(&partition.date_range))?;
        let partition_keys = refresh_keys::refresh_keys(
            session,
            cube,
            definition,
            &cubes,
            time_dimension,
            Some(&partition.date_range),
        )?;
        partitions.push(PartitionDescription {
            table_name: partition.table_name.clone(),
            date_range: partition.date_range.clone(),
            load_sql: create(&partition.table_name, &partition_sql),
            invalidate_key_queries: partition_keys.queries,
        });
    }

    let mut refresh_range_sql = Vec::new();
    if let Some(path) = time_dimension {
        let (td_cube, td_name) = crate::registry::CubeRegistry::split_path(path)?;
        let query = cube_query(session, td_cube)?;
        let ctx = query.root_context();
        let column = query.render_member(td_cube, td_name, &ctx)?;
        let source = format!("{} AS {}", query.cube_sql(td_cube, &ctx)?, query.cube_alias(td_cube, &ctx)?);
        for function in ["min", "max"] {
            refresh_range_sql.push((format!("SELECT {function}({column}) FROM {source}"), Vec::new()));
        }
    }

    tracing::debug!(pre_aggregation = %target.id(), table = %target.table_name, "described pre-aggregation");
    Ok(PreAggregationDescription {
        pre_aggregation_id: target.id(),
        pre_aggregations_schema: session.config.pre_aggregations.schema.clone(),
        table_name: target.table_name.clone(),
        pre_aggregation_type: target.pre_aggregation_type,
        external: definition.external.unwrap_or(session.config.pre_aggregations.external),
        load_sql: create(&target.table_name, &sql),
        sql,
        preview_sql: (format!("SELECT * FROM {} LIMIT 1000", target.table_name), Vec::new()),
        invalidate_key_queries: keys.queries,
        refresh_key_renewal_thresholds: keys.renewal_thresholds,
        renewal_threshold_outside_update_window: keys.renewal_threshold_outside_update_window,
        update_window_seconds: keys.update_window_seconds,
        granularity: references.time_dimension.as_ref().map(|(_, g)| *g),
        partition_granularity: definition.partition_granularity,
        matched_time_dimension_date_range: target.date_range.clone(),
        partitions,
        refresh_range_sql,
    })
}
