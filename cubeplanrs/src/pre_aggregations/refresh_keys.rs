//! Invalidation probes and how often to re-run them.

use serde_json::Value;

use crate::error::{CubePlanError, Result};
use crate::models::{PreAggregationDefinition, RefreshKey};
use crate::params::ParamAllocator;
use crate::query_builder::CompileSession;
use crate::template;
use crate::time;

/// Seconds between probe runs outside an incremental key's update window.
pub const RENEWAL_THRESHOLD_OUTSIDE_UPDATE_WINDOW: u64 = 86_400;

const MAX_EVERY_RENEWAL_THRESHOLD: u64 = 300;

#[derive(Debug, Clone, Default)]
pub(crate) struct RefreshKeys {
    pub queries: Vec<(String, Vec<Value>)>,
    pub renewal_thresholds: Vec<u64>,
    pub update_window_seconds: Option<u64>,
    pub renewal_threshold_outside_update_window: Option<u64>,
}

/// Probes for one pre-aggregation: its own key, else the keys of the cubes
/// it reads, else a scan of its cube.
pub(crate) fn refresh_keys(
    session: CompileSession<'_>,
    cube: &str,
    definition: &PreAggregationDefinition,
    cubes: &[String],
    time_dimension: Option<&str>,
    partition_range: Option<&(String, String)>,
) -> Result<RefreshKeys> {
    let mut keys = RefreshKeys::default();

    if let Some(refresh_key) = &definition.refresh_key {
        if refresh_key.incremental && definition.partition_granularity.is_none() {
            return Err(CubePlanError::PreAggregation(format!(
                "incremental refresh key of a pre-aggregation in '{cube}' requires partitionGranularity"
            )));
        }
        if refresh_key.sql.is_some() || refresh_key.every.is_some() || refresh_key.incremental {
            let (sql, params, threshold) = key_query(session, cube, refresh_key, partition_range)?;
            keys.queries.push((sql, params));
            keys.renewal_thresholds.push(threshold);
            if refresh_key.incremental {
                keys.update_window_seconds = refresh_key
                    .update_window
                    .as_deref()
                    .map(time::parse_every_interval)
                    .transpose()?;
                keys.renewal_threshold_outside_update_window = Some(RENEWAL_THRESHOLD_OUTSIDE_UPDATE_WINDOW);
            }
            return Ok(keys);
        }
    }

    for name in cubes {
        if let Some(refresh_key) = &session.registry.cube(name)?.refresh_key {
            let (sql, params, threshold) = key_query(session, name, refresh_key, None)?;
            keys.queries.push((sql, params));
            keys.renewal_thresholds.push(threshold);
        }
    }
    if !keys.queries.is_empty() {
        return Ok(keys);
    }

    let query = super::cube_query(session, cube)?;
    let ctx = query.root_context();
    let probe = match time_dimension {
        Some(path) => {
            let (td_cube, td_name) = crate::registry::CubeRegistry::split_path(path)?;
            format!("max({})", query.render_member(td_cube, td_name, &ctx)?)
        }
        None => "count(*)".to_string(),
    };
    let sql = format!(
        "SELECT {probe} FROM {} AS {}",
        query.cube_sql(cube, &ctx)?,
        query.cube_alias(cube, &ctx)?
    );
    keys.queries.push(session.params.build_sql_and_params(&sql, session.dialect)?);
    keys.renewal_thresholds.push(session.config.pre_aggregations.default_renewal_threshold);
    Ok(keys)
}

/// One refresh key probe with its renewal threshold in seconds.
fn key_query(
    session: CompileSession<'_>,
    cube: &str,
    refresh_key: &RefreshKey,
    partition_range: Option<&(String, String)>,
) -> Result<(String, Vec<Value>, u64)> {
    let dialect = session.dialect;
    let key_sql = refresh_key
        .sql
        .as_deref()
        .map(|sql| render_key_sql(session, cube, sql))
        .transpose()?;
    let every = refresh_key
        .every
        .as_deref()
        .map(time::parse_every_interval)
        .transpose()?;

    let (expression, threshold) = match (&key_sql, every) {
        (Some(sql), Some(seconds)) => (format!("({sql})"), seconds),
        (Some(sql), None) => (
            format!("({sql})"),
            session.config.pre_aggregations.default_renewal_threshold,
        ),
        (None, every) => {
            let seconds = every.unwrap_or(3_600);
            (
                format!("FLOOR({} / {seconds})", dialect.unix_timestamp_sql()),
                every_renewal_threshold(seconds),
            )
        }
    };

    let params = ParamAllocator::new();
    let sql = match (refresh_key.incremental, partition_range) {
        (true, Some((_, end))) => {
            let mut partition_end = dialect.date_time_cast(&params.allocate_param(end.as_str()));
            if let Some(window) = &refresh_key.update_window {
                let interval = time::SqlInterval::parse(window)?;
                partition_end = dialect.add_interval(&partition_end, &interval)?;
            }
            format!(
                "SELECT CASE WHEN {} < {partition_end} THEN {expression} END",
                dialect.now_timestamp_sql()
            )
        }
        _ => match &key_sql {
            Some(sql) => sql.clone(),
            None => format!("SELECT {expression}"),
        },
    };
    let (sql, bound) = params.build_sql_and_params(&sql, dialect)?;
    Ok((sql, bound, threshold))
}

/// Key SQL with `{CUBE}` and member references resolved against `cube`.
fn render_key_sql(session: CompileSession<'_>, cube: &str, sql: &str) -> Result<String> {
    if !template::has_references(sql) {
        return Ok(sql.to_string());
    }
    let query = super::cube_query(session, cube)?;
    query.evaluate_template(cube, sql, &query.root_context())
}

/// A tenth of the interval, kept between one second and five minutes.
pub fn every_renewal_threshold(seconds: u64) -> u64 {
    (seconds / 10).clamp(1, MAX_EVERY_RENEWAL_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renewal_threshold_is_clamped() {
        assert_eq!(every_renewal_threshold(5), 1);
        assert_eq!(every_renewal_threshold(600), 60);
        assert_eq!(every_renewal_threshold(86_400), 300);
    }
}
