//! Choosing the rollup that answers a query.

use inflector::Inflector;

use crate::cache::CompilerCache;
use crate::error::{CubePlanError, Result};
use crate::models::{PreAggregationDefinition, PreAggregationType};
use crate::query_builder::Query;
use crate::registry::CubeRegistry;
use crate::time::{self, Granularity};

use super::canonical::CanonicalQuery;
use super::table_name;

/// Full member paths stored by a rollup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupReferences {
    pub measures: Vec<String>,
    pub dimensions: Vec<String>,
    pub segments: Vec<String>,
    pub time_dimension: Option<(String, Granularity)>,
}

impl RollupReferences {
    pub fn resolve(registry: &CubeRegistry, cube: &str, definition: &PreAggregationDefinition) -> Result<Self> {
        let resolve_all = |members: &[String]| {
            members
                .iter()
                .map(|m| registry.normalize_member(cube, m))
                .collect::<Result<Vec<_>>>()
        };
        let time_dimension = match (&definition.time_dimension, definition.granularity) {
            (Some(td), Some(g)) => Some((registry.normalize_member(cube, td)?, g)),
            (Some(td), None) => {
                return Err(CubePlanError::PreAggregation(format!(
                    "time dimension '{td}' of a pre-aggregation in '{cube}' needs a granularity"
                )))
            }
            (None, _) => None,
        };
        Ok(Self {
            measures: resolve_all(&definition.measures)?,
            dimensions: resolve_all(&definition.dimensions)?,
            segments: resolve_all(&definition.segments)?,
            time_dimension,
        })
    }

    /// Dimensions and segments, which a rollup stores the same way.
    fn grouping_columns(&self) -> Vec<&String> {
        let mut columns: Vec<&String> = self.dimensions.iter().chain(&self.segments).collect();
        columns.sort();
        columns.dedup();
        columns
    }
}

/// One physical slice of a partitioned rollup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub table_name: String,
    pub date_range: (String, String),
}

#[derive(Debug, Clone)]
pub struct MatchedPreAggregation {
    pub cube: String,
    pub name: String,
    pub pre_aggregation_type: PreAggregationType,
    /// Declared definition, or the one synthesized for an autoRollup.
    pub definition: PreAggregationDefinition,
    pub references: RollupReferences,
    pub table_name: String,
    /// Range of the query's time dimension the rollup was matched on.
    pub date_range: Option<(String, String)>,
    pub partitions: Vec<Partition>,
}

impl MatchedPreAggregation {
    pub fn id(&self) -> String {
        format!("{}.{}", self.cube, self.name)
    }
}

/// First rollup, in join order then declaration order, that answers `query`.
pub(crate) fn find_pre_aggregation_for_query(query: &Query<'_>) -> Result<Option<MatchedPreAggregation>> {
    if !query.pre_aggregations_enabled() || query.options.pre_aggregation_query || query.ungrouped {
        return Ok(None);
    }
    let Some(join) = &query.join else {
        return Ok(None);
    };
    let canonical = CanonicalQuery::from_query(query)?;
    if canonical.has_cumulative_measures {
        tracing::debug!("cumulative measures are computed from raw tables");
        return Ok(None);
    }

    let registry = query.session.registry;
    for cube in join.cubes() {
        for (name, definition) in registry.pre_aggregations_for_cube(cube)? {
            let (references, table) = match definition.pre_aggregation_type {
                PreAggregationType::OriginalSql => continue,
                PreAggregationType::Rollup => (
                    RollupReferences::resolve(registry, cube, definition)?,
                    table_name(query.session, cube, name)?,
                ),
                PreAggregationType::AutoRollup => match auto_rollup_references(registry, &canonical, cube)? {
                    Some(references) => {
                        let table = auto_rollup_table_name(query, cube, name, &references)?;
                        (references, table)
                    }
                    None => {
                        tracing::debug!(cube, pre_aggregation = %name, "autoRollup does not cover the query");
                        continue;
                    }
                },
            };
            if !matches(&canonical, &references) {
                tracing::debug!(cube, pre_aggregation = %name, "pre-aggregation rejected");
                continue;
            }

            let date_range = references.time_dimension.as_ref().and_then(|(path, _)| {
                query
                    .time_dimensions
                    .iter()
                    .find(|td| &td.path == path)
                    .and_then(|td| td.date_range.clone())
            });
            let partitions = match definition.partition_granularity {
                Some(partition_granularity) if references.time_dimension.is_some() => {
                    let Some((from, to)) = &date_range else {
                        tracing::debug!(
                            cube,
                            pre_aggregation = %name,
                            "partitioned pre-aggregation needs a date range"
                        );
                        continue;
                    };
                    partitions_for(query, &table, partition_granularity, from, to)?
                }
                _ => Vec::new(),
            };

            let mut definition = definition.clone();
            if definition.pre_aggregation_type == PreAggregationType::AutoRollup {
                definition.measures = references.measures.clone();
                definition.dimensions = references.dimensions.clone();
                definition.segments = references.segments.clone();
                definition.time_dimension = references.time_dimension.as_ref().map(|(p, _)| p.clone());
                definition.granularity = references.time_dimension.as_ref().map(|(_, g)| *g);
            }
            tracing::info!(cube, pre_aggregation = %name, table = %table, "using pre-aggregation");
            return Ok(Some(MatchedPreAggregation {
                cube: cube.to_string(),
                name: name.clone(),
                pre_aggregation_type: definition.pre_aggregation_type,
                definition,
                references,
                table_name: table,
                date_range,
                partitions,
            }));
        }
    }
    Ok(None)
}

pub(crate) fn partitions_for(
    query: &Query<'_>,
    table: &str,
    granularity: Granularity,
    from: &str,
    to: &str,
) -> Result<Vec<Partition>> {
    let precision = query.session.precision;
    let buckets = time::time_series(
        granularity,
        from,
        to,
        precision,
        query.session.config.query.max_time_series_buckets,
    )?;
    buckets
        .into_iter()
        .map(|(start, end)| {
            let suffix = time::partition_suffix(time::parse_date_time(&start)?, granularity);
            Ok(Partition {
                table_name: format!("{table}{suffix}"),
                date_range: (start, end),
            })
        })
        .collect()
}

/// Whether a rollup storing `rollup` reproduces the query exactly.
pub fn matches(query: &CanonicalQuery, rollup: &RollupReferences) -> bool {
    if query.ungrouped || query.has_cumulative_measures {
        return false;
    }
    let columns = rollup.grouping_columns();
    let covers = |paths: &[String]| paths.iter().all(|p| rollup.measures.contains(p));
    let measures_covered = covers(&query.measures) || covers(&query.leaf_measures);

    let dimensions_covered = query
        .sorted_dimensions
        .iter()
        .chain(&query.filter_dimensions)
        .all(|d| columns.contains(&d));
    let exact_dimensions = columns.len() == query.sorted_dimensions.len()
        && query.sorted_dimensions.iter().zip(&columns).all(|(a, b)| a == *b)
        && query.all_filters_within_selected_dimensions;

    if query.has_multiplied_measures && !exact_dimensions {
        return false;
    }

    // Additive
    if query.is_additive && dimensions_covered && time_dimensions_match(query, rollup, false) && measures_covered {
        return true;
    }
    // Leaf additive
    if query.leaf_measure_additive
        && !query.has_multiplied_measures
        && dimensions_covered
        && time_dimensions_match(query, rollup, false)
        && covers(&query.leaf_measures)
    {
        return true;
    }
    // Non-additive
    exact_dimensions
        && query.has_no_time_dimensions_without_granularity
        && time_dimensions_match(query, rollup, true)
        && measures_covered
}

fn time_dimensions_match(query: &CanonicalQuery, rollup: &RollupReferences, exact: bool) -> bool {
    let Some((path, rollup_granularity)) = &rollup.time_dimension else {
        return query.sorted_time_dimensions.is_empty();
    };
    if exact && query.sorted_time_dimensions.is_empty() {
        return false;
    }
    query.sorted_time_dimensions.iter().all(|td| {
        if &td.dimension != path {
            return false;
        }
        match td.granularity {
            Some(g) if exact => {
                g == *rollup_granularity && td.range_granularity.map_or(true, |range| g.divides(range))
            }
            Some(_) => td.expected_granularity() == Some(*rollup_granularity),
            None => td
                .range_granularity
                .map_or(false, |range| rollup_granularity.divides(range)),
        }
    })
}

/// The rollup an autoRollup would need for `query`, when every member is on `cube`.
fn auto_rollup_references(
    registry: &CubeRegistry,
    query: &CanonicalQuery,
    cube: &str,
) -> Result<Option<RollupReferences>> {
    if !query.is_additive || query.has_multiplied_measures || query.sorted_time_dimensions.len() > 1 {
        return Ok(None);
    }
    let on_cube = |path: &String| CubeRegistry::split_path(path).map(|(c, _)| c == cube).unwrap_or(false);
    let all_on_cube = query
        .sorted_dimensions
        .iter()
        .chain(&query.filter_dimensions)
        .chain(&query.measures)
        .chain(query.sorted_time_dimensions.iter().map(|td| &td.dimension))
        .all(on_cube);
    if !all_on_cube {
        return Ok(None);
    }

    let mut dimensions = Vec::new();
    let mut segments = Vec::new();
    for path in query.sorted_dimensions.iter().chain(&query.filter_dimensions) {
        if registry.segment(path).is_ok() {
            segments.push(path.clone());
        } else {
            dimensions.push(path.clone());
        }
    }
    let time_dimension = match query.sorted_time_dimensions.first() {
        Some(td) => match td.expected_granularity() {
            Some(g) => Some((td.dimension.clone(), g)),
            None => return Ok(None),
        },
        None => None,
    };
    Ok(Some(RollupReferences {
        measures: query.measures.clone(),
        dimensions,
        segments,
        time_dimension,
    }))
}

/// `{table}_{signature}`, stable for the same set of members.
fn auto_rollup_table_name(
    query: &Query<'_>,
    cube: &str,
    name: &str,
    references: &RollupReferences,
) -> Result<String> {
    let granularity = references
        .time_dimension
        .as_ref()
        .map(|(path, g)| format!("{path}.{g}"))
        .unwrap_or_default();
    let mut parts: Vec<&str> = Vec::new();
    parts.extend(references.measures.iter().map(String::as_str));
    parts.extend(references.dimensions.iter().map(String::as_str));
    parts.extend(references.segments.iter().map(String::as_str));
    parts.push(&granularity);
    let signature = CompilerCache::signature(&parts);
    Ok(format!(
        "{}_{}",
        table_name(query.session, cube, &name.to_snake_case())?,
        &signature[..8]
    ))
}
