//! Query compilation: resolve a `QuerySpec` against the cube registry and
//! render it as dialect SQL with positional params.

use std::sync::Arc;

use chrono::{NaiveDateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::cache::CompilerCache;
use crate::config::CompilerConfig;
use crate::dialect::Dialect;
use crate::error::Result;
use crate::join_graph::JoinGraph;
use crate::models::PreAggregationType;
use crate::params::ParamAllocator;
use crate::pre_aggregations::{self, CanonicalQuery, MatchedPreAggregation, PreAggregationDescription, SqlAndParams};
use crate::registry::CubeRegistry;
use crate::request::{OrderSpec, QuerySpec};

mod analysis;
mod context;
mod cumulative;
mod evaluator;
mod filters;
mod joins;
mod members;
mod order;
mod planner;
mod query;

pub use order::OrderMember;

pub(crate) use members::MeasureMember;
pub(crate) use query::{CompileSession, Query, QueryOptions};

/// Output of one compilation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledQuery {
    pub sql: SqlAndParams,
    /// Column alias to the member it holds; time dimensions as `Cube.member.granularity`.
    pub alias_name_to_member: IndexMap<String, String>,
    pub order: Vec<OrderMember>,
    pub total_sql: Option<SqlAndParams>,
    /// Pre-aggregations the SQL reads from.
    pub pre_aggregations: Vec<PreAggregationDescription>,
    pub used_pre_aggregation: Option<String>,
    /// The range this output answers, for `compile_compare`.
    pub compare_date_range: Option<(String, String)>,
}

/// Compiles queries for one registry and dialect.
///
/// The compiler holds no per-query state; concurrent compiles may share it
/// and its cache.
pub struct QueryCompiler<'a> {
    registry: &'a CubeRegistry,
    dialect: &'a dyn Dialect,
    join_graph: JoinGraph,
    config: CompilerConfig,
    cache: Arc<CompilerCache>,
    now: Option<NaiveDateTime>,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(registry: &'a CubeRegistry, dialect: &'a dyn Dialect) -> Result<Self> {
        let config = CompilerConfig::default();
        Ok(Self {
            registry,
            dialect,
            join_graph: JoinGraph::new(registry)?,
            cache: Arc::new(CompilerCache::with_config(&config.cache)),
            config,
            now: None,
        })
    }

    /// Replace the configuration. Resets the cache to the configured limits.
    pub fn with_config(mut self, config: CompilerConfig) -> Self {
        self.cache = Arc::new(CompilerCache::with_config(&config.cache));
        self.config = config;
        self
    }

    /// Share a cache with other compilers over the same registry.
    pub fn with_cache(mut self, cache: Arc<CompilerCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Fix the instant relative date ranges are resolved against.
    pub fn with_now(mut self, now: NaiveDateTime) -> Self {
        self.now = Some(now);
        self
    }

    pub fn cache(&self) -> &CompilerCache {
        &self.cache
    }

    fn session<'s>(&'s self, params: &'s ParamAllocator) -> CompileSession<'s> {
        let overrides = self.config.for_dialect(self.dialect.name());
        CompileSession {
            registry: self.registry,
            join_graph: &self.join_graph,
            dialect: self.dialect,
            config: &self.config,
            cache: &self.cache,
            params,
            now: self.now.unwrap_or_else(|| Utc::now().naive_utc()),
            precision: overrides
                .timestamp_precision
                .unwrap_or_else(|| self.dialect.timestamp_precision()),
            max_identifier_length: overrides
                .max_identifier_length
                .unwrap_or_else(|| self.dialect.max_identifier_length()),
        }
    }

    pub fn compile(&self, spec: &QuerySpec) -> Result<CompiledQuery> {
        let params = ParamAllocator::new();
        self.compile_in(self.session(&params), spec)
    }

    fn compile_in(&self, session: CompileSession<'_>, spec: &QuerySpec) -> Result<CompiledQuery> {
        let params = session.params;
        let query = Query::new(session, spec, QueryOptions::root())?;
        tracing::debug!(
            measures = query.measures.len(),
            dimensions = query.dimensions.len(),
            time_dimensions = query.time_dimensions.len(),
            dialect = self.dialect.name(),
            "compiling query"
        );

        let matched = pre_aggregations::find_pre_aggregation_for_query(&query)?;
        let annotated = annotated_sql(&query, matched.as_ref())?;

        let total_sql = if spec.total {
            let total_spec = QuerySpec {
                limit: None,
                offset: None,
                order: OrderSpec::default(),
                total: false,
                ..spec.clone()
            };
            let options = QueryOptions {
                nested: true,
                ..QueryOptions::root()
            };
            let total_query = Query::new(session, &total_spec, options)?;
            let inner = annotated_sql(&total_query, matched.as_ref())?;
            Some(params.build_sql_and_params(&query.total_sql(&inner), self.dialect)?)
        } else {
            None
        };

        let descriptions = self.used_pre_aggregations(session, &query, matched.as_ref())?;

        Ok(CompiledQuery {
            sql: params.build_sql_and_params(&annotated, self.dialect)?,
            alias_name_to_member: alias_name_to_member(&query)?,
            order: query.order.clone(),
            total_sql,
            pre_aggregations: descriptions,
            used_pre_aggregation: matched.as_ref().map(MatchedPreAggregation::id),
            compare_date_range: None,
        })
    }

    /// One compiled query per `compareDateRange` entry, each tagged with its range.
    pub fn compile_compare(&self, spec: &QuerySpec) -> Result<Vec<CompiledQuery>> {
        let compared = spec
            .time_dimensions
            .iter()
            .enumerate()
            .find_map(|(i, td)| td.compare_date_range.as_ref().map(|ranges| (i, ranges)));
        let Some((index, ranges)) = compared else {
            return Ok(vec![self.compile(spec)?]);
        };

        let mut compiled = Vec::with_capacity(ranges.len());
        for range in ranges {
            let mut single = spec.clone();
            single.time_dimensions[index].date_range = Some(range.clone());
            single.time_dimensions[index].compare_date_range = None;
            let params = ParamAllocator::new();
            let session = self.session(&params);
            let mut output = self.compile_in(session, &single)?;
            output.compare_date_range = Some(range.resolve(session.now, session.precision)?);
            compiled.push(output);
        }
        Ok(compiled)
    }

    /// Canonical form the rollup matcher compares for `spec`.
    pub fn canonical_query(&self, spec: &QuerySpec) -> Result<CanonicalQuery> {
        let params = ParamAllocator::new();
        let query = Query::new(self.session(&params), spec, QueryOptions::root())?;
        CanonicalQuery::from_query(&query)
    }

    /// Descriptions of every declared pre-aggregation, for a refresh scheduler.
    /// autoRollups depend on the queries they answer and are skipped.
    pub fn pre_aggregation_descriptions(&self) -> Result<Vec<PreAggregationDescription>> {
        let mut descriptions = Vec::new();
        for cube in self.registry.cubes() {
            for (name, definition) in &cube.pre_aggregations {
                if definition.pre_aggregation_type == PreAggregationType::AutoRollup {
                    continue;
                }
                let params = ParamAllocator::new();
                let session = self.session(&params);
                let target = pre_aggregations::declared(session, &cube.name, name)?;
                descriptions.push(pre_aggregations::describe(
                    session,
                    &self.config.query.timezone,
                    &target,
                )?);
            }
        }
        Ok(descriptions)
    }

    /// The matched rollup, plus the originalSql tables the SQL reads from.
    fn used_pre_aggregations(
        &self,
        session: CompileSession<'_>,
        query: &Query<'_>,
        matched: Option<&MatchedPreAggregation>,
    ) -> Result<Vec<PreAggregationDescription>> {
        let mut descriptions = Vec::new();
        let original_cubes: Vec<String> = match matched {
            Some(m) => {
                descriptions.push(pre_aggregations::describe(session, &query.timezone, m)?);
                if m.definition.use_original_sql_pre_aggregations {
                    vec![m.cube.clone()]
                } else {
                    Vec::new()
                }
            }
            None => match &query.join {
                Some(join) => join
                    .cubes()
                    .into_iter()
                    .filter(|cube| query.original_sql_tables.contains_key(*cube))
                    .map(str::to_string)
                    .collect(),
                None => Vec::new(),
            },
        };
        for cube in original_cubes {
            let declared = self.registry.pre_aggregations_for_cube(&cube)?;
            let original = declared
                .iter()
                .find(|(_, p)| p.pre_aggregation_type == PreAggregationType::OriginalSql);
            if let Some((name, _)) = original {
                let target = pre_aggregations::declared(session, &cube, name)?;
                descriptions.push(pre_aggregations::describe(session, &query.timezone, &target)?);
            }
        }
        Ok(descriptions)
    }
}

fn annotated_sql(query: &Query<'_>, matched: Option<&MatchedPreAggregation>) -> Result<String> {
    match matched {
        Some(m) => pre_aggregations::rollup_query_sql(query, m),
        None => query.build_sql(),
    }
}

fn alias_name_to_member(query: &Query<'_>) -> Result<IndexMap<String, String>> {
    let mut aliases = IndexMap::new();
    for dimension in &query.dimensions {
        aliases.insert(query.alias_name(&dimension.path)?, dimension.path.clone());
    }
    for td in query.grouped_time_dimensions() {
        aliases.insert(query.time_dimension_alias(td)?, td.expression_path());
    }
    for measure in &query.measures {
        aliases.insert(query.alias_name(&measure.path)?, measure.path.clone());
    }
    Ok(aliases)
}
