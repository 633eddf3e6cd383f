//! One compilation unit: a resolved query plus the services it renders with.

use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::cache::CompilerCache;
use crate::config::CompilerConfig;
use crate::dialect::Dialect;
use crate::error::{CubePlanError, Result};
use crate::join_graph::{JoinGraph, JoinTree};
use crate::models::PreAggregationType;
use crate::params::ParamAllocator;
use crate::pre_aggregations;
use crate::registry::CubeRegistry;
use crate::request::QuerySpec;
use crate::time::{validate_timezone, Granularity};

use super::analysis::MemberWalker;
use super::context::RenderContext;
use super::filters::FilterNode;
use super::members::{DimensionMember, MeasureMember, SegmentMember, TimeDimensionMember};
use super::order::{self, OrderMember};

/// Everything a compilation borrows. Nested queries are built from a copy,
/// so they share the dialect, cache and param allocator of their parent.
#[derive(Clone, Copy)]
pub(crate) struct CompileSession<'a> {
    pub registry: &'a CubeRegistry,
    pub join_graph: &'a JoinGraph,
    pub dialect: &'a dyn Dialect,
    pub config: &'a CompilerConfig,
    pub cache: &'a CompilerCache,
    pub params: &'a ParamAllocator,
    pub now: NaiveDateTime,
    pub precision: usize,
    pub max_identifier_length: usize,
}

impl<'a> CompileSession<'a> {
    pub fn with_params(self, params: &'a ParamAllocator) -> Self {
        Self { params, ..self }
    }

    pub fn walker(&self) -> MemberWalker<'a> {
        MemberWalker::new(self.registry, self.cache)
    }

    /// Build a nested compilation sharing this session.
    pub fn new_query(self, spec: &QuerySpec, options: QueryOptions) -> Result<Query<'a>> {
        Query::new(self, spec, options)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct QueryOptions {
    /// Building a rollup table: sketches instead of counts, no default order.
    pub pre_aggregation_query: bool,
    pub disable_pre_aggregations: bool,
    /// Replace cube SQL with declared originalSql tables.
    pub original_sql_pre_aggregations: bool,
    pub cube_alias_prefix: Option<String>,
    pub expression_measures: Vec<MeasureMember>,
    /// Nested queries carry no default order or row limit.
    pub nested: bool,
}

impl QueryOptions {
    pub fn root() -> Self {
        Self {
            original_sql_pre_aggregations: true,
            ..Self::default()
        }
    }
}

pub(crate) struct Query<'a> {
    pub session: CompileSession<'a>,
    pub options: QueryOptions,
    /// Kept for nested queries that inherit its filters.
    pub spec: QuerySpec,
    pub timezone: String,
    pub measures: Vec<MeasureMember>,
    pub dimensions: Vec<DimensionMember>,
    pub time_dimensions: Vec<TimeDimensionMember>,
    pub segments: Vec<SegmentMember>,
    pub filters: Vec<FilterNode>,
    pub measure_filters: Vec<FilterNode>,
    pub order: Vec<OrderMember>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub ungrouped: bool,
    pub join: Option<JoinTree>,
    /// Cube name to the originalSql table standing in for its SQL.
    pub original_sql_tables: HashMap<String, String>,
}

impl<'a> Query<'a> {
    pub fn new(session: CompileSession<'a>, spec: &QuerySpec, options: QueryOptions) -> Result<Self> {
        let registry = session.registry;

        let mut measures = spec
            .measures
            .iter()
            .map(|path| MeasureMember::from_path(registry, path))
            .collect::<Result<Vec<_>>>()?;
        measures.extend(options.expression_measures.iter().cloned());

        let dimensions = spec
            .dimensions
            .iter()
            .map(|path| DimensionMember::from_path(registry, path, options.pre_aggregation_query))
            .collect::<Result<Vec<_>>>()?;

        let segments = spec
            .segments
            .iter()
            .map(|path| SegmentMember::from_path(registry, path))
            .collect::<Result<Vec<_>>>()?;

        let mut time_dimensions = Vec::new();
        for td in &spec.time_dimensions {
            if td.compare_date_range.is_some() {
                return Err(CubePlanError::Validation(format!(
                    "compareDateRange on '{}' must be compiled with compile_compare",
                    td.dimension
                )));
            }
            let granularity = td.granularity.as_deref().map(Granularity::parse).transpose()?;
            let date_range = td
                .date_range
                .as_ref()
                .map(|range| range.resolve(session.now, session.precision))
                .transpose()?;
            time_dimensions.push(TimeDimensionMember::new(
                registry,
                &td.dimension,
                granularity,
                date_range,
            )?);
        }

        let mut filters = Vec::new();
        let mut measure_filters = Vec::new();
        for spec_filter in &spec.filters {
            let node = FilterNode::from_spec(registry, spec_filter)?;
            if node.is_measure_filter()? {
                measure_filters.push(node);
            } else {
                filters.push(node);
            }
        }

        let limit = if options.pre_aggregation_query || options.nested {
            spec.limit
        } else {
            spec.limit.or(session.config.query.default_row_limit)
        };
        if let (Some(limit), Some(max)) = (limit, session.config.query.max_row_limit) {
            if limit > max && !options.nested {
                return Err(CubePlanError::Validation(format!(
                    "limit {limit} exceeds the maximum row limit of {max}"
                )));
            }
        }

        let timezone = spec
            .timezone
            .clone()
            .unwrap_or_else(|| session.config.query.timezone.clone());
        validate_timezone(&timezone)?;

        let mut query = Query {
            session,
            timezone,
            measures,
            dimensions,
            time_dimensions,
            segments,
            filters,
            measure_filters,
            order: Vec::new(),
            limit,
            offset: spec.offset,
            ungrouped: spec.ungrouped,
            join: None,
            original_sql_tables: HashMap::new(),
            spec: spec.clone(),
            options,
        };
        if query.measures.is_empty()
            && query.dimensions.is_empty()
            && query.grouped_time_dimensions().next().is_none()
        {
            return Err(CubePlanError::Validation(
                "query should contain at least one measure, dimension or time dimension with granularity"
                    .to_string(),
            ));
        }

        let cube_names = query.collect_cube_names()?;
        query.join = session.join_graph.build_join_cached(session.cache, &cube_names)?;
        query.check_single_data_source(&cube_names)?;
        if query.ungrouped {
            let allow = spec
                .allow_ungrouped_without_primary_key
                .unwrap_or(session.config.query.allow_ungrouped_without_primary_key);
            query.check_ungrouped(allow)?;
        }
        query.order = order::normalize(&query, &spec.order)?;
        query.original_sql_tables = query.resolve_original_sql_tables()?;
        Ok(query)
    }

    fn collect_cube_names(&self) -> Result<Vec<String>> {
        let walker = self.session.walker();
        let mut names: Vec<String> = Vec::new();
        let mut add = |found: Vec<String>| {
            for name in found {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        };
        for m in &self.measures {
            add(walker.measure_cube_names(m)?);
        }
        for d in &self.dimensions {
            add(walker.member_cube_names(&d.path)?);
        }
        for td in &self.time_dimensions {
            add(walker.member_cube_names(&td.path)?);
        }
        for s in &self.segments {
            add(walker.member_cube_names(&s.path)?);
        }
        for node in self.filters.iter().chain(&self.measure_filters) {
            for leaf in node.leaves() {
                add(walker.member_cube_names(&leaf.path)?);
            }
        }
        Ok(names)
    }

    fn check_single_data_source(&self, cube_names: &[String]) -> Result<()> {
        let mut first: Option<(&str, &str)> = None;
        for name in cube_names {
            let cube = self.session.registry.cube(name)?;
            match first {
                None => first = Some((name.as_str(), cube.data_source.as_str())),
                Some((other, source)) if source != cube.data_source => {
                    return Err(CubePlanError::Validation(format!(
                        "cubes '{other}' and '{name}' belong to different data sources \
                         ('{source}' and '{}') and can't be joined in one query",
                        cube.data_source
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn check_ungrouped(&self, allow_without_primary_key: bool) -> Result<()> {
        if !self.measure_filters.is_empty() {
            return Err(CubePlanError::Validation(
                "measure filters aren't allowed in an ungrouped query".to_string(),
            ));
        }
        if let Some(m) = self.measures.iter().find(|m| m.is_cumulative()) {
            return Err(CubePlanError::Validation(format!(
                "cumulative measure '{}' isn't allowed in an ungrouped query",
                m.path
            )));
        }
        if allow_without_primary_key {
            return Ok(());
        }
        let Some(join) = &self.join else {
            return Ok(());
        };
        let selected: Vec<&str> = self.dimensions.iter().map(|d| d.path.as_str()).collect();
        for cube in join.cubes() {
            let missing: Vec<String> = self
                .session
                .registry
                .primary_keys(cube)?
                .into_iter()
                .filter(|pk| !selected.contains(&pk.as_str()))
                .collect();
            if !missing.is_empty() {
                return Err(CubePlanError::Schema(format!(
                    "ungrouped query requires primary keys to be present in dimensions: {}. \
                     Pass allowUngroupedWithoutPrimaryKey to disable this check",
                    missing.join(", ")
                )));
            }
        }
        Ok(())
    }

    fn resolve_original_sql_tables(&self) -> Result<HashMap<String, String>> {
        let mut tables = HashMap::new();
        if !self.pre_aggregations_enabled() || !self.options.original_sql_pre_aggregations {
            return Ok(tables);
        }
        let Some(join) = &self.join else {
            return Ok(tables);
        };
        for cube in join.cubes() {
            let declared = self.session.registry.pre_aggregations_for_cube(cube)?;
            let original = declared
                .iter()
                .find(|(_, p)| p.pre_aggregation_type == PreAggregationType::OriginalSql);
            if let Some((name, _)) = original {
                let table = pre_aggregations::table_name(self.session, cube, name)?;
                tracing::debug!(cube, table = %table, "using originalSql pre-aggregation");
                tables.insert(cube.to_string(), table);
            }
        }
        Ok(tables)
    }

    pub fn pre_aggregations_enabled(&self) -> bool {
        self.session.config.pre_aggregations.enabled && !self.options.disable_pre_aggregations
    }

    pub fn root_context(&self) -> RenderContext {
        match &self.options.cube_alias_prefix {
            Some(prefix) => RenderContext::default().with_cube_alias_prefix(prefix.clone()),
            None => RenderContext::default(),
        }
    }

    /// Time dimensions that appear as output columns.
    pub fn grouped_time_dimensions(&self) -> impl Iterator<Item = &TimeDimensionMember> {
        self.time_dimensions.iter().filter(|td| td.granularity.is_some())
    }

    /// Multiplication flag of a cube in this query's join tree.
    pub fn multiplied(&self, cube: &str) -> Result<bool> {
        match &self.join {
            Some(join) => join.is_multiplied(cube),
            None => Err(CubePlanError::Internal(format!(
                "cube '{cube}' rendered by a query without a join tree"
            ))),
        }
    }

    /// Measure filter measures that are not also selected.
    pub fn measure_filter_members(&self) -> Result<Vec<MeasureMember>> {
        let mut extra: Vec<MeasureMember> = Vec::new();
        for node in &self.measure_filters {
            for leaf in node.leaves() {
                let selected = self.measures.iter().any(|m| m.path == leaf.path);
                if !selected && !extra.iter().any(|m| m.path == leaf.path) {
                    extra.push(MeasureMember::from_path(self.session.registry, &leaf.path)?);
                }
            }
        }
        Ok(extra)
    }
}
