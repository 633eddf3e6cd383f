//! FROM clause: the join tree plus nested subquery dimension joins.

use crate::error::{CubePlanError, Result};
use crate::request::{FilterSpec, QuerySpec, TimeDimensionSpec};
use crate::sql_ast::{Join, SqlJoinType, TableRef};

use super::context::RenderContext;
use super::filters::FilterNode;
use super::members::MeasureMember;
use super::query::{Query, QueryOptions};

impl<'a> Query<'a> {
    /// Root cube and its LEFT JOINs. Subquery dimension joins follow the
    /// cube that owns them.
    pub(crate) fn join_query(
        &self,
        ctx: &RenderContext,
        subquery_dimensions: &[String],
    ) -> Result<(TableRef, Vec<Join>)> {
        let join = self.join.as_ref().ok_or_else(|| {
            CubePlanError::Internal("query without members has no FROM clause".to_string())
        })?;

        let from = TableRef::new(
            self.cube_sql(&join.root, ctx)?,
            self.cube_alias_name(&join.root, ctx)?,
        );
        let mut joins = self.subquery_joins(&join.root, subquery_dimensions, ctx)?;

        for edge in &join.joins {
            joins.push(Join {
                join_type: SqlJoinType::Left,
                table: TableRef::new(
                    self.cube_sql(&edge.original_to, ctx)?,
                    self.cube_alias_name(&edge.original_to, ctx)?,
                ),
                on: vec![self.evaluate_template(&edge.original_from, &edge.join.sql, ctx)?],
            });
            joins.extend(self.subquery_joins(&edge.original_to, subquery_dimensions, ctx)?);
        }
        Ok((from, joins))
    }

    /// Subquery dimensions reachable from every selected and filtered member.
    pub(crate) fn subquery_dimensions(&self) -> Result<Vec<String>> {
        let walker = self.session.walker();
        let mut found: Vec<String> = Vec::new();
        let mut add = |paths: Vec<String>| {
            for path in paths {
                if !found.contains(&path) {
                    found.push(path);
                }
            }
        };
        for m in &self.measures {
            add(walker.measure_subquery_dimensions(m)?);
        }
        for m in self.measure_filter_members()? {
            add(walker.measure_subquery_dimensions(&m)?);
        }
        for d in &self.dimensions {
            add(walker.member_subquery_dimensions(&d.path)?);
        }
        for td in &self.time_dimensions {
            add(walker.member_subquery_dimensions(&td.path)?);
        }
        for s in &self.segments {
            add(walker.member_subquery_dimensions(&s.path)?);
        }
        for node in &self.filters {
            for leaf in node.leaves() {
                add(walker.member_subquery_dimensions(&leaf.path)?);
            }
        }
        Ok(found)
    }

    fn subquery_joins(&self, cube: &str, paths: &[String], ctx: &RenderContext) -> Result<Vec<Join>> {
        paths
            .iter()
            .filter(|path| path.split('.').next() == Some(cube))
            .map(|path| self.subquery_join(path, ctx))
            .collect()
    }

    /// `LEFT JOIN (nested) AS alias ON alias.pk = pk` for one subquery dimension.
    pub(crate) fn subquery_join(&self, path: &str, ctx: &RenderContext) -> Result<Join> {
        let registry = self.session.registry;
        let dialect = self.session.dialect;
        let definition = registry.dimension(path)?;
        let (cube, name) = crate::registry::CubeRegistry::split_path(path)?;
        let primary_keys = registry.primary_keys(cube)?;
        if primary_keys.is_empty() {
            return Err(CubePlanError::Schema(format!(
                "sub query dimension '{path}' requires a primary key on '{cube}'"
            )));
        }

        let mut spec = QuerySpec {
            dimensions: primary_keys.clone(),
            ..QuerySpec::default()
        };
        if definition.propagate_filters_to_sub_query {
            spec.filters = self.propagated_filters()?;
            spec.segments = self.spec.segments.clone();
            spec.time_dimensions = self
                .spec
                .time_dimensions
                .iter()
                .filter(|td| td.date_range.is_some())
                .map(|td| TimeDimensionSpec {
                    granularity: None,
                    compare_date_range: None,
                    ..td.clone()
                })
                .collect();
        }
        spec.timezone = Some(self.timezone.clone());

        let options = QueryOptions {
            nested: true,
            disable_pre_aggregations: true,
            original_sql_pre_aggregations: self.options.original_sql_pre_aggregations,
            cube_alias_prefix: Some(format!("{cube}_{name}_subquery")),
            expression_measures: vec![MeasureMember::expression(cube, name, &definition.sql)],
            ..QueryOptions::default()
        };
        let nested = self.session.new_query(&spec, options)?;
        tracing::debug!(dimension = path, "compiling sub query dimension");
        let sql = nested.build_sql()?;

        let alias = self.subquery_alias(cube, name)?;
        let on = primary_keys
            .iter()
            .map(|pk| {
                let (_, pk_name) = crate::registry::CubeRegistry::split_path(pk)?;
                Ok(format!(
                    "{}.{} = {}",
                    dialect.quote_ident(&alias),
                    self.escaped_alias(pk)?,
                    self.render_member(cube, pk_name, ctx)?
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Join {
            join_type: SqlJoinType::Left,
            table: TableRef::subquery(&sql, alias),
            on,
        })
    }

    /// Dimension filters of the outer request, for nested queries.
    fn propagated_filters(&self) -> Result<Vec<FilterSpec>> {
        let mut filters = Vec::new();
        for spec in &self.spec.filters {
            if !FilterNode::from_spec(self.session.registry, spec)?.is_measure_filter()? {
                filters.push(spec.clone());
            }
        }
        Ok(filters)
    }
}
