//! Aggregation planning.
//!
//! A query whose measures all aggregate at their cube's grain compiles to one
//! grouped SELECT. Measures whose rows fan out through a one-to-many join are
//! aggregated per primary key of their cube first, cumulative measures over a
//! date series, and the pieces are joined back on the dimension columns.

use std::collections::HashMap;

use crate::error::{CubePlanError, Result};
use crate::sql_ast::{Join, SelectItem, SelectQuery, SqlJoinType, SqlRenderer, TableRef};

use super::context::RenderContext;
use super::members::MeasureMember;
use super::query::Query;

/// Leaf measures of a query, by how they have to be aggregated.
#[derive(Debug, Default)]
pub(crate) struct MeasureClasses {
    pub regular: Vec<MeasureMember>,
    pub multiplied: Vec<MeasureMember>,
    /// With the multiplication flag of the measure's cube.
    pub cumulative: Vec<(bool, MeasureMember)>,
}

impl<'a> Query<'a> {
    /// Annotated SQL against raw tables.
    pub(crate) fn build_sql(&self) -> Result<String> {
        let select = self.full_key_query_aggregate()?;
        Ok(self.render(&select))
    }

    pub(crate) fn render(&self, select: &SelectQuery) -> String {
        SqlRenderer::new(self.session.dialect).render_select(select)
    }

    /// Every measure of the query plus those only used by measure filters.
    pub(crate) fn all_measures(&self) -> Result<Vec<MeasureMember>> {
        let mut all = self.measures.clone();
        all.extend(self.measure_filter_members()?);
        Ok(all)
    }

    pub(crate) fn classify_measures(&self) -> Result<MeasureClasses> {
        let join = self.join.as_ref().ok_or_else(|| {
            CubePlanError::Internal("measures classified without a join tree".to_string())
        })?;
        let walker = self.session.walker();
        let mut classes = MeasureClasses::default();
        for measure in self.all_measures()? {
            for (multiplied, leaf) in walker.multiplied_measures(&measure, join)? {
                let seen = classes
                    .regular
                    .iter()
                    .chain(&classes.multiplied)
                    .chain(classes.cumulative.iter().map(|(_, m)| m))
                    .any(|m| m.path == leaf.path);
                if seen {
                    continue;
                }
                if leaf.is_cumulative() {
                    classes.cumulative.push((multiplied, leaf));
                } else if multiplied {
                    classes.multiplied.push(leaf);
                } else {
                    classes.regular.push(leaf);
                }
            }
        }
        tracing::debug!(
            regular = classes.regular.len(),
            multiplied = classes.multiplied.len(),
            cumulative = classes.cumulative.len(),
            "classified measures"
        );
        Ok(classes)
    }

    pub(crate) fn full_key_query_aggregate(&self) -> Result<SelectQuery> {
        let ctx = self.root_context();
        if self.ungrouped || (self.measures.is_empty() && self.measure_filters.is_empty()) {
            return self.simple_query(&ctx);
        }

        let mut classes = self.classify_measures()?;
        if self.options.pre_aggregation_query {
            for (multiplied, measure) in std::mem::take(&mut classes.cumulative) {
                if multiplied {
                    classes.multiplied.push(measure);
                } else {
                    classes.regular.push(measure);
                }
            }
        }
        if classes.multiplied.is_empty() && classes.cumulative.is_empty() {
            return self.simple_query(&ctx);
        }

        let regular_cubes = cube_names(&classes.regular);
        let multiplied_cubes = cube_names(&classes.multiplied);
        let of_cube = |measures: &[MeasureMember], cube: &str| -> Vec<MeasureMember> {
            measures.iter().filter(|m| m.cube == cube).cloned().collect()
        };

        let mut pieces: Vec<(SelectQuery, Vec<MeasureMember>)> = Vec::new();
        let mut same_cubes = regular_cubes.clone();
        same_cubes.sort();
        let mut sorted_multiplied = multiplied_cubes.clone();
        sorted_multiplied.sort();

        if !classes.regular.is_empty() && classes.cumulative.is_empty() && same_cubes == sorted_multiplied {
            for cube in &multiplied_cubes {
                let mut measures = of_cube(&classes.multiplied, cube);
                measures.extend(of_cube(&classes.regular, cube));
                let piece_ctx = ctx.with_cube_alias_prefix(format!("{}_key", self.cube_alias_name(cube, &ctx)?));
                pieces.push((self.aggregate_sub_query(cube, &measures, &piece_ctx)?, measures));
            }
        } else {
            if !classes.regular.is_empty() {
                let piece_ctx = ctx.with_cube_alias_prefix("main");
                pieces.push((
                    self.regular_measures_sub_query(&classes.regular, None, &piece_ctx)?,
                    classes.regular.clone(),
                ));
            }
            for cube in &multiplied_cubes {
                let measures = of_cube(&classes.multiplied, cube);
                let piece_ctx = ctx.with_cube_alias_prefix(format!("{}_key", self.cube_alias_name(cube, &ctx)?));
                pieces.push((self.aggregate_sub_query(cube, &measures, &piece_ctx)?, measures));
            }
            for (_, measure) in &classes.cumulative {
                let piece_ctx =
                    ctx.with_cube_alias_prefix(format!("{}_cumulative", self.alias_name(&measure.path)?));
                pieces.push((
                    self.over_time_series_query(measure, &piece_ctx)?,
                    vec![measure.clone()],
                ));
            }
        }
        self.join_full_key_query_aggregate(pieces)
    }

    /// One grouped SELECT over the joined cubes.
    pub(crate) fn simple_query(&self, ctx: &RenderContext) -> Result<SelectQuery> {
        let mut select = self.dimension_select_items(ctx)?;
        for measure in &self.measures {
            select.push(self.measure_select_item(measure, ctx)?);
        }
        let (from, joins) = self.join_query(ctx, &self.subquery_dimensions()?)?;
        let having = self
            .measure_filters
            .iter()
            .map(|f| self.filter_to_where(f, ctx))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();
        Ok(SelectQuery {
            select,
            from,
            joins,
            filters: self.where_conditions(ctx)?,
            group_by: if self.ungrouped { Vec::new() } else { self.group_by_ordinals() },
            having,
            order_by: self.order_by_items(),
            limit: self.limit,
            offset: self.offset,
            ..SelectQuery::default()
        })
    }

    /// Grouped SELECT of `measures` at the query's dimensions. `conditions`
    /// replaces the query's WHERE when given.
    pub(crate) fn regular_measures_sub_query(
        &self,
        measures: &[MeasureMember],
        conditions: Option<Vec<String>>,
        ctx: &RenderContext,
    ) -> Result<SelectQuery> {
        let mut select = self.dimension_select_items(ctx)?;
        for measure in measures {
            select.push(self.measure_select_item(measure, ctx)?);
        }
        let (from, joins) = self.join_query(ctx, &self.subquery_dimensions()?)?;
        let filters = match conditions {
            Some(conditions) => conditions,
            None => self.where_conditions(ctx)?,
        };
        Ok(SelectQuery {
            select,
            from,
            joins,
            filters,
            group_by: if ctx.ungrouped { Vec::new() } else { self.group_by_ordinals() },
            ..SelectQuery::default()
        })
    }

    /// Measures of `key_cube` aggregated once per primary key.
    ///
    /// The keys query collects distinct dimension and primary key tuples over
    /// the full join; the cube is then joined back on its primary key alone,
    /// so each of its rows is counted once.
    fn aggregate_sub_query(
        &self,
        key_cube: &str,
        measures: &[MeasureMember],
        ctx: &RenderContext,
    ) -> Result<SelectQuery> {
        let dialect = self.session.dialect;
        let walker = self.session.walker();
        for measure in measures {
            if let Some(other) = walker
                .measure_cube_names(measure)?
                .into_iter()
                .find(|cube| cube != key_cube)
            {
                return Err(CubePlanError::Unsupported(format!(
                    "measure '{}' is aggregated by '{key_cube}' primary key but references cube '{other}'",
                    measure.path
                )));
            }
        }

        let primary_keys = self.session.registry.primary_keys(key_cube)?;
        if primary_keys.is_empty() {
            return Err(CubePlanError::Schema(format!(
                "primary key for '{key_cube}' is required to aggregate its measures without fan-out"
            )));
        }

        let mut keys_select = self.dimension_select_items(ctx)?;
        for pk in &primary_keys {
            let (_, name) = crate::registry::CubeRegistry::split_path(pk)?;
            keys_select.push(SelectItem::aliased(
                self.render_member(key_cube, name, ctx)?,
                self.alias_name(pk)?,
            ));
        }
        let (keys_from, keys_joins) = self.join_query(ctx, &self.subquery_dimensions()?)?;
        let keys = SelectQuery {
            distinct: true,
            select: keys_select,
            from: keys_from,
            joins: keys_joins,
            filters: self.where_conditions(ctx)?,
            ..SelectQuery::default()
        };

        let keys_alias = dialect.quote_ident("keys");
        let mut select: Vec<SelectItem> = self
            .dimension_aliases()?
            .into_iter()
            .map(|alias| {
                SelectItem::aliased(format!("{keys_alias}.{}", dialect.quote_ident(&alias)), alias)
            })
            .collect();
        for measure in measures {
            select.push(self.measure_select_item(measure, ctx)?);
        }

        let mut on = Vec::with_capacity(primary_keys.len());
        for pk in &primary_keys {
            let (_, name) = crate::registry::CubeRegistry::split_path(pk)?;
            on.push(format!(
                "{keys_alias}.{} = {}",
                self.escaped_alias(pk)?,
                self.render_member(key_cube, name, ctx)?
            ));
        }
        let mut joins = vec![Join {
            join_type: SqlJoinType::Left,
            table: TableRef::new(
                self.cube_sql(key_cube, ctx)?,
                self.cube_alias_name(key_cube, ctx)?,
            ),
            on,
        }];
        let mut measure_subqueries = Vec::new();
        for measure in measures {
            for path in walker.measure_subquery_dimensions(measure)? {
                if !measure_subqueries.contains(&path) {
                    measure_subqueries.push(path);
                }
            }
        }
        for path in &measure_subqueries {
            joins.push(self.subquery_join(path, ctx)?);
        }

        Ok(SelectQuery {
            select,
            from: TableRef::subquery(&self.render(&keys), "keys"),
            joins,
            group_by: self.group_by_ordinals(),
            ..SelectQuery::default()
        })
    }

    /// Join the pieces on their dimension columns and compute the selected
    /// measures from the columns they expose.
    fn join_full_key_query_aggregate(
        &self,
        mut pieces: Vec<(SelectQuery, Vec<MeasureMember>)>,
    ) -> Result<SelectQuery> {
        let dialect = self.session.dialect;
        let aliases = self.dimension_aliases()?;

        let mut references = HashMap::new();
        let mut piece_order: Vec<&str> = Vec::new();
        for (_, measures) in &pieces {
            for measure in measures {
                references.insert(
                    measure.path.clone(),
                    dialect.quote_ident(&self.alias_name(&measure.path)?),
                );
                piece_order.push(&measure.path);
            }
        }
        let query_order: Vec<&str> = self.measures.iter().map(|m| m.path.as_str()).collect();
        let direct = pieces.len() == 1
            && self.measure_filters.is_empty()
            && !self.measures.iter().any(|m| m.expression)
            && piece_order == query_order;
        if direct {
            if let Some((mut piece, _)) = pieces.pop() {
                piece.order_by = self.order_by_items();
                piece.limit = self.limit;
                piece.offset = self.offset;
                return Ok(piece);
            }
        }

        let outer_ctx = self.root_context().with_rendered_reference(references);
        let mut select: Vec<SelectItem> = aliases
            .iter()
            .map(|alias| SelectItem::aliased(format!("q_0.{}", dialect.quote_ident(alias)), alias.clone()))
            .collect();
        for measure in &self.measures {
            select.push(self.measure_select_item(measure, &outer_ctx)?);
        }

        let mut rendered = pieces.iter().map(|(piece, _)| self.render(piece));
        let first = rendered.next().ok_or_else(|| {
            CubePlanError::Internal("aggregation plan produced no sub queries".to_string())
        })?;
        let mut joins = Vec::new();
        for (i, sql) in rendered.enumerate() {
            let (prev, this) = (format!("q_{i}"), format!("q_{}", i + 1));
            let on = aliases
                .iter()
                .map(|alias| {
                    let column = dialect.quote_ident(alias);
                    format!(
                        "({prev}.{column} = {this}.{column} OR ({prev}.{column} IS NULL AND {this}.{column} IS NULL))"
                    )
                })
                .collect();
            joins.push(Join {
                join_type: SqlJoinType::Inner,
                table: TableRef::subquery(&sql, this),
                on,
            });
        }

        let filters = self
            .measure_filters
            .iter()
            .map(|f| self.filter_to_where(f, &outer_ctx))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        Ok(SelectQuery {
            select,
            from: TableRef::subquery(&first, "q_0"),
            joins,
            filters,
            order_by: self.order_by_items(),
            limit: self.limit,
            offset: self.offset,
            ..SelectQuery::default()
        })
    }

    // ------------------------------------------------------------------------
    // Shared clauses
    // ------------------------------------------------------------------------

    /// Dimension and granular time dimension columns, in output order.
    pub(crate) fn dimension_select_items(&self, ctx: &RenderContext) -> Result<Vec<SelectItem>> {
        let mut items = Vec::new();
        for dimension in &self.dimensions {
            items.push(SelectItem::aliased(
                self.dimension_select_sql(dimension, ctx)?,
                self.alias_name(&dimension.path)?,
            ));
        }
        for td in self.grouped_time_dimensions() {
            items.push(SelectItem::aliased(
                self.time_dimension_select_sql(td, ctx)?,
                self.time_dimension_alias(td)?,
            ));
        }
        Ok(items)
    }

    pub(crate) fn dimension_aliases(&self) -> Result<Vec<String>> {
        let mut aliases = Vec::new();
        for dimension in &self.dimensions {
            aliases.push(self.alias_name(&dimension.path)?);
        }
        for td in self.grouped_time_dimensions() {
            aliases.push(self.time_dimension_alias(td)?);
        }
        Ok(aliases)
    }

    pub(crate) fn measure_select_item(&self, measure: &MeasureMember, ctx: &RenderContext) -> Result<SelectItem> {
        Ok(SelectItem::aliased(
            self.render_measure_member(measure, ctx)?,
            self.alias_name(&measure.path)?,
        ))
    }

    /// Dimension filters, time dimension ranges and segments.
    pub(crate) fn where_conditions(&self, ctx: &RenderContext) -> Result<Vec<String>> {
        let mut conditions = self.dimension_filter_conditions(ctx)?;
        for td in &self.time_dimensions {
            if let Some(condition) = self.time_dimension_range_condition(td, ctx)? {
                conditions.push(condition);
            }
        }
        Ok(conditions)
    }

    /// Dimension filters and segments, without time dimension ranges.
    pub(crate) fn dimension_filter_conditions(&self, ctx: &RenderContext) -> Result<Vec<String>> {
        let mut conditions = Vec::new();
        for filter in &self.filters {
            if let Some(condition) = self.filter_to_where(filter, ctx)? {
                conditions.push(condition);
            }
        }
        for segment in &self.segments {
            conditions.push(self.render_member(&segment.cube, &segment.name, ctx)?);
        }
        Ok(conditions)
    }

    pub(crate) fn time_dimension_range_condition(
        &self,
        td: &super::members::TimeDimensionMember,
        ctx: &RenderContext,
    ) -> Result<Option<String>> {
        let Some((from, to)) = &td.date_range else {
            return Ok(None);
        };
        let column = self.converted_time_dimension(td, ctx)?;
        Ok(Some(format!(
            "{column} >= {} AND {column} <= {}",
            self.date_param(from),
            self.date_param(to)
        )))
    }

    /// `SELECT count(*) FROM (<sql>)` over the annotated query.
    pub(crate) fn total_sql(&self, sql: &str) -> String {
        let dialect = self.session.dialect;
        format!(
            "SELECT count(*) {} FROM ({sql}) {}",
            dialect.quote_ident("total_count"),
            dialect.quote_ident("original_query")
        )
    }
}

/// Distinct cubes in first-appearance order.
fn cube_names(measures: &[MeasureMember]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for measure in measures {
        if !names.contains(&measure.cube) {
            names.push(measure.cube.clone());
        }
    }
    names
}
