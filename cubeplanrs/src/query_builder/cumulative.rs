//! Rolling window and running total measures over a generated date series.

use std::collections::HashMap;

use crate::error::{CubePlanError, Result};
use crate::models::{MeasureType, WindowOffset};
use crate::sql_ast::{Join, SelectItem, SelectQuery, SqlJoinType, TableRef};
use crate::time::{self, SqlInterval};

use super::context::RenderContext;
use super::members::{MeasureMember, TimeDimensionMember};
use super::query::Query;

/// Column expressions a window condition compares.
struct WindowBounds<'s> {
    date_from: &'s str,
    date_to: &'s str,
    field: &'s str,
    dimension_from: &'s str,
    /// Widen the window to the whole requested range instead of one bucket.
    from_start_to_end: bool,
}

impl<'a> Query<'a> {
    /// One cumulative measure evaluated per bucket of the granular time
    /// dimensions: the base rows are LEFT JOINed to each bucket they fall
    /// into and re-aggregated.
    pub(crate) fn over_time_series_query(
        &self,
        measure: &MeasureMember,
        ctx: &RenderContext,
    ) -> Result<SelectQuery> {
        let grouped: Vec<&TimeDimensionMember> = self.grouped_time_dimensions().collect();
        if grouped.is_empty() {
            let filters = self.cumulative_filters(measure, None, ctx)?;
            return self.regular_measures_sub_query(std::slice::from_ref(measure), Some(filters), ctx);
        }

        let dialect = self.session.dialect;
        let ungroup = measure.should_ungroup_for_cumulative();
        let mut series = Vec::with_capacity(grouped.len());
        for td in &grouped {
            let (from, to) = td.date_range.as_ref().ok_or_else(|| {
                CubePlanError::Validation(format!(
                    "time series queries without dateRange aren't supported: '{}'",
                    td.path
                ))
            })?;
            let granularity = td.granularity.ok_or_else(|| {
                CubePlanError::Internal(format!("'{}' has no granularity", td.path))
            })?;
            let buckets = time::time_series(
                granularity,
                from,
                to,
                self.session.precision,
                self.session.config.query.max_time_series_buckets,
            )?;
            series.push((*td, granularity, buckets));
        }

        let override_granularity = if ungroup {
            None
        } else {
            let finest = series.iter().map(|(_, g, _)| *g).reduce(time::min_granularity);
            time::min_granularity_opt(measure.window_granularity()?, finest)
        };
        let base_ctx = ctx
            .with_over_time_series(override_granularity)
            .with_ungrouped(ungroup);
        let series_range = series.iter().find_map(|(td, _, buckets)| {
            let first = buckets.first()?;
            let last = buckets.last()?;
            Some((*td, first.0.clone(), last.1.clone()))
        });
        let filters = self.cumulative_filters(measure, series_range, &base_ctx)?;
        let base = self.regular_measures_sub_query(std::slice::from_ref(measure), Some(filters), &base_ctx)?;

        let base_alias = dialect.quote_ident(&self.cube_alias_name("base", ctx)?);
        let mut select: Vec<SelectItem> = Vec::new();
        for dimension in &self.dimensions {
            let alias = self.alias_name(&dimension.path)?;
            select.push(SelectItem::aliased(
                format!("{base_alias}.{}", dialect.quote_ident(&alias)),
                alias,
            ));
        }

        let mut tables: Vec<TableRef> = Vec::new();
        let mut window_conditions: Vec<String> = Vec::new();
        for (td, _, buckets) in &series {
            let series_alias = dialect.quote_ident(&self.cube_alias_name(&format!("{}_series", td.path), ctx)?);
            let date_from = format!("{series_alias}.{}", dialect.quote_ident("date_from"));
            let date_to = format!("{series_alias}.{}", dialect.quote_ident("date_to"));
            let td_alias = self.time_dimension_alias(td)?;
            select.push(SelectItem::aliased(date_from.clone(), td_alias.clone()));

            let field = format!("{base_alias}.{}", dialect.quote_ident(&td_alias));
            let dimension_from = match &td.date_range {
                Some((from, _)) => self.date_param(from),
                None => date_from.clone(),
            };
            let bounds = WindowBounds {
                date_from: &date_from,
                date_to: &date_to,
                field: &field,
                dimension_from: &dimension_from,
                from_start_to_end: false,
            };
            if let Some(condition) = self.window_condition(measure, &bounds)? {
                window_conditions.push(condition);
            }
            tables.push(TableRef::subquery(
                &dialect.series_sql(buckets),
                self.cube_alias_name(&format!("{}_series", td.path), ctx)?,
            ));
        }

        let aliases = HashMap::from([(
            measure.path.clone(),
            format!("{base_alias}.{}", self.escaped_alias(&measure.path)?),
        )]);
        let outer_ctx = ctx.with_cumulative_aliases(aliases);
        select.push(self.measure_select_item(measure, &outer_ctx)?);

        let mut tables = tables.into_iter();
        let from = tables.next().ok_or_else(|| {
            CubePlanError::Internal("time series query without a series".to_string())
        })?;
        let mut joins: Vec<Join> = tables
            .map(|table| Join {
                join_type: SqlJoinType::Inner,
                table,
                on: Vec::new(),
            })
            .collect();
        joins.push(Join {
            join_type: SqlJoinType::Left,
            table: TableRef::subquery(&self.render(&base), self.cube_alias_name("base", ctx)?),
            on: window_conditions,
        });

        Ok(SelectQuery {
            select,
            from,
            joins,
            group_by: self.group_by_ordinals(),
            ..SelectQuery::default()
        })
    }

    /// WHERE of the base query: dimension filters and segments, plus time
    /// dimension ranges widened by the measure's window.
    fn cumulative_filters(
        &self,
        measure: &MeasureMember,
        series_range: Option<(&TimeDimensionMember, String, String)>,
        ctx: &RenderContext,
    ) -> Result<Vec<String>> {
        let mut conditions = self.dimension_filter_conditions(ctx)?;
        let running_total = measure.definition.measure_type == MeasureType::RunningTotal;
        for td in &self.time_dimensions {
            let Some((from, to)) = &td.date_range else {
                continue;
            };
            if td.granularity.is_none() && !running_total && series_range.is_some() {
                if let Some(condition) = self.time_dimension_range_condition(td, ctx)? {
                    conditions.push(condition);
                }
                continue;
            }
            let (series_from, series_to) = match &series_range {
                Some((series_td, start, end)) if series_td.path == td.path => (start.as_str(), end.as_str()),
                _ => (from.as_str(), to.as_str()),
            };
            let field = self.converted_time_dimension(td, ctx)?;
            let date_from = self.date_param(series_from);
            let date_to = self.date_param(series_to);
            let dimension_from = self.date_param(from);
            let bounds = WindowBounds {
                date_from: &date_from,
                date_to: &date_to,
                field: &field,
                dimension_from: &dimension_from,
                from_start_to_end: series_range.is_some(),
            };
            if let Some(condition) = self.window_condition(measure, &bounds)? {
                conditions.push(condition);
            }
        }
        Ok(conditions)
    }

    /// Rows of the window ending at a bucket. `None` for non-cumulative measures.
    fn window_condition(&self, measure: &MeasureMember, bounds: &WindowBounds<'_>) -> Result<Option<String>> {
        let dialect = self.session.dialect;
        if let Some(window) = &measure.definition.rolling_window {
            let offset = window.offset;
            let mut conditions = Vec::new();

            if window.trailing.as_deref() != Some("unbounded") {
                let start = if bounds.from_start_to_end || offset == WindowOffset::Start {
                    bounds.date_from
                } else {
                    bounds.date_to
                };
                let trailing_start = match &window.trailing {
                    Some(interval) => dialect.subtract_interval(start, &SqlInterval::parse(interval)?)?,
                    None => start.to_string(),
                };
                let sign = if offset == WindowOffset::Start { ">=" } else { ">" };
                conditions.push(format!("{} {sign} {trailing_start}", bounds.field));
            }

            if window.leading.as_deref() != Some("unbounded") {
                let end = if bounds.from_start_to_end || offset == WindowOffset::End {
                    bounds.date_to
                } else {
                    bounds.date_from
                };
                let leading_end = match &window.leading {
                    Some(interval) => dialect.add_interval(end, &SqlInterval::parse(interval)?)?,
                    None => end.to_string(),
                };
                let sign = if offset == WindowOffset::End { "<=" } else { "<" };
                conditions.push(format!("{} {sign} {leading_end}", bounds.field));
            }

            return Ok(Some(if conditions.is_empty() {
                "1 = 1".to_string()
            } else {
                conditions.join(" AND ")
            }));
        }
        if measure.definition.measure_type == MeasureType::RunningTotal {
            return Ok(Some(format!(
                "{field} >= {} AND {field} <= {}",
                bounds.dimension_from,
                bounds.date_to,
                field = bounds.field
            )));
        }
        Ok(None)
    }
}
