//! SQL reading from a matched rollup and SQL that builds one.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::Result;
use crate::models::PreAggregationType;
use crate::params::ParamAllocator;
use crate::query_builder::{CompileSession, Query, QueryOptions};
use crate::request::{DateRangeSpec, QuerySpec, TimeDimensionSpec};
use crate::sql_ast::{SelectQuery, TableRef};

use super::matcher::{MatchedPreAggregation, RollupReferences};

/// Annotated SQL answering `query` from the rollup table(s).
pub(crate) fn rollup_query_sql(query: &Query<'_>, matched: &MatchedPreAggregation) -> Result<String> {
    let dialect = query.session.dialect;
    let walker = query.session.walker();
    let references = &matched.references;
    let mut rendered: HashMap<String, String> = HashMap::new();

    for path in &references.dimensions {
        rendered.insert(path.clone(), dialect.quote_ident(&query.alias_name(path)?));
    }
    for path in &references.segments {
        rendered.insert(
            path.clone(),
            format!("{} = 1", dialect.quote_ident(&query.alias_name(path)?)),
        );
    }
    if let Some((path, granularity)) = &references.time_dimension {
        let column = format!("{}_{granularity}", query.alias_name(path)?);
        rendered.insert(path.clone(), dialect.quote_ident(&query.checked_alias(column)?));
    }
    for path in &references.measures {
        let member = crate::query_builder::MeasureMember::from_path(query.session.registry, path)?;
        let leaves = walker.leaf_measures(&member)?;
        let recomputable = leaves != [path.clone()] && leaves.iter().all(|l| references.measures.contains(l));
        if !member.is_additive() && recomputable {
            continue;
        }
        let column = dialect.quote_ident(&query.alias_name(path)?);
        let sql = match query.aggregate_on_grouped_column(member.definition.measure_type, &column)? {
            Some(sql) if member.is_additive() => sql,
            _ => format!("max({column})"),
        };
        rendered.insert(path.clone(), sql);
    }

    let granularity = references.time_dimension.as_ref().map(|(_, g)| *g);
    let ctx = query
        .root_context()
        .with_rendered_reference(rendered)
        .with_rollup(granularity);

    let mut select = query.dimension_select_items(&ctx)?;
    for measure in &query.measures {
        select.push(query.measure_select_item(measure, &ctx)?);
    }
    let having = query
        .measure_filters
        .iter()
        .map(|f| query.filter_to_where(f, &ctx))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect();

    let select = SelectQuery {
        select,
        from: rollup_source(query, matched)?,
        filters: query.where_conditions(&ctx)?,
        group_by: query.group_by_ordinals(),
        having,
        order_by: query.order_by_items(),
        limit: query.limit,
        offset: query.offset,
        ..SelectQuery::default()
    };
    Ok(query.render(&select))
}

/// The rollup table, or the union of the partitions covering the query range.
fn rollup_source(query: &Query<'_>, matched: &MatchedPreAggregation) -> Result<TableRef> {
    let alias = query.cube_alias_name(&matched.cube, &query.root_context())?;
    if matched.partitions.is_empty() {
        return Ok(TableRef::new(matched.table_name.clone(), alias));
    }
    let union = matched
        .partitions
        .iter()
        .map(|p| format!("SELECT * FROM {}", p.table_name))
        .collect::<Vec<_>>()
        .join(" UNION ALL ");
    Ok(TableRef::subquery(&union, alias))
}

/// SELECT that fills a rollup table, with its own params.
pub(crate) fn load_select_sql(
    session: CompileSession<'_>,
    cube: &str,
    pre_aggregation_type: PreAggregationType,
    use_original_sql: bool,
    references: &RollupReferences,
    timezone: &str,
    date_range: Option<&(String, String)>,
) -> Result<(String, Vec<Value>)> {
    let params = ParamAllocator::new();
    let session = session.with_params(&params);

    if pre_aggregation_type == PreAggregationType::OriginalSql {
        let query = super::cube_query(session, cube)?;
        let ctx = query.root_context();
        let sql = format!(
            "SELECT * FROM {} AS {}",
            query.cube_sql(cube, &ctx)?,
            query.cube_alias(cube, &ctx)?
        );
        return params.build_sql_and_params(&sql, session.dialect);
    }

    let mut dimensions = references.dimensions.clone();
    dimensions.extend(references.segments.iter().cloned());
    let time_dimensions = references
        .time_dimension
        .iter()
        .map(|(path, granularity)| TimeDimensionSpec {
            dimension: path.clone(),
            granularity: Some(granularity.to_string()),
            date_range: date_range.map(|(from, to)| DateRangeSpec::Absolute([from.clone(), to.clone()])),
            compare_date_range: None,
        })
        .collect();
    let spec = QuerySpec {
        measures: references.measures.clone(),
        dimensions,
        time_dimensions,
        timezone: Some(timezone.to_string()),
        ..QuerySpec::default()
    };
    let options = QueryOptions {
        pre_aggregation_query: true,
        original_sql_pre_aggregations: use_original_sql,
        ..QueryOptions::default()
    };
    let query = session.new_query(&spec, options)?;
    let annotated = query.build_sql()?;
    params.build_sql_and_params(&annotated, session.dialect)
}
