//! Order normalization and ordinal ORDER BY items.

use serde::Serialize;

use crate::error::{CubePlanError, Result};
use crate::request::{OrderSpec, SortDirection};
use crate::sql_ast::OrderItem;

use super::query::Query;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderMember {
    pub id: String,
    pub desc: bool,
}

/// Explicit order as given, or the default order of the query shape.
pub(crate) fn normalize(query: &Query<'_>, spec: &OrderSpec) -> Result<Vec<OrderMember>> {
    if !spec.is_empty() {
        let mut order = Vec::with_capacity(spec.0.len());
        for (id, direction) in &spec.0 {
            if id.split('.').count() < 2 {
                return Err(CubePlanError::Validation(format!(
                    "order member '{id}' must be a Cube.member path"
                )));
            }
            order.push(OrderMember {
                id: id.clone(),
                desc: *direction == SortDirection::Desc,
            });
        }
        return Ok(order);
    }
    if query.options.nested || query.options.pre_aggregation_query {
        return Ok(Vec::new());
    }
    Ok(default_order(query).into_iter().collect())
}

/// Granular time dimension ascending, else the first measure descending,
/// else the first dimension ascending.
fn default_order(query: &Query<'_>) -> Option<OrderMember> {
    if let Some(td) = query.grouped_time_dimensions().next() {
        return Some(OrderMember {
            id: td.path.clone(),
            desc: false,
        });
    }
    if let Some(measure) = query.measures.first() {
        return Some(OrderMember {
            id: measure.path.clone(),
            desc: true,
        });
    }
    query.dimensions.first().map(|d| OrderMember {
        id: d.path.clone(),
        desc: false,
    })
}

impl<'a> Query<'a> {
    /// 1-based position of a member among the output columns.
    pub(crate) fn field_index(&self, id: &str) -> Option<usize> {
        let dimensions = self.dimensions.iter().map(|d| d.path == id);
        let time_dimensions = self
            .grouped_time_dimensions()
            .map(|td| td.path == id || td.expression_path() == id);
        let measures = self.measures.iter().map(|m| m.path == id);
        dimensions
            .chain(time_dimensions)
            .chain(measures)
            .position(|matched| matched)
            .map(|i| i + 1)
    }

    /// ORDER BY ordinals; members that are not selected are skipped.
    pub(crate) fn order_by_items(&self) -> Vec<OrderItem> {
        self.order
            .iter()
            .filter_map(|o| {
                self.field_index(&o.id).map(|index| OrderItem {
                    expr: index.to_string(),
                    desc: o.desc,
                })
            })
            .collect()
    }

    /// GROUP BY ordinals over the dimension columns.
    pub(crate) fn group_by_ordinals(&self) -> Vec<String> {
        let count = self.dimensions.len() + self.grouped_time_dimensions().count();
        (1..=count).map(|i| i.to_string()).collect()
    }
}
