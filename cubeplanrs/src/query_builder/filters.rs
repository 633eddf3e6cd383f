//! Filter trees and their WHERE/HAVING rendering.

use serde_json::Value;

use crate::dialect::LikeKind;
use crate::error::{CubePlanError, Result};
use crate::models::DimensionType;
use crate::registry::{CubeRegistry, MemberKind};
use crate::request::{FilterOperator, FilterSpec};
use crate::sql_ast::conjunction;
use crate::time;

use super::context::RenderContext;
use super::query::Query;

#[derive(Debug, Clone)]
pub(crate) enum FilterNode {
    Leaf(FilterLeaf),
    And(Vec<FilterNode>),
    Or(Vec<FilterNode>),
}

#[derive(Debug, Clone)]
pub(crate) struct FilterLeaf {
    pub path: String,
    pub cube: String,
    pub name: String,
    pub kind: MemberKind,
    pub operator: FilterOperator,
    pub values: Vec<Value>,
}

impl FilterNode {
    pub fn from_spec(registry: &CubeRegistry, spec: &FilterSpec) -> Result<Self> {
        match spec {
            FilterSpec::And { and } => Ok(FilterNode::And(
                and.iter()
                    .map(|f| FilterNode::from_spec(registry, f))
                    .collect::<Result<_>>()?,
            )),
            FilterSpec::Or { or } => Ok(FilterNode::Or(
                or.iter()
                    .map(|f| FilterNode::from_spec(registry, f))
                    .collect::<Result<_>>()?,
            )),
            FilterSpec::Member(filter) => {
                let path = filter.member_path()?;
                let kind = registry.member_kind(path)?;
                if kind == MemberKind::Segment {
                    return Err(CubePlanError::Validation(format!(
                        "segment '{path}' can't be filtered, add it to segments instead"
                    )));
                }
                if filter.operator == FilterOperator::MeasureFilter && kind != MemberKind::Measure {
                    return Err(CubePlanError::Validation(format!(
                        "measureFilter operator requires a measure but '{path}' is a {kind}"
                    )));
                }
                if filter.operator.is_date_operator() && !is_time_dimension(registry, path, kind)? {
                    return Err(CubePlanError::Validation(format!(
                        "date operator '{}' requires a time dimension but '{path}' is not one",
                        operator_name(filter.operator)
                    )));
                }
                let (cube, name) = CubeRegistry::split_path(path)?;
                Ok(FilterNode::Leaf(FilterLeaf {
                    path: path.to_string(),
                    cube: cube.to_string(),
                    name: name.to_string(),
                    kind,
                    operator: filter.operator,
                    values: filter.values.clone(),
                }))
            }
        }
    }

    pub fn leaves(&self) -> Vec<&FilterLeaf> {
        match self {
            FilterNode::Leaf(leaf) => vec![leaf],
            FilterNode::And(children) | FilterNode::Or(children) => {
                children.iter().flat_map(|c| c.leaves()).collect()
            }
        }
    }

    /// Whether the tree filters aggregated values (HAVING) rather than rows.
    pub fn is_measure_filter(&self) -> Result<bool> {
        let leaves = self.leaves();
        let measures = leaves.iter().filter(|l| l.is_aggregate()).count();
        if measures > 0 && measures < leaves.len() {
            return Err(CubePlanError::Validation(
                "you cannot use dimension and measure in same condition".to_string(),
            ));
        }
        Ok(measures > 0)
    }
}

impl FilterLeaf {
    fn is_aggregate(&self) -> bool {
        self.kind == MemberKind::Measure && self.operator != FilterOperator::MeasureFilter
    }
}

impl<'a> Query<'a> {
    /// Condition for a filter tree, `None` when it constrains nothing.
    pub(crate) fn filter_to_where(&self, node: &FilterNode, ctx: &RenderContext) -> Result<Option<String>> {
        let (children, joiner) = match node {
            FilterNode::Leaf(leaf) => return self.leaf_to_where(leaf, ctx).map(Some),
            FilterNode::And(children) => (children, " AND "),
            FilterNode::Or(children) => (children, " OR "),
        };
        let mut rendered = Vec::new();
        for child in children {
            if let Some(sql) = self.filter_to_where(child, ctx)? {
                rendered.push(sql);
            }
        }
        Ok(match rendered.len() {
            0 => None,
            1 => rendered.pop(),
            _ => Some(
                rendered
                    .iter()
                    .map(|c| format!("({c})"))
                    .collect::<Vec<_>>()
                    .join(joiner),
            ),
        })
    }

    fn leaf_to_where(&self, leaf: &FilterLeaf, ctx: &RenderContext) -> Result<String> {
        let registry = self.session.registry;
        if leaf.operator == FilterOperator::MeasureFilter {
            let definition = registry.measure(&leaf.path)?;
            if definition.filters.is_empty() {
                return Ok("1 = 1".to_string());
            }
            let conditions = definition
                .filters
                .iter()
                .map(|f| self.evaluate_template(&leaf.cube, &f.sql, ctx))
                .collect::<Result<Vec<_>>>()?;
            return Ok(conjunction(&conditions));
        }

        let (column, dimension_type) = match leaf.kind {
            MemberKind::Measure => (
                self.render_member(&leaf.cube, &leaf.name, ctx)?,
                DimensionType::Number,
            ),
            _ => {
                let definition = registry.dimension(&leaf.path)?;
                let sql = self.render_member(&leaf.cube, &leaf.name, ctx)?;
                let converted = definition.dimension_type == DimensionType::Time
                    && ctx.reference(&leaf.path).is_none();
                let column = if converted {
                    self.session.dialect.convert_tz(&sql, &self.timezone)
                } else {
                    sql
                };
                (column, definition.dimension_type)
            }
        };
        self.operator_sql(leaf, &column, dimension_type)
    }

    fn operator_sql(&self, leaf: &FilterLeaf, column: &str, dimension_type: DimensionType) -> Result<String> {
        let dialect = self.session.dialect;
        let non_null: Vec<&Value> = leaf.values.iter().filter(|v| !v.is_null()).collect();
        let has_null = non_null.len() < leaf.values.len();
        let param = |value: &Value| {
            let token = self.session.params.allocate_param(value.clone());
            dialect.cast_parameter_for(dimension_type, &token)
        };

        use FilterOperator::*;
        let sql = match leaf.operator {
            Equals | In => {
                let matched = match non_null.as_slice() {
                    [] => return Ok(format!("{column} IS NULL")),
                    [single] => format!("{column} = {}", param(single)),
                    many => format!(
                        "{column} IN ({})",
                        many.iter().map(|v| param(v)).collect::<Vec<_>>().join(", ")
                    ),
                };
                if has_null {
                    format!("{matched} OR {column} IS NULL")
                } else {
                    matched
                }
            }
            NotEquals | NotIn => {
                let excluded = match non_null.as_slice() {
                    [] => return Ok(format!("{column} IS NOT NULL")),
                    [single] => format!("{column} <> {}", param(single)),
                    many => format!(
                        "{column} NOT IN ({})",
                        many.iter().map(|v| param(v)).collect::<Vec<_>>().join(", ")
                    ),
                };
                if has_null {
                    excluded
                } else {
                    format!("{excluded} OR {column} IS NULL")
                }
            }
            Set => format!("{column} IS NOT NULL"),
            NotSet => format!("{column} IS NULL"),
            Gt | Gte | Lt | Lte => {
                let op = match leaf.operator {
                    Gt => ">",
                    Gte => ">=",
                    Lt => "<",
                    _ => "<=",
                };
                let value = first_value(leaf)?;
                format!("{column} {op} {}", param(value))
            }
            Contains | NotContains | StartsWith | NotStartsWith | EndsWith | NotEndsWith => {
                self.like_sql(leaf, column, &non_null)?
            }
            InDateRange | NotInDateRange => {
                let (from, to) = self.date_range_values(leaf)?;
                if leaf.operator == InDateRange {
                    format!("{column} >= {from} AND {column} <= {to}")
                } else {
                    format!("{column} < {from} OR {column} > {to}")
                }
            }
            OnTheDate => {
                let value = date_value(leaf, 0)?;
                let from = self.date_param(&time::format_from_date(value, self.session.precision)?);
                let to = self.date_param(&time::format_to_date(value, self.session.precision)?);
                format!("{column} >= {from} AND {column} <= {to}")
            }
            BeforeDate | AfterOrOnDate => {
                let from = self.date_param(&time::format_from_date(date_value(leaf, 0)?, self.session.precision)?);
                let op = if leaf.operator == BeforeDate { "<" } else { ">=" };
                format!("{column} {op} {from}")
            }
            BeforeOrOnDate | AfterDate => {
                let to = self.date_param(&time::format_to_date(date_value(leaf, 0)?, self.session.precision)?);
                let op = if leaf.operator == AfterDate { ">" } else { "<=" };
                format!("{column} {op} {to}")
            }
            MeasureFilter => {
                return Err(CubePlanError::Internal(
                    "measureFilter reached operator rendering".to_string(),
                ))
            }
        };
        Ok(sql)
    }

    fn like_sql(&self, leaf: &FilterLeaf, column: &str, values: &[&Value]) -> Result<String> {
        use FilterOperator::*;
        let (kind, negate) = match leaf.operator {
            Contains => (LikeKind::Contains, false),
            NotContains => (LikeKind::Contains, true),
            StartsWith => (LikeKind::StartsWith, false),
            NotStartsWith => (LikeKind::StartsWith, true),
            EndsWith => (LikeKind::EndsWith, false),
            _ => (LikeKind::EndsWith, true),
        };
        if values.is_empty() {
            return Err(CubePlanError::Validation(format!(
                "filter on '{}' with operator '{}' requires values",
                leaf.path,
                operator_name(leaf.operator)
            )));
        }
        let likes: Vec<String> = values
            .iter()
            .map(|value| {
                let literal = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let token = self.session.params.allocate_param(escape_like(&literal));
                self.session.dialect.like_ignore_case(column, negate, &token, kind)
            })
            .collect();
        Ok(if negate {
            format!("({} OR {column} IS NULL)", likes.join(" AND "))
        } else {
            likes.join(" OR ")
        })
    }

    fn date_range_values(&self, leaf: &FilterLeaf) -> Result<(String, String)> {
        let from = time::format_from_date(date_value(leaf, 0)?, self.session.precision)?;
        let to = time::format_to_date(date_value(leaf, 1)?, self.session.precision)?;
        Ok((self.date_param(&from), self.date_param(&to)))
    }

    /// Bound wall-clock timestamp comparable with a tz-converted column.
    pub(crate) fn date_param(&self, value: &str) -> String {
        let token = self.session.params.allocate_param(value);
        self.session.dialect.date_time_cast(&token)
    }
}

fn is_time_dimension(registry: &CubeRegistry, path: &str, kind: MemberKind) -> Result<bool> {
    Ok(kind == MemberKind::Dimension
        && registry.dimension(path)?.dimension_type == DimensionType::Time)
}

fn first_value(leaf: &FilterLeaf) -> Result<&Value> {
    leaf.values.iter().find(|v| !v.is_null()).ok_or_else(|| {
        CubePlanError::Validation(format!(
            "filter on '{}' with operator '{}' requires a value",
            leaf.path,
            operator_name(leaf.operator)
        ))
    })
}

fn date_value(leaf: &FilterLeaf, index: usize) -> Result<&str> {
    leaf.values
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            CubePlanError::Validation(format!(
                "filter on '{}' with operator '{}' requires a date at position {index}",
                leaf.path,
                operator_name(leaf.operator)
            ))
        })
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn operator_name(operator: FilterOperator) -> String {
    serde_json::to_value(operator)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{operator:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CubeDefinition, DimensionDefinition, MeasureDefinition};
    use serde_json::json;

    fn registry() -> CubeRegistry {
        CubeRegistry::from_cubes(vec![CubeDefinition::new("Orders", "orders")
            .with_dimension("status", DimensionDefinition::string("status"))
            .with_measure("count", MeasureDefinition::count())
            .with_segment("completed", "{CUBE}.status = 'completed'")])
        .unwrap()
    }

    #[test]
    fn mixed_groups_are_rejected() {
        let spec = FilterSpec::Or {
            or: vec![
                FilterSpec::member("Orders.status", FilterOperator::Equals, vec![json!("a")]),
                FilterSpec::member("Orders.count", FilterOperator::Gt, vec![json!(1)]),
            ],
        };
        let node = FilterNode::from_spec(&registry(), &spec).unwrap();
        assert!(node.is_measure_filter().is_err());
    }

    #[test]
    fn segments_are_not_filterable() {
        let spec = FilterSpec::member("Orders.completed", FilterOperator::Set, vec![]);
        assert!(FilterNode::from_spec(&registry(), &spec).is_err());
    }

    #[test]
    fn like_values_escape_wildcards() {
        assert_eq!(escape_like("50%_off"), "50\\%\\_off");
        assert_eq!(escape_like("C:\\"), "C:\\\\");
        assert_eq!(escape_like("a\\%"), "a\\\\\\%");
    }

    #[test]
    fn date_operators_need_a_time_dimension() {
        let spec = FilterSpec::member(
            "Orders.status",
            FilterOperator::BeforeDate,
            vec![json!("2020-01-01")],
        );
        let err = FilterNode::from_spec(&registry(), &spec).unwrap_err();
        assert!(matches!(err, CubePlanError::Validation(_)));
        assert!(err.to_string().contains("beforeDate"));
    }

    #[test]
    fn operator_names_are_camel_case() {
        assert_eq!(operator_name(FilterOperator::NotInDateRange), "notInDateRange");
    }
}
