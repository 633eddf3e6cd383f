//! Query shape accepted by the compiler (JSON-shaped, camelCase keys).

use chrono::NaiveDateTime;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{CubePlanError, Result};
use crate::time;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySpec {
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub segments: Vec<String>,
    #[serde(default)]
    pub time_dimensions: Vec<TimeDimensionSpec>,
    #[serde(default)]
    pub filters: Vec<FilterSpec>,
    #[serde(default)]
    pub order: OrderSpec,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// IANA name. Falls back to the configured default.
    pub timezone: Option<String>,
    #[serde(default)]
    pub ungrouped: bool,
    /// Also emit a `count(*)` wrapper over the compiled query.
    #[serde(default)]
    pub total: bool,
    pub allow_ungrouped_without_primary_key: Option<bool>,
}

impl QuerySpec {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeDimensionSpec {
    pub dimension: String,
    pub granularity: Option<String>,
    pub date_range: Option<DateRangeSpec>,
    pub compare_date_range: Option<Vec<DateRangeSpec>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DateRangeSpec {
    Absolute([String; 2]),
    Relative(String),
}

impl DateRangeSpec {
    /// Inclusive `(from, to)` literals at the given fractional precision.
    pub fn resolve(&self, now: NaiveDateTime, precision: usize) -> Result<(String, String)> {
        match self {
            DateRangeSpec::Absolute([from, to]) => Ok((
                time::format_from_date(from, precision)?,
                time::format_to_date(to, precision)?,
            )),
            DateRangeSpec::Relative(phrase) => time::resolve_relative_range(phrase, now, precision),
        }
    }
}

// ============================================================================
// Filters
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterSpec {
    And { and: Vec<FilterSpec> },
    Or { or: Vec<FilterSpec> },
    Member(MemberFilter),
}

impl FilterSpec {
    pub fn member(member: &str, operator: FilterOperator, values: Vec<Value>) -> Self {
        FilterSpec::Member(MemberFilter {
            member: Some(member.to_string()),
            dimension: None,
            operator,
            values,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberFilter {
    pub member: Option<String>,
    /// Older clients send `dimension` instead of `member`.
    pub dimension: Option<String>,
    pub operator: FilterOperator,
    #[serde(default)]
    pub values: Vec<Value>,
}

impl MemberFilter {
    pub fn member_path(&self) -> Result<&str> {
        self.member
            .as_deref()
            .or(self.dimension.as_deref())
            .ok_or_else(|| {
                CubePlanError::Validation("member attribute is required for filter".to_string())
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Set,
    NotSet,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    NotContains,
    StartsWith,
    NotStartsWith,
    EndsWith,
    NotEndsWith,
    InDateRange,
    NotInDateRange,
    OnTheDate,
    BeforeDate,
    BeforeOrOnDate,
    AfterDate,
    AfterOrOnDate,
    MeasureFilter,
}

impl FilterOperator {
    pub fn is_date_operator(&self) -> bool {
        matches!(
            self,
            FilterOperator::InDateRange
                | FilterOperator::NotInDateRange
                | FilterOperator::OnTheDate
                | FilterOperator::BeforeDate
                | FilterOperator::BeforeOrOnDate
                | FilterOperator::AfterDate
                | FilterOperator::AfterOrOnDate
        )
    }
}

// ============================================================================
// Order
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Accepts both `{"A.x": "asc"}` and `[["A.x", "asc"]]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderSpec(pub Vec<(String, SortDirection)>);

impl OrderSpec {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for OrderSpec {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawOrder {
            Map(IndexMap<String, SortDirection>),
            List(Vec<(String, SortDirection)>),
        }
        Ok(match RawOrder::deserialize(deserializer)? {
            RawOrder::Map(map) => OrderSpec(map.into_iter().collect()),
            RawOrder::List(list) => OrderSpec(list),
        })
    }
}
