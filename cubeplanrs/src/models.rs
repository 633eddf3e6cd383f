//! Cube definitions as consumed by the compiler.
//!
//! Member maps keep declaration order, which drives pre-aggregation
//! precedence and default aliases.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::time::Granularity;

fn default_data_source() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CubeDefinition {
    pub name: String,
    /// Plain table reference, used verbatim in FROM.
    pub sql_table: Option<String>,
    /// Arbitrary SELECT, wrapped in parentheses in FROM.
    pub sql: Option<String>,
    /// Replaces the cube name when deriving member aliases.
    pub sql_alias: Option<String>,
    #[serde(default = "default_data_source")]
    pub data_source: String,
    pub refresh_key: Option<RefreshKey>,
    #[serde(default)]
    pub measures: IndexMap<String, MeasureDefinition>,
    #[serde(default)]
    pub dimensions: IndexMap<String, DimensionDefinition>,
    #[serde(default)]
    pub segments: IndexMap<String, SegmentDefinition>,
    #[serde(default)]
    pub joins: IndexMap<String, JoinDefinition>,
    #[serde(default)]
    pub pre_aggregations: IndexMap<String, PreAggregationDefinition>,
    pub description: Option<String>,
}

impl CubeDefinition {
    pub fn new(name: impl Into<String>, sql_table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_table: Some(sql_table.into()),
            sql: None,
            sql_alias: None,
            data_source: default_data_source(),
            refresh_key: None,
            measures: IndexMap::new(),
            dimensions: IndexMap::new(),
            segments: IndexMap::new(),
            joins: IndexMap::new(),
            pre_aggregations: IndexMap::new(),
            description: None,
        }
    }

    pub fn with_measure(mut self, name: &str, measure: MeasureDefinition) -> Self {
        self.measures.insert(name.to_string(), measure);
        self
    }

    pub fn with_dimension(mut self, name: &str, dimension: DimensionDefinition) -> Self {
        self.dimensions.insert(name.to_string(), dimension);
        self
    }

    pub fn with_segment(mut self, name: &str, sql: &str) -> Self {
        self.segments.insert(
            name.to_string(),
            SegmentDefinition {
                sql: sql.to_string(),
                description: None,
            },
        );
        self
    }

    pub fn with_join(mut self, target: &str, relationship: JoinRelationship, sql: &str) -> Self {
        self.joins.insert(
            target.to_string(),
            JoinDefinition {
                relationship,
                sql: sql.to_string(),
            },
        );
        self
    }

    pub fn with_pre_aggregation(mut self, name: &str, pre_agg: PreAggregationDefinition) -> Self {
        self.pre_aggregations.insert(name.to_string(), pre_agg);
        self
    }

    /// Names of the dimensions flagged as primary key, in declaration order.
    pub fn primary_keys(&self) -> Vec<&str> {
        self.dimensions
            .iter()
            .filter(|(_, d)| d.primary_key)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

// ============================================================================
// Measures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureType {
    Count,
    CountDistinct,
    CountDistinctApprox,
    Sum,
    Avg,
    Min,
    Max,
    RunningTotal,
    Number,
    String,
    Time,
    Boolean,
}

impl MeasureType {
    /// Re-aggregating partial results with the same function is exact.
    pub fn is_additive(&self) -> bool {
        matches!(
            self,
            MeasureType::Sum
                | MeasureType::Count
                | MeasureType::CountDistinctApprox
                | MeasureType::Min
                | MeasureType::Max
        )
    }

    /// Expression over other measures rather than an aggregate of its own.
    pub fn is_calculated(&self) -> bool {
        matches!(
            self,
            MeasureType::Number | MeasureType::String | MeasureType::Time | MeasureType::Boolean
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MeasureType::Count => "count",
            MeasureType::CountDistinct => "countDistinct",
            MeasureType::CountDistinctApprox => "countDistinctApprox",
            MeasureType::Sum => "sum",
            MeasureType::Avg => "avg",
            MeasureType::Min => "min",
            MeasureType::Max => "max",
            MeasureType::RunningTotal => "runningTotal",
            MeasureType::Number => "number",
            MeasureType::String => "string",
            MeasureType::Time => "time",
            MeasureType::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureDefinition {
    pub sql: Option<String>,
    #[serde(rename = "type")]
    pub measure_type: MeasureType,
    #[serde(default)]
    pub filters: Vec<MeasureFilter>,
    pub rolling_window: Option<RollingWindow>,
    pub description: Option<String>,
}

impl MeasureDefinition {
    pub fn new(measure_type: MeasureType, sql: Option<&str>) -> Self {
        Self {
            sql: sql.map(str::to_string),
            measure_type,
            filters: Vec::new(),
            rolling_window: None,
            description: None,
        }
    }

    pub fn count() -> Self {
        Self::new(MeasureType::Count, None)
    }

    pub fn sum(sql: &str) -> Self {
        Self::new(MeasureType::Sum, Some(sql))
    }

    pub fn with_filter(mut self, sql: &str) -> Self {
        self.filters.push(MeasureFilter {
            sql: sql.to_string(),
        });
        self
    }

    pub fn with_rolling_window(mut self, window: RollingWindow) -> Self {
        self.rolling_window = Some(window);
        self
    }

    /// Running totals and rolling windows need a date series to be computed.
    pub fn is_cumulative(&self) -> bool {
        self.measure_type == MeasureType::RunningTotal || self.rolling_window.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasureFilter {
    pub sql: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowOffset {
    Start,
    #[default]
    End,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollingWindow {
    /// Interval or `unbounded`.
    pub trailing: Option<String>,
    pub leading: Option<String>,
    #[serde(default)]
    pub offset: WindowOffset,
}

// ============================================================================
// Dimensions and segments
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DimensionType {
    String,
    Number,
    Time,
    Boolean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimensionDefinition {
    pub sql: String,
    #[serde(rename = "type")]
    pub dimension_type: DimensionType,
    #[serde(default)]
    pub primary_key: bool,
    /// Computes a measure per row of the owning cube through a nested query.
    #[serde(default)]
    pub sub_query: bool,
    #[serde(default)]
    pub propagate_filters_to_sub_query: bool,
    pub case: Option<CaseDefinition>,
    pub description: Option<String>,
}

impl DimensionDefinition {
    pub fn new(dimension_type: DimensionType, sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            dimension_type,
            primary_key: false,
            sub_query: false,
            propagate_filters_to_sub_query: false,
            case: None,
            description: None,
        }
    }

    pub fn string(sql: &str) -> Self {
        Self::new(DimensionType::String, sql)
    }

    pub fn time(sql: &str) -> Self {
        Self::new(DimensionType::Time, sql)
    }

    pub fn number(sql: &str) -> Self {
        Self::new(DimensionType::Number, sql)
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn sub_query(mut self) -> Self {
        self.sub_query = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseDefinition {
    pub when: Vec<CaseWhen>,
    #[serde(rename = "else")]
    pub else_label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseWhen {
    pub sql: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentDefinition {
    pub sql: String,
    pub description: Option<String>,
}

// ============================================================================
// Joins
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinRelationship {
    #[serde(alias = "many_to_one")]
    BelongsTo,
    #[serde(alias = "one_to_many")]
    HasMany,
    #[serde(alias = "one_to_one")]
    HasOne,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinDefinition {
    pub relationship: JoinRelationship,
    /// ON condition, referencing both cubes through `{CUBE}` / `{Other}`.
    pub sql: String,
}

// ============================================================================
// Pre-aggregations and refresh keys
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "String")]
pub enum PreAggregationType {
    #[default]
    Rollup,
    OriginalSql,
    AutoRollup,
}

impl TryFrom<String> for PreAggregationType {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.as_str() {
            "rollup" => Ok(PreAggregationType::Rollup),
            "originalSql" | "original_sql" => Ok(PreAggregationType::OriginalSql),
            "autoRollup" | "auto_rollup" => Ok(PreAggregationType::AutoRollup),
            other => Err(format!("unknown pre-aggregation type '{other}'")),
        }
    }
}

impl PreAggregationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreAggregationType::Rollup => "rollup",
            PreAggregationType::OriginalSql => "originalSql",
            PreAggregationType::AutoRollup => "autoRollup",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreAggregationDefinition {
    #[serde(rename = "type", default)]
    pub pre_aggregation_type: PreAggregationType,
    /// Member names, either bare (`count`) or full paths (`Orders.count`).
    #[serde(default)]
    pub measures: Vec<String>,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub segments: Vec<String>,
    pub time_dimension: Option<String>,
    pub granularity: Option<Granularity>,
    pub partition_granularity: Option<Granularity>,
    pub refresh_key: Option<RefreshKey>,
    pub external: Option<bool>,
    #[serde(default)]
    pub use_original_sql_pre_aggregations: bool,
}

impl PreAggregationDefinition {
    pub fn rollup(measures: &[&str], dimensions: &[&str]) -> Self {
        Self {
            measures: measures.iter().map(|m| m.to_string()).collect(),
            dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_time_dimension(mut self, dimension: &str, granularity: Granularity) -> Self {
        self.time_dimension = Some(dimension.to_string());
        self.granularity = Some(granularity);
        self
    }

    pub fn partitioned_by(mut self, granularity: Granularity) -> Self {
        self.partition_granularity = Some(granularity);
        self
    }

    pub fn with_refresh_key(mut self, refresh_key: RefreshKey) -> Self {
        self.refresh_key = Some(refresh_key);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshKey {
    pub sql: Option<String>,
    /// Duration such as `1 hour`.
    pub every: Option<String>,
    #[serde(default)]
    pub incremental: bool,
    pub update_window: Option<String>,
}
