//! Resolved query members.
//!
//! Each member owns a copy of its definition so nested queries can be
//! assembled from members that never existed in the registry, such as the
//! expression measure behind a subquery dimension.

use crate::error::{CubePlanError, Result};
use crate::models::{DimensionType, MeasureDefinition, MeasureType};
use crate::registry::CubeRegistry;
use crate::time::Granularity;

#[derive(Debug, Clone)]
pub(crate) struct MeasureMember {
    pub path: String,
    pub cube: String,
    pub name: String,
    pub definition: MeasureDefinition,
    /// Built from a subquery dimension rather than declared on the cube.
    pub expression: bool,
}

impl MeasureMember {
    pub fn from_path(registry: &CubeRegistry, path: &str) -> Result<Self> {
        let definition = registry.measure(path)?.clone();
        let (cube, name) = CubeRegistry::split_path(path)?;
        Ok(Self {
            path: path.to_string(),
            cube: cube.to_string(),
            name: name.to_string(),
            definition,
            expression: false,
        })
    }

    /// Measure computing a subquery dimension's SQL over its referenced measures.
    pub fn expression(cube: &str, name: &str, sql: &str) -> Self {
        Self {
            path: format!("{cube}.{name}"),
            cube: cube.to_string(),
            name: name.to_string(),
            definition: MeasureDefinition::new(MeasureType::Number, Some(sql)),
            expression: true,
        }
    }

    pub fn is_cumulative(&self) -> bool {
        self.definition.is_cumulative()
    }

    pub fn is_additive(&self) -> bool {
        self.definition.measure_type.is_additive()
    }

    /// Finest unit of the rolling window, when it has bounded edges.
    pub fn window_granularity(&self) -> Result<Option<Granularity>> {
        let Some(window) = &self.definition.rolling_window else {
            return Ok(None);
        };
        let mut granularity = None;
        for edge in [&window.trailing, &window.leading].into_iter().flatten() {
            if edge == "unbounded" {
                continue;
            }
            let unit = crate::time::SqlInterval::parse(edge)?.granularity();
            granularity = crate::time::min_granularity_opt(granularity, Some(unit));
        }
        Ok(granularity)
    }

    /// Non-additive rolling windows re-aggregate raw rows instead of grouped ones.
    pub fn should_ungroup_for_cumulative(&self) -> bool {
        self.definition.rolling_window.is_some() && !self.is_additive()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct DimensionMember {
    pub path: String,
    pub cube: String,
    pub name: String,
    pub kind: DimensionSource,
}

/// Segments are selected as 0/1 columns when a rollup stores them.
#[derive(Debug, Clone)]
pub(crate) enum DimensionSource {
    Dimension,
    Segment,
}

impl DimensionMember {
    pub fn from_path(registry: &CubeRegistry, path: &str, allow_segments: bool) -> Result<Self> {
        let (cube, name) = CubeRegistry::split_path(path)?;
        let kind = match registry.dimension(path) {
            Ok(_) => DimensionSource::Dimension,
            Err(_) if allow_segments && registry.segment(path).is_ok() => DimensionSource::Segment,
            Err(err) => return Err(err),
        };
        Ok(Self {
            path: path.to_string(),
            cube: cube.to_string(),
            name: name.to_string(),
            kind,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TimeDimensionMember {
    pub path: String,
    pub cube: String,
    pub name: String,
    pub granularity: Option<Granularity>,
    /// Normalized inclusive bounds.
    pub date_range: Option<(String, String)>,
}

impl TimeDimensionMember {
    pub fn new(
        registry: &CubeRegistry,
        path: &str,
        granularity: Option<Granularity>,
        date_range: Option<(String, String)>,
    ) -> Result<Self> {
        let definition = registry.dimension(path)?;
        if definition.dimension_type != DimensionType::Time {
            return Err(CubePlanError::Validation(format!(
                "'{path}' is used as a time dimension but is of type {:?}",
                definition.dimension_type
            )));
        }
        let (cube, name) = CubeRegistry::split_path(path)?;
        Ok(Self {
            path: path.to_string(),
            cube: cube.to_string(),
            name: name.to_string(),
            granularity,
            date_range,
        })
    }

    /// `Cube.member.granularity`, the key callers use to map aliases back.
    pub fn expression_path(&self) -> String {
        match self.granularity {
            Some(g) => format!("{}.{g}", self.path),
            None => self.path.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SegmentMember {
    pub path: String,
    pub cube: String,
    pub name: String,
}

impl SegmentMember {
    pub fn from_path(registry: &CubeRegistry, path: &str) -> Result<Self> {
        registry.segment(path)?;
        let (cube, name) = CubeRegistry::split_path(path)?;
        Ok(Self {
            path: path.to_string(),
            cube: cube.to_string(),
            name: name.to_string(),
        })
    }
}
