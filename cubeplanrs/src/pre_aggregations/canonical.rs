//! Query shape reduced to what rollup matching compares.

use std::collections::BTreeSet;

use crate::error::Result;
use crate::models::DimensionType;
use crate::query_builder::Query;
use crate::registry::MemberKind;
use crate::time::{self, Granularity};

/// A time dimension as a rollup has to store it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct CanonicalTimeDimension {
    pub dimension: String,
    /// Requested granularity, `None` when the dimension only filters.
    pub granularity: Option<Granularity>,
    /// Coarsest granularity the date range is aligned to.
    pub range_granularity: Option<Granularity>,
}

impl CanonicalTimeDimension {
    /// Rollup granularity that reproduces this dimension exactly.
    pub fn expected_granularity(&self) -> Option<Granularity> {
        time::min_granularity_opt(self.granularity, self.range_granularity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalQuery {
    /// Selected dimensions and segments.
    pub sorted_dimensions: Vec<String>,
    /// Dimensions referenced only by filters.
    pub filter_dimensions: Vec<String>,
    pub sorted_time_dimensions: Vec<CanonicalTimeDimension>,
    pub measures: Vec<String>,
    pub leaf_measures: Vec<String>,
    pub has_no_time_dimensions_without_granularity: bool,
    pub all_filters_within_selected_dimensions: bool,
    pub is_additive: bool,
    pub leaf_measure_additive: bool,
    pub has_multiplied_measures: bool,
    pub has_cumulative_measures: bool,
    pub ungrouped: bool,
}

impl CanonicalQuery {
    pub(crate) fn from_query(query: &Query<'_>) -> Result<Self> {
        let registry = query.session.registry;
        let walker = query.session.walker();

        let mut selected: BTreeSet<String> = query.dimensions.iter().map(|d| d.path.clone()).collect();
        selected.extend(query.segments.iter().map(|s| s.path.clone()));

        let mut filtered: BTreeSet<String> = BTreeSet::new();
        for node in &query.filters {
            for leaf in node.leaves() {
                if leaf.kind == MemberKind::Dimension {
                    filtered.insert(leaf.path.clone());
                }
            }
        }

        let mut time_dimensions = Vec::new();
        for td in &query.time_dimensions {
            let range_granularity = match &td.date_range {
                Some((from, to)) => time::date_range_granularity(from, to, query.session.precision)?,
                None => None,
            };
            time_dimensions.push(CanonicalTimeDimension {
                dimension: td.path.clone(),
                granularity: td.granularity,
                range_granularity,
            });
        }
        time_dimensions.sort();
        time_dimensions.dedup();

        let measures = query.all_measures()?;
        let mut leaves: BTreeSet<String> = BTreeSet::new();
        let mut leaf_measure_additive = true;
        for measure in &measures {
            for leaf in walker.leaf_measures(measure)? {
                let additive = if leaf == measure.path {
                    measure.is_additive()
                } else {
                    registry.measure(&leaf)?.measure_type.is_additive()
                };
                leaf_measure_additive &= additive;
                leaves.insert(leaf);
            }
        }

        let classes = query.classify_measures()?;
        let mut has_multiplied_measures = !classes.multiplied.is_empty();
        if let Some(join) = &query.join {
            for leaf in &leaves {
                let (cube, _) = crate::registry::CubeRegistry::split_path(leaf)?;
                has_multiplied_measures |= join.is_multiplied(cube)?;
            }
        }
        let has_time_filter = filtered
            .iter()
            .any(|path| registry.dimension(path).map(|d| d.dimension_type == DimensionType::Time).unwrap_or(false));

        Ok(Self {
            all_filters_within_selected_dimensions: filtered.iter().all(|f| selected.contains(f)),
            filter_dimensions: filtered.difference(&selected).cloned().collect(),
            sorted_dimensions: selected.into_iter().collect(),
            has_no_time_dimensions_without_granularity: !has_time_filter
                && time_dimensions.iter().all(|td| td.granularity.is_some()),
            sorted_time_dimensions: time_dimensions,
            is_additive: measures.iter().all(|m| m.is_additive()),
            measures: measures.iter().map(|m| m.path.clone()).collect::<BTreeSet<_>>().into_iter().collect(),
            leaf_measures: leaves.into_iter().collect(),
            leaf_measure_additive,
            has_multiplied_measures,
            has_cumulative_measures: !classes.cumulative.is_empty(),
            ungrouped: query.ungrouped,
        })
    }
}
