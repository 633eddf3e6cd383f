//! Directed join graph between cubes.
//!
//! Edges run from the cube that declares a join to the joined cube. A join
//! tree for a set of cubes is rooted at whichever cube reaches all the others
//! with the fewest joins; the first such cube wins ties.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::cache::CompilerCache;
use crate::error::{CubePlanError, Result};
use crate::models::{JoinDefinition, JoinRelationship};
use crate::registry::CubeRegistry;

/// Cardinality of a join, read from the declaring cube's side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    /// Each row on the left maps to many rows on the right (1:N)
    OneToMany,
    /// Each row on the left maps to exactly one row on the right (1:1)
    OneToOne,
    /// Many rows on the left map to one row on the right (N:1)
    ManyToOne,
}

impl From<JoinRelationship> for Cardinality {
    fn from(relationship: JoinRelationship) -> Self {
        match relationship {
            JoinRelationship::BelongsTo => Cardinality::ManyToOne,
            JoinRelationship::HasMany => Cardinality::OneToMany,
            JoinRelationship::HasOne => Cardinality::OneToOne,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinEdge {
    pub original_from: String,
    pub original_to: String,
    pub join: JoinDefinition,
}

impl JoinEdge {
    pub fn cardinality(&self) -> Cardinality {
        self.join.relationship.into()
    }

    /// Rows of `cube` get repeated when this edge is joined.
    pub fn multiplies(&self, cube: &str) -> bool {
        match self.cardinality() {
            Cardinality::OneToMany => self.original_from == cube,
            Cardinality::ManyToOne => self.original_to == cube,
            Cardinality::OneToOne => false,
        }
    }

    fn other_side(&self, cube: &str) -> &str {
        if self.original_from == cube {
            &self.original_to
        } else {
            &self.original_from
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTree {
    pub root: String,
    /// In join order: each edge's `original_from` is already part of the tree.
    pub joins: Vec<JoinEdge>,
    pub multiplication_factor: BTreeMap<String, bool>,
}

impl JoinTree {
    /// Root first, then every joined cube in join order.
    pub fn cubes(&self) -> Vec<&str> {
        std::iter::once(self.root.as_str())
            .chain(self.joins.iter().map(|j| j.original_to.as_str()))
            .collect()
    }

    pub fn is_multiplied(&self, cube: &str) -> Result<bool> {
        self.multiplication_factor
            .get(cube)
            .copied()
            .ok_or_else(|| {
                CubePlanError::Internal(format!(
                    "multiplication factor missing for cube '{cube}' joined from '{}'",
                    self.root
                ))
            })
    }
}

#[derive(Debug, Clone)]
pub struct JoinGraph {
    graph: DiGraph<String, JoinDefinition>,
    index: HashMap<String, NodeIndex>,
}

impl JoinGraph {
    pub fn new(registry: &CubeRegistry) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for cube in registry.cubes() {
            index.insert(cube.name.clone(), graph.add_node(cube.name.clone()));
        }
        for cube in registry.cubes() {
            for (target, join) in &cube.joins {
                for side in [cube.name.as_str(), target.as_str()] {
                    if registry.cube(side)?.primary_keys().is_empty() {
                        return Err(CubePlanError::Schema(format!(
                            "primary key for '{side}' is required when join is defined in order to make aggregates work properly"
                        )));
                    }
                }
                let (from, to) = (index[&cube.name], index[target.as_str()]);
                graph.add_edge(from, to, join.clone());
            }
        }
        tracing::debug!(
            cubes = graph.node_count(),
            joins = graph.edge_count(),
            "built join graph"
        );
        Ok(Self { graph, index })
    }

    /// Join tree connecting `cubes`, or `None` when `cubes` is empty.
    pub fn build_join(&self, cubes: &[String]) -> Result<Option<JoinTree>> {
        let mut unique: Vec<&str> = Vec::new();
        for cube in cubes {
            if !self.index.contains_key(cube.as_str()) {
                return Err(CubePlanError::Schema(format!("cube '{cube}' not found")));
            }
            if !unique.contains(&cube.as_str()) {
                unique.push(cube);
            }
        }
        if unique.is_empty() {
            return Ok(None);
        }

        let best = unique
            .iter()
            .filter_map(|root| {
                self.build_tree_for_root(root, &unique)
                    .map(|joins| (root, joins))
            })
            .min_by_key(|(_, joins)| joins.len());

        let (root, joins) = best.ok_or_else(|| {
            let quoted: Vec<String> = unique.iter().map(|c| format!("'{c}'")).collect();
            CubePlanError::Schema(format!(
                "can't find join path to join {}",
                quoted.join(", ")
            ))
        })?;

        let mut tree = JoinTree {
            root: root.to_string(),
            joins,
            multiplication_factor: BTreeMap::new(),
        };
        let members: Vec<String> = tree.cubes().into_iter().map(str::to_string).collect();
        for cube in members {
            let multiplied = find_multiplication_factor_for(&cube, &tree.joins);
            tree.multiplication_factor.insert(cube, multiplied);
        }
        tracing::debug!(
            root = %tree.root,
            joins = tree.joins.len(),
            "selected join tree"
        );
        Ok(Some(tree))
    }

    /// `build_join` memoized in the compiler cache.
    pub fn build_join_cached(
        &self,
        cache: &CompilerCache,
        cubes: &[String],
    ) -> Result<Option<JoinTree>> {
        let mut parts = vec!["join"];
        parts.extend(cubes.iter().map(String::as_str));
        let key = CompilerCache::signature(&parts);
        cache.join_tree(&key, || self.build_join(cubes))
    }

    fn build_tree_for_root(&self, root: &str, cubes: &[&str]) -> Option<Vec<JoinEdge>> {
        let root_idx = self.index[root];
        let mut joined: HashSet<NodeIndex> = HashSet::from([root_idx]);
        let mut joins: Vec<JoinEdge> = Vec::new();
        for target in cubes.iter().filter(|c| **c != root) {
            let target_idx = self.index[*target];
            if joined.contains(&target_idx) {
                continue;
            }
            let path = self.shortest_path(root_idx, target_idx)?;
            for pair in path.windows(2) {
                let (from, to) = (pair[0], pair[1]);
                if joined.contains(&to) {
                    continue;
                }
                let edge = self.graph.find_edge(from, to)?;
                joins.push(JoinEdge {
                    original_from: self.graph[from].clone(),
                    original_to: self.graph[to].clone(),
                    join: self.graph[edge].clone(),
                });
                joined.insert(to);
            }
        }
        Some(joins)
    }

    /// Breadth-first search over declared joins.
    fn shortest_path(&self, from: NodeIndex, to: NodeIndex) -> Option<Vec<NodeIndex>> {
        let mut queue = VecDeque::from([from]);
        let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
        let mut visited: HashSet<NodeIndex> = HashSet::from([from]);

        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut path = vec![to];
                let mut node = to;
                while let Some(prev) = parent.get(&node) {
                    path.push(*prev);
                    node = *prev;
                }
                path.reverse();
                return Some(path);
            }
            // petgraph yields outgoing edges newest first
            let mut neighbors: Vec<NodeIndex> =
                self.graph.edges(current).map(|e| e.target()).collect();
            neighbors.reverse();
            for neighbor in neighbors {
                if visited.insert(neighbor) {
                    parent.insert(neighbor, current);
                    queue.push_back(neighbor);
                }
            }
        }
        None
    }
}

/// Whether rows of `cube` are repeated anywhere in the joined rowset.
pub fn find_multiplication_factor_for(cube: &str, joins: &[JoinEdge]) -> bool {
    fn walk<'a>(current: &'a str, joins: &'a [JoinEdge], visited: &mut HashSet<&'a str>) -> bool {
        if !visited.insert(current) {
            return false;
        }
        let next: Vec<&JoinEdge> = joins
            .iter()
            .filter(|j| j.original_from == current || j.original_to == current)
            .collect();
        if next
            .iter()
            .any(|j| j.multiplies(current) && !visited.contains(j.other_side(current)))
        {
            return true;
        }
        next.iter().any(|j| walk(j.other_side(current), joins, visited))
    }
    walk(cube, joins, &mut HashSet::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CubeDefinition, DimensionDefinition, JoinRelationship, MeasureDefinition};

    fn cube(name: &str) -> CubeDefinition {
        CubeDefinition::new(name, name.to_lowercase())
            .with_dimension("id", DimensionDefinition::number("{CUBE}.id").primary_key())
            .with_measure("count", MeasureDefinition::count())
    }

    fn registry() -> CubeRegistry {
        CubeRegistry::from_cubes(vec![
            cube("Orders")
                .with_join("Users", JoinRelationship::BelongsTo, "{CUBE}.user_id = {Users.id}")
                .with_join("LineItems", JoinRelationship::HasMany, "{CUBE}.id = {LineItems.order_id}"),
            cube("Users"),
            cube("LineItems")
                .with_dimension("order_id", DimensionDefinition::number("{CUBE}.order_id"))
                .with_join("Products", JoinRelationship::BelongsTo, "{CUBE}.product_id = {Products.id}"),
            cube("Products"),
            cube("Island"),
        ])
        .unwrap()
    }

    fn names(cubes: &[&str]) -> Vec<String> {
        cubes.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn picks_root_that_reaches_everything() {
        let graph = JoinGraph::new(&registry()).unwrap();
        let tree = graph
            .build_join(&names(&["Users", "Orders"]))
            .unwrap()
            .unwrap();
        assert_eq!(tree.root, "Orders");
        assert_eq!(tree.cubes(), vec!["Orders", "Users"]);
        assert!(tree.is_multiplied("Users").unwrap());
        assert!(!tree.is_multiplied("Orders").unwrap());
    }

    #[test]
    fn multi_hop_paths_record_intermediate_cubes() {
        let graph = JoinGraph::new(&registry()).unwrap();
        let tree = graph
            .build_join(&names(&["Orders", "Products"]))
            .unwrap()
            .unwrap();
        assert_eq!(tree.cubes(), vec!["Orders", "LineItems", "Products"]);
        assert!(tree.is_multiplied("Orders").unwrap());
        assert!(tree.is_multiplied("Products").unwrap());
        assert!(!tree.is_multiplied("LineItems").unwrap());
    }

    #[test]
    fn unreachable_cubes_fail() {
        let graph = JoinGraph::new(&registry()).unwrap();
        let err = graph
            .build_join(&names(&["Orders", "Island"]))
            .unwrap_err();
        assert!(err.to_string().contains("can't find join path to join 'Orders', 'Island'"));
    }

    #[test]
    fn empty_input_has_no_tree() {
        let graph = JoinGraph::new(&registry()).unwrap();
        assert!(graph.build_join(&[]).unwrap().is_none());
    }

    #[test]
    fn joins_require_primary_keys() {
        let registry = CubeRegistry::from_cubes(vec![
            CubeDefinition::new("A", "a")
                .with_join("B", JoinRelationship::BelongsTo, "{CUBE}.b_id = {B}.id"),
            cube("B"),
        ])
        .unwrap();
        let err = JoinGraph::new(&registry).unwrap_err();
        assert!(err.to_string().contains("primary key for 'A' is required"));
    }

    #[test]
    fn missing_multiplication_factor_is_internal() {
        let graph = JoinGraph::new(&registry()).unwrap();
        let tree = graph.build_join(&names(&["Orders"])).unwrap().unwrap();
        assert!(matches!(
            tree.is_multiplied("Users"),
            Err(CubePlanError::Internal(_))
        ));
    }
}
