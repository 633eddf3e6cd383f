//! Reference walks over member templates.
//!
//! Every walk is a pure function of the registry and its inputs. Results for
//! registry members are memoized in the compiler cache; walks that depend on a
//! particular join tree are recomputed per query.

use std::collections::HashSet;

use crate::cache::CompilerCache;
use crate::error::{CubePlanError, Result};
use crate::join_graph::JoinTree;
use crate::models::{MeasureDefinition, MeasureType};
use crate::registry::{CubeRegistry, MemberKind, Reference, Symbol};
use crate::template::{self, TemplatePart};

use super::members::MeasureMember;

/// What one member's templates point at directly.
#[derive(Debug, Default)]
struct MemberReferences {
    members: Vec<String>,
    cubes: Vec<String>,
}

/// A measure reached while walking a measure tree, with the measure that referenced it.
#[derive(Debug, Clone)]
struct MeasureEdge {
    parent: Option<String>,
    member: MeasureMember,
}

pub(crate) struct MemberWalker<'a> {
    registry: &'a CubeRegistry,
    cache: &'a CompilerCache,
}

impl<'a> MemberWalker<'a> {
    pub fn new(registry: &'a CubeRegistry, cache: &'a CompilerCache) -> Self {
        Self { registry, cache }
    }

    /// Cubes a registry member needs joined, its own cube first.
    pub fn member_cube_names(&self, path: &str) -> Result<Vec<String>> {
        let key = CompilerCache::signature(&["cube_names", path]);
        self.cache.paths(&key, || {
            let (cube, _) = CubeRegistry::split_path(path)?;
            let mut out = vec![cube.to_string()];
            let mut visited = HashSet::new();
            self.collect_cube_names(path, &mut Vec::new(), &mut visited, &mut out)?;
            Ok(out)
        })
    }

    pub fn measure_cube_names(&self, measure: &MeasureMember) -> Result<Vec<String>> {
        if !measure.expression {
            return self.member_cube_names(&measure.path);
        }
        let refs = self.measure_references(&measure.cube, &measure.definition)?;
        let mut out = vec![measure.cube.clone()];
        push_unique(&mut out, refs.cubes);
        let mut visited = HashSet::new();
        for child in refs.members {
            self.collect_cube_names(&child, &mut vec![measure.path.clone()], &mut visited, &mut out)?;
        }
        Ok(out)
    }

    fn collect_cube_names(
        &self,
        path: &str,
        stack: &mut Vec<String>,
        visited: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) -> Result<()> {
        enter(stack, path)?;
        if visited.insert(path.to_string()) {
            let (cube, _) = CubeRegistry::split_path(path)?;
            push_unique(out, vec![cube.to_string()]);
            let refs = self.references(path)?;
            push_unique(out, refs.cubes);
            for child in refs.members {
                self.collect_cube_names(&child, stack, visited, out)?;
            }
        }
        stack.pop();
        Ok(())
    }

    /// Measures at the bottom of a measure's reference tree.
    pub fn leaf_measures(&self, measure: &MeasureMember) -> Result<Vec<String>> {
        let compute = || {
            let edges = self.measure_edges(measure)?;
            let parents: HashSet<&str> = edges.iter().filter_map(|e| e.parent.as_deref()).collect();
            let mut leaves = Vec::new();
            for edge in &edges {
                if !parents.contains(edge.member.path.as_str()) {
                    push_unique(&mut leaves, vec![edge.member.path.clone()]);
                }
            }
            Ok(leaves)
        };
        if measure.expression {
            return compute();
        }
        let key = CompilerCache::signature(&["leaf_measures", &measure.path]);
        self.cache.paths(&key, compute)
    }

    /// Measures to aggregate on their own, each flagged when its cube's rows fan out.
    ///
    /// A measure mixing several cubes (or wrapping a cumulative measure) is
    /// split into the measures it references so each can be aggregated at its
    /// own grain; otherwise the measure itself is returned.
    pub fn multiplied_measures(
        &self,
        measure: &MeasureMember,
        join: &JoinTree,
    ) -> Result<Vec<(bool, MeasureMember)>> {
        let edges = self.measure_edges(measure)?;

        let composite: HashSet<&str> = edges
            .iter()
            .filter_map(|edge| {
                let parent = edge.parent.as_deref()?;
                let (parent_cube, _) = CubeRegistry::split_path(parent).ok()?;
                (parent_cube != edge.member.cube || edge.member.is_cumulative()).then_some(parent)
            })
            .collect();

        let mut to_render: Vec<(bool, MeasureMember)> = Vec::new();
        for edge in &edges {
            let Some(parent) = edge.parent.as_deref() else {
                continue;
            };
            if composite.contains(parent)
                && !composite.contains(edge.member.path.as_str())
                && !to_render.iter().any(|(_, m)| m.path == edge.member.path)
            {
                to_render.push((result_multiplied(&edge.member, join)?, edge.member.clone()));
            }
        }
        if to_render.is_empty() {
            to_render.push((result_multiplied(measure, join)?, measure.clone()));
        }
        Ok(to_render)
    }

    /// Subquery dimensions a registry member reaches, which need their own joins.
    pub fn member_subquery_dimensions(&self, path: &str) -> Result<Vec<String>> {
        let key = CompilerCache::signature(&["sub_query_dimensions", path]);
        self.cache.paths(&key, || {
            let mut out = Vec::new();
            self.collect_subquery_dimensions(path, &mut Vec::new(), &mut HashSet::new(), &mut out)?;
            Ok(out)
        })
    }

    pub fn measure_subquery_dimensions(&self, measure: &MeasureMember) -> Result<Vec<String>> {
        if !measure.expression {
            return self.member_subquery_dimensions(&measure.path);
        }
        let refs = self.measure_references(&measure.cube, &measure.definition)?;
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        for child in refs.members {
            self.collect_subquery_dimensions(&child, &mut vec![measure.path.clone()], &mut visited, &mut out)?;
        }
        Ok(out)
    }

    fn collect_subquery_dimensions(
        &self,
        path: &str,
        stack: &mut Vec<String>,
        visited: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) -> Result<()> {
        enter(stack, path)?;
        if visited.insert(path.to_string()) {
            let (cube, name) = CubeRegistry::split_path(path)?;
            if let Symbol::Dimension(d) = self.registry.resolve_symbol(cube, name)? {
                if d.sub_query {
                    push_unique(out, vec![path.to_string()]);
                }
            }
            for child in self.references(path)?.members {
                self.collect_subquery_dimensions(&child, stack, visited, out)?;
            }
        }
        stack.pop();
        Ok(())
    }

    /// Pre-order walk over measure-to-measure references, root first.
    fn measure_edges(&self, root: &MeasureMember) -> Result<Vec<MeasureEdge>> {
        let mut edges = vec![MeasureEdge {
            parent: None,
            member: root.clone(),
        }];
        let refs = self.measure_references(&root.cube, &root.definition)?;
        let mut stack = vec![root.path.clone()];
        for child in self.measure_children(refs)? {
            self.collect_measure_edges(&root.path, &child, &mut stack, &mut edges)?;
        }
        Ok(edges)
    }

    fn collect_measure_edges(
        &self,
        parent: &str,
        path: &str,
        stack: &mut Vec<String>,
        edges: &mut Vec<MeasureEdge>,
    ) -> Result<()> {
        enter(stack, path)?;
        let member = MeasureMember::from_path(self.registry, path)?;
        let refs = self.measure_references(&member.cube, &member.definition)?;
        edges.push(MeasureEdge {
            parent: Some(parent.to_string()),
            member,
        });
        for child in self.measure_children(refs)? {
            self.collect_measure_edges(path, &child, stack, edges)?;
        }
        stack.pop();
        Ok(())
    }

    fn measure_children(&self, refs: MemberReferences) -> Result<Vec<String>> {
        let mut children = Vec::new();
        for path in refs.members {
            if self.registry.member_kind(&path)? == MemberKind::Measure {
                children.push(path);
            }
        }
        Ok(children)
    }

    fn references(&self, path: &str) -> Result<MemberReferences> {
        let (cube, name) = CubeRegistry::split_path(path)?;
        match self.registry.resolve_symbol(cube, name)? {
            Symbol::Measure(m) => self.measure_references(cube, m),
            // Rendered by a nested query; nothing it references joins the outer one.
            Symbol::Dimension(d) if d.sub_query => Ok(MemberReferences::default()),
            Symbol::Dimension(d) => {
                let mut templates = vec![d.sql.as_str()];
                if let Some(case) = &d.case {
                    templates.extend(case.when.iter().map(|w| w.sql.as_str()));
                }
                self.template_references(cube, &templates)
            }
            Symbol::Segment(s) => self.template_references(cube, &[s.sql.as_str()]),
        }
    }

    fn measure_references(&self, cube: &str, definition: &MeasureDefinition) -> Result<MemberReferences> {
        let mut templates: Vec<&str> = definition.filters.iter().map(|f| f.sql.as_str()).collect();
        if let Some(sql) = &definition.sql {
            templates.insert(0, sql);
        }
        let mut refs = self.template_references(cube, &templates)?;
        if definition.sql.is_none() {
            push_unique(&mut refs.members, self.registry.primary_keys(cube)?);
        }
        Ok(refs)
    }

    fn template_references(&self, cube: &str, templates: &[&str]) -> Result<MemberReferences> {
        let mut refs = MemberReferences::default();
        for sql in templates {
            for part in template::parse(sql) {
                let TemplatePart::Reference { head, member } = part else {
                    continue;
                };
                match self.registry.resolve_reference(Some(cube), &head, member.as_deref())? {
                    Reference::Cube(name) => push_unique(&mut refs.cubes, vec![name]),
                    Reference::Member { cube, name } => {
                        push_unique(&mut refs.members, vec![format!("{cube}.{name}")])
                    }
                }
            }
        }
        Ok(refs)
    }
}

/// Multiplied, unless the aggregate is immune to repeated rows.
fn result_multiplied(measure: &MeasureMember, join: &JoinTree) -> Result<bool> {
    let multiplied = join.is_multiplied(&measure.cube)?;
    let definition = &measure.definition;
    let immune = match definition.measure_type {
        MeasureType::CountDistinct => true,
        MeasureType::Count => definition.sql.is_none(),
        MeasureType::Number => definition.sql.as_deref().map(str::trim) == Some("count(*)"),
        _ => false,
    };
    Ok(multiplied && !immune)
}

fn enter(stack: &mut Vec<String>, path: &str) -> Result<()> {
    if stack.iter().any(|p| p == path) {
        return Err(CubePlanError::Schema(format!(
            "circular reference detected: {} -> {path}",
            stack.join(" -> ")
        )));
    }
    stack.push(path.to_string());
    Ok(())
}

fn push_unique(out: &mut Vec<String>, items: Vec<String>) {
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join_graph::JoinGraph;
    use crate::models::{CubeDefinition, DimensionDefinition, JoinRelationship};

    fn registry() -> CubeRegistry {
        CubeRegistry::from_cubes(vec![
            CubeDefinition::new("Orders", "orders")
                .with_dimension("id", DimensionDefinition::number("id").primary_key())
                .with_dimension("status", DimensionDefinition::string("status"))
                .with_measure("count", MeasureDefinition::count())
                .with_measure("total", MeasureDefinition::sum("amount"))
                .with_measure(
                    "itemsPerOrder",
                    MeasureDefinition::new(MeasureType::Number, Some("{LineItems.count} / {count}")),
                )
                .with_join("LineItems", JoinRelationship::HasMany, "{CUBE}.id = {LineItems.order_id}"),
            CubeDefinition::new("LineItems", "line_items")
                .with_dimension("id", DimensionDefinition::number("id").primary_key())
                .with_dimension("order_id", DimensionDefinition::number("order_id"))
                .with_measure("count", MeasureDefinition::count()),
        ])
        .unwrap()
    }

    #[test]
    fn cube_names_follow_references() {
        let registry = registry();
        let cache = CompilerCache::new();
        let walker = MemberWalker::new(&registry, &cache);
        assert_eq!(
            walker.member_cube_names("Orders.itemsPerOrder").unwrap(),
            vec!["Orders", "LineItems"]
        );
        // second call is served from the cache
        walker.member_cube_names("Orders.itemsPerOrder").unwrap();
        assert_eq!(cache.stats().0, 1);
    }

    #[test]
    fn composite_measures_split_into_leaves() {
        let registry = registry();
        let cache = CompilerCache::new();
        let walker = MemberWalker::new(&registry, &cache);
        let graph = JoinGraph::new(&registry).unwrap();
        let join = graph
            .build_join(&["Orders".to_string(), "LineItems".to_string()])
            .unwrap()
            .unwrap();
        let root = MeasureMember::from_path(&registry, "Orders.itemsPerOrder").unwrap();
        let split = walker.multiplied_measures(&root, &join).unwrap();
        let flags: Vec<(bool, &str)> = split.iter().map(|(f, m)| (*f, m.path.as_str())).collect();
        // count without sql renders as a distinct key count, so it is never multiplied
        assert_eq!(flags, vec![(false, "LineItems.count"), (false, "Orders.count")]);
        assert_eq!(
            walker.leaf_measures(&root).unwrap(),
            vec!["LineItems.count", "Orders.count"]
        );
    }

    #[test]
    fn sums_on_the_one_side_are_multiplied() {
        let registry = registry();
        let cache = CompilerCache::new();
        let walker = MemberWalker::new(&registry, &cache);
        let graph = JoinGraph::new(&registry).unwrap();
        let join = graph
            .build_join(&["Orders".to_string(), "LineItems".to_string()])
            .unwrap()
            .unwrap();
        let total = MeasureMember::from_path(&registry, "Orders.total").unwrap();
        let split = walker.multiplied_measures(&total, &join).unwrap();
        assert_eq!(split.len(), 1);
        assert!(split[0].0);
    }

    #[test]
    fn cycles_are_schema_errors() {
        let registry = CubeRegistry::from_cubes(vec![CubeDefinition::new("A", "a")
            .with_dimension("x", DimensionDefinition::string("{y}"))
            .with_dimension("y", DimensionDefinition::string("{x}"))])
        .unwrap();
        let cache = CompilerCache::new();
        let walker = MemberWalker::new(&registry, &cache);
        let err = walker.member_cube_names("A.x").unwrap_err();
        assert!(matches!(err, CubePlanError::Schema(_)));
        assert!(err.to_string().contains("circular reference"));
    }
}
