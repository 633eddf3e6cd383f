//! Cube lookup and path resolution.
//!
//! Every member path handed to the compiler is resolved here; an unknown path
//! is always an error rather than an absent value.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;
use indexmap::IndexMap;
use serde::Deserialize;

use crate::error::{CubePlanError, Result};
use crate::models::{
    CubeDefinition, DimensionDefinition, DimensionType, MeasureDefinition, PreAggregationDefinition,
    SegmentDefinition,
};
use crate::template::{self, TemplatePart, SELF_REFERENCE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Measure,
    Dimension,
    Segment,
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemberKind::Measure => "measure",
            MemberKind::Dimension => "dimension",
            MemberKind::Segment => "segment",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Symbol<'a> {
    Measure(&'a MeasureDefinition),
    Dimension(&'a DimensionDefinition),
    Segment(&'a SegmentDefinition),
}

impl Symbol<'_> {
    pub fn kind(&self) -> MemberKind {
        match self {
            Symbol::Measure(_) => MemberKind::Measure,
            Symbol::Dimension(_) => MemberKind::Dimension,
            Symbol::Segment(_) => MemberKind::Segment,
        }
    }
}

/// What a `{...}` template reference points at once resolved against a cube.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Cube(String),
    Member { cube: String, name: String },
}

#[derive(Debug, Deserialize)]
struct CubeFile {
    #[serde(default)]
    cubes: Vec<CubeDefinition>,
}

#[derive(Debug, Default, Clone)]
pub struct CubeRegistry {
    cubes: IndexMap<String, CubeDefinition>,
}

impl CubeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a registry from in-memory definitions.
    pub fn from_cubes(cubes: Vec<CubeDefinition>) -> Result<Self> {
        let mut registry = CubeRegistry::new();
        for cube in cubes {
            registry.insert(cube)?;
        }
        registry.validate()?;
        Ok(registry)
    }

    /// Load every `*.yml`/`*.yaml` file under `root`, each holding a `cubes:` list.
    pub fn load_from_dir<P: AsRef<Path>>(root: P) -> Result<Self> {
        let dir = root.as_ref();
        if !dir.exists() {
            return Err(CubePlanError::Validation(format!(
                "model directory not found: {}",
                dir.display()
            )));
        }
        let mut registry = CubeRegistry::new();
        for pattern in ["*.yml", "*.yaml"] {
            let mut files: Vec<PathBuf> = glob(&format!("{}/{pattern}", dir.display()))
                .map_err(|e| CubePlanError::Other(e.into()))?
                .flatten()
                .collect();
            files.sort();
            for path in files {
                registry.load_file(&path)?;
            }
        }
        registry.validate()?;
        tracing::info!(cubes = registry.cubes.len(), dir = %dir.display(), "loaded cube definitions");
        Ok(registry)
    }

    fn load_file(&mut self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path)?;
        let file: CubeFile = serde_yaml::from_str(&contents)?;
        tracing::debug!(path = %path.display(), cubes = file.cubes.len(), "parsed cube file");
        for cube in file.cubes {
            self.insert(cube)?;
        }
        Ok(())
    }

    fn insert(&mut self, cube: CubeDefinition) -> Result<()> {
        if self.cubes.contains_key(&cube.name) {
            return Err(CubePlanError::Schema(format!(
                "cube '{}' is defined more than once",
                cube.name
            )));
        }
        self.cubes.insert(cube.name.clone(), cube);
        Ok(())
    }

    pub fn cubes(&self) -> impl Iterator<Item = &CubeDefinition> {
        self.cubes.values()
    }

    pub fn has_cube(&self, name: &str) -> bool {
        self.cubes.contains_key(name)
    }

    pub fn cube(&self, name: &str) -> Result<&CubeDefinition> {
        self.cubes
            .get(name)
            .ok_or_else(|| CubePlanError::Schema(format!("cube '{name}' not found")))
    }

    /// `Cube.member` into its two halves.
    pub fn split_path(path: &str) -> Result<(&str, &str)> {
        match path.split_once('.') {
            Some((cube, member)) if !cube.is_empty() && !member.is_empty() && !member.contains('.') => {
                Ok((cube, member))
            }
            _ => Err(CubePlanError::Schema(format!(
                "'{path}' is not a valid member path, expected 'Cube.member'"
            ))),
        }
    }

    pub fn cube_from_path(&self, path: &str) -> Result<&CubeDefinition> {
        let (cube, _) = Self::split_path(path)?;
        self.cube(cube)
    }

    pub fn resolve_symbol(&self, cube: &str, name: &str) -> Result<Symbol<'_>> {
        let def = self.cube(cube)?;
        if let Some(m) = def.measures.get(name) {
            return Ok(Symbol::Measure(m));
        }
        if let Some(d) = def.dimensions.get(name) {
            return Ok(Symbol::Dimension(d));
        }
        if let Some(s) = def.segments.get(name) {
            return Ok(Symbol::Segment(s));
        }
        Err(CubePlanError::Schema(format!(
            "'{name}' not found in cube '{cube}'"
        )))
    }

    /// Resolve `path` and require it to be a member of `kind`.
    pub fn parse_path(&self, kind: MemberKind, path: &str) -> Result<(String, String)> {
        let (cube, name) = Self::split_path(path)?;
        let symbol = self.resolve_symbol(cube, name)?;
        if symbol.kind() != kind {
            return Err(CubePlanError::Schema(format!(
                "'{path}' is a {} but was used as a {kind}",
                symbol.kind()
            )));
        }
        Ok((cube.to_string(), name.to_string()))
    }

    pub fn member_kind(&self, path: &str) -> Result<MemberKind> {
        let (cube, name) = Self::split_path(path)?;
        Ok(self.resolve_symbol(cube, name)?.kind())
    }

    pub fn measure(&self, path: &str) -> Result<&MeasureDefinition> {
        let (cube, name) = Self::split_path(path)?;
        match self.resolve_symbol(cube, name)? {
            Symbol::Measure(m) => Ok(m),
            other => Err(CubePlanError::Schema(format!(
                "'{path}' is a {} but was used as a measure",
                other.kind()
            ))),
        }
    }

    pub fn dimension(&self, path: &str) -> Result<&DimensionDefinition> {
        let (cube, name) = Self::split_path(path)?;
        match self.resolve_symbol(cube, name)? {
            Symbol::Dimension(d) => Ok(d),
            other => Err(CubePlanError::Schema(format!(
                "'{path}' is a {} but was used as a dimension",
                other.kind()
            ))),
        }
    }

    pub fn segment(&self, path: &str) -> Result<&SegmentDefinition> {
        let (cube, name) = Self::split_path(path)?;
        match self.resolve_symbol(cube, name)? {
            Symbol::Segment(s) => Ok(s),
            other => Err(CubePlanError::Schema(format!(
                "'{path}' is a {} but was used as a segment",
                other.kind()
            ))),
        }
    }

    /// Full paths of the primary key dimensions of `cube`.
    pub fn primary_keys(&self, cube: &str) -> Result<Vec<String>> {
        Ok(self
            .cube(cube)?
            .primary_keys()
            .into_iter()
            .map(|pk| format!("{cube}.{pk}"))
            .collect())
    }

    pub fn pre_aggregations_for_cube(
        &self,
        cube: &str,
    ) -> Result<&IndexMap<String, PreAggregationDefinition>> {
        Ok(&self.cube(cube)?.pre_aggregations)
    }

    /// Resolve one `{head}` / `{head.member}` reference written inside `cube`.
    pub fn resolve_reference(
        &self,
        cube: Option<&str>,
        head: &str,
        member: Option<&str>,
    ) -> Result<Reference> {
        let owner = |what: &str| {
            cube.ok_or_else(|| {
                CubePlanError::Schema(format!("'{what}' is referenced outside of a cube context"))
            })
        };
        match (head, member) {
            (SELF_REFERENCE, None) => Ok(Reference::Cube(owner(SELF_REFERENCE)?.to_string())),
            (SELF_REFERENCE, Some(name)) => {
                let cube = owner(SELF_REFERENCE)?;
                self.resolve_symbol(cube, name)?;
                Ok(Reference::Member {
                    cube: cube.to_string(),
                    name: name.to_string(),
                })
            }
            (other_cube, Some(name)) => {
                self.resolve_symbol(other_cube, name)?;
                Ok(Reference::Member {
                    cube: other_cube.to_string(),
                    name: name.to_string(),
                })
            }
            (name, None) => {
                if let Some(current) = cube {
                    if self.resolve_symbol(current, name).is_ok() {
                        return Ok(Reference::Member {
                            cube: current.to_string(),
                            name: name.to_string(),
                        });
                    }
                }
                if self.has_cube(name) {
                    return Ok(Reference::Cube(name.to_string()));
                }
                Err(CubePlanError::Schema(format!(
                    "'{name}' is neither a member of '{}' nor a cube",
                    cube.unwrap_or("<none>")
                )))
            }
        }
    }

    /// Member paths a template written inside `cube` refers to, in order.
    pub fn evaluate_references(&self, cube: &str, sql: &str) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        for part in template::parse(sql) {
            if let TemplatePart::Reference { head, member } = part {
                if let Reference::Member { cube, name } =
                    self.resolve_reference(Some(cube), &head, member.as_deref())?
                {
                    let path = format!("{cube}.{name}");
                    if !paths.contains(&path) {
                        paths.push(path);
                    }
                }
            }
        }
        Ok(paths)
    }

    /// Normalize a pre-aggregation member (`count`, `CUBE.count`, `Users.city`) to a full path.
    pub fn normalize_member(&self, cube: &str, reference: &str) -> Result<String> {
        let stripped = reference.trim().trim_start_matches('{').trim_end_matches('}');
        let (head, member) = match stripped.split_once('.') {
            Some((head, member)) => (head, Some(member)),
            None => (stripped, None),
        };
        match self.resolve_reference(Some(cube), head, member)? {
            Reference::Member { cube, name } => Ok(format!("{cube}.{name}")),
            Reference::Cube(name) => Err(CubePlanError::Schema(format!(
                "'{reference}' in cube '{cube}' names cube '{name}', expected a member"
            ))),
        }
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Check that joins, templates and pre-aggregations only reference known symbols.
    pub fn validate(&self) -> Result<()> {
        for cube in self.cubes.values() {
            self.validate_cube(cube)?;
        }
        Ok(())
    }

    fn validate_cube(&self, cube: &CubeDefinition) -> Result<()> {
        let name = cube.name.as_str();
        if cube.sql_table.is_none() && cube.sql.is_none() {
            return Err(CubePlanError::Schema(format!(
                "cube '{name}' needs either sql_table or sql"
            )));
        }
        for (target, join) in &cube.joins {
            if !self.has_cube(target) {
                return Err(CubePlanError::Schema(format!(
                    "cube '{name}' joins unknown cube '{target}'"
                )));
            }
            self.check_template(name, &join.sql)?;
        }
        for (member, measure) in &cube.measures {
            if let Some(sql) = &measure.sql {
                self.check_template(name, sql).map_err(|e| context(e, name, member))?;
            }
            for filter in &measure.filters {
                self.check_template(name, &filter.sql)
                    .map_err(|e| context(e, name, member))?;
            }
        }
        for (member, dimension) in &cube.dimensions {
            self.check_template(name, &dimension.sql)
                .map_err(|e| context(e, name, member))?;
            if dimension.sub_query && dimension.primary_key {
                return Err(CubePlanError::Schema(format!(
                    "sub query dimension '{name}.{member}' can't be a primary key"
                )));
            }
        }
        for (member, segment) in &cube.segments {
            self.check_template(name, &segment.sql)
                .map_err(|e| context(e, name, member))?;
        }
        for (pre_agg_name, pre_agg) in &cube.pre_aggregations {
            self.validate_pre_aggregation(cube, pre_agg_name, pre_agg)?;
        }
        Ok(())
    }

    fn check_template(&self, cube: &str, sql: &str) -> Result<()> {
        for part in template::parse(sql) {
            if let TemplatePart::Reference { head, member } = part {
                self.resolve_reference(Some(cube), &head, member.as_deref())?;
            }
        }
        Ok(())
    }

    fn validate_pre_aggregation(
        &self,
        cube: &CubeDefinition,
        pre_agg_name: &str,
        pre_agg: &PreAggregationDefinition,
    ) -> Result<()> {
        let owner = cube.name.as_str();
        let label = format!("{owner}.{pre_agg_name}");
        let expect = |reference: &str, kind: MemberKind| -> Result<String> {
            let path = self.normalize_member(owner, reference)?;
            let actual = self.member_kind(&path)?;
            if actual != kind {
                return Err(CubePlanError::Schema(format!(
                    "pre-aggregation '{label}' lists '{path}' as a {kind} but it is a {actual}"
                )));
            }
            Ok(path)
        };
        for m in &pre_agg.measures {
            expect(m, MemberKind::Measure)?;
        }
        for d in &pre_agg.dimensions {
            expect(d, MemberKind::Dimension)?;
        }
        for s in &pre_agg.segments {
            expect(s, MemberKind::Segment)?;
        }
        if let Some(td) = &pre_agg.time_dimension {
            let path = expect(td, MemberKind::Dimension)?;
            if self.dimension(&path)?.dimension_type != DimensionType::Time {
                return Err(CubePlanError::Schema(format!(
                    "pre-aggregation '{label}' time dimension '{path}' is not of type time"
                )));
            }
        }
        Ok(())
    }
}

fn context(err: CubePlanError, cube: &str, member: &str) -> CubePlanError {
    match err {
        CubePlanError::Schema(msg) => CubePlanError::Schema(format!("{cube}.{member}: {msg}")),
        other => other,
    }
}
