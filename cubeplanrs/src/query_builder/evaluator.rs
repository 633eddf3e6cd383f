//! Symbol evaluation: member templates to SQL under a render context.

use inflector::Inflector;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{CubePlanError, Result};
use crate::models::{CaseDefinition, DimensionDefinition, MeasureDefinition, MeasureType};
use crate::registry::{Reference, Symbol};
use crate::sql_ast::conjunction;
use crate::template::{self, TemplatePart};

use super::context::RenderContext;
use super::members::{DimensionMember, DimensionSource, MeasureMember, TimeDimensionMember};
use super::query::Query;

static BARE_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[_a-zA-Z][_a-zA-Z0-9]*$").expect("valid identifier regex"));

static SELECT_STAR_FROM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^\s*select\s+\*\s+from\s+([a-zA-Z0-9_\-`".*]+)\s*$"#)
        .expect("valid select star regex")
});

impl<'a> Query<'a> {
    // ------------------------------------------------------------------------
    // Naming
    // ------------------------------------------------------------------------

    /// Column alias for a member path: `Orders.createdAt` -> `orders__created_at`.
    pub(crate) fn alias_name(&self, path: &str) -> Result<String> {
        let mut segments: Vec<String> = Vec::new();
        for (i, part) in path.split('.').enumerate() {
            let part = if i == 0 {
                self.session
                    .registry
                    .cube(part)
                    .ok()
                    .and_then(|cube| cube.sql_alias.as_deref())
                    .unwrap_or(part)
            } else {
                part
            };
            segments.push(part.to_snake_case());
        }
        self.checked_alias(segments.join("__"))
    }

    pub(crate) fn checked_alias(&self, alias: String) -> Result<String> {
        let max = self.session.max_identifier_length;
        if alias.len() > max {
            return Err(CubePlanError::Validation(format!(
                "alias '{alias}' exceeds the {max} character identifier limit of {}",
                self.session.dialect.name()
            )));
        }
        Ok(alias)
    }

    pub(crate) fn escaped_alias(&self, path: &str) -> Result<String> {
        Ok(self.session.dialect.quote_ident(&self.alias_name(path)?))
    }

    pub(crate) fn time_dimension_alias(&self, td: &TimeDimensionMember) -> Result<String> {
        let base = self.alias_name(&td.path)?;
        match td.granularity {
            Some(g) => self.checked_alias(format!("{base}_{g}")),
            None => Ok(base),
        }
    }

    /// Unquoted table alias of a cube, prefixed inside nested pieces.
    pub(crate) fn cube_alias_name(&self, cube: &str, ctx: &RenderContext) -> Result<String> {
        let base = self.alias_name(cube)?;
        match &ctx.cube_alias_prefix {
            Some(prefix) => self.checked_alias(format!("{}__{base}", prefix.to_snake_case())),
            None => Ok(base),
        }
    }

    pub(crate) fn cube_alias(&self, cube: &str, ctx: &RenderContext) -> Result<String> {
        Ok(self.session.dialect.quote_ident(&self.cube_alias_name(cube, ctx)?))
    }

    /// FROM source of a cube: an originalSql table, its table, or its SQL.
    pub(crate) fn cube_sql(&self, cube: &str, ctx: &RenderContext) -> Result<String> {
        if let Some(table) = self.original_sql_tables.get(cube) {
            return Ok(table.clone());
        }
        let definition = self.session.registry.cube(cube)?;
        if let Some(table) = &definition.sql_table {
            return self.evaluate_template(cube, table, ctx);
        }
        let sql = definition.sql.as_deref().ok_or_else(|| {
            CubePlanError::Schema(format!("cube '{cube}' needs either sql_table or sql"))
        })?;
        let evaluated = self.evaluate_template(cube, sql, ctx)?;
        if let Some(cap) = SELECT_STAR_FROM.captures(&evaluated) {
            return Ok(cap[1].to_string());
        }
        Ok(format!("({evaluated})"))
    }

    fn auto_prefix(&self, cube: &str, sql: String, ctx: &RenderContext) -> Result<String> {
        if BARE_IDENTIFIER.is_match(&sql) {
            return Ok(format!("{}.{sql}", self.cube_alias(cube, ctx)?));
        }
        Ok(sql)
    }

    // ------------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------------

    /// Replace every `{...}` reference in a template written inside `cube`.
    pub(crate) fn evaluate_template(&self, cube: &str, sql: &str, ctx: &RenderContext) -> Result<String> {
        let mut out = String::with_capacity(sql.len());
        for part in template::parse(sql) {
            match part {
                TemplatePart::Text(text) => out.push_str(&text),
                TemplatePart::Reference { head, member } => {
                    let reference =
                        self.session
                            .registry
                            .resolve_reference(Some(cube), &head, member.as_deref())?;
                    let rendered = match reference {
                        Reference::Cube(name) => self.cube_alias(&name, ctx)?,
                        Reference::Member { cube, name } => self.render_member(&cube, &name, ctx)?,
                    };
                    out.push_str(&rendered);
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn render_member(&self, cube: &str, name: &str, ctx: &RenderContext) -> Result<String> {
        match self.session.registry.resolve_symbol(cube, name)? {
            Symbol::Measure(m) => self.render_measure(cube, name, m, ctx),
            Symbol::Dimension(d) => self.render_dimension(cube, name, d, ctx),
            Symbol::Segment(s) => {
                let path = format!("{cube}.{name}");
                if let Some(sql) = ctx.reference(&path) {
                    return Ok(sql.clone());
                }
                let ctx = ctx.visit(&path)?;
                let sql = self.evaluate_template(cube, &s.sql, &ctx)?;
                self.auto_prefix(cube, sql, &ctx)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Dimensions
    // ------------------------------------------------------------------------

    fn render_dimension(
        &self,
        cube: &str,
        name: &str,
        definition: &DimensionDefinition,
        ctx: &RenderContext,
    ) -> Result<String> {
        let path = format!("{cube}.{name}");
        if let Some(sql) = ctx.reference(&path) {
            return Ok(sql.clone());
        }
        if definition.sub_query {
            let dialect = self.session.dialect;
            let alias = self.subquery_alias(cube, name)?;
            return Ok(format!(
                "{}.{}",
                dialect.quote_ident(&alias),
                self.escaped_alias(&path)?
            ));
        }
        let ctx = ctx.visit(&path)?;
        if let Some(case) = &definition.case {
            return self.case_when_statement(cube, case, &ctx);
        }
        let sql = self.evaluate_template(cube, &definition.sql, &ctx)?;
        self.auto_prefix(cube, sql, &ctx)
    }

    fn case_when_statement(&self, cube: &str, case: &CaseDefinition, ctx: &RenderContext) -> Result<String> {
        let dialect = self.session.dialect;
        let mut sql = String::from("CASE");
        for when in &case.when {
            let condition = self.evaluate_template(cube, &when.sql, ctx)?;
            sql.push_str(&format!(
                " WHEN {condition} THEN {}",
                dialect.render_literal(&Value::String(when.label.clone()))
            ));
        }
        if let Some(label) = &case.else_label {
            sql.push_str(&format!(
                " ELSE {}",
                dialect.render_literal(&Value::String(label.clone()))
            ));
        }
        sql.push_str(" END");
        Ok(sql)
    }

    /// Table alias of the nested query computing a subquery dimension.
    pub(crate) fn subquery_alias(&self, cube: &str, name: &str) -> Result<String> {
        self.alias_name(&format!("{cube}_{name}_subquery"))
    }

    /// Select expression of a dimension column.
    pub(crate) fn dimension_select_sql(&self, dimension: &DimensionMember, ctx: &RenderContext) -> Result<String> {
        match &dimension.kind {
            DimensionSource::Dimension => self.render_member(&dimension.cube, &dimension.name, ctx),
            DimensionSource::Segment => {
                let condition = self.render_member(&dimension.cube, &dimension.name, ctx)?;
                Ok(format!("CASE WHEN {condition} THEN 1 ELSE 0 END"))
            }
        }
    }

    /// Time dimension column converted to the query timezone and truncated.
    pub(crate) fn time_dimension_select_sql(
        &self,
        td: &TimeDimensionMember,
        ctx: &RenderContext,
    ) -> Result<String> {
        let dialect = self.session.dialect;
        if ctx.rollup_query {
            let column = self.render_member(&td.cube, &td.name, ctx)?;
            return Ok(match td.granularity {
                Some(g) if ctx.rollup_granularity != Some(g) => dialect.time_grouped_column(g, &column),
                _ => column,
            });
        }
        let converted = self.converted_time_dimension(td, ctx)?;
        if ctx.ungrouped {
            return Ok(converted);
        }
        match ctx.granularity_override.or(td.granularity) {
            Some(g) => Ok(dialect.time_grouped_column(g, &converted)),
            None => Ok(converted),
        }
    }

    pub(crate) fn converted_time_dimension(&self, td: &TimeDimensionMember, ctx: &RenderContext) -> Result<String> {
        let column = self.render_member(&td.cube, &td.name, ctx)?;
        if ctx.reference(&td.path).is_some() {
            return Ok(column);
        }
        Ok(self.session.dialect.convert_tz(&column, &self.timezone))
    }

    // ------------------------------------------------------------------------
    // Measures
    // ------------------------------------------------------------------------

    pub(crate) fn render_measure_member(&self, measure: &MeasureMember, ctx: &RenderContext) -> Result<String> {
        self.render_measure(&measure.cube, &measure.name, &measure.definition, ctx)
    }

    fn render_measure(
        &self,
        cube: &str,
        name: &str,
        definition: &MeasureDefinition,
        ctx: &RenderContext,
    ) -> Result<String> {
        let path = format!("{cube}.{name}");
        if let Some(sql) = ctx.reference(&path) {
            return Ok(sql.clone());
        }
        let ctx = ctx.visit(&path)?;
        let evaluated = self.measure_expression(cube, definition, &ctx)?;
        let measure_type = definition.measure_type;

        if ctx.ungrouped {
            return Ok(if evaluated == "*" { "1".to_string() } else { evaluated });
        }
        if self.ungrouped {
            return Ok(match measure_type {
                MeasureType::Count | MeasureType::CountDistinct | MeasureType::CountDistinctApprox => {
                    self.apply_measure_filters(cube, definition, "1".to_string(), &ctx)?
                }
                _ => evaluated,
            });
        }
        if let Some(column) = ctx.ungrouped_aliases_for_cumulative.get(&path) {
            if let Some(sql) = self.aggregate_on_grouped_column(measure_type, column)? {
                return Ok(sql);
            }
            return self.aggregate(cube, definition, column.clone(), &ctx);
        }
        self.aggregate(cube, definition, evaluated, &ctx)
    }

    fn aggregate(
        &self,
        cube: &str,
        definition: &MeasureDefinition,
        sql: String,
        ctx: &RenderContext,
    ) -> Result<String> {
        let dialect = self.session.dialect;
        let multiplied = self.multiplied(cube)?;
        match definition.measure_type {
            MeasureType::CountDistinctApprox => {
                if ctx.over_time_series_aggregate || self.options.pre_aggregation_query {
                    dialect.hll_init(&sql)
                } else {
                    dialect.count_distinct_approx(&sql)
                }
            }
            MeasureType::CountDistinct => Ok(format!("count(distinct {sql})")),
            MeasureType::Count if definition.sql.is_none() && multiplied => {
                Ok(format!("count(distinct {sql})"))
            }
            MeasureType::RunningTotal => Ok(format!("sum({sql})")),
            MeasureType::Number if multiplied && sql.trim() == "count(*)" => {
                self.primary_key_count(cube, ctx)
            }
            t if t.is_calculated() => Ok(sql),
            t => Ok(format!("{}({sql})", t.as_str())),
        }
    }

    /// Re-aggregation of an already grouped column, when exact.
    pub(crate) fn aggregate_on_grouped_column(&self, measure_type: MeasureType, column: &str) -> Result<Option<String>> {
        Ok(match measure_type {
            MeasureType::Count | MeasureType::Sum => Some(format!("sum({column})")),
            MeasureType::CountDistinctApprox => Some(self.session.dialect.hll_merge(column)?),
            MeasureType::Min | MeasureType::Max => Some(format!("{}({column})", measure_type.as_str())),
            _ => None,
        })
    }

    /// Measure SQL before aggregation, with its filters applied.
    fn measure_expression(&self, cube: &str, definition: &MeasureDefinition, ctx: &RenderContext) -> Result<String> {
        let sql = match &definition.sql {
            Some(sql) => {
                let evaluated = self.evaluate_template(cube, sql, ctx)?;
                self.auto_prefix(cube, evaluated, ctx)?
            }
            None => self.primary_key_sql(cube, ctx)?,
        };
        self.apply_measure_filters(cube, definition, sql, ctx)
    }

    fn apply_measure_filters(
        &self,
        cube: &str,
        definition: &MeasureDefinition,
        sql: String,
        ctx: &RenderContext,
    ) -> Result<String> {
        if definition.filters.is_empty() {
            return Ok(sql);
        }
        let conditions = definition
            .filters
            .iter()
            .map(|f| self.evaluate_template(cube, &f.sql, ctx))
            .collect::<Result<Vec<_>>>()?;
        let value = if sql == "*" { "1".to_string() } else { sql };
        Ok(format!("CASE WHEN {} THEN {value} END", conjunction(&conditions)))
    }

    /// Primary key expression; composite keys are concatenated as text.
    pub(crate) fn primary_key_sql(&self, cube: &str, ctx: &RenderContext) -> Result<String> {
        let definition = self.session.registry.cube(cube)?;
        let keys = definition.primary_keys();
        match keys.as_slice() {
            [] => Ok("*".to_string()),
            [single] => self.render_member(cube, single, ctx),
            many => {
                let dialect = self.session.dialect;
                let parts = many
                    .iter()
                    .map(|pk| Ok(dialect.cast_to_string(&self.render_member(cube, pk, ctx)?)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(dialect.concat_strings(&parts))
            }
        }
    }

    fn primary_key_count(&self, cube: &str, ctx: &RenderContext) -> Result<String> {
        Ok(format!("count(distinct {})", self.primary_key_sql(cube, ctx)?))
    }
}
