//! Bound-parameter bookkeeping.
//!
//! Values are minted into opaque `$N$` tokens while SQL is generated. Only the
//! final serialization replaces tokens with dialect placeholders, numbering
//! them in the order they appear in the text rather than allocation order.

use std::cell::RefCell;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::dialect::Dialect;
use crate::error::{CubePlanError, Result};

static PARAM_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(\d+)\$").expect("valid param token regex"));

/// Shared by a root compilation and every nested sub-compilation it spawns.
#[derive(Debug, Default)]
pub struct ParamAllocator {
    values: RefCell<Vec<Value>>,
}

impl ParamAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_param(&self, value: impl Into<Value>) -> String {
        let mut values = self.values.borrow_mut();
        values.push(value.into());
        format!("${}$", values.len() - 1)
    }

    /// Replace each `?` in a template with a freshly allocated token.
    pub fn allocate_params_for_template(&self, template: &str, values: &[Value]) -> Result<String> {
        let expected = template.matches('?').count();
        if expected != values.len() {
            return Err(CubePlanError::Internal(format!(
                "template '{template}' expects {expected} params but {} were supplied",
                values.len()
            )));
        }
        let mut rendered = String::with_capacity(template.len());
        let mut remaining = values.iter();
        for ch in template.chars() {
            if ch == '?' {
                let value = remaining.next().cloned().unwrap_or(Value::Null);
                rendered.push_str(&self.allocate_param(value));
            } else {
                rendered.push(ch);
            }
        }
        Ok(rendered)
    }

    pub fn allocated(&self) -> usize {
        self.values.borrow().len()
    }

    /// Turn token-annotated SQL into final SQL plus ordered params.
    ///
    /// A token that appears twice is bound twice, so placeholder `i` always
    /// maps to `params[i]`.
    pub fn build_sql_and_params(
        &self,
        annotated: &str,
        dialect: &dyn Dialect,
    ) -> Result<(String, Vec<Value>)> {
        let values = self.values.borrow();
        let mut params = Vec::new();
        let mut sql = String::with_capacity(annotated.len());
        let mut last = 0;
        for cap in PARAM_TOKEN.captures_iter(annotated) {
            let whole = cap.get(0).ok_or_else(|| {
                CubePlanError::Internal("param token without a match".to_string())
            })?;
            let index: usize = cap[1]
                .parse()
                .map_err(|_| CubePlanError::Internal(format!("bad param token {}", &cap[0])))?;
            let value = values.get(index).ok_or_else(|| {
                CubePlanError::Internal(format!("param token {} was never allocated", &cap[0]))
            })?;
            sql.push_str(&annotated[last..whole.start()]);
            sql.push_str(&dialect.placeholder(params.len()));
            params.push(value.clone());
            last = whole.end();
        }
        sql.push_str(&annotated[last..]);
        Ok((sql, params))
    }
}

#[cfg(all(test, feature = "postgres"))]
mod tests {
    use super::*;
    use crate::dialect::PostgresDialect;
    use serde_json::json;

    #[test]
    fn numbers_placeholders_by_appearance() {
        let params = ParamAllocator::new();
        let a = params.allocate_param("a");
        let b = params.allocate_param("b");
        let annotated = format!("x = {b} AND y = {a}");
        let (sql, values) = params
            .build_sql_and_params(&annotated, &PostgresDialect)
            .unwrap();
        assert_eq!(sql, "x = $1 AND y = $2");
        assert_eq!(values, vec![json!("b"), json!("a")]);
    }

    #[test]
    fn repeated_tokens_are_bound_again() {
        let params = ParamAllocator::new();
        let a = params.allocate_param(1);
        let (sql, values) = params
            .build_sql_and_params(&format!("{a} + {a}"), &PostgresDialect)
            .unwrap();
        assert_eq!(sql, "$1 + $2");
        assert_eq!(values, vec![json!(1), json!(1)]);
    }

    #[test]
    fn template_params() {
        let params = ParamAllocator::new();
        let sql = params
            .allocate_params_for_template("col BETWEEN ? AND ?", &[json!("x"), json!("y")])
            .unwrap();
        assert_eq!(sql, "col BETWEEN $0$ AND $1$");
        assert_eq!(params.allocated(), 2);
        assert!(params
            .allocate_params_for_template("col = ?", &[])
            .is_err());
    }

    #[test]
    fn unknown_token_is_internal_error() {
        let params = ParamAllocator::new();
        let err = params
            .build_sql_and_params("x = $7$", &PostgresDialect)
            .unwrap_err();
        assert!(matches!(err, CubePlanError::Internal(_)));
    }
}
