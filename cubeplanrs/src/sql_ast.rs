//! Minimal SELECT tree rendered through a dialect.
//!
//! Expressions are already-rendered SQL fragments; the tree only fixes clause
//! order and identifier quoting of aliases.

use crate::dialect::Dialect;

#[derive(Debug, Clone)]
pub struct SelectItem {
    pub expr: String,
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn aliased(expr: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            alias: Some(alias.into()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TableRef {
    /// Table name or parenthesized subquery.
    pub sql: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(sql: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            alias: Some(alias.into()),
        }
    }

    pub fn subquery(sql: &str, alias: impl Into<String>) -> Self {
        Self::new(format!("({sql})"), alias)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlJoinType {
    Inner,
    Left,
    Full,
}

#[derive(Debug, Clone)]
pub struct Join {
    pub join_type: SqlJoinType,
    pub table: TableRef,
    pub on: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OrderItem {
    pub expr: String,
    pub desc: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SelectQuery {
    pub distinct: bool,
    pub select: Vec<SelectItem>,
    pub from: TableRef,
    pub joins: Vec<Join>,
    pub filters: Vec<String>,
    pub group_by: Vec<String>,
    pub having: Vec<String>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

pub struct SqlRenderer<'d> {
    dialect: &'d dyn Dialect,
}

impl<'d> SqlRenderer<'d> {
    pub fn new(dialect: &'d dyn Dialect) -> Self {
        Self { dialect }
    }

    pub fn render_select(&self, query: &SelectQuery) -> String {
        let select_items: Vec<String> = query
            .select
            .iter()
            .map(|item| match &item.alias {
                Some(alias) => format!("{} AS {}", item.expr, self.dialect.quote_ident(alias)),
                None => item.expr.clone(),
            })
            .collect();

        let distinct = if query.distinct { "DISTINCT " } else { "" };
        let mut sql = format!(
            "SELECT {distinct}{} FROM {}",
            select_items.join(", "),
            self.render_table_ref(&query.from)
        );

        for join in &query.joins {
            let join_kw = match join.join_type {
                SqlJoinType::Inner => "INNER JOIN",
                SqlJoinType::Left => "LEFT JOIN",
                SqlJoinType::Full => "FULL JOIN",
            };
            let on_clause = if join.on.is_empty() {
                "1 = 1".to_string()
            } else {
                join.on.join(" AND ")
            };
            sql.push_str(&format!(
                " {join_kw} {} ON {on_clause}",
                self.render_table_ref(&join.table)
            ));
        }

        if !query.filters.is_empty() {
            sql.push_str(&format!(" WHERE {}", conjunction(&query.filters)));
        }

        if !query.group_by.is_empty() {
            sql.push_str(&format!(" GROUP BY {}", query.group_by.join(", ")));
        }

        if !query.having.is_empty() {
            sql.push_str(&format!(" HAVING {}", conjunction(&query.having)));
        }

        if !query.order_by.is_empty() {
            let orders: Vec<String> = query
                .order_by
                .iter()
                .map(|o| format!("{} {}", o.expr, if o.desc { "DESC" } else { "ASC" }))
                .collect();
            sql.push_str(&format!(" ORDER BY {}", orders.join(", ")));
        }

        sql.push_str(&self.dialect.render_limit(query.limit, query.offset));
        sql
    }

    fn render_table_ref(&self, table: &TableRef) -> String {
        match &table.alias {
            Some(alias) => format!("{} AS {}", table.sql, self.dialect.quote_ident(alias)),
            None => table.sql.clone(),
        }
    }
}

/// `(a) AND (b)`, or just `a` when there is a single condition.
pub fn conjunction(conditions: &[String]) -> String {
    match conditions {
        [single] => single.clone(),
        many => many
            .iter()
            .map(|c| format!("({c})"))
            .collect::<Vec<_>>()
            .join(" AND "),
    }
}

#[cfg(all(test, feature = "postgres"))]
mod tests {
    use super::*;
    use crate::dialect::PostgresDialect;

    #[test]
    fn renders_clauses_in_order() {
        let query = SelectQuery {
            select: vec![
                SelectItem::aliased("\"orders\".status", "orders__status"),
                SelectItem::aliased("count(*)", "orders__count"),
            ],
            from: TableRef::new("public.orders", "orders"),
            filters: vec!["a = 1".into(), "b = 2".into()],
            group_by: vec!["1".into()],
            order_by: vec![OrderItem {
                expr: "2".into(),
                desc: true,
            }],
            limit: Some(10),
            ..SelectQuery::default()
        };
        let sql = SqlRenderer::new(&PostgresDialect).render_select(&query);
        assert_eq!(
            sql,
            "SELECT \"orders\".status AS \"orders__status\", count(*) AS \"orders__count\" \
             FROM public.orders AS \"orders\" WHERE (a = 1) AND (b = 2) GROUP BY 1 ORDER BY 2 DESC LIMIT 10"
        );
    }

    #[test]
    fn empty_join_condition_joins_everything() {
        let query = SelectQuery {
            select: vec![SelectItem::aliased("q_0.x", "x")],
            from: TableRef::subquery("SELECT 1 AS x", "q_0"),
            joins: vec![Join {
                join_type: SqlJoinType::Left,
                table: TableRef::subquery("SELECT 2 AS y", "q_1"),
                on: vec![],
            }],
            ..SelectQuery::default()
        };
        let sql = SqlRenderer::new(&PostgresDialect).render_select(&query);
        assert!(sql.contains("LEFT JOIN (SELECT 2 AS y) AS \"q_1\" ON 1 = 1"));
    }
}
