use std::sync::Arc;

use super::select::Select;
use super::{render_ctes, render_limit, render_order_by, Modifiers, Query, RowPlan};
use crate::ast::compiler::{Context, Render, Scope};
use crate::ast::dialect::CompoundParens;
use crate::ast::expr;
use crate::ast::types::{Cte, Node, QueryNode, QuerySource, Source};
use crate::db::connection::Connection;
use crate::db::cursor::CursorWrapper;
use crate::db::database::Database;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Union,
    UnionAll,
    Intersect,
    Except,
}

impl SetOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SetOp::Union => "UNION",
            SetOp::UnionAll => "UNION ALL",
            SetOp::Intersect => "INTERSECT",
            SetOp::Except => "EXCEPT",
        }
    }
}

/// Operand of a set operation.
#[derive(Debug, Clone)]
pub enum SelectQuery {
    Select(Arc<Select>),
    Compound(Arc<CompoundSelect>),
    /// Opaque body, e.g. the anchor of a CTE being extended.
    Query(Arc<dyn QueryNode>),
}

impl SelectQuery {
    fn is_compound(&self) -> bool {
        match self {
            SelectQuery::Select(_) => false,
            SelectQuery::Compound(_) => true,
            SelectQuery::Query(q) => q.is_compound(),
        }
    }

    fn row_plan(&self) -> Option<RowPlan> {
        match self {
            SelectQuery::Select(s) => Some(s.row_plan()),
            SelectQuery::Compound(c) => c.lhs.row_plan(),
            SelectQuery::Query(_) => None,
        }
    }
}

impl Render for SelectQuery {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        match self {
            SelectQuery::Select(s) => s.render(ctx),
            SelectQuery::Compound(c) => c.render(ctx),
            SelectQuery::Query(q) => q.render(ctx),
        }
    }
}

impl From<Select> for SelectQuery {
    fn from(select: Select) -> Self {
        SelectQuery::Select(Arc::new(select))
    }
}

impl From<CompoundSelect> for SelectQuery {
    fn from(compound: CompoundSelect) -> Self {
        SelectQuery::Compound(Arc::new(compound))
    }
}

/// `lhs <op> rhs`, associating exactly as composed.
#[derive(Debug, Clone)]
pub struct CompoundSelect {
    modifiers: Modifiers,
    lhs: SelectQuery,
    op: SetOp,
    rhs: SelectQuery,
}

impl CompoundSelect {
    pub fn new(lhs: impl Into<SelectQuery>, op: SetOp, rhs: impl Into<SelectQuery>) -> Self {
        Self {
            modifiers: Modifiers::default(),
            lhs: lhs.into(),
            op,
            rhs: rhs.into(),
        }
    }

    pub fn union(&self, other: impl Into<SelectQuery>) -> CompoundSelect {
        CompoundSelect::new(self.clone(), SetOp::Union, other)
    }

    pub fn union_all(&self, other: impl Into<SelectQuery>) -> CompoundSelect {
        CompoundSelect::new(self.clone(), SetOp::UnionAll, other)
    }

    pub fn intersect(&self, other: impl Into<SelectQuery>) -> CompoundSelect {
        CompoundSelect::new(self.clone(), SetOp::Intersect, other)
    }

    pub fn except_(&self, other: impl Into<SelectQuery>) -> CompoundSelect {
        CompoundSelect::new(self.clone(), SetOp::Except, other)
    }

    pub fn alias(&self, name: &str) -> Source {
        Source::Query(QuerySource {
            query: Arc::new(self.clone()),
            alias: Some(name.to_string()),
        })
    }

    pub fn cte(&self, name: &str) -> Cte {
        Cte::new(name, Arc::new(self.clone()))
    }

    pub fn execute<C: Connection>(&self, db: &mut Database<C>) -> Result<CursorWrapper> {
        let cursor = db.execute(self)?;
        Ok(CursorWrapper::new(cursor, self.row_plan()))
    }

    fn render_operand(ctx: &mut Context<'_>, operand: &SelectQuery, rhs: bool) -> Result<()> {
        let mode = ctx.dialect.compound_select_parentheses;
        let wrap = if operand.is_compound() {
            // A right-hand set operation must keep its grouping.
            rhs || mode == CompoundParens::Always
        } else {
            mode != CompoundParens::Never
        };
        ctx.push_alias(|ctx| {
            ctx.with_state(
                |s| {
                    s.parentheses = wrap;
                    s.subquery = false;
                    s.scope = Scope::Normal;
                },
                |ctx| operand.render(ctx),
            )
        })
    }

    fn render_body(&self, ctx: &mut Context<'_>) -> Result<()> {
        render_ctes(ctx, &self.modifiers.ctes)?;

        // `a | (b | c)` renders its grouped right side first so the aliases of
        // the nested operation are allocated before the left operand's.
        if self.rhs.is_compound() && !self.lhs.is_compound() {
            let rhs = ctx.capture(|ctx| Self::render_operand(ctx, &self.rhs, true))?;
            Self::render_operand(ctx, &self.lhs, false)?;
            ctx.literal(" ").literal(self.op.as_sql()).literal(" ");
            ctx.splice(rhs);
        } else {
            Self::render_operand(ctx, &self.lhs, false)?;
            ctx.literal(" ").literal(self.op.as_sql()).literal(" ");
            Self::render_operand(ctx, &self.rhs, true)?;
        }

        render_order_by(ctx, &self.modifiers.order_by, Scope::Values)?;
        render_limit(ctx, &self.modifiers)
    }
}

impl Render for CompoundSelect {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        let state = ctx.state();
        let nested = state.subquery || state.scope == Scope::Source;
        let parens = nested && state.function_args != Some(1);
        ctx.with_state(
            |s| {
                s.parentheses = parens;
                s.converter = None;
                s.function_args = None;
            },
            |ctx| {
                if nested {
                    ctx.push_alias(|ctx| self.render_body(ctx))
                } else {
                    self.render_body(ctx)
                }
            },
        )
    }
}

impl QueryNode for CompoundSelect {
    fn is_compound(&self) -> bool {
        true
    }
}

impl Query for CompoundSelect {
    fn modifiers(&self) -> &Modifiers {
        &self.modifiers
    }

    fn modifiers_mut(&mut self) -> &mut Modifiers {
        &mut self.modifiers
    }

    /// Rows are shaped after the left-most SELECT.
    fn row_plan(&self) -> RowPlan {
        let mut plan = self.lhs.row_plan().unwrap_or(RowPlan {
            shape: Default::default(),
            projection: Vec::new(),
            sources: Vec::new(),
            edges: Vec::new(),
        });
        plan.shape = self.modifiers.row_shape.clone();
        plan
    }
}

impl From<CompoundSelect> for Node {
    fn from(compound: CompoundSelect) -> Self {
        expr::subquery(Arc::new(compound))
    }
}

impl Cte {
    /// Extend this CTE's body with `UNION ALL rhs`; used to build recursive
    /// CTEs whose step references the anchor.
    pub fn union_all(&self, rhs: impl Into<SelectQuery>) -> Cte {
        let body = CompoundSelect::new(SelectQuery::Query(Arc::clone(&self.query)), SetOp::UnionAll, rhs);
        Cte {
            query: Arc::new(body),
            ..self.clone()
        }
    }

    pub fn union(&self, rhs: impl Into<SelectQuery>) -> Cte {
        let body = CompoundSelect::new(SelectQuery::Query(Arc::clone(&self.query)), SetOp::Union, rhs);
        Cte {
            query: Arc::new(body),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::dialect::Dialect;
    use crate::ast::expr::ExprExt;
    use crate::ast::types::Table;

    fn select_from(name: &str) -> Select {
        let table = Table::new(name);
        Select::new().from(table.clone()).columns([table.c("id")])
    }

    #[test]
    fn test_left_associative_aliases() {
        let (a, b, c) = (select_from("a"), select_from("b"), select_from("c"));
        let query = a.union(b).union(c);
        let (sql, _) = query.sql().unwrap();
        assert_eq!(
            sql,
            "SELECT \"t1\".\"id\" FROM \"a\" AS \"t1\" UNION \
             SELECT \"t2\".\"id\" FROM \"b\" AS \"t2\" UNION \
             SELECT \"t3\".\"id\" FROM \"c\" AS \"t3\""
        );
    }

    #[test]
    fn test_grouped_right_side_aliases() {
        let (a, b, c) = (select_from("a"), select_from("b"), select_from("c"));
        let query = a.union(b.union(c));
        let (sql, _) = query.sql().unwrap();
        assert_eq!(
            sql,
            "SELECT \"t3\".\"id\" FROM \"a\" AS \"t3\" UNION \
             (SELECT \"t1\".\"id\" FROM \"b\" AS \"t1\" UNION \
             SELECT \"t2\".\"id\" FROM \"c\" AS \"t2\")"
        );
    }

    #[test]
    fn test_params_follow_text_order_when_rhs_rendered_first() {
        let a = Table::new("a");
        let lhs = Select::new().from(a.clone()).where_(a.c("x").eq(1));
        let rhs = Select::new()
            .from(a.clone())
            .where_(a.c("x").eq(2))
            .union(Select::new().from(a.clone()).where_(a.c("x").eq(3)));
        let (sql, params) = lhs.union(rhs).bind(Arc::new(Dialect::postgres())).sql().unwrap();
        assert!(sql.contains("= $1"));
        assert!(sql.find("$1") < sql.find("$2") && sql.find("$2") < sql.find("$3"));
        assert_eq!(params, vec![1.into(), 2.into(), 3.into()]);
    }

    #[test]
    fn test_dialect_parenthesization() {
        let (a, b) = (select_from("a"), select_from("b"));
        let query = a.union_all(b).bind(Arc::new(Dialect::postgres()));
        let (sql, _) = query.sql().unwrap();
        assert_eq!(
            sql,
            "(SELECT \"t1\".\"id\" FROM \"a\" AS \"t1\") UNION ALL (SELECT \"t2\".\"id\" FROM \"b\" AS \"t2\")"
        );
    }

    #[test]
    fn test_compound_order_by_is_unqualified() {
        let (a, b) = (select_from("a"), select_from("b"));
        let query = a.union(b).order_by([Table::new("a").c("id").desc()]).limit(3);
        let (sql, _) = query.sql().unwrap();
        assert!(sql.ends_with(" ORDER BY \"id\" DESC LIMIT ?"), "{}", sql);
    }

    #[test]
    fn test_compound_as_subquery() {
        let (a, b) = (select_from("a"), select_from("b"));
        let outer = Table::new("users");
        let query = Select::new()
            .from(outer.clone())
            .columns([outer.c("id")])
            .where_(outer.c("id").in_(a.union(b)));
        let (sql, _) = query.sql().unwrap();
        assert!(sql.contains(
            "IN (SELECT \"t2\".\"id\" FROM \"a\" AS \"t2\" UNION SELECT \"t3\".\"id\" FROM \"b\" AS \"t3\")"
        ), "{}", sql);
    }
}
