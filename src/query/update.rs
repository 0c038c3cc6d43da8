use super::write::{
    check_returning, render_returning, render_target, write_plan, ConflictAction, ExecuteResult,
};
use super::{render_ctes, render_limit, render_order_by, Modifiers, Query, RowPlan};
use crate::ast::compiler::{Context, Render, Scope};
use crate::ast::dialect::ConflictStyle;
use crate::ast::expr::ExprExt;
use crate::ast::types::{Column, Node, QueryNode, Source, Table};
use crate::db::connection::Connection;
use crate::db::cursor::CursorWrapper;
use crate::db::database::Database;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Update {
    modifiers: Modifiers,
    table: Table,
    assignments: Vec<(String, Node)>,
    from: Vec<Source>,
    where_: Option<Node>,
    returning: Vec<Node>,
    action: Option<ConflictAction>,
}

impl Update {
    pub fn new(table: Table) -> Self {
        Self {
            modifiers: Modifiers::default(),
            table,
            assignments: Vec::new(),
            from: Vec::new(),
            where_: None,
            returning: Vec::new(),
            action: None,
        }
    }

    /// Assign `value` to `column`, replacing an earlier assignment to it.
    pub fn set(&self, column: &str, value: impl Into<Node>) -> Self {
        let mut query = self.clone();
        let value = value.into();
        match query.assignments.iter_mut().find(|(c, _)| c == column) {
            Some(existing) => existing.1 = value,
            None => query.assignments.push((column.to_string(), value)),
        }
        query
    }

    pub fn set_many<I, K, V>(&self, assignments: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Node>,
    {
        assignments
            .into_iter()
            .fold(self.clone(), |query, (k, v)| query.set(k.as_ref(), v))
    }

    /// `UPDATE ... FROM <source>`.
    pub fn from(&self, source: impl Into<Source>) -> Self {
        let mut query = self.clone();
        query.from.push(source.into());
        query
    }

    pub fn where_(&self, predicate: impl Into<Node>) -> Self {
        let mut query = self.clone();
        let predicate = predicate.into();
        query.where_ = Some(match query.where_.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        query
    }

    pub fn orwhere(&self, predicate: impl Into<Node>) -> Self {
        let mut query = self.clone();
        let predicate = predicate.into();
        query.where_ = Some(match query.where_.take() {
            Some(existing) => existing.or(predicate),
            None => predicate,
        });
        query
    }

    pub fn returning<I, N>(&self, nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        check_returning(self.modifiers.dialect.as_ref())?;
        let mut query = self.clone();
        query.returning = nodes.into_iter().map(Into::into).collect();
        Ok(query)
    }

    /// `UPDATE OR <action>` (SQLite).
    pub fn or_action(&self, action: ConflictAction) -> Self {
        let mut query = self.clone();
        query.action = Some(action);
        query
    }

    pub fn execute<C: Connection>(&self, db: &mut Database<C>) -> Result<ExecuteResult> {
        let cursor = db.execute(self)?;
        if self.returning.is_empty() {
            let affected = db.rows_affected(cursor.as_ref())?;
            return Ok(ExecuteResult::RowsAffected(affected));
        }
        Ok(ExecuteResult::Rows(CursorWrapper::new(cursor, self.row_plan())))
    }

    fn render_body(&self, ctx: &mut Context<'_>) -> Result<()> {
        if self.assignments.is_empty() {
            return Err(Error::InvalidQuery("UPDATE without assignments".to_string()));
        }
        for source in &self.from {
            ctx.register_source(source);
        }
        render_ctes(ctx, &self.modifiers.ctes)?;

        ctx.literal("UPDATE ");
        if let Some(action) = self.action {
            if ctx.dialect.conflict_style != ConflictStyle::Sqlite {
                return Err(Error::NotSupported(format!(
                    "UPDATE OR {} is not supported by the {} dialect",
                    action.as_sql(),
                    ctx.dialect.name
                )));
            }
            ctx.literal("OR ").literal(action.as_sql()).literal(" ");
        }
        render_target(ctx, &self.table);

        let mut assignments: Vec<(Column, &Node)> = self
            .assignments
            .iter()
            .map(|(name, value)| (self.table.c(name), value))
            .collect();
        assignments.sort_by_key(|(column, _)| column.sort_key());

        ctx.literal(" SET ");
        for (i, (column, value)) in assignments.iter().enumerate() {
            if i > 0 {
                ctx.literal(", ");
            }
            let name = ctx.quote(&column.name);
            ctx.literal(&name).literal(" = ");
            let converter = column.field.as_ref().map(|f| f.kind.clone());
            ctx.with_state(
                |s| {
                    s.scope = Scope::Normal;
                    s.converter = converter;
                },
                |ctx| value.render(ctx),
            )?;
        }

        if !self.from.is_empty() {
            ctx.literal(" FROM ");
            ctx.scope_source(|ctx| ctx.join(&self.from, ", "))?;
        }

        if let Some(predicate) = &self.where_ {
            ctx.literal(" WHERE ");
            ctx.scope_normal(|ctx| predicate.render(ctx))?;
        }
        render_order_by(ctx, &self.modifiers.order_by, Scope::Normal)?;
        render_limit(ctx, &self.modifiers)?;
        render_returning(ctx, &self.returning)
    }
}

impl Render for Update {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.with_state(
            |s| {
                s.scope = Scope::Values;
                s.subquery = true;
                s.converter = None;
            },
            |ctx| self.render_body(ctx),
        )
    }
}

impl QueryNode for Update {}

impl Query for Update {
    fn modifiers(&self) -> &Modifiers {
        &self.modifiers
    }

    fn modifiers_mut(&mut self) -> &mut Modifiers {
        &mut self.modifiers
    }

    fn row_plan(&self) -> RowPlan {
        write_plan(&self.table, &self.returning, &self.modifiers.row_shape)
    }
}
