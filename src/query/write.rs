//! Pieces shared by INSERT, UPDATE and DELETE.

use std::sync::Arc;

use super::{require, RowPlan, RowShape};
use crate::ast::compiler::{Context, Render, Scope};
use crate::ast::dialect::{ConflictStyle, Dialect};
use crate::ast::types::{Node, Source, Table};
use crate::ast::value::Value;
use crate::db::cursor::CursorWrapper;
use crate::error::{Error, Result};

/// Conflict resolution keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    Rollback,
    Abort,
    Fail,
    Ignore,
    Replace,
}

impl ConflictAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ConflictAction::Rollback => "ROLLBACK",
            ConflictAction::Abort => "ABORT",
            ConflictAction::Fail => "FAIL",
            ConflictAction::Ignore => "IGNORE",
            ConflictAction::Replace => "REPLACE",
        }
    }
}

/// What an INSERT does when it collides with an existing row.
///
/// A bare action (`ignore`, `replace`) maps to the dialect's keyword form;
/// `preserve`/`update` produce an upsert clause.
#[derive(Debug, Clone, Default)]
pub struct OnConflict {
    pub action: Option<ConflictAction>,
    /// Conflict target columns (required by the upsert form outside MySQL).
    pub target: Vec<String>,
    /// Columns overwritten with the value proposed for insertion.
    pub preserve: Vec<String>,
    pub update: Vec<(String, Node)>,
    pub where_: Option<Node>,
}

impl OnConflict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action(action: ConflictAction) -> Self {
        Self {
            action: Some(action),
            ..Self::default()
        }
    }

    pub fn ignore() -> Self {
        Self::action(ConflictAction::Ignore)
    }

    pub fn replace() -> Self {
        Self::action(ConflictAction::Replace)
    }

    pub fn target(mut self, columns: &[&str]) -> Self {
        self.target = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn preserve(mut self, columns: &[&str]) -> Self {
        self.preserve = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn update(mut self, column: &str, value: impl Into<Node>) -> Self {
        self.update.push((column.to_string(), value.into()));
        self
    }

    pub fn where_(mut self, predicate: impl Into<Node>) -> Self {
        self.where_ = Some(predicate.into());
        self
    }

    fn is_upsert(&self) -> bool {
        !self.preserve.is_empty() || !self.update.is_empty()
    }
}

/// Result of executing a write statement.
#[derive(Debug)]
pub enum ExecuteResult {
    /// RETURNING was requested.
    Rows(CursorWrapper),
    RowsAffected(u64),
    LastInsertId(Option<Value>),
}

impl ExecuteResult {
    pub fn rows_affected(&self) -> Option<u64> {
        match self {
            ExecuteResult::RowsAffected(n) => Some(*n),
            _ => None,
        }
    }

    pub fn last_insert_id(&self) -> Option<&Value> {
        match self {
            ExecuteResult::LastInsertId(id) => id.as_ref(),
            _ => None,
        }
    }

    pub fn into_rows(self) -> Option<CursorWrapper> {
        match self {
            ExecuteResult::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}

/// Build-time RETURNING check against a bound dialect.
pub(crate) fn check_returning(dialect: Option<&Arc<Dialect>>) -> Result<()> {
    match dialect {
        Some(d) if !d.returning => Err(Error::InvalidQuery(format!(
            "RETURNING is not supported by the {} dialect",
            d.name
        ))),
        _ => Ok(()),
    }
}

/// Make the target table render under its own name and emit it.
pub(crate) fn render_target(ctx: &mut Context<'_>, table: &Table) {
    let name = table.alias.clone().unwrap_or_else(|| table.name.clone());
    ctx.aliases.set(table.key(), name);
    let path = ctx.quote_path(&table.path());
    ctx.literal(&path);
    if let Some(alias) = &table.alias {
        let alias = ctx.quote(alias);
        ctx.literal(" AS ").literal(&alias);
    }
}

pub(crate) fn render_returning(ctx: &mut Context<'_>, returning: &[Node]) -> Result<()> {
    if returning.is_empty() {
        return Ok(());
    }
    require(ctx.dialect.returning, ctx.dialect, "RETURNING")?;
    ctx.literal(" RETURNING ");
    ctx.scope_values(|ctx| ctx.join(returning, ", "))
}

pub(crate) fn write_plan(table: &Table, returning: &[Node], shape: &RowShape) -> RowPlan {
    RowPlan {
        shape: shape.clone(),
        projection: returning.to_vec(),
        sources: vec![Source::Table(table.clone())],
        edges: Vec::new(),
    }
}

/// `INSERT [OR x] INTO`, `REPLACE INTO`, `INSERT IGNORE INTO`.
pub(crate) fn render_insert_verb(ctx: &mut Context<'_>, conflict: Option<&OnConflict>) -> Result<()> {
    let action = conflict.and_then(|c| c.action);
    let style = ctx.dialect.conflict_style;
    match (style, action) {
        (_, None) => {
            ctx.literal("INSERT INTO ");
        }
        (ConflictStyle::Sqlite, Some(action)) => {
            ctx.literal("INSERT OR ").literal(action.as_sql()).literal(" INTO ");
        }
        (ConflictStyle::Postgres, Some(ConflictAction::Ignore)) => {
            ctx.literal("INSERT INTO ");
        }
        (ConflictStyle::Mysql, Some(ConflictAction::Replace)) => {
            ctx.literal("REPLACE INTO ");
        }
        (ConflictStyle::Mysql, Some(ConflictAction::Ignore)) => {
            ctx.literal("INSERT IGNORE INTO ");
        }
        (_, Some(action)) => {
            return Err(Error::NotSupported(format!(
                "conflict action {} is not supported by the {} dialect",
                action.as_sql(),
                ctx.dialect.name
            )));
        }
    }
    Ok(())
}

/// Trailing conflict clause: `ON CONFLICT ...` or `ON DUPLICATE KEY UPDATE ...`.
pub(crate) fn render_upsert(ctx: &mut Context<'_>, table: &Table, conflict: &OnConflict) -> Result<()> {
    let style = ctx.dialect.conflict_style;
    if style == ConflictStyle::Postgres
        && conflict.action == Some(ConflictAction::Ignore)
        && !conflict.is_upsert()
    {
        ctx.literal(" ON CONFLICT");
        render_conflict_target(ctx, table, &conflict.target);
        ctx.literal(" DO NOTHING");
        return Ok(());
    }
    if !conflict.is_upsert() {
        return Ok(());
    }

    match style {
        ConflictStyle::Mysql => {
            if conflict.where_.is_some() {
                return Err(Error::NotSupported(
                    "ON DUPLICATE KEY UPDATE does not accept a WHERE clause".to_string(),
                ));
            }
            ctx.literal(" ON DUPLICATE KEY UPDATE ");
        }
        ConflictStyle::Sqlite | ConflictStyle::Postgres => {
            if conflict.target.is_empty() {
                return Err(Error::InvalidQuery(
                    "an upsert needs conflict target columns".to_string(),
                ));
            }
            ctx.literal(" ON CONFLICT");
            render_conflict_target(ctx, table, &conflict.target);
            ctx.literal(" DO UPDATE SET ");
        }
    }

    let mut first = true;
    for name in &conflict.preserve {
        if !first {
            ctx.literal(", ");
        }
        first = false;
        let column = ctx.quote(&table.c(name).name);
        ctx.literal(&column).literal(" = ");
        match style {
            ConflictStyle::Mysql => ctx.literal("VALUES(").literal(&column).literal(")"),
            _ => ctx.literal("EXCLUDED.").literal(&column),
        };
    }
    for (name, value) in &conflict.update {
        if !first {
            ctx.literal(", ");
        }
        first = false;
        let column = table.c(name);
        let quoted = ctx.quote(&column.name);
        ctx.literal(&quoted).literal(" = ");
        let converter = column.field.as_ref().map(|f| f.kind.clone());
        ctx.with_state(
            |s| {
                s.scope = Scope::Normal;
                s.converter = converter;
            },
            |ctx| value.render(ctx),
        )?;
    }

    if let Some(predicate) = &conflict.where_ {
        ctx.literal(" WHERE ");
        ctx.scope_normal(|ctx| predicate.render(ctx))?;
    }
    Ok(())
}

fn render_conflict_target(ctx: &mut Context<'_>, table: &Table, target: &[String]) {
    if target.is_empty() {
        return;
    }
    let columns: Vec<String> = target.iter().map(|c| ctx.quote(&table.c(c).name)).collect();
    ctx.literal(" (").literal(&columns.join(", ")).literal(")");
}
