use super::compound::SelectQuery;
use super::write::{
    check_returning, render_insert_verb, render_returning, render_target, render_upsert,
    write_plan, ConflictAction, ExecuteResult, OnConflict,
};
use super::{render_ctes, require, Modifiers, Query, RowPlan, RowShape};
use crate::ast::compiler::{Context, Render, Scope};
use crate::ast::types::{Column, Node, QueryNode, Table};
use crate::db::connection::Connection;
use crate::db::cursor::CursorWrapper;
use crate::db::database::Database;
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
enum InsertData {
    /// `DEFAULT VALUES`.
    Default,
    /// Column → value rows, keyed by field or column name.
    Rows(Vec<Vec<(String, Node)>>),
    Query(SelectQuery),
}

#[derive(Debug, Clone)]
pub struct Insert {
    modifiers: Modifiers,
    table: Table,
    data: InsertData,
    columns: Option<Vec<String>>,
    returning: Vec<Node>,
    on_conflict: Option<OnConflict>,
}

fn collect_row<I, K, V>(row: I) -> Vec<(String, Node)>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<Node>,
{
    row.into_iter()
        .map(|(k, v)| (k.as_ref().to_string(), v.into()))
        .collect()
}

impl Insert {
    /// Insert a row of defaults until data is supplied.
    pub fn new(table: Table) -> Self {
        Self {
            modifiers: Modifiers::default(),
            table,
            data: InsertData::Default,
            columns: None,
            returning: Vec::new(),
            on_conflict: None,
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Single row of `(column, value)` pairs.
    pub fn values<I, K, V>(&self, row: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Node>,
    {
        let mut query = self.clone();
        query.data = InsertData::Rows(vec![collect_row(row)]);
        query
    }

    /// Several rows. Without explicit columns the first row decides them, so
    /// an empty batch is rejected.
    pub fn rows<R, I, K, V>(&self, rows: R) -> Result<Self>
    where
        R: IntoIterator<Item = I>,
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Node>,
    {
        let rows: Vec<Vec<(String, Node)>> = rows.into_iter().map(collect_row).collect();
        if rows.is_empty() && self.columns.is_none() {
            return Err(Error::InvalidQuery(
                "cannot insert zero rows without explicit columns".to_string(),
            ));
        }
        let mut query = self.clone();
        query.data = InsertData::Rows(rows);
        Ok(query)
    }

    /// Explicit column list, emitted in the given order.
    pub fn columns(&self, columns: &[&str]) -> Self {
        let mut query = self.clone();
        query.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        query
    }

    /// `INSERT INTO t (columns) SELECT ...`.
    pub fn from_select(&self, columns: &[&str], select: impl Into<SelectQuery>) -> Self {
        let mut query = self.columns(columns);
        query.data = InsertData::Query(select.into());
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

    pub fn on_conflict(&self, conflict: OnConflict) -> Self {
        let mut query = self.clone();
        query.on_conflict = Some(conflict);
        query
    }

    pub fn on_conflict_ignore(&self) -> Self {
        self.on_conflict(OnConflict::ignore())
    }

    pub fn on_conflict_replace(&self) -> Self {
        self.on_conflict(OnConflict::replace())
    }

    pub fn or_action(&self, action: ConflictAction) -> Self {
        self.on_conflict(OnConflict::action(action))
    }

    /// Without RETURNING the result carries the new row's id: fetched through
    /// an automatic `RETURNING <pk>` when the dialect allows it, else from
    /// the connection.
    pub fn execute<C: Connection>(&self, db: &mut Database<C>) -> Result<ExecuteResult> {
        if !self.returning.is_empty() {
            let cursor = db.execute(self)?;
            return Ok(ExecuteResult::Rows(CursorWrapper::new(cursor, self.row_plan())));
        }

        let pk = self
            .table
            .model
            .as_ref()
            .and_then(|m| m.primary_key())
            .map(|f| f.name.clone());
        if let (true, Some(pk)) = (db.dialect().returning, pk) {
            let mut query = self.clone();
            query.returning = vec![self.table.c(&pk).into()];
            let cursor = db.execute(&query)?;
            let plan = write_plan(&self.table, &query.returning, &RowShape::Tuples);
            let mut rows = CursorWrapper::new(cursor, plan);
            let id = rows.rows()?.last().and_then(|r| r.first_value()).cloned();
            return Ok(ExecuteResult::LastInsertId(id));
        }

        let mut cursor = db.execute(self)?;
        let id = db.last_insert_id(cursor.as_mut())?;
        Ok(ExecuteResult::LastInsertId(id))
    }

    /// Columns to emit plus one value list per row.
    fn normalize(&self, rows: &[Vec<(String, Node)>]) -> Result<(Vec<Column>, Vec<Vec<Node>>)> {
        let columns: Vec<Column> = match &self.columns {
            Some(names) => names.iter().map(|n| self.table.c(n)).collect(),
            None => {
                let mut columns: Vec<Column> = rows
                    .first()
                    .map(|row| row.iter().map(|(k, _)| self.table.c(k)).collect())
                    .unwrap_or_default();
                if let Some(model) = &self.table.model {
                    for (field, _) in model.defaults() {
                        if !columns.iter().any(|c| c.name == field.column_name) {
                            columns.push(self.table.c(&field.name));
                        }
                    }
                }
                columns.sort_by_key(Column::sort_key);
                columns
            }
        };

        let mut values = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let mut out = Vec::with_capacity(columns.len());
            for column in &columns {
                let supplied = row
                    .iter()
                    .find(|(k, _)| self.table.c(k).name == column.name)
                    .map(|(_, v)| v.clone());
                let default = || {
                    column
                        .field
                        .as_ref()
                        .and_then(|f| f.default.clone())
                        .map(Node::Value)
                };
                match supplied.or_else(default) {
                    Some(node) => out.push(node),
                    None => {
                        return Err(Error::InvalidQuery(format!(
                            "missing value for column {:?} in row {}",
                            column.name, i
                        )))
                    }
                }
            }
            values.push(out);
        }
        Ok((columns, values))
    }

    fn render_columns(ctx: &mut Context<'_>, columns: &[Column]) {
        let names: Vec<String> = columns.iter().map(|c| ctx.quote(&c.name)).collect();
        ctx.literal(" (").literal(&names.join(", ")).literal(")");
    }

    fn render_body(&self, ctx: &mut Context<'_>) -> Result<()> {
        render_ctes(ctx, &self.modifiers.ctes)?;
        render_insert_verb(ctx, self.on_conflict.as_ref())?;
        render_target(ctx, &self.table);

        match &self.data {
            InsertData::Default => {
                ctx.literal(" DEFAULT VALUES");
            }
            InsertData::Rows(rows) => {
                let (columns, values) = self.normalize(rows)?;
                if values.is_empty() {
                    return Err(Error::InvalidQuery("no rows to insert".to_string()));
                }
                if values.len() > 1 {
                    require(ctx.dialect.multi_row_insert, ctx.dialect, "multi-row INSERT")?;
                }
                Self::render_columns(ctx, &columns);
                ctx.literal(" VALUES ");
                for (i, row) in values.iter().enumerate() {
                    if i > 0 {
                        ctx.literal(", ");
                    }
                    ctx.literal("(");
                    for (j, (column, node)) in columns.iter().zip(row).enumerate() {
                        if j > 0 {
                            ctx.literal(", ");
                        }
                        let converter = column.field.as_ref().map(|f| f.kind.clone());
                        ctx.with_state(|s| s.converter = converter, |ctx| node.render(ctx))?;
                    }
                    ctx.literal(")");
                }
            }
            InsertData::Query(select) => {
                if let Some(names) = &self.columns {
                    let columns: Vec<Column> = names.iter().map(|n| self.table.c(n)).collect();
                    Self::render_columns(ctx, &columns);
                }
                ctx.literal(" ");
                ctx.push_alias(|ctx| {
                    ctx.with_state(
                        |s| {
                            s.subquery = false;
                            s.scope = Scope::Normal;
                        },
                        |ctx| select.render(ctx),
                    )
                })?;
            }
        }

        if let Some(conflict) = &self.on_conflict {
            render_upsert(ctx, &self.table, conflict)?;
        }
        render_returning(ctx, &self.returning)
    }
}

impl Render for Insert {
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

impl QueryNode for Insert {}

impl Query for Insert {
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
