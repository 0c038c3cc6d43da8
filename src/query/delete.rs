use super::write::{check_returning, render_returning, render_target, write_plan, ExecuteResult};
use super::{render_ctes, render_limit, render_order_by, Modifiers, Query, RowPlan};
use crate::ast::compiler::{Context, Render, Scope};
use crate::ast::expr::ExprExt;
use crate::ast::types::{Node, QueryNode, Table};
use crate::db::connection::Connection;
use crate::db::cursor::CursorWrapper;
use crate::db::database::Database;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Delete {
    modifiers: Modifiers,
    table: Table,
    where_: Option<Node>,
    returning: Vec<Node>,
}

impl Delete {
    pub fn new(table: Table) -> Self {
        Self {
            modifiers: Modifiers::default(),
            table,
            where_: None,
            returning: Vec::new(),
        }
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

    pub fn execute<C: Connection>(&self, db: &mut Database<C>) -> Result<ExecuteResult> {
        let cursor = db.execute(self)?;
        if self.returning.is_empty() {
            let affected = db.rows_affected(cursor.as_ref())?;
            return Ok(ExecuteResult::RowsAffected(affected));
        }
        Ok(ExecuteResult::Rows(CursorWrapper::new(cursor, self.row_plan())))
    }
}

impl Render for Delete {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.with_state(
            |s| {
                s.scope = Scope::Values;
                s.subquery = true;
                s.converter = None;
            },
            |ctx| {
                render_ctes(ctx, &self.modifiers.ctes)?;
                ctx.literal("DELETE FROM ");
                render_target(ctx, &self.table);
                if let Some(predicate) = &self.where_ {
                    ctx.literal(" WHERE ");
                    ctx.scope_normal(|ctx| predicate.render(ctx))?;
                }
                render_order_by(ctx, &self.modifiers.order_by, Scope::Normal)?;
                render_limit(ctx, &self.modifiers)?;
                render_returning(ctx, &self.returning)
            },
        )
    }
}

impl QueryNode for Delete {}

impl Query for Delete {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::expr::count;
    use crate::ast::value::Value;
    use crate::query::Select;

    #[test]
    fn test_delete_where_subquery_with_having() {
        let (users, tweets) = (Table::new("users"), Table::new("tweets"));
        let ct = count(tweets.c("id")).alias("ct");
        let heavy = Select::new()
            .from(users.clone())
            .columns([Node::from(users.c("id")), ct.clone()])
            .inner_join(tweets.clone(), tweets.c("user_id").eq(users.c("id")))
            .group_by([users.c("id")])
            .having(ct.gt(100));
        let query = Delete::new(users.clone()).where_(users.c("id").in_(heavy));
        let (sql, params) = query.sql().unwrap();
        assert_eq!(
            sql,
            "DELETE FROM \"users\" WHERE (\"users\".\"id\" IN (SELECT \"t1\".\"id\", COUNT(\"t2\".\"id\") AS ct \
             FROM \"users\" AS \"t1\" INNER JOIN \"tweets\" AS \"t2\" ON (\"t2\".\"user_id\" = \"t1\".\"id\") \
             GROUP BY \"t1\".\"id\" HAVING (ct > ?)))"
        );
        assert_eq!(params, vec![Value::Int(100)]);
    }

    #[test]
    fn test_delete_returning_and_limit() {
        let users = Table::new("users");
        let query = Delete::new(users.clone())
            .where_(users.c("active").eq(false))
            .limit(10)
            .returning([users.c("id")])
            .unwrap();
        let (sql, params) = query.sql().unwrap();
        assert_eq!(
            sql,
            "DELETE FROM \"users\" WHERE (\"users\".\"active\" = ?) LIMIT ? RETURNING \"id\""
        );
        assert_eq!(params, vec![Value::Bool(false), Value::Int(10)]);
    }

    #[test]
    fn test_delete_everything() {
        let (sql, _) = Delete::new(Table::new("logs")).sql().unwrap();
        assert_eq!(sql, "DELETE FROM \"logs\"");
    }
}
