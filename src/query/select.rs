use std::sync::Arc;

use super::compound::{CompoundSelect, SelectQuery, SetOp};
use super::{
    render_ctes, render_limit, render_order_by, require, Constructor, JoinEdge, Modifiers, Query,
    RowPlan,
};
use crate::ast::compiler::{Context, Render, Scope};
use crate::ast::expr::{self, ExprExt};
use crate::ast::types::{Cte, JoinType, Node, QueryNode, QuerySource, Source, Window};
use crate::ast::value::Value;
use crate::db::connection::Connection;
use crate::db::cursor::CursorWrapper;
use crate::db::database::Database;
use crate::db::rows::Row;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
enum Distinct {
    #[default]
    None,
    All,
    On(Vec<Node>),
}

#[derive(Debug, Clone, Default)]
struct Lock {
    nowait: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Select {
    modifiers: Modifiers,
    from: Vec<Source>,
    columns: Vec<Node>,
    where_: Option<Node>,
    group_by: Vec<Node>,
    having: Option<Node>,
    windows: Vec<Window>,
    distinct: Distinct,
    lock: Option<Lock>,
    /// Source the next join hangs off.
    join_ctx: Option<Source>,
    edges: Vec<JoinEdge>,
}

/// ON clause derived from a foreign key between the two sources' models.
fn infer_on(lhs: &Source, dest: &Source) -> Option<Node> {
    let (lm, dm) = (lhs.model()?, dest.model()?);
    if let Some(fk) = lm.foreign_key_to(dm.table_name()) {
        return Some(lhs.c(&fk.field).eq(dest.c(&fk.related_field)));
    }
    if let Some(fk) = dm.foreign_key_to(lm.table_name()) {
        return Some(dest.c(&fk.field).eq(lhs.c(&fk.related_field)));
    }
    None
}

/// Attribute a joined object is attached under: the foreign key name when
/// the lhs holds the key, the backref when the dest does, else the dest's
/// alias or name.
fn edge_attr(lhs: &Source, dest: &Source) -> String {
    if let (Some(lm), Some(dm)) = (lhs.model(), dest.model()) {
        if let Some(fk) = lm.foreign_key_to(dm.table_name()) {
            return fk.field.clone();
        }
        if let Some(fk) = dm.foreign_key_to(lm.table_name()) {
            return fk.backref.clone();
        }
    }
    dest.display_name()
}

impl Select {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a FROM source; it becomes the join context.
    pub fn from(&self, source: impl Into<Source>) -> Self {
        let mut query = self.clone();
        let source = source.into();
        query.join_ctx = Some(source.root().clone());
        query.from.push(source);
        query
    }

    /// Replace the projection.
    pub fn columns<I, N>(&self, columns: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        let mut query = self.clone();
        query.columns = columns.into_iter().map(Into::into).collect();
        query
    }

    /// Extend the projection.
    pub fn select_extend<I, N>(&self, columns: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        let mut query = self.clone();
        query.columns.extend(columns.into_iter().map(Into::into));
        query
    }

    /// AND-combine with any existing WHERE predicate.
    pub fn where_(&self, predicate: impl Into<Node>) -> Self {
        let mut query = self.clone();
        let predicate = predicate.into();
        query.where_ = Some(match query.where_.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        query
    }

    /// OR-combine with any existing WHERE predicate.
    pub fn orwhere(&self, predicate: impl Into<Node>) -> Self {
        let mut query = self.clone();
        let predicate = predicate.into();
        query.where_ = Some(match query.where_.take() {
            Some(existing) => existing.or(predicate),
            None => predicate,
        });
        query
    }

    pub fn group_by<I, N>(&self, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        let mut query = self.clone();
        query.group_by = nodes.into_iter().map(Into::into).collect();
        query
    }

    pub fn having(&self, predicate: impl Into<Node>) -> Self {
        let mut query = self.clone();
        let predicate = predicate.into();
        query.having = Some(match query.having.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        query
    }

    /// Declare a named window for the WINDOW clause.
    pub fn window(&self, window: Window) -> Result<Self> {
        if window.name.is_none() {
            return Err(Error::InvalidQuery(
                "windows in the WINDOW clause need a name".to_string(),
            ));
        }
        let mut query = self.clone();
        query.windows.push(window);
        Ok(query)
    }

    pub fn distinct(&self) -> Self {
        let mut query = self.clone();
        query.distinct = Distinct::All;
        query
    }

    pub fn distinct_on<I, N>(&self, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        let mut query = self.clone();
        query.distinct = Distinct::On(nodes.into_iter().map(Into::into).collect());
        query
    }

    pub fn for_update(&self, nowait: bool) -> Self {
        let mut query = self.clone();
        query.lock = Some(Lock { nowait });
        query
    }

    /// 1-based page of `per_page` rows.
    pub fn paginate(&self, page: u64, per_page: u64) -> Self {
        let page = page.max(1);
        self.limit(per_page).offset((page - 1) * per_page)
    }

    fn join_with(
        &self,
        dest: Source,
        kind: JoinType,
        on: Option<Node>,
        attr: Option<String>,
    ) -> Self {
        let mut query = self.clone();
        let lhs = query
            .join_ctx
            .clone()
            .or_else(|| query.from.last().map(|s| s.root().clone()));

        let on = match (&on, &lhs) {
            (None, Some(lhs)) if kind != JoinType::Cross => infer_on(lhs, &dest),
            _ => on,
        };

        match query.from.pop() {
            Some(last) => query.from.push(last.join(dest.clone(), kind, on)),
            None => query.from.push(dest.clone()),
        }

        if let Some(lhs) = lhs {
            if let (Some(lhs_key), Some(rhs_key)) = (lhs.key(), dest.key()) {
                query.edges.push(JoinEdge {
                    lhs: lhs_key,
                    rhs: rhs_key,
                    attr: attr.unwrap_or_else(|| edge_attr(&lhs, &dest)),
                    constructor: Constructor::for_source(&dest),
                });
            }
        }
        query.join_ctx = Some(dest);
        query
    }

    /// Join `dest` onto the current join context. Without `on`, models
    /// related by a foreign key get their ON clause inferred.
    pub fn join(&self, dest: impl Into<Source>, kind: JoinType, on: Option<Node>) -> Self {
        self.join_with(dest.into(), kind, on, None)
    }

    pub fn inner_join(&self, dest: impl Into<Source>, on: impl Into<Node>) -> Self {
        self.join_with(dest.into(), JoinType::Inner, Some(on.into()), None)
    }

    pub fn left_join(&self, dest: impl Into<Source>, on: impl Into<Node>) -> Self {
        self.join_with(dest.into(), JoinType::LeftOuter, Some(on.into()), None)
    }

    /// Join and attach reconstructed objects under `attr`.
    pub fn join_as(
        &self,
        dest: impl Into<Source>,
        kind: JoinType,
        on: Option<Node>,
        attr: &str,
    ) -> Self {
        self.join_with(dest.into(), kind, on, Some(attr.to_string()))
    }

    /// Join through the foreign key relating the join context and `dest`.
    pub fn join_related(&self, dest: impl Into<Source>, kind: JoinType) -> Result<Self> {
        let dest = dest.into();
        let lhs = self
            .join_ctx
            .clone()
            .or_else(|| self.from.last().map(|s| s.root().clone()))
            .ok_or_else(|| Error::InvalidQuery("join without a FROM source".to_string()))?;
        let on = infer_on(&lhs, &dest).ok_or_else(|| {
            Error::InvalidQuery(format!(
                "no foreign key relates {} and {}",
                lhs.display_name(),
                dest.display_name()
            ))
        })?;
        Ok(self.join_with(dest, kind, Some(on), None))
    }

    /// Make `source` the context subsequent joins hang off.
    pub fn switch(&self, source: impl Into<Source>) -> Self {
        let mut query = self.clone();
        query.join_ctx = Some(source.into().root().clone());
        query
    }

    /// Use this query as an aliased FROM source.
    pub fn alias(&self, name: &str) -> Source {
        Source::Query(QuerySource {
            query: Arc::new(self.clone()),
            alias: Some(name.to_string()),
        })
    }

    pub fn cte(&self, name: &str) -> Cte {
        Cte::new(name, Arc::new(self.clone()))
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

    pub fn execute<C: Connection>(&self, db: &mut Database<C>) -> Result<CursorWrapper> {
        let cursor = db.execute(self)?;
        Ok(CursorWrapper::new(cursor, self.row_plan()))
    }

    /// First column of the first row.
    pub fn scalar<C: Connection>(&self, db: &mut Database<C>) -> Result<Option<Value>> {
        let mut rows = self.tuples().limit(1).execute(db)?;
        rows.scalar()
    }

    pub fn first<C: Connection>(&self, db: &mut Database<C>) -> Result<Option<Row>> {
        let mut rows = self.limit(1).execute(db)?;
        rows.first()
    }

    /// Number of rows this query yields.
    pub fn count<C: Connection>(&self, db: &mut Database<C>) -> Result<i64> {
        let inner = self.order_by(Vec::<Node>::new());
        let wrapper = Select::new()
            .from(inner.alias("_wrapped"))
            .columns([expr::fn_("COUNT", [expr::sql("1", Vec::new())])]);
        let value = wrapper.scalar(db)?;
        Ok(value.and_then(|v| v.as_i64()).unwrap_or(0))
    }

    pub fn exists<C: Connection>(&self, db: &mut Database<C>) -> Result<bool> {
        let check = self.columns([expr::sql("1", Vec::new())]).limit(1).tuples();
        Ok(check.execute(db)?.first()?.is_some())
    }

    fn render_body(&self, ctx: &mut Context<'_>) -> Result<()> {
        for source in &self.from {
            ctx.register_source(source);
        }
        render_ctes(ctx, &self.modifiers.ctes)?;

        ctx.literal("SELECT ");
        match &self.distinct {
            Distinct::None => {}
            Distinct::All => {
                ctx.literal("DISTINCT ");
            }
            Distinct::On(nodes) => {
                require(ctx.dialect.distinct_on, ctx.dialect, "DISTINCT ON")?;
                ctx.literal("DISTINCT ON ");
                ctx.with_state(
                    |s| {
                        s.scope = Scope::Normal;
                        s.parentheses = true;
                    },
                    |ctx| ctx.join(nodes, ", "),
                )?;
                ctx.literal(" ");
            }
        }

        ctx.scope_source(|ctx| {
            if self.columns.is_empty() {
                ctx.literal("*");
                Ok(())
            } else {
                ctx.join(&self.columns, ", ")
            }
        })?;

        if !self.from.is_empty() {
            ctx.literal(" FROM ");
            ctx.scope_source(|ctx| ctx.join(&self.from, ", "))?;
        }

        if let Some(predicate) = &self.where_ {
            ctx.literal(" WHERE ");
            ctx.scope_normal(|ctx| predicate.render(ctx))?;
        }

        if !self.group_by.is_empty() {
            ctx.literal(" GROUP BY ");
            ctx.scope_normal(|ctx| ctx.join(&self.group_by, ", "))?;
        }

        if let Some(predicate) = &self.having {
            ctx.literal(" HAVING ");
            ctx.scope_normal(|ctx| predicate.render(ctx))?;
        }

        if !self.windows.is_empty() {
            require(ctx.dialect.window_functions, ctx.dialect, "WINDOW")?;
            ctx.literal(" WINDOW ");
            for (i, window) in self.windows.iter().enumerate() {
                if i > 0 {
                    ctx.literal(", ");
                }
                let name = window.name.clone().unwrap_or_default();
                ctx.literal(&name).literal(" AS (");
                window.render(ctx)?;
                ctx.literal(")");
            }
        }

        render_order_by(ctx, &self.modifiers.order_by, Scope::Normal)?;
        render_limit(ctx, &self.modifiers)?;

        if let Some(lock) = &self.lock {
            require(ctx.dialect.for_update, ctx.dialect, "FOR UPDATE")?;
            ctx.literal(" FOR UPDATE");
            if lock.nowait {
                require(ctx.dialect.for_update_nowait, ctx.dialect, "FOR UPDATE NOWAIT")?;
                ctx.literal(" NOWAIT");
            }
        }
        Ok(())
    }
}

impl Render for Select {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        let state = ctx.state();
        let nested = state.subquery || state.scope == Scope::Source;
        // A lone function argument is already wrapped by the call parentheses.
        let parens = nested && state.function_args != Some(1);
        ctx.with_state(
            |s| {
                s.parentheses = parens;
                s.subquery = true;
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

impl QueryNode for Select {}

impl Query for Select {
    fn modifiers(&self) -> &Modifiers {
        &self.modifiers
    }

    fn modifiers_mut(&mut self) -> &mut Modifiers {
        &mut self.modifiers
    }

    fn row_plan(&self) -> RowPlan {
        RowPlan {
            shape: self.modifiers.row_shape.clone(),
            projection: self.columns.clone(),
            sources: self.from.clone(),
            edges: self.edges.clone(),
        }
    }
}

impl From<Select> for Node {
    fn from(select: Select) -> Self {
        expr::subquery(Arc::new(select))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::dialect::Dialect;
    use crate::ast::expr::{count, ExprExt};
    use crate::ast::field::Field;
    use crate::ast::types::Table;
    use crate::model::Model;

    fn users_tweets() -> (Table, Table) {
        (Table::new("users"), Table::new("tweets"))
    }

    #[test]
    fn test_select_join_group_by() {
        let (users, tweets) = users_tweets();
        let query = Select::new()
            .from(users.clone())
            .columns([
                Node::from(users.c("id")),
                users.c("username").into(),
                count(tweets.c("id")).alias("ct"),
            ])
            .inner_join(tweets.clone(), tweets.c("user_id").eq(users.c("id")))
            .group_by([users.c("id"), users.c("username")]);
        let (sql, params) = query.sql().unwrap();
        assert_eq!(
            sql,
            "SELECT \"t1\".\"id\", \"t1\".\"username\", COUNT(\"t2\".\"id\") AS ct \
             FROM \"users\" AS \"t1\" INNER JOIN \"tweets\" AS \"t2\" \
             ON (\"t2\".\"user_id\" = \"t1\".\"id\") \
             GROUP BY \"t1\".\"id\", \"t1\".\"username\""
        );
        assert!(params.is_empty());
    }

    #[test]
    fn test_where_and_combines() {
        let users = Table::new("users");
        let query = Select::new()
            .from(users.clone())
            .where_(users.c("a").eq(1))
            .where_(users.c("b").eq(2));
        let (sql, params) = query.sql().unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM \"users\" AS \"t1\" WHERE ((\"t1\".\"a\" = ?) AND (\"t1\".\"b\" = ?))"
        );
        assert_eq!(params, vec![Value::Int(1), Value::Int(2)]);

        let (sql, _) = query.orwhere(users.c("c").eq(3)).sql().unwrap();
        assert!(sql.ends_with("OR (\"t1\".\"c\" = ?))"));
    }

    #[test]
    fn test_builder_methods_copy() {
        let users = Table::new("users");
        let base = Select::new().from(users.clone()).columns([users.c("id")]);
        let before = base.sql().unwrap();
        let _ = base.where_(users.c("id").eq(1));
        let _ = base.order_by([users.c("id").desc()]).limit(5);
        let _ = base.inner_join(Table::new("tweets"), users.c("id").eq(1));
        assert_eq!(base.sql().unwrap(), before);
    }

    #[test]
    fn test_limit_offset() {
        let users = Table::new("users");
        let query = Select::new().from(users.clone()).paginate(3, 20);
        let (sql, params) = query.sql().unwrap();
        assert!(sql.ends_with(" LIMIT ? OFFSET ?"));
        assert_eq!(params, vec![Value::Int(20), Value::Int(40)]);

        let offset_only = Select::new().from(users).offset(10);
        let (sql, _) = offset_only.bind(Arc::new(Dialect::sqlite())).sql().unwrap();
        assert!(sql.ends_with(" LIMIT -1 OFFSET ?"));
        let (sql, _) = offset_only.sql().unwrap();
        assert!(sql.ends_with("\"t1\" OFFSET ?"));
    }

    #[test]
    fn test_subquery_in_where() {
        let (users, tweets) = users_tweets();
        let inner = Select::new()
            .from(tweets.clone())
            .columns([tweets.c("user_id")])
            .where_(tweets.c("likes").gt(10));
        let query = Select::new()
            .from(users.clone())
            .columns([users.c("id")])
            .where_(users.c("id").in_(inner));
        let (sql, params) = query.sql().unwrap();
        assert_eq!(
            sql,
            "SELECT \"t1\".\"id\" FROM \"users\" AS \"t1\" WHERE (\"t1\".\"id\" IN \
             (SELECT \"t2\".\"user_id\" FROM \"tweets\" AS \"t2\" WHERE (\"t2\".\"likes\" > ?)))"
        );
        assert_eq!(params, vec![Value::Int(10)]);
    }

    #[test]
    fn test_correlated_subquery_uses_outer_alias() {
        let (users, tweets) = users_tweets();
        let inner = Select::new()
            .from(tweets.clone())
            .columns([tweets.c("id")])
            .where_(tweets.c("user_id").eq(users.c("id")));
        let query = Select::new()
            .from(users.clone())
            .columns([users.c("id")])
            .where_(expr::exists(Arc::new(inner)));
        let (sql, _) = query.sql().unwrap();
        assert_eq!(
            sql,
            "SELECT \"t1\".\"id\" FROM \"users\" AS \"t1\" WHERE EXISTS(SELECT \"t2\".\"id\" \
             FROM \"tweets\" AS \"t2\" WHERE (\"t2\".\"user_id\" = \"t1\".\"id\"))"
        );
    }

    #[test]
    fn test_subquery_as_source() {
        let users = Table::new("users");
        let inner = Select::new()
            .from(users.clone())
            .columns([users.c("id")])
            .alias("sq");
        let query = Select::new().from(inner.clone()).columns([inner.c("id")]);
        let (sql, _) = query.sql().unwrap();
        assert_eq!(
            sql,
            "SELECT \"sq\".\"id\" FROM (SELECT \"t1\".\"id\" FROM \"users\" AS \"t1\") AS \"sq\""
        );
    }

    #[test]
    fn test_distinct_on_and_locking_need_support() {
        let users = Table::new("users");
        let query = Select::new()
            .from(users.clone())
            .distinct_on([users.c("team")])
            .columns([users.c("team"), users.c("id")]);
        let (sql, _) = query.sql().unwrap();
        assert!(sql.starts_with("SELECT DISTINCT ON (\"t1\".\"team\") \"t1\".\"team\""));
        let err = query.bind(Arc::new(Dialect::sqlite())).sql().unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));

        let locked = Select::new().from(users).for_update(true);
        assert!(locked.sql().unwrap().0.ends_with(" FOR UPDATE NOWAIT"));
        assert!(locked.bind(Arc::new(Dialect::sqlite())).sql().is_err());
    }

    #[test]
    fn test_named_window() {
        let users = Table::new("users");
        let w = Window::named("w").partition_by([users.c("team")]);
        let query = Select::new()
            .from(users.clone())
            .columns([expr::fn_("ROW_NUMBER", Vec::<Node>::new()).over(w.clone())])
            .window(w)
            .unwrap();
        let (sql, _) = query.sql().unwrap();
        assert_eq!(
            sql,
            "SELECT ROW_NUMBER() OVER w FROM \"users\" AS \"t1\" WINDOW w AS (PARTITION BY \"t1\".\"team\")"
        );
        assert!(Select::new().window(Window::new()).is_err());
    }

    #[test]
    fn test_cte() {
        let users = Table::new("users");
        let active = Select::new()
            .from(users.clone())
            .columns([users.c("id")])
            .where_(users.c("active").eq(true))
            .cte("active");
        let query = Select::new()
            .from(active.source())
            .columns([active.c("id")])
            .with_cte(active.clone());
        let (sql, _) = query.sql().unwrap();
        assert_eq!(
            sql,
            "WITH \"active\" AS (SELECT \"t1\".\"id\" FROM \"users\" AS \"t1\" WHERE (\"t1\".\"active\" = ?)) \
             SELECT \"active\".\"id\" FROM \"active\""
        );
    }

    #[test]
    fn test_recursive_cte_detected() {
        let nodes = Table::new("nodes");
        let base = Select::new()
            .from(nodes.clone())
            .columns([nodes.c("id")])
            .where_(nodes.c("parent_id").is_null())
            .cte("tree");
        let step = Select::new()
            .from(nodes.clone())
            .columns([nodes.c("id")])
            .inner_join(base.source(), nodes.c("parent_id").eq(base.c("id")));
        let tree = base.union_all(step);
        let query = Select::new()
            .from(tree.source())
            .columns([tree.c("id")])
            .with_cte(tree);
        let (sql, _) = query.sql().unwrap();
        assert!(sql.starts_with("WITH RECURSIVE \"tree\" AS (SELECT"), "{}", sql);
        assert!(sql.contains("UNION ALL"));
        assert!(sql.contains("INNER JOIN \"tree\" ON"));
    }

    #[test]
    fn test_join_related_infers_on() {
        let users = Model::builder("users")
            .field(Field::integer("id").primary_key())
            .field(Field::text("username"))
            .build();
        let tweets = Model::builder("tweets")
            .field(Field::integer("id").primary_key())
            .foreign_key(Field::integer("user").column_name("user_id"), &users, "id", "tweets")
            .field(Field::text("content"))
            .build();

        let query = tweets
            .select()
            .join_related(users.table(), JoinType::Inner)
            .unwrap();
        let (sql, _) = query.sql().unwrap();
        assert!(sql.ends_with(
            "FROM \"tweets\" AS \"t1\" INNER JOIN \"users\" AS \"t2\" ON (\"t1\".\"user_id\" = \"t2\".\"id\")"
        ));
        assert_eq!(query.edges[0].attr, "user");

        let reverse = users
            .select()
            .join_related(tweets.table(), JoinType::LeftOuter)
            .unwrap();
        assert_eq!(reverse.edges[0].attr, "tweets");

        let unrelated = Table::new("events");
        assert!(users.select().join_related(unrelated, JoinType::Inner).is_err());
    }

    #[test]
    fn test_switch_join_context() {
        let (a, b, c) = (Table::new("a"), Table::new("b"), Table::new("c"));
        let query = Select::new()
            .from(a.clone())
            .inner_join(b.clone(), b.c("a_id").eq(a.c("id")))
            .switch(a.clone())
            .inner_join(c.clone(), c.c("a_id").eq(a.c("id")));
        assert_eq!(query.edges.len(), 2);
        assert_eq!(query.edges[1].lhs, a.key());
        assert_eq!(query.edges[1].rhs, c.key());
        let (sql, _) = query.sql().unwrap();
        assert!(sql.contains(
            "FROM \"a\" AS \"t1\" INNER JOIN \"b\" AS \"t2\" ON (\"t2\".\"a_id\" = \"t1\".\"id\") \
             INNER JOIN \"c\" AS \"t3\""
        ));
    }
}
