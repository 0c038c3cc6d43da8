/// Statement builders.
///
/// Every builder method takes `&self` and returns a modified copy, so a
/// query can be extended along several paths without the branches seeing
/// each other's changes:
///
/// ```ignore
/// let base = users.select().where_(users.c("active").eq(true));
/// let admins = base.where_(users.c("admin").eq(true));
/// let recent = base.order_by([users.c("created").desc()]).limit(10);
/// ```
mod compound;
mod delete;
mod insert;
mod select;
mod update;
mod write;

pub use compound::{CompoundSelect, SelectQuery, SetOp};
pub use delete::Delete;
pub use insert::Insert;
pub use select::Select;
pub use update::Update;
pub use write::{ConflictAction, ExecuteResult, OnConflict};

use std::fmt;
use std::sync::Arc;

use crate::ast::compiler::{compile, Context, Render, Scope};
use crate::ast::dialect::Dialect;
use crate::ast::types::{Cte, Node, Source, SourceKey};
use crate::ast::value::Value;
use crate::db::rows::{NamedRow, Object};
use crate::error::{Error, Result};
use crate::model::Model;

/// Builds one object per source per row during joined-object reconstruction.
#[derive(Clone)]
pub enum Constructor {
    Model(Arc<Model>),
    Map,
}

impl fmt::Debug for Constructor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constructor::Model(m) => write!(f, "Model({})", m.table_name()),
            Constructor::Map => write!(f, "Map"),
        }
    }
}

impl Constructor {
    pub fn for_source(source: &Source) -> Self {
        match source.model() {
            Some(model) => Constructor::Model(Arc::clone(model)),
            None => Constructor::Map,
        }
    }

    pub fn build(&self) -> Object {
        match self {
            Constructor::Model(model) => Object::instance(Arc::clone(model)),
            Constructor::Map => Object::map(),
        }
    }
}

pub type RowFn = Arc<dyn Fn(&NamedRow) -> Object + Send + Sync>;

/// How result rows are handed back.
#[derive(Clone, Default)]
pub enum RowShape {
    #[default]
    Tuples,
    Dicts,
    Named,
    /// Caller supplied constructor over the labeled row.
    Constructor(RowFn),
    /// Joined-object reconstruction.
    Objects,
}

impl fmt::Debug for RowShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowShape::Tuples => write!(f, "Tuples"),
            RowShape::Dicts => write!(f, "Dicts"),
            RowShape::Named => write!(f, "Named"),
            RowShape::Constructor(_) => write!(f, "Constructor(..)"),
            RowShape::Objects => write!(f, "Objects"),
        }
    }
}

/// Join recorded at build time, replayed by the materializer.
#[derive(Debug, Clone)]
pub struct JoinEdge {
    pub lhs: SourceKey,
    pub rhs: SourceKey,
    /// Attribute of the lhs object the rhs object is attached under.
    pub attr: String,
    pub constructor: Constructor,
}

/// Everything the materializer needs to know about a statement.
#[derive(Debug, Clone)]
pub struct RowPlan {
    pub shape: RowShape,
    pub projection: Vec<Node>,
    /// FROM list; the first entry's root is the reconstruction root.
    pub sources: Vec<Source>,
    pub edges: Vec<JoinEdge>,
}

/// State shared by every statement kind.
#[derive(Debug, Clone, Default)]
pub struct Modifiers {
    pub order_by: Vec<Node>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub ctes: Vec<Cte>,
    pub row_shape: RowShape,
    /// Dialect bound at construction; enables build-time checks.
    pub dialect: Option<Arc<Dialect>>,
}

/// Builder methods common to all statements.
pub trait Query: Render + Clone {
    fn modifiers(&self) -> &Modifiers;

    fn modifiers_mut(&mut self) -> &mut Modifiers;

    /// Replace the ORDER BY list.
    fn order_by<I, N>(&self, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        let mut query = self.clone();
        query.modifiers_mut().order_by = nodes.into_iter().map(Into::into).collect();
        query
    }

    fn limit(&self, limit: u64) -> Self {
        let mut query = self.clone();
        query.modifiers_mut().limit = Some(limit);
        query
    }

    fn offset(&self, offset: u64) -> Self {
        let mut query = self.clone();
        query.modifiers_mut().offset = Some(offset);
        query
    }

    fn with_cte(&self, cte: Cte) -> Self {
        let mut query = self.clone();
        query.modifiers_mut().ctes.push(cte);
        query
    }

    fn bind(&self, dialect: Arc<Dialect>) -> Self {
        let mut query = self.clone();
        query.modifiers_mut().dialect = Some(dialect);
        query
    }

    fn row_shape(&self, shape: RowShape) -> Self {
        let mut query = self.clone();
        query.modifiers_mut().row_shape = shape;
        query
    }

    fn tuples(&self) -> Self {
        self.row_shape(RowShape::Tuples)
    }

    fn dicts(&self) -> Self {
        self.row_shape(RowShape::Dicts)
    }

    fn namedtuples(&self) -> Self {
        self.row_shape(RowShape::Named)
    }

    fn objects(&self) -> Self {
        self.row_shape(RowShape::Objects)
    }

    fn constructor<F>(&self, f: F) -> Self
    where
        F: Fn(&NamedRow) -> Object + Send + Sync + 'static,
    {
        self.row_shape(RowShape::Constructor(Arc::new(f)))
    }

    /// Render with the bound dialect, or the generic one.
    fn sql(&self) -> Result<(String, Vec<Value>)> {
        match &self.modifiers().dialect {
            Some(dialect) => compile(self, dialect),
            None => compile(self, &Dialect::generic()),
        }
    }

    fn row_plan(&self) -> RowPlan;
}

/// `WITH [RECURSIVE] name [(cols)] AS (...)`, once, in declaration order.
pub(crate) fn render_ctes(ctx: &mut Context<'_>, ctes: &[Cte]) -> Result<()> {
    if ctes.is_empty() {
        return Ok(());
    }
    ctx.literal("WITH ");
    let position = ctx.position();
    let mut recursive = false;
    for (i, cte) in ctes.iter().enumerate() {
        if i > 0 {
            ctx.literal(", ");
        }
        recursive |= cte.recursive;
        let name = ctx.quote(&cte.name);
        ctx.literal(&name);
        if !cte.columns.is_empty() {
            let columns: Vec<String> = cte.columns.iter().map(|c| ctx.quote(c)).collect();
            ctx.literal(" (").literal(&columns.join(", ")).literal(")");
        }
        ctx.literal(" AS ");
        match cte.materialized {
            Some(true) => {
                ctx.literal("MATERIALIZED ");
            }
            Some(false) => {
                ctx.literal("NOT MATERIALIZED ");
            }
            None => {}
        }
        ctx.enter_cte(&cte.name);
        let body = ctx.push_alias(|ctx| {
            ctx.with_state(
                |s| {
                    s.scope = Scope::Cte;
                    s.parentheses = true;
                    s.subquery = false;
                    s.converter = None;
                    s.function_args = None;
                },
                |ctx| cte.query.render(ctx),
            )
        });
        ctx.exit_cte();
        body?;
        recursive |= ctx.take_recursive_hit();
    }
    if recursive {
        ctx.insert_literal(position, "RECURSIVE ");
    }
    ctx.literal(" ");
    Ok(())
}

pub(crate) fn render_order_by(ctx: &mut Context<'_>, nodes: &[Node], scope: Scope) -> Result<()> {
    if nodes.is_empty() {
        return Ok(());
    }
    ctx.literal(" ORDER BY ");
    ctx.with_state(|s| s.scope = scope, |ctx| ctx.join(nodes, ", "))
}

/// LIMIT / OFFSET as bind values; the dialect's maximum LIMIT stands in when
/// only an offset is given.
pub(crate) fn render_limit(ctx: &mut Context<'_>, modifiers: &Modifiers) -> Result<()> {
    match (modifiers.limit, modifiers.offset) {
        (Some(limit), _) => {
            ctx.literal(" LIMIT ").bind(Value::Int(to_i64(limit)?));
        }
        (None, Some(_)) => {
            if let Some(max) = ctx.dialect.limit_max.clone() {
                ctx.literal(" LIMIT ").literal(&max);
            }
        }
        (None, None) => {}
    }
    if let Some(offset) = modifiers.offset {
        ctx.literal(" OFFSET ").bind(Value::Int(to_i64(offset)?));
    }
    Ok(())
}

fn to_i64(n: u64) -> Result<i64> {
    i64::try_from(n).map_err(|_| Error::InvalidQuery(format!("{} does not fit a LIMIT/OFFSET", n)))
}

/// Fail with `NotSupported` unless `supported`.
pub(crate) fn require(supported: bool, dialect: &Dialect, feature: &str) -> Result<()> {
    if supported {
        Ok(())
    } else {
        Err(Error::NotSupported(format!(
            "{} is not supported by the {} dialect",
            feature, dialect.name
        )))
    }
}
