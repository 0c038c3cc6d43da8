//! Statement IR.
//!
//! Every piece of a statement is a [`Node`]. Nodes are plain values: cloning
//! one and changing the clone never affects the original, which is what the
//! query builders rely on. Sub-queries are shared behind `Arc`, so a clone of
//! a large statement is cheap.

use std::fmt;
use std::sync::Arc;

use super::compiler::Render;
use super::field::{Field, SortKey};
use super::value::Value;
use crate::error::{Error, Result};
use crate::model::Model;

/// A statement that can appear nested inside another one (sub-select, CTE
/// body, INSERT source).
pub trait QueryNode: Render + fmt::Debug + Send + Sync {
    /// True for set operations; they never wrap themselves when used as the
    /// left operand of another set operation.
    fn is_compound(&self) -> bool {
        false
    }
}

/// Universal IR unit.
#[derive(Debug, Clone)]
pub enum Node {
    Column(Column),
    /// Quoted identifier path, e.g. `"schema"."table"`.
    Entity(Vec<String>),
    /// Bind value, emitted as a placeholder.
    Value(Value),
    Expression(Box<Expression>),
    Negated(Box<Node>),
    Function(Box<Function>),
    Ordering(Box<Ordering>),
    Alias(Box<Alias>),
    List(NodeList),
    /// Raw SQL with `?` standing for each parameter.
    Sql(Sql),
    Source(Source),
    /// `*` or `source.*`.
    Star(Option<Source>),
    Case(Box<Case>),
    Cast(Box<Cast>),
}

impl Node {
    /// Strip any alias wrappers.
    pub fn unwrap_alias(&self) -> &Node {
        match self {
            Node::Alias(a) => a.node.unwrap_alias(),
            other => other,
        }
    }

    /// The typed field behind this node, looking through aliases.
    pub fn field(&self) -> Option<&Arc<Field>> {
        match self.unwrap_alias() {
            Node::Column(c) => c.field.as_ref(),
            _ => None,
        }
    }

    pub fn alias(self, name: &str) -> Node {
        Node::Alias(Box::new(Alias {
            node: self,
            name: name.to_string(),
        }))
    }

    pub fn asc(self) -> Node {
        Node::Ordering(Box::new(Ordering::new(self, Direction::Asc)))
    }

    pub fn desc(self) -> Node {
        Node::Ordering(Box::new(Ordering::new(self, Direction::Desc)))
    }
}

/// Identity of a source for alias allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceKey {
    Table {
        schema: Option<String>,
        name: String,
        alias: Option<String>,
    },
    Query {
        id: usize,
        alias: Option<String>,
    },
    Cte(String),
}

/// A node usable in FROM / JOIN position.
#[derive(Debug, Clone)]
pub enum Source {
    Table(Table),
    Join(Box<Join>),
    Query(QuerySource),
    Cte(Cte),
}

impl Source {
    /// Alias-manager identity; joins have none of their own.
    pub fn key(&self) -> Option<SourceKey> {
        match self {
            Source::Table(t) => Some(t.key()),
            Source::Join(_) => None,
            Source::Query(q) => Some(q.key()),
            Source::Cte(c) => Some(SourceKey::Cte(c.name.clone())),
        }
    }

    pub fn explicit_alias(&self) -> Option<&str> {
        match self {
            Source::Table(t) => t.alias.as_deref(),
            Source::Query(q) => q.alias.as_deref(),
            Source::Cte(c) => Some(&c.name),
            Source::Join(_) => None,
        }
    }

    /// Model attached to a plain table source.
    pub fn model(&self) -> Option<&Arc<Model>> {
        match self {
            Source::Table(t) => t.model.as_ref(),
            _ => None,
        }
    }

    /// Name used in error messages and as a default join attribute.
    pub fn display_name(&self) -> String {
        match self {
            Source::Table(t) => t.alias.clone().unwrap_or_else(|| t.name.clone()),
            Source::Query(q) => q.alias.clone().unwrap_or_else(|| "subquery".to_string()),
            Source::Cte(c) => c.name.clone(),
            Source::Join(j) => j.lhs.display_name(),
        }
    }

    /// Left-most non-join source.
    pub fn root(&self) -> &Source {
        match self {
            Source::Join(j) => j.lhs.root(),
            other => other,
        }
    }

    /// Mint a column without checking declared columns.
    pub fn c(&self, name: &str) -> Column {
        let field = self.model().and_then(|m| m.field(name)).cloned();
        let name = field
            .as_ref()
            .map(|f| f.column_name.clone())
            .unwrap_or_else(|| name.to_string());
        Column {
            source: self.root().clone(),
            name,
            field,
        }
    }

    /// Mint a column, refusing names the source does not declare.
    pub fn column(&self, name: &str) -> Result<Column> {
        let declared = match self.root() {
            Source::Table(t) => t.declares(name),
            Source::Cte(c) => c.columns.is_empty() || c.columns.iter().any(|n| n == name),
            _ => true,
        };
        if !declared {
            return Err(Error::UnknownColumn {
                source_name: self.display_name(),
                column: name.to_string(),
            });
        }
        Ok(self.c(name))
    }

    pub fn star(&self) -> Node {
        Node::Star(Some(self.root().clone()))
    }

    pub fn join(self, rhs: impl Into<Source>, kind: JoinType, on: Option<Node>) -> Source {
        Source::Join(Box::new(Join {
            lhs: self,
            rhs: rhs.into(),
            kind,
            on,
        }))
    }
}

#[derive(Clone)]
pub struct Table {
    pub name: String,
    pub schema: Option<String>,
    pub alias: Option<String>,
    pub columns: Option<Arc<Vec<String>>>,
    pub model: Option<Arc<Model>>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("alias", &self.alias)
            .field("columns", &self.columns)
            .field("model", &self.model.as_ref().map(|m| m.table_name()))
            .finish()
    }
}

impl Table {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            schema: None,
            alias: None,
            columns: None,
            model: None,
        }
    }

    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = Some(schema.to_string());
        self
    }

    pub fn with_columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(Arc::new(columns.iter().map(|c| c.to_string()).collect()));
        self
    }

    pub fn with_model(mut self, model: Arc<Model>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn key(&self) -> SourceKey {
        SourceKey::Table {
            schema: self.schema.clone(),
            name: self.name.clone(),
            alias: self.alias.clone(),
        }
    }

    /// Identifier path (schema first).
    pub fn path(&self) -> Vec<String> {
        match &self.schema {
            Some(schema) => vec![schema.clone(), self.name.clone()],
            None => vec![self.name.clone()],
        }
    }

    fn declares(&self, name: &str) -> bool {
        if let Some(columns) = &self.columns {
            return columns.iter().any(|c| c == name);
        }
        if let Some(model) = &self.model {
            return model.field(name).is_some();
        }
        true
    }

    pub fn c(&self, name: &str) -> Column {
        Source::Table(self.clone()).c(name)
    }

    pub fn column(&self, name: &str) -> Result<Column> {
        Source::Table(self.clone()).column(name)
    }

    pub fn star(&self) -> Node {
        Node::Star(Some(Source::Table(self.clone())))
    }
}

/// Sub-select in source position.
#[derive(Debug, Clone)]
pub struct QuerySource {
    pub query: Arc<dyn QueryNode>,
    pub alias: Option<String>,
}

impl QuerySource {
    pub fn key(&self) -> SourceKey {
        SourceKey::Query {
            id: Arc::as_ptr(&self.query) as *const () as usize,
            alias: self.alias.clone(),
        }
    }
}

/// Common table expression.
#[derive(Debug, Clone)]
pub struct Cte {
    pub name: String,
    pub query: Arc<dyn QueryNode>,
    pub columns: Vec<String>,
    pub recursive: bool,
    pub materialized: Option<bool>,
}

impl Cte {
    pub fn new(name: &str, query: Arc<dyn QueryNode>) -> Self {
        Self {
            name: name.to_string(),
            query,
            columns: Vec::new(),
            recursive: false,
            materialized: None,
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn materialized(mut self, materialized: bool) -> Self {
        self.materialized = Some(materialized);
        self
    }

    pub fn source(&self) -> Source {
        Source::Cte(self.clone())
    }

    pub fn c(&self, name: &str) -> Column {
        self.source().c(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    LeftOuter,
    RightOuter,
    FullOuter,
    Cross,
    Lateral,
    LeftLateral,
}

impl JoinType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::LeftOuter => "LEFT OUTER JOIN",
            JoinType::RightOuter => "RIGHT OUTER JOIN",
            JoinType::FullOuter => "FULL OUTER JOIN",
            JoinType::Cross => "CROSS JOIN",
            JoinType::Lateral => "CROSS JOIN LATERAL",
            JoinType::LeftLateral => "LEFT OUTER JOIN LATERAL",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Join {
    pub lhs: Source,
    pub rhs: Source,
    pub kind: JoinType,
    pub on: Option<Node>,
}

/// Column reference; typed when `field` is present.
#[derive(Debug, Clone)]
pub struct Column {
    pub source: Source,
    pub name: String,
    pub field: Option<Arc<Field>>,
}

impl Column {
    pub fn sort_key(&self) -> SortKey {
        match &self.field {
            Some(f) => f.sort_key(),
            None => SortKey::Name(self.name.clone()),
        }
    }

    /// True when both refer to the same column of the same source.
    pub fn same_as(&self, other: &Column) -> bool {
        self.name == other.name && self.source.key() == other.source.key()
    }

    pub fn alias(self, name: &str) -> Node {
        Node::from(self).alias(name)
    }

    pub fn asc(self) -> Node {
        Node::from(self).asc()
    }

    pub fn desc(self) -> Node {
        Node::from(self).desc()
    }
}

/// Binary operators. Spelling goes through the dialect's translation table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
    Like,
    ILike,
    Between,
    Regexp,
    IRegexp,
    Custom(String),
}

impl Op {
    pub fn as_str(&self) -> &str {
        match self {
            Op::And => "AND",
            Op::Or => "OR",
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mul => "*",
            Op::Div => "/",
            Op::Mod => "%",
            Op::BitAnd => "&",
            Op::BitOr => "|",
            Op::Concat => "||",
            Op::Eq => "=",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::In => "IN",
            Op::NotIn => "NOT IN",
            Op::Is => "IS",
            Op::IsNot => "IS NOT",
            Op::Like => "LIKE",
            Op::ILike => "ILIKE",
            Op::Between => "BETWEEN",
            Op::Regexp => "REGEXP",
            Op::IRegexp => "IREGEXP",
            Op::Custom(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Expression {
    pub lhs: Node,
    pub op: Op,
    pub rhs: Node,
    /// When set, the expression does not wrap itself in parentheses.
    pub flat: bool,
}

/// Window definition, named (WINDOW clause) or inline.
#[derive(Debug, Clone, Default)]
pub struct Window {
    pub name: Option<String>,
    pub partition_by: Vec<Node>,
    pub order_by: Vec<Node>,
    pub frame: Option<WindowFrame>,
}

impl Window {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn partition_by<I, N>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        self.partition_by = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn order_by<I, N>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Node>,
    {
        self.order_by = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn frame(mut self, frame: WindowFrame) -> Self {
        self.frame = Some(frame);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowFrame {
    pub mode: WindowFrameMode,
    pub start: WindowFrameBound,
    pub end: Option<WindowFrameBound>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowFrameMode {
    Rows,
    Range,
    Groups,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowFrameBound {
    CurrentRow,
    Preceding(Option<u64>),
    Following(Option<u64>),
}

#[derive(Debug, Clone)]
pub enum Over {
    /// Reference to a window declared in the WINDOW clause.
    Named(String),
    Inline(Window),
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub args: Vec<Node>,
    /// Whether result values borrow the converter of a typed argument.
    pub coerce: bool,
    pub distinct: bool,
    pub filter: Option<Node>,
    pub over: Option<Over>,
}

const NON_COERCING: &[&str] = &["count", "sum", "avg", "total", "cast", "array_agg"];

impl Function {
    pub fn new(name: &str, args: Vec<Node>) -> Self {
        let coerce = !NON_COERCING.contains(&name.to_ascii_lowercase().as_str());
        Self {
            name: name.to_string(),
            args,
            coerce,
            distinct: false,
            filter: None,
            over: None,
        }
    }

    pub fn coerce(mut self, coerce: bool) -> Self {
        self.coerce = coerce;
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn filter(mut self, predicate: impl Into<Node>) -> Self {
        self.filter = Some(predicate.into());
        self
    }

    pub fn over(mut self, window: Window) -> Self {
        self.over = Some(match window.name {
            Some(name) => Over::Named(name),
            None => Over::Inline(window),
        });
        self
    }

    pub fn alias(self, name: &str) -> Node {
        Node::from(self).alias(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nulls {
    First,
    Last,
}

#[derive(Debug, Clone)]
pub struct Ordering {
    pub node: Node,
    pub direction: Direction,
    pub nulls: Option<Nulls>,
    pub collation: Option<String>,
}

impl Ordering {
    pub fn new(node: Node, direction: Direction) -> Self {
        Self {
            node,
            direction,
            nulls: None,
            collation: None,
        }
    }

    pub fn nulls(mut self, nulls: Nulls) -> Self {
        self.nulls = Some(nulls);
        self
    }

    pub fn collate(mut self, collation: &str) -> Self {
        self.collation = Some(collation.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Alias {
    pub node: Node,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct NodeList {
    pub nodes: Vec<Node>,
    pub glue: String,
    pub parens: bool,
}

impl NodeList {
    pub fn new(nodes: Vec<Node>, glue: &str) -> Self {
        Self {
            nodes,
            glue: glue.to_string(),
            parens: false,
        }
    }

    pub fn comma(nodes: Vec<Node>) -> Self {
        Self::new(nodes, ", ")
    }

    pub fn parens(mut self) -> Self {
        self.parens = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Sql {
    pub text: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone)]
pub struct Case {
    pub predicate: Option<Node>,
    pub whens: Vec<(Node, Node)>,
    pub default: Option<Node>,
}

#[derive(Debug, Clone)]
pub struct Cast {
    pub node: Node,
    pub data_type: String,
}

impl From<Column> for Node {
    fn from(c: Column) -> Self {
        Node::Column(c)
    }
}

impl From<Value> for Node {
    fn from(v: Value) -> Self {
        Node::Value(v)
    }
}

impl From<bool> for Node {
    fn from(v: bool) -> Self {
        Node::Value(v.into())
    }
}

impl From<i32> for Node {
    fn from(v: i32) -> Self {
        Node::Value(v.into())
    }
}

impl From<i64> for Node {
    fn from(v: i64) -> Self {
        Node::Value(v.into())
    }
}

impl From<f64> for Node {
    fn from(v: f64) -> Self {
        Node::Value(v.into())
    }
}

impl From<&str> for Node {
    fn from(v: &str) -> Self {
        Node::Value(v.into())
    }
}

impl From<String> for Node {
    fn from(v: String) -> Self {
        Node::Value(v.into())
    }
}

/// A sequence of values becomes one bind value per element inside a
/// parenthesized list, so `IN (...)` gets one placeholder per element.
impl<T: Into<Value>> From<Vec<T>> for Node {
    fn from(values: Vec<T>) -> Self {
        let nodes = values.into_iter().map(|v| Node::Value(v.into())).collect();
        Node::List(NodeList::comma(nodes).parens())
    }
}

impl From<Expression> for Node {
    fn from(e: Expression) -> Self {
        Node::Expression(Box::new(e))
    }
}

impl From<Function> for Node {
    fn from(f: Function) -> Self {
        Node::Function(Box::new(f))
    }
}

impl From<Ordering> for Node {
    fn from(o: Ordering) -> Self {
        Node::Ordering(Box::new(o))
    }
}

impl From<NodeList> for Node {
    fn from(l: NodeList) -> Self {
        Node::List(l)
    }
}

impl From<Case> for Node {
    fn from(c: Case) -> Self {
        Node::Case(Box::new(c))
    }
}

impl From<Source> for Node {
    fn from(s: Source) -> Self {
        Node::Source(s)
    }
}

impl From<Table> for Node {
    fn from(t: Table) -> Self {
        Node::Source(Source::Table(t))
    }
}

impl From<Table> for Source {
    fn from(t: Table) -> Self {
        Source::Table(t)
    }
}

impl From<Cte> for Source {
    fn from(c: Cte) -> Self {
        Source::Cte(c)
    }
}

impl From<QuerySource> for Source {
    fn from(q: QuerySource) -> Self {
        Source::Query(q)
    }
}
