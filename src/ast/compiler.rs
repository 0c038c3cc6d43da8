/// IR → SQL compiler.
///
/// Rendering walks the IR once, appending text to a buffer and collecting
/// bind values in emission order. Placeholders are written as a marker and
/// only spelled out (`?`, `$n`, `%s`) in [`Context::finish`], so fragments can
/// be captured and spliced without renumbering anything.
///
/// How a node renders depends on the [`State`] on top of the context stack:
///
/// ```text
///   scope   │ table            │ column             │ alias
///  ─────────┼──────────────────┼────────────────────┼───────────────
///   Normal  │ "t1"             │ "t1"."col"         │ name
///   Source  │ "users" AS "t1"  │ "t1"."col"         │ node AS name
///   Values  │ "users"          │ "col"              │ node AS name
/// ```
use std::collections::HashMap;

use super::dialect::{Dialect, ParamStyle};
use super::field::FieldKind;
use super::types::*;
use super::value::Value;
use crate::error::{Error, Result};

const PARAM_MARKER: char = '\u{1}';

/// Anything that can write itself into a [`Context`].
pub trait Render {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Normal,
    /// FROM / JOIN / projection position.
    Source,
    /// INSERT column lists, SET targets, RETURNING.
    Values,
    /// Inside a WITH definition.
    Cte,
}

#[derive(Debug, Clone)]
pub struct State {
    pub scope: Scope,
    /// Wrap the current frame in parentheses. Reset on every push.
    pub parentheses: bool,
    /// Set while rendering inside another statement.
    pub subquery: bool,
    /// Applied to bind values, set from the typed lhs of a comparison.
    pub converter: Option<FieldKind>,
    /// Argument count of the enclosing function call.
    pub function_args: Option<usize>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            scope: Scope::Normal,
            parentheses: false,
            subquery: false,
            converter: None,
            function_args: None,
        }
    }
}

/// Allocates `t1`, `t2`, ... per source.
///
/// The counter is shared by the whole statement; mappings live in levels.
/// A nested statement pushes a level, resolves its own sources there and
/// drops them on pop, so siblings never share a mapping while lookups of
/// outer sources (correlated references) still succeed.
#[derive(Debug)]
pub struct AliasManager {
    counter: usize,
    levels: Vec<HashMap<SourceKey, String>>,
}

impl Default for AliasManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AliasManager {
    pub fn new() -> Self {
        Self {
            counter: 0,
            levels: vec![HashMap::new()],
        }
    }

    pub fn push(&mut self) {
        self.levels.push(HashMap::new());
    }

    pub fn pop(&mut self) {
        if self.levels.len() > 1 {
            self.levels.pop();
        }
    }

    /// Alias in the current level, allocating one if absent.
    pub fn add(&mut self, key: &SourceKey) -> String {
        if let Some(alias) = self.levels.last().and_then(|l| l.get(key)) {
            return alias.clone();
        }
        self.counter += 1;
        let alias = format!("t{}", self.counter);
        self.set(key.clone(), alias.clone());
        alias
    }

    pub fn set(&mut self, key: SourceKey, alias: String) {
        if let Some(level) = self.levels.last_mut() {
            level.insert(key, alias);
        }
    }

    pub fn lookup(&self, key: &SourceKey) -> Option<&str> {
        self.levels
            .iter()
            .rev()
            .find_map(|l| l.get(key))
            .map(String::as_str)
    }

    /// Alias from the nearest level that knows the key, else a new one here.
    pub fn get(&mut self, key: &SourceKey) -> String {
        match self.lookup(key) {
            Some(alias) => alias.to_string(),
            None => self.add(key),
        }
    }
}

pub struct Context<'a> {
    pub dialect: &'a Dialect,
    pub aliases: AliasManager,
    sql: String,
    values: Vec<Value>,
    stack: Vec<State>,
    cte_stack: Vec<String>,
    recursive_hit: bool,
}

impl<'a> Context<'a> {
    pub fn new(dialect: &'a Dialect) -> Self {
        Self {
            dialect,
            aliases: AliasManager::new(),
            sql: String::new(),
            values: Vec::new(),
            stack: vec![State::default()],
            cte_stack: Vec::new(),
            recursive_hit: false,
        }
    }

    pub fn state(&self) -> &State {
        // The root state is never popped.
        &self.stack[self.stack.len() - 1]
    }

    /// Run `body` under a copy of the current state modified by `update`.
    pub fn with_state<U, F>(&mut self, update: U, body: F) -> Result<()>
    where
        U: FnOnce(&mut State),
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let mut state = self.state().clone();
        state.parentheses = false;
        update(&mut state);
        let parens = state.parentheses;
        self.stack.push(state);
        if parens {
            self.sql.push('(');
        }
        let result = body(self);
        if parens && result.is_ok() {
            self.sql.push(')');
        }
        self.stack.pop();
        result
    }

    pub fn scope_normal<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.with_state(|s| s.scope = Scope::Normal, body)
    }

    pub fn scope_source<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.with_state(|s| s.scope = Scope::Source, body)
    }

    pub fn scope_values<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.with_state(|s| s.scope = Scope::Values, body)
    }

    pub fn scope_cte<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.with_state(|s| s.scope = Scope::Cte, body)
    }

    pub fn parens<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.with_state(|s| s.parentheses = true, body)
    }

    /// Run `body` inside a fresh alias level.
    pub fn push_alias<F>(&mut self, body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.aliases.push();
        let result = body(self);
        self.aliases.pop();
        result
    }

    pub fn literal(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    /// Bind a value, applying the active converter.
    pub fn value(&mut self, value: Value) -> &mut Self {
        let value = match &self.state().converter {
            Some(kind) => kind.to_db(value),
            None => value,
        };
        self.bind(value)
    }

    /// Bind a value as-is.
    pub fn bind(&mut self, value: Value) -> &mut Self {
        self.sql.push(PARAM_MARKER);
        self.values.push(value);
        self
    }

    pub fn sql(&mut self, node: &dyn Render) -> Result<&mut Self> {
        node.render(self)?;
        Ok(self)
    }

    /// Render `items` separated by `glue`.
    pub fn join<T: Render>(&mut self, items: &[T], glue: &str) -> Result<()> {
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(glue);
            }
            item.render(self)?;
        }
        Ok(())
    }

    pub fn quote(&self, ident: &str) -> String {
        self.dialect.quote(ident)
    }

    pub fn quote_path(&self, parts: &[String]) -> String {
        parts
            .iter()
            .map(|p| self.dialect.quote(p))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Alias a source renders under: an explicit alias wins, CTEs use their
    /// name, everything else goes through the alias manager.
    pub fn source_alias(&mut self, source: &Source) -> String {
        if let Some(alias) = source.explicit_alias() {
            return alias.to_string();
        }
        match source.key() {
            Some(key) => self.aliases.get(&key),
            None => String::new(),
        }
    }

    /// Allocate aliases for a FROM list (joins depth first) before anything
    /// of the statement is emitted.
    pub fn register_source(&mut self, source: &Source) {
        match source {
            Source::Join(join) => {
                self.register_source(&join.lhs);
                self.register_source(&join.rhs);
            }
            Source::Cte(_) => {}
            other => {
                if other.explicit_alias().is_none() {
                    if let Some(key) = other.key() {
                        self.aliases.add(&key);
                    }
                }
            }
        }
    }

    /// Render `body` and hand back what it produced instead of keeping it.
    pub fn capture<F>(&mut self, body: F) -> Result<(String, Vec<Value>)>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let sql_mark = self.sql.len();
        let value_mark = self.values.len();
        body(self)?;
        let sql = self.sql.split_off(sql_mark);
        let values = self.values.split_off(value_mark);
        Ok((sql, values))
    }

    /// Append a fragment produced by [`Context::capture`].
    pub fn splice(&mut self, fragment: (String, Vec<Value>)) {
        self.sql.push_str(&fragment.0);
        self.values.extend(fragment.1);
    }

    pub fn position(&self) -> usize {
        self.sql.len()
    }

    pub fn insert_literal(&mut self, position: usize, text: &str) {
        self.sql.insert_str(position, text);
    }

    pub fn enter_cte(&mut self, name: &str) {
        self.cte_stack.push(name.to_string());
    }

    pub fn exit_cte(&mut self) {
        self.cte_stack.pop();
    }

    /// Whether a CTE referenced itself since the last call.
    pub fn take_recursive_hit(&mut self) -> bool {
        std::mem::take(&mut self.recursive_hit)
    }

    /// Spell out placeholders and return the statement with its parameters.
    pub fn finish(self) -> (String, Vec<Value>) {
        let mut sql = String::with_capacity(self.sql.len() + self.values.len() * 2);
        let mut n = 0;
        for ch in self.sql.chars() {
            if ch != PARAM_MARKER {
                sql.push(ch);
                continue;
            }
            n += 1;
            match self.dialect.param_style {
                ParamStyle::Qmark => sql.push('?'),
                ParamStyle::Numbered => {
                    sql.push('$');
                    sql.push_str(&n.to_string());
                }
                ParamStyle::Format => sql.push_str("%s"),
            }
        }
        (sql, self.values)
    }
}

/// Compile any renderable node to SQL text and parameters.
pub fn compile(node: &dyn Render, dialect: &Dialect) -> Result<(String, Vec<Value>)> {
    let mut ctx = Context::new(dialect);
    node.render(&mut ctx)?;
    Ok(ctx.finish())
}

/// Alias names that need no quoting.
fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub(crate) fn alias_name(ctx: &Context<'_>, name: &str) -> String {
    if is_plain_identifier(name) {
        name.to_string()
    } else {
        ctx.quote(name)
    }
}

impl Render for Node {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        match self {
            Node::Column(c) => c.render(ctx),
            Node::Entity(path) => {
                let quoted = ctx.quote_path(path);
                ctx.literal(&quoted);
                Ok(())
            }
            Node::Value(v) => {
                ctx.value(v.clone());
                Ok(())
            }
            Node::Expression(e) => e.render(ctx),
            Node::Negated(n) => {
                ctx.literal("NOT ");
                n.render(ctx)
            }
            Node::Function(f) => f.render(ctx),
            Node::Ordering(o) => o.render(ctx),
            Node::Alias(a) => a.render(ctx),
            Node::List(l) => l.render(ctx),
            Node::Sql(s) => s.render(ctx),
            Node::Source(s) => s.render(ctx),
            Node::Star(None) => {
                ctx.literal("*");
                Ok(())
            }
            Node::Star(Some(source)) => {
                let alias = ctx.source_alias(source);
                let quoted = ctx.quote(&alias);
                ctx.literal(&quoted).literal(".*");
                Ok(())
            }
            Node::Case(c) => c.render(ctx),
            Node::Cast(c) => {
                ctx.literal("CAST(");
                c.node.render(ctx)?;
                ctx.literal(" AS ").literal(&c.data_type).literal(")");
                Ok(())
            }
        }
    }
}

impl Render for Column {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        let name = ctx.quote(&self.name);
        if ctx.state().scope == Scope::Values {
            ctx.literal(&name);
            return Ok(());
        }
        let alias = ctx.source_alias(&self.source);
        let alias = ctx.quote(&alias);
        ctx.literal(&alias).literal(".").literal(&name);
        Ok(())
    }
}

impl Render for Source {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        match self {
            Source::Table(table) => {
                let path = ctx.quote_path(&table.path());
                match ctx.state().scope {
                    Scope::Source => {
                        let alias = ctx.source_alias(self);
                        let alias = ctx.quote(&alias);
                        ctx.literal(&path).literal(" AS ").literal(&alias);
                    }
                    Scope::Values | Scope::Cte => {
                        ctx.literal(&path);
                    }
                    Scope::Normal => {
                        let alias = ctx.source_alias(self);
                        let alias = ctx.quote(&alias);
                        ctx.literal(&alias);
                    }
                }
                Ok(())
            }
            Source::Join(join) => join.render(ctx),
            Source::Query(q) => {
                let scope = ctx.state().scope;
                ctx.with_state(
                    |s| {
                        s.subquery = true;
                        s.scope = Scope::Normal;
                    },
                    |ctx| q.query.render(ctx),
                )?;
                if scope == Scope::Source {
                    let alias = ctx.source_alias(self);
                    let alias = ctx.quote(&alias);
                    ctx.literal(" AS ").literal(&alias);
                }
                Ok(())
            }
            Source::Cte(cte) => {
                if ctx.cte_stack.iter().any(|n| n == &cte.name) {
                    ctx.recursive_hit = true;
                }
                let name = ctx.quote(&cte.name);
                ctx.literal(&name);
                Ok(())
            }
        }
    }
}

impl Render for Join {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.scope_source(|ctx| {
            self.lhs.render(ctx)?;
            ctx.literal(" ").literal(self.kind.as_sql()).literal(" ");
            self.rhs.render(ctx)
        })?;
        if let Some(on) = &self.on {
            ctx.literal(" ON ");
            ctx.scope_normal(|ctx| on.render(ctx))?;
        }
        Ok(())
    }
}

fn is_empty_list(node: &Node) -> bool {
    matches!(node, Node::List(l) if l.nodes.is_empty())
}

impl Render for Expression {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        if matches!(self.op, Op::In | Op::NotIn) && is_empty_list(&self.rhs) {
            let always = if self.op == Op::In { "(0 = 1)" } else { "(1 = 1)" };
            ctx.literal(always);
            return Ok(());
        }

        let op = ctx.dialect.operator(self.op.as_str()).to_string();
        let converter = self.lhs.field().map(|f| f.kind.clone());
        let rhs_is_column = matches!(self.rhs.unwrap_alias(), Node::Column(_));

        ctx.with_state(
            |s| {
                s.parentheses = !self.flat;
                s.function_args = None;
            },
            |ctx| {
                self.lhs.render(ctx)?;
                if matches!(self.op, Op::Is | Op::IsNot) && matches!(self.rhs, Node::Value(Value::Null)) {
                    ctx.literal(" ").literal(&op).literal(" NULL");
                    return Ok(());
                }
                ctx.literal(" ").literal(&op).literal(" ");
                ctx.with_state(
                    |s| {
                        if let (Some(kind), false) = (converter, rhs_is_column) {
                            s.converter = Some(kind);
                        }
                    },
                    |ctx| self.rhs.render(ctx),
                )
            },
        )
    }
}

impl Render for Function {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.literal(&self.name).literal("(");
        if self.distinct {
            ctx.literal("DISTINCT ");
        }
        let nargs = self.args.len();
        ctx.with_state(|s| s.function_args = Some(nargs), |ctx| ctx.join(&self.args, ", "))?;
        ctx.literal(")");

        if let Some(filter) = &self.filter {
            ctx.literal(" FILTER (WHERE ");
            ctx.with_state(
                |s| {
                    s.scope = Scope::Normal;
                    s.function_args = None;
                },
                |ctx| filter.render(ctx),
            )?;
            ctx.literal(")");
        }

        if let Some(over) = &self.over {
            if !ctx.dialect.window_functions {
                return Err(Error::NotSupported(format!(
                    "window functions are not supported by {}",
                    ctx.dialect.name
                )));
            }
            ctx.literal(" OVER ");
            match over {
                Over::Named(name) => {
                    ctx.literal(name);
                }
                Over::Inline(window) => {
                    ctx.literal("(");
                    window.render(ctx)?;
                    ctx.literal(")");
                }
            }
        }
        Ok(())
    }
}

/// Window body without the surrounding parentheses.
impl Render for Window {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.with_state(
            |s| {
                s.scope = Scope::Normal;
                s.function_args = None;
            },
            |ctx| {
                let mut first = true;
                if !self.partition_by.is_empty() {
                    ctx.literal("PARTITION BY ");
                    ctx.join(&self.partition_by, ", ")?;
                    first = false;
                }
                if !self.order_by.is_empty() {
                    if !first {
                        ctx.literal(" ");
                    }
                    ctx.literal("ORDER BY ");
                    ctx.join(&self.order_by, ", ")?;
                    first = false;
                }
                if let Some(frame) = &self.frame {
                    if !first {
                        ctx.literal(" ");
                    }
                    ctx.literal(&frame_sql(frame));
                }
                Ok(())
            },
        )
    }
}

fn frame_sql(frame: &WindowFrame) -> String {
    let mode = match frame.mode {
        WindowFrameMode::Rows => "ROWS",
        WindowFrameMode::Range => "RANGE",
        WindowFrameMode::Groups => "GROUPS",
    };
    let start = frame_bound_sql(&frame.start);
    match &frame.end {
        Some(end) => format!("{} BETWEEN {} AND {}", mode, start, frame_bound_sql(end)),
        None => format!("{} {}", mode, start),
    }
}

fn frame_bound_sql(bound: &WindowFrameBound) -> String {
    match bound {
        WindowFrameBound::CurrentRow => "CURRENT ROW".to_string(),
        WindowFrameBound::Preceding(None) => "UNBOUNDED PRECEDING".to_string(),
        WindowFrameBound::Preceding(Some(n)) => format!("{} PRECEDING", n),
        WindowFrameBound::Following(None) => "UNBOUNDED FOLLOWING".to_string(),
        WindowFrameBound::Following(Some(n)) => format!("{} FOLLOWING", n),
    }
}

impl Render for Ordering {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        self.node.render(ctx)?;
        if let Some(collation) = &self.collation {
            ctx.literal(" COLLATE ").literal(collation);
        }
        ctx.literal(match self.direction {
            Direction::Asc => " ASC",
            Direction::Desc => " DESC",
        });
        match self.nulls {
            Some(Nulls::First) => {
                ctx.literal(" NULLS FIRST");
            }
            Some(Nulls::Last) => {
                ctx.literal(" NULLS LAST");
            }
            None => {}
        }
        Ok(())
    }
}

impl Render for Alias {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        let name = alias_name(ctx, &self.name);
        match ctx.state().scope {
            Scope::Source | Scope::Values => {
                self.node.render(ctx)?;
                ctx.literal(" AS ").literal(&name);
            }
            Scope::Normal | Scope::Cte => {
                ctx.literal(&name);
            }
        }
        Ok(())
    }
}

impl Render for NodeList {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        // A parenthesized single expression would otherwise gain a second pair.
        if self.parens && self.nodes.len() == 1 {
            if let Node::Expression(e) = &self.nodes[0] {
                let mut flat = (**e).clone();
                flat.flat = true;
                return ctx.with_state(
                    |s| {
                        s.parentheses = true;
                        s.function_args = None;
                    },
                    |ctx| flat.render(ctx),
                );
            }
        }
        ctx.with_state(
            |s| {
                s.parentheses = self.parens;
                s.function_args = None;
            },
            |ctx| ctx.join(&self.nodes, &self.glue),
        )
    }
}

impl Render for Sql {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        let mut params = self.params.iter();
        for ch in self.text.chars() {
            match (ch, params.as_slice().first()) {
                ('?', Some(v)) => {
                    ctx.bind(v.clone());
                    params.next();
                }
                _ => ctx.sql.push(ch),
            }
        }
        Ok(())
    }
}

impl Render for Case {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        ctx.literal("CASE ");
        if let Some(predicate) = &self.predicate {
            predicate.render(ctx)?;
            ctx.literal(" ");
        }
        for (when, then) in &self.whens {
            ctx.literal("WHEN ");
            when.render(ctx)?;
            ctx.literal(" THEN ");
            then.render(ctx)?;
            ctx.literal(" ");
        }
        if let Some(default) = &self.default {
            ctx.literal("ELSE ");
            default.render(ctx)?;
            ctx.literal(" ");
        }
        ctx.literal("END");
        Ok(())
    }
}

impl<T: Render + ?Sized> Render for Box<T> {
    fn render(&self, ctx: &mut Context<'_>) -> Result<()> {
        (**self).render(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::expr::*;
    use crate::ast::field::Field;
    use crate::model::Model;

    fn render(node: &Node) -> (String, Vec<Value>) {
        compile(node, &Dialect::generic()).unwrap()
    }

    #[test]
    fn test_alias_is_stable_within_statement() {
        let users = Table::new("users");
        let node = list([users.c("id"), users.c("name")], false);
        let (sql, _) = render(&node);
        assert_eq!(sql, "\"t1\".\"id\", \"t1\".\"name\"");
    }

    #[test]
    fn test_alias_levels_are_private() {
        let users = Table::new("users");
        let tweets = Table::new("tweets");
        let dialect = Dialect::generic();
        let mut ctx = Context::new(&dialect);
        ctx.aliases.add(&users.key());
        ctx.push_alias(|ctx| {
            assert_eq!(ctx.aliases.add(&tweets.key()), "t2");
            // Outer sources stay visible.
            assert_eq!(ctx.aliases.get(&users.key()), "t1");
            Ok(())
        })
        .unwrap();
        ctx.push_alias(|ctx| {
            assert_eq!(ctx.aliases.add(&tweets.key()), "t3");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_bind_values_in_emission_order() {
        let users = Table::new("users");
        let node = and_([
            users.c("a").eq(1),
            users.c("b").eq("x"),
            users.c("c").in_(vec![3, 4]),
        ])
        .unwrap();
        let (sql, params) = render(&node);
        assert_eq!(
            sql,
            "(((\"t1\".\"a\" = ?) AND (\"t1\".\"b\" = ?)) AND (\"t1\".\"c\" IN (?, ?)))"
        );
        assert_eq!(
            params,
            vec![Value::Int(1), Value::Text("x".into()), Value::Int(3), Value::Int(4)]
        );
    }

    #[test]
    fn test_numbered_placeholders() {
        let users = Table::new("users");
        let node = users.c("a").eq(1).or(users.c("b").eq(2));
        let (sql, _) = compile(&node, &Dialect::postgres()).unwrap();
        assert_eq!(sql, "((\"t1\".\"a\" = $1) OR (\"t1\".\"b\" = $2))");
        let (sql, _) = compile(&node, &Dialect::mysql()).unwrap();
        assert_eq!(sql, "((`t1`.`a` = %s) OR (`t1`.`b` = %s))");
    }

    #[test]
    fn test_capture_and_splice_keep_order() {
        let dialect = Dialect::postgres();
        let mut ctx = Context::new(&dialect);
        let later = ctx
            .capture(|ctx| {
                ctx.literal("b = ").value(Value::Int(2));
                Ok(())
            })
            .unwrap();
        ctx.literal("a = ").value(Value::Int(1)).literal(" AND ");
        ctx.splice(later);
        let (sql, params) = ctx.finish();
        assert_eq!(sql, "a = $1 AND b = $2");
        assert_eq!(params, vec![Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn test_scopes() {
        let users = Table::new("users");
        let col = Node::from(users.c("id"));
        let dialect = Dialect::generic();
        let mut ctx = Context::new(&dialect);
        ctx.scope_values(|ctx| col.render(ctx)).unwrap();
        ctx.literal(" | ");
        ctx.scope_source(|ctx| Node::from(users.clone()).render(ctx)).unwrap();
        ctx.literal(" | ");
        ctx.scope_values(|ctx| Node::from(users.clone()).render(ctx)).unwrap();
        let (sql, _) = ctx.finish();
        assert_eq!(sql, "\"id\" | \"users\" AS \"t1\" | \"users\"");
    }

    #[test]
    fn test_alias_rendering_by_scope() {
        let users = Table::new("users");
        let node = count(users.c("id")).alias("ct");
        let dialect = Dialect::generic();
        let mut ctx = Context::new(&dialect);
        ctx.scope_source(|ctx| node.render(ctx)).unwrap();
        ctx.literal(" | ");
        node.render(&mut ctx).unwrap();
        ctx.literal(" | ");
        ctx.scope_source(|ctx| users.c("id").alias("user id").render(ctx))
            .unwrap();
        let (sql, _) = ctx.finish();
        assert_eq!(
            sql,
            "COUNT(\"t1\".\"id\") AS ct | ct | \"t1\".\"id\" AS \"user id\""
        );
    }

    #[test]
    fn test_single_expression_list_is_flat() {
        let users = Table::new("users");
        let node = list([users.c("a").eq(1)], true);
        let (sql, _) = render(&node);
        assert_eq!(sql, "(\"t1\".\"a\" = ?)");
    }

    #[test]
    fn test_empty_in() {
        let users = Table::new("users");
        let (sql, params) = render(&users.c("id").in_(Vec::<i64>::new()));
        assert_eq!(sql, "(0 = 1)");
        assert!(params.is_empty());
        let (sql, _) = render(&users.c("id").not_in(Vec::<i64>::new()));
        assert_eq!(sql, "(1 = 1)");
    }

    #[test]
    fn test_is_null() {
        let users = Table::new("users");
        let (sql, params) = render(&users.c("email").is_null());
        assert_eq!(sql, "(\"t1\".\"email\" IS NULL)");
        assert!(params.is_empty());
        let (sql, _) = render(&users.c("email").is_not_null());
        assert_eq!(sql, "(\"t1\".\"email\" IS NOT NULL)");
    }

    #[test]
    fn test_operator_translation() {
        let users = Table::new("users");
        let (sql, _) = compile(&users.c("name").ilike("a%"), &Dialect::sqlite()).unwrap();
        assert_eq!(sql, "(\"t1\".\"name\" LIKE ?)");
    }

    #[test]
    fn test_typed_lhs_converts_rhs() {
        let model = Model::builder("users")
            .field(Field::integer("id").primary_key())
            .field(Field::boolean("admin"))
            .build();
        let users = model.table();
        let (_, params) = render(&users.c("id").eq("42"));
        assert_eq!(params, vec![Value::Int(42)]);
        let (_, params) = render(&users.c("admin").eq(1));
        assert_eq!(params, vec![Value::Bool(true)]);
    }

    #[test]
    fn test_raw_sql_params() {
        let node = sql("a = ? AND b = ?", vec![Value::Int(1), Value::Int(2)]);
        let (text, params) = compile(&node, &Dialect::postgres()).unwrap();
        assert_eq!(text, "a = $1 AND b = $2");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_function_filter_and_window() {
        let users = Table::new("users");
        let node = Node::from(
            count(users.c("id"))
                .filter(users.c("active").eq(true))
                .over(Window::new().partition_by([users.c("team")])),
        );
        let (sql, _) = render(&node);
        assert_eq!(
            sql,
            "COUNT(\"t1\".\"id\") FILTER (WHERE (\"t1\".\"active\" = ?)) OVER (PARTITION BY \"t1\".\"team\")"
        );

        let mut dialect = Dialect::generic();
        dialect.window_functions = false;
        let err = compile(&node, &dialect).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_window_frame() {
        let users = Table::new("users");
        let window = Window::new()
            .order_by([users.c("id").asc()])
            .frame(WindowFrame {
                mode: WindowFrameMode::Rows,
                start: WindowFrameBound::Preceding(None),
                end: Some(WindowFrameBound::CurrentRow),
            });
        let node = Node::from(fn_("SUM", [users.c("amount")]).over(window));
        let (sql, _) = render(&node);
        assert!(sql.ends_with(
            "OVER (ORDER BY \"t1\".\"id\" ASC ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW)"
        ));
    }

    #[test]
    fn test_case_and_cast() {
        let users = Table::new("users");
        let node = case(
            None,
            vec![(users.c("score").gt(10), Node::from("high"))],
            Some(Node::from("low")),
        );
        let (sql, params) = render(&node);
        assert_eq!(sql, "CASE WHEN (\"t1\".\"score\" > ?) THEN ? ELSE ? END");
        assert_eq!(params.len(), 3);

        let (sql, _) = render(&cast(users.c("id"), "TEXT"));
        assert_eq!(sql, "CAST(\"t1\".\"id\" AS TEXT)");
    }
}
