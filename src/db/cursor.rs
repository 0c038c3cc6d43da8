//! Lazy, caching adapter between a live cursor and shaped rows.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use super::connection::Cursor;
use super::rows::{NamedRow, Object, Row};
use crate::ast::field::FieldKind;
use crate::ast::types::{Node, Source, SourceKey};
use crate::ast::value::Value;
use crate::error::{Error, Result};
use crate::query::{Constructor, JoinEdge, RowFn, RowPlan, RowShape};

/// Where one projected column lands and how its cells are converted.
#[derive(Debug, Clone)]
struct ColumnSlot {
    owner: Option<SourceKey>,
    attr: String,
    kind: Option<FieldKind>,
}

/// Reconstruction graph: accumulators in BFS order from the root, and the
/// edges connecting them in the order they were discovered.
#[derive(Debug)]
struct ObjectGraph {
    root: Option<SourceKey>,
    constructors: Vec<(SourceKey, Constructor)>,
    edges: Vec<JoinEdge>,
}

enum Shape {
    Tuples,
    Dicts,
    Named,
    Constructor(RowFn),
    Objects(ObjectGraph),
}

struct Strategy {
    labels: Arc<Vec<String>>,
    slots: Vec<ColumnSlot>,
    shape: Shape,
}

fn collect_leaves<'a>(source: &'a Source, out: &mut Vec<&'a Source>) {
    match source {
        Source::Join(join) => {
            collect_leaves(&join.lhs, out);
            collect_leaves(&join.rhs, out);
        }
        other => out.push(other),
    }
}

impl ObjectGraph {
    fn new(plan: &RowPlan) -> Self {
        let root_source = plan.sources.first().map(Source::root);
        let root = root_source.and_then(Source::key);
        let (root_source, root_key) = match (root_source, root) {
            (Some(source), Some(key)) => (source, key),
            _ => {
                return Self {
                    root: None,
                    constructors: Vec::new(),
                    edges: Vec::new(),
                }
            }
        };

        let mut leaves = Vec::new();
        for source in &plan.sources {
            collect_leaves(source, &mut leaves);
        }
        let present: HashSet<SourceKey> = leaves.iter().filter_map(|s| s.key()).collect();

        let mut constructors = vec![(root_key.clone(), Constructor::for_source(root_source))];
        let mut edges = Vec::new();
        let mut seen = HashSet::from([root_key.clone()]);
        let mut queue = VecDeque::from([root_key.clone()]);
        while let Some(current) = queue.pop_front() {
            for edge in plan.edges.iter().filter(|e| e.lhs == current) {
                if !present.contains(&edge.rhs) || !seen.insert(edge.rhs.clone()) {
                    continue;
                }
                constructors.push((edge.rhs.clone(), edge.constructor.clone()));
                edges.push(edge.clone());
                queue.push_back(edge.rhs.clone());
            }
        }

        Self {
            root: Some(root_key),
            constructors,
            edges,
        }
    }

    fn contains(&self, key: &SourceKey) -> bool {
        self.constructors.iter().any(|(k, _)| k == key)
    }

    fn build(&self, labels: &[String], slots: &[ColumnSlot], values: Vec<Value>) -> Object {
        let root = match &self.root {
            Some(root) => root,
            None => {
                let mut object = Object::map();
                for (label, value) in labels.iter().zip(values) {
                    object.set(label, value);
                }
                return object;
            }
        };

        let mut objects: HashMap<&SourceKey, Object> = self
            .constructors
            .iter()
            .map(|(key, constructor)| (key, constructor.build()))
            .collect();

        // Sources holding a non-NULL value, directly or through a descendant.
        let mut set: HashSet<&SourceKey> = HashSet::new();
        for (slot, value) in slots.iter().zip(values) {
            let owner = slot
                .owner
                .as_ref()
                .filter(|k| objects.contains_key(k))
                .unwrap_or(root);
            if !value.is_null() {
                set.insert(owner);
            }
            if let Some(object) = objects.get_mut(owner) {
                object.set(&slot.attr, value);
            }
        }

        // Leaves first, so a child is complete before it moves into its parent.
        for edge in self.edges.iter().rev() {
            let child = match objects.remove(&edge.rhs) {
                Some(child) => child,
                None => continue,
            };
            if !set.contains(&edge.rhs) {
                continue;
            }
            set.insert(&edge.lhs);
            if let Some(parent) = objects.get_mut(&edge.lhs) {
                parent.attach(&edge.attr, child);
            }
        }

        objects.remove(root).unwrap_or_else(Object::map)
    }
}

/// Resolve the owning source, attribute and converter for each column.
fn resolve_slots(plan: &RowPlan, labels: &[String], graph: Option<&ObjectGraph>) -> Vec<ColumnSlot> {
    let root = plan.sources.first().map(Source::root);
    let root_model = root.and_then(Source::model);
    let positional = plan.projection.len() == labels.len()
        && !plan.projection.iter().any(|n| matches!(n, Node::Star(_)));

    labels
        .iter()
        .enumerate()
        .map(|(i, label)| {
            let node = if positional { plan.projection.get(i) } else { None };
            let aliased = matches!(node, Some(Node::Alias(_)));

            if let Some(Node::Column(column)) = node.map(Node::unwrap_alias) {
                let owner = column.source.key();
                let owned = match (&owner, graph) {
                    (Some(key), Some(graph)) => graph.contains(key),
                    _ => true,
                };
                if let (true, Some(field)) = (owned, &column.field) {
                    return ColumnSlot {
                        owner,
                        attr: if aliased { label.clone() } else { field.name.clone() },
                        kind: Some(field.kind.clone()),
                    };
                }
                if owned && column.field.is_none() {
                    return ColumnSlot {
                        owner,
                        attr: label.clone(),
                        kind: None,
                    };
                }
            }

            if let Some(field) = root_model.and_then(|m| m.field(label)) {
                return ColumnSlot {
                    owner: None,
                    attr: field.name.clone(),
                    kind: Some(field.kind.clone()),
                };
            }

            if let Some(Node::Function(function)) = node.map(Node::unwrap_alias) {
                if function.coerce && function.args.len() == 1 {
                    if let Some(field) = function.args[0].field() {
                        return ColumnSlot {
                            owner: None,
                            attr: label.clone(),
                            kind: Some(field.kind.clone()),
                        };
                    }
                }
            }

            ColumnSlot {
                owner: None,
                attr: label.clone(),
                kind: None,
            }
        })
        .collect()
}

impl Strategy {
    fn new(plan: &RowPlan, description: &[String]) -> Self {
        let labels = Arc::new(description.to_vec());
        let shape = match &plan.shape {
            RowShape::Tuples => Shape::Tuples,
            RowShape::Dicts => Shape::Dicts,
            RowShape::Named => Shape::Named,
            RowShape::Constructor(f) => Shape::Constructor(Arc::clone(f)),
            RowShape::Objects => Shape::Objects(ObjectGraph::new(plan)),
        };
        let graph = match &shape {
            Shape::Objects(graph) => Some(graph),
            _ => None,
        };
        let slots = resolve_slots(plan, &labels, graph);
        Self {
            labels,
            slots,
            shape,
        }
    }

    fn convert(&self, raw: Vec<Value>) -> Vec<Value> {
        raw.into_iter()
            .enumerate()
            .map(|(i, value)| match self.slots.get(i).and_then(|s| s.kind.as_ref()) {
                Some(kind) => kind.from_db(value),
                None => value,
            })
            .collect()
    }

    fn process(&self, raw: Vec<Value>) -> Row {
        let values = self.convert(raw);
        match &self.shape {
            Shape::Tuples => Row::Tuple(values),
            Shape::Dicts => Row::Dict(
                self.labels
                    .iter()
                    .cloned()
                    .zip(values)
                    .collect::<BTreeMap<_, _>>(),
            ),
            Shape::Named => Row::Named(NamedRow::new(Arc::clone(&self.labels), values)),
            Shape::Constructor(f) => {
                Row::Object(f(&NamedRow::new(Arc::clone(&self.labels), values)))
            }
            Shape::Objects(graph) => Row::Object(graph.build(&self.labels, &self.slots, values)),
        }
    }
}

/// Rows of an executed statement, pulled from the cursor on demand and
/// cached.
///
/// Once the cursor is exhausted the wrapper is a fixed, fully cached
/// sequence.
pub struct CursorWrapper {
    cursor: Option<Box<dyn Cursor>>,
    cache: Vec<Row>,
    strategy: Strategy,
}

impl fmt::Debug for CursorWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorWrapper")
            .field("columns", &self.strategy.labels)
            .field("cached", &self.cache.len())
            .field("populated", &self.is_populated())
            .finish()
    }
}

impl CursorWrapper {
    pub fn new(cursor: Box<dyn Cursor>, plan: RowPlan) -> Self {
        let strategy = Strategy::new(&plan, cursor.description());
        Self {
            cursor: Some(cursor),
            cache: Vec::new(),
            strategy,
        }
    }

    /// Column labels reported by the cursor.
    pub fn columns(&self) -> &[String] {
        &self.strategy.labels
    }

    /// True once the underlying cursor has been drained.
    pub fn is_populated(&self) -> bool {
        self.cursor.is_none()
    }

    fn pull(&mut self) -> Result<Option<Row>> {
        let cursor = match self.cursor.as_mut() {
            Some(cursor) => cursor,
            None => return Ok(None),
        };
        match cursor.fetch_one()? {
            Some(raw) => Ok(Some(self.strategy.process(raw))),
            None => {
                self.cursor = None;
                Ok(None)
            }
        }
    }

    /// Cache at least `n` rows, or everything when `n` is `None`.
    pub fn fill_cache(&mut self, n: Option<usize>) -> Result<()> {
        while n.map_or(true, |n| self.cache.len() < n) {
            match self.pull()? {
                Some(row) => self.cache.push(row),
                None => break,
            }
        }
        Ok(())
    }

    pub fn get(&mut self, index: usize) -> Result<&Row> {
        self.fill_cache(Some(index + 1))?;
        let len = self.cache.len();
        self.cache
            .get(index)
            .ok_or(Error::IndexOutOfRange { index, len })
    }

    pub fn len(&mut self) -> Result<usize> {
        self.fill_cache(None)?;
        Ok(self.cache.len())
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        self.fill_cache(Some(1))?;
        Ok(self.cache.is_empty())
    }

    pub fn rows(&mut self) -> Result<&[Row]> {
        self.fill_cache(None)?;
        Ok(&self.cache)
    }

    pub fn into_rows(mut self) -> Result<Vec<Row>> {
        self.fill_cache(None)?;
        Ok(self.cache)
    }

    /// Iterate, caching rows as they are pulled.
    pub fn iter(&mut self) -> Iter<'_> {
        Iter {
            wrapper: self,
            position: 0,
        }
    }

    /// One-pass iteration that does not cache.
    pub fn iterator(self) -> RowIter {
        RowIter {
            cached: self.cache.into_iter(),
            cursor: self.cursor,
            strategy: self.strategy,
        }
    }

    pub fn first(&mut self) -> Result<Option<Row>> {
        self.fill_cache(Some(1))?;
        Ok(self.cache.first().cloned())
    }

    /// First column of the first row.
    pub fn scalar(&mut self) -> Result<Option<Value>> {
        Ok(self.first()?.and_then(|row| row.first_value().cloned()))
    }
}

pub struct Iter<'a> {
    wrapper: &'a mut CursorWrapper,
    position: usize,
}

impl Iterator for Iter<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(err) = self.wrapper.fill_cache(Some(self.position + 1)) {
            return Some(Err(err));
        }
        let row = self.wrapper.cache.get(self.position).cloned()?;
        self.position += 1;
        Some(Ok(row))
    }
}

pub struct RowIter {
    cached: std::vec::IntoIter<Row>,
    cursor: Option<Box<dyn Cursor>>,
    strategy: Strategy,
}

impl Iterator for RowIter {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(row) = self.cached.next() {
            return Some(Ok(row));
        }
        let cursor = self.cursor.as_mut()?;
        match cursor.fetch_one() {
            Ok(Some(raw)) => Some(Ok(self.strategy.process(raw))),
            Ok(None) => {
                self.cursor = None;
                None
            }
            Err(err) => {
                self.cursor = None;
                Some(Err(err.into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::expr::{count, max, ExprExt};
    use crate::ast::field::Field;
    use crate::ast::types::{JoinType, Table};
    use crate::db::connection::VecCursor;
    use crate::db::rows::Datum;
    use crate::model::Model;
    use crate::query::{Query, Select};

    fn cursor(columns: &[&str], rows: Vec<Vec<Value>>) -> Box<dyn Cursor> {
        Box::new(VecCursor::new(
            columns.iter().map(|c| c.to_string()).collect(),
            rows,
        ))
    }

    fn plan(shape: RowShape) -> RowPlan {
        RowPlan {
            shape,
            projection: Vec::new(),
            sources: Vec::new(),
            edges: Vec::new(),
        }
    }

    fn numbers(n: i64) -> Vec<Vec<Value>> {
        (1..=n).map(|i| vec![Value::Int(i)]).collect()
    }

    #[test]
    fn test_fill_cache_is_incremental() {
        let mut rows = CursorWrapper::new(cursor(&["n"], numbers(5)), plan(RowShape::Tuples));
        rows.fill_cache(Some(2)).unwrap();
        assert!(!rows.is_populated());
        assert_eq!(rows.get(1).unwrap(), &Row::Tuple(vec![Value::Int(2)]));
        rows.fill_cache(Some(1)).unwrap();
        assert_eq!(rows.len().unwrap(), 5);
        assert!(rows.is_populated());
    }

    #[test]
    fn test_out_of_range_only_after_exhaustion() {
        let mut rows = CursorWrapper::new(cursor(&["n"], numbers(3)), plan(RowShape::Tuples));
        assert!(rows.get(2).is_ok());
        assert!(matches!(
            rows.get(3),
            Err(Error::IndexOutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn test_caching_iter_and_one_pass_iterator() {
        let mut rows = CursorWrapper::new(cursor(&["n"], numbers(4)), plan(RowShape::Tuples));
        let firsts: Vec<Row> = rows.iter().take(2).map(|r| r.unwrap()).collect();
        assert_eq!(firsts.len(), 2);
        let again: Vec<Row> = rows.iter().map(|r| r.unwrap()).collect();
        assert_eq!(again.len(), 4);
        assert_eq!(again[..2], firsts[..]);

        let mut fresh = CursorWrapper::new(cursor(&["n"], numbers(4)), plan(RowShape::Tuples));
        fresh.fill_cache(Some(1)).unwrap();
        let all: Vec<Row> = fresh.iterator().map(|r| r.unwrap()).collect();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_dicts_named_and_constructor_shapes() {
        let raw = vec![vec![Value::Int(1), Value::Text("huey".into())]];
        let mut dicts = CursorWrapper::new(cursor(&["id", "name"], raw.clone()), plan(RowShape::Dicts));
        let row = dicts.first().unwrap().unwrap();
        assert_eq!(row.get("name"), Some(&Value::Text("huey".into())));

        let mut named = CursorWrapper::new(cursor(&["id", "name"], raw.clone()), plan(RowShape::Named));
        let row = named.first().unwrap().unwrap();
        assert_eq!(row.first_value(), Some(&Value::Int(1)));
        assert_eq!(row.get("id"), Some(&Value::Int(1)));

        let shape = RowShape::Constructor(Arc::new(|row: &NamedRow| {
            let mut object = Object::map();
            object.set("label", row.get("name").cloned().unwrap_or_default());
            object
        }));
        let mut built = CursorWrapper::new(cursor(&["id", "name"], raw), plan(shape));
        let row = built.first().unwrap().unwrap();
        assert_eq!(row.get("label"), Some(&Value::Text("huey".into())));
    }

    #[test]
    fn test_typed_columns_are_converted() {
        let users = Model::builder("users")
            .field(Field::integer("id").primary_key())
            .field(Field::boolean("admin"))
            .build();
        let query = users.select();
        let mut rows = CursorWrapper::new(
            cursor(&["id", "admin"], vec![vec![Value::Text("7".into()), Value::Int(0)]]),
            query.row_plan(),
        );
        assert_eq!(
            rows.first().unwrap().unwrap(),
            Row::Tuple(vec![Value::Int(7), Value::Bool(false)])
        );
    }

    fn three_models() -> (Arc<Model>, Arc<Model>, Arc<Model>) {
        let users = Model::builder("users")
            .field(Field::integer("id").primary_key())
            .field(Field::text("username"))
            .build();
        let tweets = Model::builder("tweets")
            .field(Field::integer("id").primary_key())
            .foreign_key(Field::integer("user_id"), &users, "id", "tweets")
            .field(Field::text("content"))
            .field(Field::boolean("pinned"))
            .build();
        let favorites = Model::builder("favorites")
            .field(Field::integer("id").primary_key())
            .foreign_key(Field::integer("tweet_id"), &tweets, "id", "favorites")
            .field(Field::boolean("flag"))
            .build();
        (users, tweets, favorites)
    }

    #[test]
    fn test_three_model_join_reconstruction() {
        let (users, tweets, favorites) = three_models();
        let query = Select::new()
            .from(users.table())
            .columns([
                Node::from(users.c("username")),
                tweets.c("content").into(),
                tweets.c("pinned").into(),
                count(favorites.c("flag")).alias("n"),
                max(tweets.c("pinned")).alias("any_pinned"),
            ])
            .join_related(tweets.table(), JoinType::Inner)
            .unwrap()
            .join_related(favorites.table(), JoinType::LeftOuter)
            .unwrap()
            .group_by([users.c("username"), tweets.c("content"), tweets.c("pinned")])
            .objects();

        let mut rows = CursorWrapper::new(
            cursor(
                &["username", "content", "pinned", "n", "any_pinned"],
                vec![vec![
                    Value::Text("huey".into()),
                    Value::Text("meow".into()),
                    Value::Int(1),
                    Value::Int(3),
                    Value::Int(1),
                ]],
            ),
            query.row_plan(),
        );
        let row = rows.first().unwrap().unwrap();
        let user = row.as_object().unwrap();
        assert_eq!(user.model().map(|m| m.table_name()), Some("users"));
        assert_eq!(user.get("username"), Some(&Value::Text("huey".into())));
        // Aggregates over typed columns keep the raw value.
        assert_eq!(user.get("n"), Some(&Value::Int(3)));
        // Coercing functions borrow the argument's converter.
        assert_eq!(user.get("any_pinned"), Some(&Value::Bool(true)));
        assert_eq!(user.get("content"), None);

        let tweet = user.related("tweets").unwrap();
        assert_eq!(tweet.model().map(|m| m.table_name()), Some("tweets"));
        assert_eq!(tweet.get("content"), Some(&Value::Text("meow".into())));
        assert_eq!(tweet.get("pinned"), Some(&Value::Bool(true)));
        // No favorites columns were selected, so nothing is attached.
        assert!(tweet.related("favorites").is_none());
    }

    #[test]
    fn test_left_join_miss_is_not_attached() {
        let (users, tweets, _) = three_models();
        let query = Select::new()
            .from(users.table())
            .columns([users.c("username"), tweets.c("content")])
            .join_related(tweets.table(), JoinType::LeftOuter)
            .unwrap()
            .objects();
        let mut rows = CursorWrapper::new(
            cursor(
                &["username", "content"],
                vec![
                    vec![Value::Text("huey".into()), Value::Null],
                    vec![Value::Text("zaizee".into()), Value::Text("purr".into())],
                ],
            ),
            query.row_plan(),
        );
        let all = rows.rows().unwrap().to_vec();
        let huey = all[0].as_object().unwrap();
        assert!(huey.related("tweets").is_none());
        let zaizee = all[1].as_object().unwrap();
        assert_eq!(
            zaizee.related("tweets").and_then(|t| t.get("content")),
            Some(&Value::Text("purr".into()))
        );
    }

    #[test]
    fn test_grandchild_attaches_through_unselected_parent() {
        let (users, tweets, favorites) = three_models();
        let query = Select::new()
            .from(users.table())
            .columns([users.c("username"), favorites.c("flag")])
            .join_related(tweets.table(), JoinType::Inner)
            .unwrap()
            .join_related(favorites.table(), JoinType::LeftOuter)
            .unwrap()
            .objects();
        let mut rows = CursorWrapper::new(
            cursor(
                &["username", "flag"],
                vec![
                    vec![Value::Text("huey".into()), Value::Int(1)],
                    vec![Value::Text("zaizee".into()), Value::Null],
                ],
            ),
            query.row_plan(),
        );
        let all = rows.rows().unwrap().to_vec();

        let huey = all[0].as_object().unwrap();
        let tweet = huey.related("tweets").unwrap();
        assert_eq!(tweet.model().map(|m| m.table_name()), Some("tweets"));
        assert_eq!(
            tweet.related("favorites").and_then(|f| f.get("flag")),
            Some(&Value::Bool(true))
        );

        let zaizee = all[1].as_object().unwrap();
        assert!(zaizee.related("tweets").is_none());
    }

    #[test]
    fn test_untyped_sources_reconstruct_as_maps() {
        let (a, b) = (Table::new("a"), Table::new("b"));
        let query = Select::new()
            .from(a.clone())
            .columns([a.c("x"), b.c("y")])
            .join_as(b.clone(), JoinType::Inner, Some(b.c("a_id").eq(a.c("id"))), "bee")
            .objects();
        let mut rows = CursorWrapper::new(
            cursor(&["x", "y"], vec![vec![Value::Int(1), Value::Int(2)]]),
            query.row_plan(),
        );
        let row = rows.first().unwrap().unwrap();
        let object = row.as_object().unwrap();
        assert_eq!(object.get("x"), Some(&Value::Int(1)));
        match object {
            Object::Map(map) => match map.get("bee") {
                Some(Datum::Object(child)) => assert_eq!(child.get("y"), Some(&Value::Int(2))),
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_scalar_on_empty_result() {
        let mut rows = CursorWrapper::new(cursor(&["n"], Vec::new()), plan(RowShape::Tuples));
        assert_eq!(rows.scalar().unwrap(), None);
        assert!(rows.is_empty().unwrap());
    }
}
