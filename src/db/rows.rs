//! Row shapes produced by the cursor wrapper.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ast::value::Value;
use crate::model::Model;

/// Labeled record: values addressable by position or column label.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedRow {
    columns: Arc<Vec<String>>,
    values: Vec<Value>,
}

impl NamedRow {
    pub fn new(columns: Arc<Vec<String>>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    pub fn index(&self, i: usize) -> Option<&Value> {
        self.values.get(i)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Entry of a mapping object: a plain value or a nested object.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
    Value(Value),
    Object(Object),
}

/// Reconstructed model instance.
#[derive(Debug, Clone)]
pub struct Instance {
    pub model: Arc<Model>,
    pub values: BTreeMap<String, Value>,
    pub related: BTreeMap<String, Object>,
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.model.table_name() == other.model.table_name()
            && self.values == other.values
            && self.related == other.related
    }
}

/// Object built from one source's share of a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    Instance(Instance),
    Map(BTreeMap<String, Datum>),
}

impl Object {
    pub fn instance(model: Arc<Model>) -> Self {
        Object::Instance(Instance {
            model,
            values: BTreeMap::new(),
            related: BTreeMap::new(),
        })
    }

    pub fn map() -> Self {
        Object::Map(BTreeMap::new())
    }

    pub fn get(&self, attr: &str) -> Option<&Value> {
        match self {
            Object::Instance(i) => i.values.get(attr),
            Object::Map(m) => match m.get(attr) {
                Some(Datum::Value(v)) => Some(v),
                _ => None,
            },
        }
    }

    pub fn related(&self, attr: &str) -> Option<&Object> {
        match self {
            Object::Instance(i) => i.related.get(attr),
            Object::Map(m) => match m.get(attr) {
                Some(Datum::Object(o)) => Some(o),
                _ => None,
            },
        }
    }

    pub fn set(&mut self, attr: &str, value: Value) {
        match self {
            Object::Instance(i) => {
                i.values.insert(attr.to_string(), value);
            }
            Object::Map(m) => {
                m.insert(attr.to_string(), Datum::Value(value));
            }
        }
    }

    pub fn attach(&mut self, attr: &str, child: Object) {
        match self {
            Object::Instance(i) => {
                i.related.insert(attr.to_string(), child);
            }
            Object::Map(m) => {
                m.insert(attr.to_string(), Datum::Object(child));
            }
        }
    }

    pub fn model(&self) -> Option<&Arc<Model>> {
        match self {
            Object::Instance(i) => Some(&i.model),
            Object::Map(_) => None,
        }
    }
}

/// One materialized row.
#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Tuple(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    Named(NamedRow),
    Object(Object),
}

impl Row {
    /// First column, for positional shapes.
    pub fn first_value(&self) -> Option<&Value> {
        match self {
            Row::Tuple(values) => values.first(),
            Row::Named(row) => row.index(0),
            Row::Dict(_) | Row::Object(_) => None,
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        match self {
            Row::Tuple(_) => None,
            Row::Dict(map) => map.get(column),
            Row::Named(row) => row.get(column),
            Row::Object(obj) => obj.get(column),
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Row::Object(obj) => Some(obj),
            _ => None,
        }
    }
}
