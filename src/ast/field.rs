//! Typed column metadata.
//!
//! A [`Field`] attached to a column lets the compiler coerce bind values into
//! their storage representation and lets the result layer convert cells back.

use std::fmt;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};

use super::value::Value;

/// User supplied conversion between application and storage values.
pub trait ValueConverter: Send + Sync + fmt::Debug {
    /// Application value → storage value.
    fn to_db(&self, value: Value) -> Value;

    /// Storage value → application value.
    fn from_db(&self, value: Value) -> Value;
}

/// Storage type of a field; decides how values are converted.
#[derive(Debug, Clone)]
pub enum FieldKind {
    Any,
    Integer,
    Float,
    Text,
    Boolean,
    Date,
    DateTime,
    Json,
    Bytes,
    Custom(Arc<dyn ValueConverter>),
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
];

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

impl FieldKind {
    pub fn to_db(&self, value: Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (FieldKind::Integer, Value::Text(s)) => match s.trim().parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => Value::Text(s),
            },
            (FieldKind::Integer, Value::Bool(b)) => Value::Int(b as i64),
            (FieldKind::Float, Value::Int(i)) => Value::Float(i as f64),
            (FieldKind::Text, Value::Int(i)) => Value::Text(i.to_string()),
            (FieldKind::Text, Value::Float(f)) => Value::Text(f.to_string()),
            (FieldKind::Boolean, Value::Int(i)) => Value::Bool(i != 0),
            (FieldKind::DateTime, Value::Text(s)) => match parse_datetime(&s) {
                Some(dt) => Value::DateTime(dt),
                None => Value::Text(s),
            },
            (FieldKind::Date, Value::Text(s)) => match NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
                Ok(d) => Value::Date(d),
                Err(_) => Value::Text(s),
            },
            (FieldKind::Custom(conv), v) => conv.to_db(v),
            (_, v) => v,
        }
    }

    pub fn from_db(&self, value: Value) -> Value {
        match (self, value) {
            (_, Value::Null) => Value::Null,
            (FieldKind::Integer, Value::Text(s)) => match s.trim().parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => Value::Text(s),
            },
            (FieldKind::Integer, Value::Float(f)) => Value::Int(f as i64),
            (FieldKind::Float, Value::Int(i)) => Value::Float(i as f64),
            (FieldKind::Text, Value::Int(i)) => Value::Text(i.to_string()),
            (FieldKind::Boolean, Value::Int(i)) => Value::Bool(i != 0),
            (FieldKind::DateTime, Value::Text(s)) => match parse_datetime(&s) {
                Some(dt) => Value::DateTime(dt),
                None => Value::Text(s),
            },
            (FieldKind::Date, Value::Text(s)) => match NaiveDate::parse_from_str(&s, "%Y-%m-%d") {
                Ok(d) => Value::Date(d),
                Err(_) => Value::Text(s),
            },
            (FieldKind::Json, Value::Text(s)) => match serde_json::from_str(&s) {
                Ok(j) => Value::Json(j),
                Err(_) => Value::Text(s),
            },
            (FieldKind::Custom(conv), v) => conv.from_db(v),
            (_, v) => v,
        }
    }
}

/// Ordering used when a statement emits columns (INSERT column lists, SET
/// assignments): typed fields first, primary key leading and then declaration
/// order; untyped columns after, by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SortKey {
    Field(u8, usize),
    Name(String),
}

/// A declared, typed column.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub column_name: String,
    pub kind: FieldKind,
    pub primary_key: bool,
    pub null: bool,
    pub default: Option<Value>,
    /// Declaration index inside the owning model.
    pub order: usize,
}

impl Field {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            column_name: name.to_string(),
            kind,
            primary_key: false,
            null: false,
            default: None,
            order: 0,
        }
    }

    pub fn integer(name: &str) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn float(name: &str) -> Self {
        Self::new(name, FieldKind::Float)
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, FieldKind::Text)
    }

    pub fn boolean(name: &str) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn datetime(name: &str) -> Self {
        Self::new(name, FieldKind::DateTime)
    }

    pub fn json(name: &str) -> Self {
        Self::new(name, FieldKind::Json)
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn column_name(mut self, column: &str) -> Self {
        self.column_name = column.to_string();
        self
    }

    pub fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn sort_key(&self) -> SortKey {
        SortKey::Field(u8::from(!self.primary_key), self.order)
    }

    pub fn to_db(&self, value: Value) -> Value {
        self.kind.to_db(value)
    }

    pub fn from_db(&self, value: Value) -> Value {
        self.kind.from_db(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Cents;

    impl ValueConverter for Cents {
        fn to_db(&self, value: Value) -> Value {
            match value {
                Value::Float(f) => Value::Int((f * 100.0).round() as i64),
                v => v,
            }
        }

        fn from_db(&self, value: Value) -> Value {
            match value {
                Value::Int(i) => Value::Float(i as f64 / 100.0),
                v => v,
            }
        }
    }

    #[test]
    fn test_builtin_conversions() {
        assert_eq!(FieldKind::Integer.to_db(Value::Text("42".into())), Value::Int(42));
        assert_eq!(FieldKind::Boolean.from_db(Value::Int(0)), Value::Bool(false));
        assert_eq!(FieldKind::Text.to_db(Value::Int(7)), Value::Text("7".into()));
        assert_eq!(FieldKind::Integer.to_db(Value::Null), Value::Null);

        let dt = FieldKind::DateTime.from_db(Value::Text("2024-01-02 03:04:05".into()));
        assert!(matches!(dt, Value::DateTime(_)));
    }

    #[test]
    fn test_custom_converter() {
        let kind = FieldKind::Custom(Arc::new(Cents));
        assert_eq!(kind.to_db(Value::Float(1.25)), Value::Int(125));
        assert_eq!(kind.from_db(Value::Int(250)), Value::Float(2.5));
    }

    #[test]
    fn test_sort_key_puts_primary_key_first() {
        let mut pk = Field::integer("id").primary_key();
        pk.order = 3;
        let mut name = Field::text("name");
        name.order = 0;
        assert!(pk.sort_key() < name.sort_key());
        assert!(name.sort_key() < SortKey::Name("aaa".into()));
    }
}
