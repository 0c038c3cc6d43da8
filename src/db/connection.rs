//! Backend seam: anything that can run SQL and hand back a cursor.

use std::collections::VecDeque;

use crate::ast::value::Value;
use crate::error::DriverError;

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// A live result set.
pub trait Cursor: Send {
    /// Column labels, in projection order.
    fn description(&self) -> &[String];

    /// Next raw row, or `None` once exhausted.
    fn fetch_one(&mut self) -> DriverResult<Option<Vec<Value>>>;

    fn rows_affected(&self) -> u64;

    /// Identifier generated by the statement that produced this cursor.
    fn last_insert_id(&self) -> Option<Value> {
        None
    }
}

/// A single database session.
pub trait Connection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> DriverResult<Box<dyn Cursor>>;

    fn last_insert_id(&mut self, cursor: &mut dyn Cursor) -> DriverResult<Option<Value>> {
        Ok(cursor.last_insert_id())
    }

    fn rows_affected(&mut self, cursor: &dyn Cursor) -> DriverResult<u64> {
        Ok(cursor.rows_affected())
    }

    fn begin(&mut self) -> DriverResult<()>;

    fn commit(&mut self) -> DriverResult<()>;

    fn rollback(&mut self) -> DriverResult<()>;

    fn in_transaction(&self) -> bool;
}

/// Cursor over rows that are already in memory.
#[derive(Debug, Clone, Default)]
pub struct VecCursor {
    description: Vec<String>,
    rows: VecDeque<Vec<Value>>,
    rows_affected: u64,
    last_insert_id: Option<Value>,
}

impl VecCursor {
    pub fn new(description: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            description,
            rows: rows.into(),
            rows_affected: 0,
            last_insert_id: None,
        }
    }

    /// Result of a statement that returns no rows.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }

    pub fn with_last_insert_id(mut self, id: impl Into<Value>) -> Self {
        self.last_insert_id = Some(id.into());
        self
    }

    pub fn with_rows_affected(mut self, rows_affected: u64) -> Self {
        self.rows_affected = rows_affected;
        self
    }
}

impl Cursor for VecCursor {
    fn description(&self) -> &[String] {
        &self.description
    }

    fn fetch_one(&mut self) -> DriverResult<Option<Vec<Value>>> {
        Ok(self.rows.pop_front())
    }

    fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    fn last_insert_id(&self) -> Option<Value> {
        self.last_insert_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_cursor_drains_in_order() {
        let mut cursor = VecCursor::new(
            vec!["id".to_string()],
            vec![vec![Value::Int(1)], vec![Value::Int(2)]],
        );
        assert_eq!(cursor.description(), ["id".to_string()]);
        assert_eq!(cursor.fetch_one().unwrap(), Some(vec![Value::Int(1)]));
        assert_eq!(cursor.fetch_one().unwrap(), Some(vec![Value::Int(2)]));
        assert_eq!(cursor.fetch_one().unwrap(), None);
    }

    #[test]
    fn test_affected_cursor() {
        let cursor = VecCursor::affected(4).with_last_insert_id(9);
        assert_eq!(cursor.rows_affected(), 4);
        assert_eq!(cursor.last_insert_id(), Some(Value::Int(9)));
        assert!(cursor.description().is_empty());
    }
}
