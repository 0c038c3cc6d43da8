//! Scripted in-memory connection for tests.

use std::collections::VecDeque;

use super::connection::{Connection, Cursor, DriverResult, VecCursor};
use crate::ast::value::Value;
use crate::error::DriverError;

#[derive(Debug, Default)]
pub(crate) struct MockConnection {
    /// Every statement seen, transaction verbs included.
    pub log: Vec<(String, Vec<Value>)>,
    results: VecDeque<VecCursor>,
    fail_on: Vec<(String, DriverError)>,
    pub fail_on_commit: bool,
    in_transaction: bool,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the cursor returned by the next non-transaction statement.
    pub fn push_result(&mut self, cursor: VecCursor) {
        self.results.push_back(cursor);
    }

    pub fn push_rows(&mut self, columns: &[&str], rows: Vec<Vec<Value>>) {
        let columns = columns.iter().map(|c| c.to_string()).collect();
        self.push_result(VecCursor::new(columns, rows));
    }

    /// Fail any statement containing `needle`.
    pub fn fail_on(&mut self, needle: &str, error: DriverError) {
        self.fail_on.push((needle.to_string(), error));
    }

    pub fn statements(&self) -> Vec<&str> {
        self.log.iter().map(|(sql, _)| sql.as_str()).collect()
    }

    fn record(&mut self, sql: &str, params: &[Value]) -> DriverResult<()> {
        self.log.push((sql.to_string(), params.to_vec()));
        match self.fail_on.iter().find(|(needle, _)| sql.contains(needle.as_str())) {
            Some((_, err)) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl Connection for MockConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> DriverResult<Box<dyn Cursor>> {
        self.record(sql, params)?;
        if sql.starts_with("SAVEPOINT") || sql.starts_with("RELEASE") || sql.starts_with("ROLLBACK") {
            return Ok(Box::new(VecCursor::default()));
        }
        Ok(Box::new(self.results.pop_front().unwrap_or_default()))
    }

    fn begin(&mut self) -> DriverResult<()> {
        self.record("BEGIN", &[])?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> DriverResult<()> {
        self.record("COMMIT", &[])?;
        if self.fail_on_commit {
            return Err(DriverError::new("OperationalError", "commit failed"));
        }
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> DriverResult<()> {
        self.record("ROLLBACK", &[])?;
        self.in_transaction = false;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }
}
