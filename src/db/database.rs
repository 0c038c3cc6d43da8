use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::connection::{Connection, Cursor};
use crate::ast::compiler::{compile, Render};
use crate::ast::dialect::Dialect;
use crate::ast::types::Table;
use crate::ast::value::Value;
use crate::error::Result;
use crate::query::{Delete, Insert, Query, Select, Update};

/// A connection paired with the dialect its statements are rendered for.
///
/// Owns the nesting counter for [`Database::atomic`]: the outermost block is
/// a real transaction, inner blocks are savepoints.
pub struct Database<C: Connection> {
    conn: C,
    dialect: Arc<Dialect>,
    depth: usize,
    savepoint_seq: usize,
}

impl<C: Connection> Database<C> {
    pub fn new(conn: C, dialect: Dialect) -> Self {
        Self {
            conn,
            dialect: Arc::new(dialect),
            depth: 0,
            savepoint_seq: 0,
        }
    }

    pub fn dialect(&self) -> &Arc<Dialect> {
        &self.dialect
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn into_connection(self) -> C {
        self.conn
    }

    pub fn compile(&self, node: &dyn Render) -> Result<(String, Vec<Value>)> {
        compile(node, &self.dialect)
    }

    pub fn execute(&mut self, node: &dyn Render) -> Result<Box<dyn Cursor>> {
        let (sql, params) = self.compile(node)?;
        self.execute_sql(&sql, &params)
    }

    pub fn execute_sql(&mut self, sql: &str, params: &[Value]) -> Result<Box<dyn Cursor>> {
        debug!(sql = %sql, params = ?params, "execute");
        Ok(self.conn.execute(sql, params)?)
    }

    pub fn last_insert_id(&mut self, cursor: &mut dyn Cursor) -> Result<Option<Value>> {
        Ok(self.conn.last_insert_id(cursor)?)
    }

    pub fn rows_affected(&mut self, cursor: &dyn Cursor) -> Result<u64> {
        Ok(self.conn.rows_affected(cursor)?)
    }

    pub fn transaction_depth(&self) -> usize {
        self.depth
    }

    pub fn in_transaction(&self) -> bool {
        self.depth > 0 || self.conn.in_transaction()
    }

    /// Run `body` inside a transaction, or a savepoint when already inside one.
    ///
    /// Success commits (or releases the savepoint); a failed commit is rolled
    /// back and its error returned. An error from `body` rolls back and is
    /// propagated unchanged.
    pub fn atomic<T, F>(&mut self, body: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let savepoint = if self.depth == 0 {
            trace!("begin");
            self.conn.begin()?;
            None
        } else {
            self.savepoint_seq += 1;
            let name = format!("s{}", self.savepoint_seq);
            let sql = format!("SAVEPOINT {}", self.dialect.quote(&name));
            trace!(savepoint = %name, "savepoint");
            self.execute_sql(&sql, &[])?;
            Some(name)
        };
        self.depth += 1;
        let outcome = body(self);
        self.depth -= 1;

        match outcome {
            Ok(value) => match self.finish(savepoint.as_deref()) {
                Ok(()) => Ok(value),
                Err(err) => {
                    self.rollback_quietly(savepoint.as_deref());
                    Err(err)
                }
            },
            Err(err) => {
                self.rollback_quietly(savepoint.as_deref());
                Err(err)
            }
        }
    }

    fn finish(&mut self, savepoint: Option<&str>) -> Result<()> {
        match savepoint {
            None => {
                trace!("commit");
                Ok(self.conn.commit()?)
            }
            Some(name) => {
                trace!(savepoint = %name, "release");
                let sql = format!("RELEASE SAVEPOINT {}", self.dialect.quote(name));
                self.execute_sql(&sql, &[]).map(|_| ())
            }
        }
    }

    fn rollback(&mut self, savepoint: Option<&str>) -> Result<()> {
        match savepoint {
            None => {
                trace!("rollback");
                Ok(self.conn.rollback()?)
            }
            Some(name) => {
                trace!(savepoint = %name, "rollback to savepoint");
                let sql = format!("ROLLBACK TO SAVEPOINT {}", self.dialect.quote(name));
                self.execute_sql(&sql, &[]).map(|_| ())
            }
        }
    }

    fn rollback_quietly(&mut self, savepoint: Option<&str>) {
        if let Err(err) = self.rollback(savepoint) {
            warn!(error = %err, "rollback failed while another error was propagating");
        }
    }

    pub fn select(&self) -> Select {
        Select::new().bind(Arc::clone(&self.dialect))
    }

    pub fn insert(&self, table: Table) -> Insert {
        Insert::new(table).bind(Arc::clone(&self.dialect))
    }

    pub fn update(&self, table: Table) -> Update {
        Update::new(table).bind(Arc::clone(&self.dialect))
    }

    pub fn delete(&self, table: Table) -> Delete {
        Delete::new(table).bind(Arc::clone(&self.dialect))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::expr::ExprExt;
    use crate::db::mock::MockConnection;
    use crate::error::{DriverError, Error};

    fn db() -> Database<MockConnection> {
        Database::new(MockConnection::new(), Dialect::sqlite())
    }

    #[test]
    fn test_execute_renders_with_dialect() {
        let mut db = Database::new(MockConnection::new(), Dialect::postgres());
        let users = Table::new("users");
        let query = db.select().from(users.clone()).columns([users.c("id")]).where_(users.c("id").eq(7));
        db.execute(&query).unwrap();
        let (sql, params) = &db.connection().log[0];
        assert_eq!(sql, "SELECT \"t1\".\"id\" FROM \"users\" AS \"t1\" WHERE (\"t1\".\"id\" = $1)");
        assert_eq!(params, &vec![Value::Int(7)]);
    }

    #[test]
    fn test_atomic_commits() {
        let mut db = db();
        let out = db
            .atomic(|db| {
                assert_eq!(db.transaction_depth(), 1);
                assert!(db.in_transaction());
                db.execute_sql("UPDATE t SET a = 1", &[])?;
                Ok(5)
            })
            .unwrap();
        assert_eq!(out, 5);
        assert_eq!(db.transaction_depth(), 0);
        assert_eq!(db.connection().statements(), vec!["BEGIN", "UPDATE t SET a = 1", "COMMIT"]);
    }

    #[test]
    fn test_nested_atomic_uses_savepoints() {
        let mut db = db();
        db.atomic(|db| {
            db.atomic(|db| {
                assert_eq!(db.transaction_depth(), 2);
                db.atomic(|_| Ok(()))
            })?;
            db.atomic(|_| Ok(()))
        })
        .unwrap();
        assert_eq!(
            db.connection().statements(),
            vec![
                "BEGIN",
                "SAVEPOINT \"s1\"",
                "SAVEPOINT \"s2\"",
                "RELEASE SAVEPOINT \"s2\"",
                "RELEASE SAVEPOINT \"s1\"",
                "SAVEPOINT \"s3\"",
                "RELEASE SAVEPOINT \"s3\"",
                "COMMIT",
            ]
        );
    }

    #[test]
    fn test_error_rolls_back_savepoint_then_propagates() {
        let mut db = db();
        let result: Result<()> = db.atomic(|db| {
            let inner: Result<()> = db.atomic(|_| Err(Error::InvalidQuery("boom".into())));
            assert!(inner.is_err());
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(
            db.connection().statements(),
            vec!["BEGIN", "SAVEPOINT \"s1\"", "ROLLBACK TO SAVEPOINT \"s1\"", "COMMIT"]
        );
    }

    #[test]
    fn test_error_rolls_back_transaction() {
        let mut db = db();
        db.connection_mut()
            .fail_on("INSERT", DriverError::new("IntegrityError", "duplicate key"));
        let result = db.atomic(|db| db.execute_sql("INSERT INTO t VALUES (1)", &[]).map(|_| ()));
        assert!(matches!(result, Err(Error::Integrity(ref m)) if m == "duplicate key"));
        assert_eq!(
            db.connection().statements(),
            vec!["BEGIN", "INSERT INTO t VALUES (1)", "ROLLBACK"]
        );
        assert!(!db.in_transaction());
    }

    #[test]
    fn test_commit_failure_rolls_back() {
        let mut db = db();
        db.connection_mut().fail_on_commit = true;
        let result = db.atomic(|_| Ok(()));
        assert!(matches!(result, Err(Error::Operational(_))));
        assert_eq!(db.connection().statements(), vec!["BEGIN", "COMMIT", "ROLLBACK"]);
        assert_eq!(db.transaction_depth(), 0);
    }

    #[test]
    fn test_factories_are_bound() {
        let db = Database::new(MockConnection::new(), Dialect::mysql());
        let users = Table::new("users");
        assert!(db.insert(users.clone()).returning([users.c("id")]).is_err());
        assert!(db.update(users.clone()).returning([users.c("id")]).is_err());
        assert!(db.delete(users).returning(Vec::<crate::ast::types::Node>::new()).is_err());
    }
}
