//! Execution: connections, the transaction-aware executor and result shaping.

pub mod connection;
pub mod cursor;
pub mod database;
pub mod postgres;
pub mod rows;

#[cfg(test)]
pub(crate) mod mock;

pub use connection::{Connection, Cursor, DriverResult, VecCursor};
pub use cursor::{CursorWrapper, Iter, RowIter};
pub use database::Database;
pub use postgres::{ConnectionConfig, PgConnection, SslMode};
pub use rows::{Datum, Instance, NamedRow, Object, Row};
