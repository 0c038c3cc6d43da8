pub mod ast;
pub mod db;
pub mod error;
pub mod model;
pub mod query;

pub use ast::{compile, Dialect, ExprExt, Field, FieldKind, Node, Source, Table, Value};
pub use db::{Connection, CursorWrapper, Database, Object, Row};
pub use error::{DriverError, Error, Result};
pub use model::Model;
pub use query::{CompoundSelect, Delete, Insert, Query, Select, Update};
