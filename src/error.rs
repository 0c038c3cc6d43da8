//! Error types for statement construction, rendering and execution.

use std::fmt;

use thiserror::Error;

/// Errors raised while building, rendering or executing statements.
#[derive(Debug, Error)]
pub enum Error {
    /// A constraint (unique, foreign key, not null, check) was violated.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The database rejected a value (out of range, bad encoding, division by zero).
    #[error("data error: {0}")]
    Data(String),

    /// The driver interface itself failed.
    #[error("interface error: {0}")]
    Interface(String),

    /// The database reported an internal failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// The statement or clause is not supported by the target dialect.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Connection or transaction state problems outside the caller's control.
    #[error("operational error: {0}")]
    Operational(String),

    /// The SQL was malformed or referenced unknown objects.
    #[error("programming error: {0}")]
    Programming(String),

    /// A driver error whose name is not in the translation table.
    #[error("database error: {0}")]
    Database(String),

    /// A statement was built inconsistently.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A column was requested from a source that does not declare it.
    #[error("unknown column {column:?} on {source_name:?}")]
    UnknownColumn {
        /// The source the column was requested from.
        source_name: String,
        /// The requested column name.
        column: String,
    },

    /// A cursor wrapper was indexed past the end of a fully consumed result.
    #[error("row index {index} out of range for {len} rows")]
    IndexOutOfRange {
        /// The requested index.
        index: usize,
        /// The number of rows in the exhausted result.
        len: usize,
    },
}

/// Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error as reported by a connection backend, before translation.
///
/// `name` follows the DB-API exception naming (`IntegrityError`,
/// `OperationalError`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverError {
    pub name: String,
    pub message: String,
}

impl DriverError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for DriverError {}

type Translate = fn(String) -> Error;

const EXCEPTION_MAP: &[(&str, Translate)] = &[
    ("IntegrityError", Error::Integrity),
    ("DataError", Error::Data),
    ("InterfaceError", Error::Interface),
    ("InternalError", Error::Internal),
    ("NotSupportedError", Error::NotSupported),
    ("OperationalError", Error::Operational),
    ("ProgrammingError", Error::Programming),
];

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        EXCEPTION_MAP
            .iter()
            .find(|(name, _)| *name == err.name)
            .map(|(_, translate)| translate(err.message.clone()))
            .unwrap_or(Error::Database(err.message))
    }
}
