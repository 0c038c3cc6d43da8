/// Statement IR and SQL compiler.
///
/// ```text
/// Builders (query/, expr.rs)
///       ↓
/// Statement IR            (types.rs, value.rs, field.rs)
///       ↓
/// SQL Compiler            (compiler.rs + dialect.rs)
///       ↓
/// (sql, params)  →  Execution (db/)
/// ```
pub mod compiler;
pub mod dialect;
pub mod expr;
pub mod field;
pub mod types;
pub mod value;

pub use compiler::{compile, AliasManager, Context, Render, Scope, State};
pub use dialect::{CompoundParens, ConflictStyle, Dialect, ParamStyle};
pub use expr::*;
pub use field::{Field, FieldKind, SortKey, ValueConverter};
pub use types::*;
pub use value::Value;
