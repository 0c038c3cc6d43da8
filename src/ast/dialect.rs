/// Dialect configuration consumed by the compiler.
///
/// A dialect decides placeholder spelling, identifier quoting, operator
/// spelling and which optional clauses may be emitted. Presets exist for the
/// common engines and any of them can be overridden from TOML:
///
/// ```ignore
/// let dialect = Dialect::from_toml_str(r#"
///     name = "sqlite"
///     param_style = "qmark"
///     limit_max = "-1"
/// "#)?;
/// ```
use std::collections::BTreeMap;

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

/// Placeholder spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParamStyle {
    /// `?`
    #[default]
    Qmark,
    /// `$1`, `$2`, ...
    Numbered,
    /// `%s`
    Format,
}

/// Whether set-operation branches are wrapped in parentheses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompoundParens {
    #[default]
    Never,
    Always,
    /// Wrap plain SELECT branches but not nested set operations.
    Unnested,
}

/// Spelling family for conflict resolution clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStyle {
    #[default]
    Sqlite,
    Postgres,
    Mysql,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dialect {
    pub name: String,
    pub param_style: ParamStyle,
    pub quote_char: char,
    /// Emitted as LIMIT when only OFFSET is requested.
    pub limit_max: Option<String>,
    pub returning: bool,
    pub window_functions: bool,
    pub distinct_on: bool,
    pub for_update: bool,
    pub for_update_nowait: bool,
    pub multi_row_insert: bool,
    pub compound_select_parentheses: CompoundParens,
    pub conflict_style: ConflictStyle,
    /// Canonical operator → dialect spelling.
    pub operations: BTreeMap<String, String>,
}

impl Default for Dialect {
    fn default() -> Self {
        Self::generic()
    }
}

fn operations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl Dialect {
    /// ANSI-ish dialect with every optional clause enabled.
    pub fn generic() -> Self {
        Self {
            name: "generic".to_string(),
            param_style: ParamStyle::Qmark,
            quote_char: '"',
            operations: BTreeMap::new(),
            limit_max: None,
            returning: true,
            window_functions: true,
            distinct_on: true,
            for_update: true,
            for_update_nowait: true,
            multi_row_insert: true,
            compound_select_parentheses: CompoundParens::Never,
            conflict_style: ConflictStyle::Sqlite,
        }
    }

    pub fn sqlite() -> Self {
        Self {
            name: "sqlite".to_string(),
            operations: operations(&[("LIKE", "GLOB"), ("ILIKE", "LIKE")]),
            limit_max: Some("-1".to_string()),
            distinct_on: false,
            for_update: false,
            for_update_nowait: false,
            ..Self::generic()
        }
    }

    pub fn postgres() -> Self {
        Self {
            name: "postgres".to_string(),
            param_style: ParamStyle::Numbered,
            operations: operations(&[("REGEXP", "~"), ("IREGEXP", "~*")]),
            compound_select_parentheses: CompoundParens::Always,
            conflict_style: ConflictStyle::Postgres,
            ..Self::generic()
        }
    }

    pub fn mysql() -> Self {
        Self {
            name: "mysql".to_string(),
            param_style: ParamStyle::Format,
            quote_char: '`',
            operations: operations(&[
                ("LIKE", "LIKE BINARY"),
                ("ILIKE", "LIKE"),
                ("REGEXP", "REGEXP BINARY"),
                ("IREGEXP", "REGEXP"),
            ]),
            limit_max: Some("18446744073709551615".to_string()),
            returning: false,
            distinct_on: false,
            compound_select_parentheses: CompoundParens::Unnested,
            conflict_style: ConflictStyle::Mysql,
            ..Self::generic()
        }
    }

    /// Look up a preset by name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "generic" | "ansi" => Some(Self::generic()),
            "sqlite" | "sqlite3" => Some(Self::sqlite()),
            "postgres" | "postgresql" => Some(Self::postgres()),
            "mysql" | "mariadb" => Some(Self::mysql()),
            _ => None,
        }
    }

    /// Names accepted by [`Dialect::by_name`].
    pub fn preset_names() -> Vec<&'static str> {
        vec!["generic", "sqlite", "postgres", "mysql"]
    }

    /// Parse a dialect from TOML. Keys left out fall back to the generic
    /// dialect.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).context("Failed to parse dialect configuration")
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize dialect configuration")
    }

    /// Dialect spelling of a canonical operator.
    pub fn operator<'a>(&'a self, op: &'a str) -> &'a str {
        self.operations.get(op).map(String::as_str).unwrap_or(op)
    }

    /// Quote one identifier, doubling embedded quote characters.
    pub fn quote(&self, ident: &str) -> String {
        let q = self.quote_char;
        let escaped = ident.replace(q, &format!("{q}{q}"));
        format!("{q}{escaped}{q}")
    }
}
