//! Small helpers for building SQL text.
//!
//! All dynamic SQL in this crate goes through these helpers. Identifiers are
//! validated instead of quoted so that generated tables keep the unquoted,
//! case-insensitive names the consumers expect. Literals are always quoted.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::errors::{ExtractionError, Result};
use crate::strata::AggFunction;

/// SQL dialect of the operational database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgres,
    Hsqldb,
    Oracle,
}

impl Dialect {
    /// Name of the template group enabled when this dialect is active.
    pub const fn group_name(&self) -> &'static str {
        match self {
            Dialect::Postgres => "pgsql",
            Dialect::Hsqldb => "hsqldb",
            Dialect::Oracle => "oracle",
        }
    }

    fn date_literal(&self, date: NaiveDate) -> String {
        match self {
            Dialect::Oracle => format!("TO_DATE('{}', 'YYYY-MM-DD')", date.format("%Y-%m-%d")),
            Dialect::Postgres | Dialect::Hsqldb => format!("DATE '{}'", date.format("%Y-%m-%d")),
        }
    }

    /// Longest identifier the database accepts.
    pub const fn max_identifier_len(&self) -> usize {
        match self {
            Dialect::Postgres => 63,
            Dialect::Hsqldb => 128,
            Dialect::Oracle => 30,
        }
    }

    /// Name of the index of `column` on `table`. Names over the identifier
    /// limit are cut and suffixed with a hash of the full name, so they stay
    /// unique per table.
    pub fn index_name(&self, table: &str, column: &str) -> String {
        let name = format!("{table}_{column}_IDX");
        let max = self.max_identifier_len();
        if name.len() <= max {
            return name;
        }

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        let suffix = format!("_{:08X}_IDX", hasher.finish() as u32);
        let keep = max.saturating_sub(suffix.len());
        format!("{}{suffix}", &name[..keep.min(name.len())])
    }

    /// Cast `expr` to character data.
    pub fn text_cast(&self, expr: &str) -> String {
        match self {
            Dialect::Postgres => format!("CAST({expr} AS VARCHAR)"),
            Dialect::Hsqldb => format!("CAST({expr} AS VARCHAR(255))"),
            Dialect::Oracle => format!("TO_CHAR({expr})"),
        }
    }

    /// Render a LIMIT/OFFSET suffix.
    pub fn limit_offset(&self, limit: usize, offset: usize) -> String {
        match self {
            Dialect::Oracle => format!(" OFFSET {offset} ROWS FETCH NEXT {limit} ROWS ONLY"),
            Dialect::Postgres | Dialect::Hsqldb => format!(" LIMIT {limit} OFFSET {offset}"),
        }
    }
}

/// A validated, unquoted SQL identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(String);

impl Ident {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if is_valid_ident(&name) {
            Ok(Ident(name))
        } else {
            Err(ExtractionError::InvalidFilter(format!(
                "Invalid SQL identifier: '{name}'"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check that `name` is a plain identifier, optionally qualified once
/// (`alias.column`).
pub fn is_valid_ident(name: &str) -> bool {
    let mut parts = name.split('.');
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        }
    };
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), None, None) => valid_part(a),
        (Some(a), Some(b), None) => valid_part(a) && valid_part(b),
        _ => false,
    }
}

/// Quote a string literal, doubling embedded quotes.
pub fn quote_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push('\'');
        }
        out.push(c);
    }
    out.push('\'');
    out
}

/// A value bound to a template slot, or used in a generated predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    /// A table or column name, rendered unquoted.
    Ident(Ident),
    /// Rendered as a comma separated list of its elements.
    List(Vec<SqlValue>),
}

impl SqlValue {
    pub fn text(s: impl Into<String>) -> Self {
        SqlValue::Text(s.into())
    }

    pub fn ident(name: impl Into<String>) -> Result<Self> {
        Ok(SqlValue::Ident(Ident::new(name)?))
    }

    pub fn int_list(values: impl IntoIterator<Item = i64>) -> Self {
        SqlValue::List(values.into_iter().map(SqlValue::Int).collect())
    }

    pub fn text_list<S: Into<String>>(values: impl IntoIterator<Item = S>) -> Self {
        SqlValue::List(values.into_iter().map(|v| SqlValue::Text(v.into())).collect())
    }

    pub fn to_sql(&self, dialect: Dialect) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(true) => "1".to_string(),
            SqlValue::Bool(false) => "0".to_string(),
            SqlValue::Int(v) => v.to_string(),
            SqlValue::Float(v) => v.to_string(),
            SqlValue::Text(s) => quote_literal(s),
            SqlValue::Date(d) => dialect.date_literal(*d),
            SqlValue::Ident(ident) => ident.to_string(),
            // An empty list would render `IN ()`, which no dialect accepts.
            SqlValue::List(values) if values.is_empty() => "NULL".to_string(),
            SqlValue::List(values) => values
                .iter()
                .map(|v| v.to_sql(dialect))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(value: NaiveDate) -> Self {
        SqlValue::Date(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<Ident> for SqlValue {
    fn from(value: Ident) -> Self {
        SqlValue::Ident(value)
    }
}

/// Render an aggregate over `column`.
///
/// Nullable columns are coalesced to zero for SUM and COUNT so that a NULL
/// cell still contributes its group. AVG, MIN and MAX keep NULLs out of the
/// computation.
pub fn aggregate_expr(function: AggFunction, column: &Ident, nullable: bool) -> String {
    let coalesce = nullable && matches!(function, AggFunction::Sum | AggFunction::Count);
    if coalesce {
        format!("{}(COALESCE({column}, 0))", function.as_sql())
    } else {
        format!("{}({column})", function.as_sql())
    }
}

/// Join predicates with AND, wrapping each one in parentheses. Empty
/// predicates are skipped.
pub fn and_all<S: AsRef<str>>(predicates: &[S]) -> String {
    predicates
        .iter()
        .map(|p| p.as_ref().trim())
        .filter(|p| !p.is_empty())
        .map(|p| format!("({p})"))
        .collect::<Vec<_>>()
        .join(" AND ")
}
