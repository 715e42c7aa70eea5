//! Access to the relational database the extraction runs against.

use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::errors::{ExtractionError, Result};
use crate::sql::Dialect;

/// Column description returned by schema introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Upper-cased SQL type name, e.g. `INTEGER`, `VARCHAR`.
    pub data_type: String,
    pub nullable: bool,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        ColumnDescriptor {
            name: name.into(),
            data_type: data_type.into().to_ascii_uppercase(),
            nullable,
        }
    }
}

/// A result row. Every cell is rendered as display text, NULL stays `None`.
pub type Row = Vec<Option<String>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryRows {
    /// First cell of the first row.
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first().and_then(|r| r.first()).and_then(|c| c.as_deref())
    }
}

/// Blocking round-trips to the database, one statement at a time.
///
/// Implementations are expected to enforce the configured query timeout and
/// report it as [`ExtractionError::Timeout`].
#[async_trait]
pub trait Database: Send + Sync + Debug {
    fn dialect(&self) -> Dialect;

    /// Execute a DDL or DML statement, returning the number of affected rows
    /// when the database reports one.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Run a query, returning every row as text.
    async fn query(&self, sql: &str) -> Result<QueryRows>;

    /// Introspect a table. Returns `None` if the table does not exist.
    async fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnDescriptor>>>;

    /// Run a query returning a single integer.
    async fn query_count(&self, sql: &str) -> Result<i64> {
        let rows = self.query(sql).await?;
        match rows.first_value() {
            Some(v) => v.trim().parse::<i64>().map_err(|e| {
                ExtractionError::Persistence(format!("Expected a count, got '{v}': {e}"))
            }),
            None => Ok(0),
        }
    }
}

/// Bound a database round-trip by `timeout`, if any.
///
/// On expiry `cancel` is awaited before reporting the timeout, so the server
/// stops running the statement and the connection is free for the statements
/// that follow. A failed cancellation is logged, the timeout is still reported.
pub async fn with_timeout<T, F, C, CF>(timeout: Option<Duration>, fut: F, cancel: C) -> Result<T>
where
    F: Future<Output = Result<T>>,
    C: FnOnce() -> CF,
    CF: Future<Output = Result<()>>,
{
    let Some(timeout) = timeout else {
        return fut.await;
    };
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            if let Err(e) = cancel().await {
                warn!(%e, ?timeout, "failed to cancel timed out statement");
            }
            Err(ExtractionError::Timeout(timeout))
        }
    }
}
