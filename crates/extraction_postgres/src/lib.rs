//! [`Database`] implementation on PostgreSQL.

pub mod errors;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use extraction_core::config::ExtractionConfig;
use extraction_core::database::{ColumnDescriptor, Database, QueryRows, Row, with_timeout};
use extraction_core::errors::{ExtractionError, Result};
use extraction_core::sql::Dialect;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::{debug, trace, warn};

use self::errors::PostgresError;

const DESCRIBE_TABLE: &str = "
    SELECT column_name, data_type, is_nullable
    FROM information_schema.columns
    WHERE table_schema = current_schema() AND LOWER(table_name) = LOWER($1)
    ORDER BY ordinal_position";

#[derive(Clone)]
pub struct PostgresDatabase {
    client: Arc<tokio_postgres::Client>,
    timeout: Option<Duration>,
}

impl fmt::Debug for PostgresDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresDatabase")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl PostgresDatabase {
    /// Connect and check the connection with a test query.
    ///
    /// The connection is driven by a task spawned on the current runtime.
    pub async fn connect(conn_str: &str, config: &ExtractionConfig) -> Result<Self> {
        if config.dialect != Dialect::Postgres {
            return Err(ExtractionError::Config(format!(
                "Cannot use dialect {:?} with postgres",
                config.dialect
            )));
        }

        let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
            .await
            .map_err(PostgresError::Connect)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                connection_errored(&e);
            }
        });

        let timeout = config.query_timeout();
        if let Some(timeout) = timeout {
            let sql = statement_timeout_sql(timeout);
            client
                .batch_execute(&sql)
                .await
                .map_err(|e| PostgresError::statement(&sql, e))?;
        }

        let db = PostgresDatabase {
            client: Arc::new(client),
            timeout,
        };
        db.query("SELECT 1").await?;
        debug!(timeout = ?db.timeout, "connected to postgres");

        Ok(db)
    }

    /// Ask the server to cancel whatever statement is running on this
    /// connection.
    async fn cancel(&self) -> Result<()> {
        warn!("cancelling timed out statement");
        self.client
            .cancel_token()
            .cancel_query(NoTls)
            .await
            .map_err(|e| ExtractionError::from(PostgresError::Cancel(e)))
    }
}

fn connection_errored(e: &dyn fmt::Display) {
    warn!(%e, "postgres connection errored");
}

/// Server side ceiling matching the client timeout.
fn statement_timeout_sql(timeout: Duration) -> String {
    format!("SET statement_timeout = {}", timeout.as_millis())
}

/// Collect the rows of a simple query. Column names are taken from the
/// first row, a query without rows has no columns.
fn collect_rows(messages: Vec<SimpleQueryMessage>) -> QueryRows {
    let mut rows = QueryRows::default();
    for message in messages {
        if let SimpleQueryMessage::Row(row) = message {
            if rows.columns.is_empty() {
                rows.columns = row.columns().iter().map(|c| c.name().to_string()).collect();
            }
            let values: Row = (0..row.len())
                .map(|idx| row.get(idx).map(|v| v.to_string()))
                .collect();
            rows.rows.push(values);
        }
    }
    rows
}

#[async_trait]
impl Database for PostgresDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        trace!(%sql, "execute");
        let exec = async {
            self.client
                .execute(sql, &[])
                .await
                .map_err(|e| ExtractionError::from(PostgresError::statement(sql, e)))
        };
        with_timeout(self.timeout, exec, || self.cancel()).await
    }

    async fn query(&self, sql: &str) -> Result<QueryRows> {
        trace!(%sql, "query");
        let query = async {
            self.client
                .simple_query(sql)
                .await
                .map_err(|e| ExtractionError::from(PostgresError::statement(sql, e)))
        };
        let messages = with_timeout(self.timeout, query, || self.cancel()).await?;
        Ok(collect_rows(messages))
    }

    async fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnDescriptor>>> {
        let describe = async {
            self.client
                .query(DESCRIBE_TABLE, &[&table])
                .await
                .map_err(|source| {
                    ExtractionError::from(PostgresError::Describe {
                        table: table.to_string(),
                        source,
                    })
                })
        };
        let rows = with_timeout(self.timeout, describe, || self.cancel()).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row
                .try_get(0)
                .map_err(|e| PostgresError::statement(DESCRIBE_TABLE, e))?;
            let data_type: String = row
                .try_get(1)
                .map_err(|e| PostgresError::statement(DESCRIBE_TABLE, e))?;
            let nullable: String = row
                .try_get(2)
                .map_err(|e| PostgresError::statement(DESCRIBE_TABLE, e))?;
            columns.push(ColumnDescriptor::new(
                name,
                data_type,
                nullable.eq_ignore_ascii_case("YES"),
            ));
        }
        Ok(Some(columns))
    }
}
