use extraction_core::errors::ExtractionError;

#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    #[error("Failed to connect to postgres: {0}")]
    Connect(#[source] tokio_postgres::Error),

    #[error("Failed to execute '{sql}': {source}")]
    Statement {
        sql: String,
        #[source]
        source: tokio_postgres::Error,
    },

    #[error("Failed to cancel statement: {0}")]
    Cancel(#[source] tokio_postgres::Error),

    #[error("Failed to describe table '{table}': {source}")]
    Describe {
        table: String,
        #[source]
        source: tokio_postgres::Error,
    },
}

impl PostgresError {
    pub(crate) fn statement(sql: &str, source: tokio_postgres::Error) -> Self {
        PostgresError::Statement {
            sql: sql.to_string(),
            source,
        }
    }
}

/// Every driver failure is a persistence failure to the pipeline.
impl From<PostgresError> for ExtractionError {
    fn from(e: PostgresError) -> Self {
        ExtractionError::Persistence(e.to_string())
    }
}
