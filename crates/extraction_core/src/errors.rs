use std::time::Duration;

/// Broad classification of an [`ExtractionError`], stable across variants.
///
/// The API layer maps these onto its own status codes. `DataNotFound` must
/// never be reported as an infrastructure failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DataNotFound,
    Configuration,
    SchemaMismatch,
    Persistence,
    ReferentialNotFound,
    InvalidInput,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("No data found")]
    DataNotFound,

    #[error("Missing query template: {0}")]
    TemplateNotFound(String),

    #[error("Failed to parse query template '{template}': {message}")]
    TemplateParse { template: String, message: String },

    #[error("Unbound slot '&{slot}' in query template '{template}'")]
    Binding { template: String, slot: String },

    #[error("Missing table: {0}")]
    TableNotFound(String),

    #[error("Missing column '{column}' on table '{table}'")]
    SchemaMismatch { table: String, column: String },

    #[error("Failed to execute query: {0}")]
    Persistence(String),

    #[error("Query exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("Unable to resolve {entity} with label '{label}'")]
    ReferentialNotFound { entity: String, label: String },

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Invalid strata: {0}")]
    InvalidStrata(String),

    #[error("Unknown extraction format: {0}")]
    UnknownFormat(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ExtractionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DataNotFound => ErrorKind::DataNotFound,
            Self::TemplateNotFound(_)
            | Self::TemplateParse { .. }
            | Self::Binding { .. }
            | Self::UnknownFormat(_)
            | Self::Config(_) => ErrorKind::Configuration,
            Self::SchemaMismatch { .. } | Self::TableNotFound(_) => ErrorKind::SchemaMismatch,
            Self::Persistence(_) | Self::Timeout(_) | Self::Io(_) => ErrorKind::Persistence,
            Self::ReferentialNotFound { .. } => ErrorKind::ReferentialNotFound,
            Self::InvalidFilter(_) | Self::InvalidStrata(_) | Self::Json(_) => {
                ErrorKind::InvalidInput
            }
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_data_not_found(&self) -> bool {
        matches!(self, Self::DataNotFound)
    }
}

pub type Result<T, E = ExtractionError> = std::result::Result<T, E>;

macro_rules! internal {
    ($($arg:tt)*) => {
        crate::errors::ExtractionError::Internal(std::format!($($arg)*))
    };
}
pub(crate) use internal;
