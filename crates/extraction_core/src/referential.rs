//! Label to id resolution of referential entities.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::database::Database;
use crate::errors::{ExtractionError, Result};
use crate::sql::quote_literal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReferentialEntity {
    LocationLevel,
    Pmfm,
    Unit,
    QualitativeValue,
    AcquisitionLevel,
}

impl ReferentialEntity {
    pub const fn name(&self) -> &'static str {
        match self {
            ReferentialEntity::LocationLevel => "LocationLevel",
            ReferentialEntity::Pmfm => "Pmfm",
            ReferentialEntity::Unit => "Unit",
            ReferentialEntity::QualitativeValue => "QualitativeValue",
            ReferentialEntity::AcquisitionLevel => "AcquisitionLevel",
        }
    }

    /// Source table and its label column.
    const fn source(&self) -> (&'static str, &'static str) {
        match self {
            ReferentialEntity::LocationLevel => ("LOCATION_LEVEL", "LABEL"),
            ReferentialEntity::Pmfm => ("PMFM", "LABEL"),
            ReferentialEntity::Unit => ("UNIT", "LABEL"),
            ReferentialEntity::QualitativeValue => ("QUALITATIVE_VALUE", "LABEL"),
            ReferentialEntity::AcquisitionLevel => ("ACQUISITION_LEVEL", "LABEL"),
        }
    }
}

impl fmt::Display for ReferentialEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolves referential codes. Resolution is a pure function of the label,
/// a missing code is fatal for the stage needing it.
#[async_trait]
pub trait ReferentialService: Send + Sync + fmt::Debug {
    async fn id_by_label(&self, entity: ReferentialEntity, label: &str) -> Result<i64>;
}

fn not_found(entity: ReferentialEntity, label: &str) -> ExtractionError {
    ExtractionError::ReferentialNotFound {
        entity: entity.name().to_string(),
        label: label.to_string(),
    }
}

/// Fixed set of referential codes.
#[derive(Debug, Default)]
pub struct MemoryReferentials {
    ids: scc::HashMap<(ReferentialEntity, String), i64>,
}

impl MemoryReferentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity: ReferentialEntity, label: &str, id: i64) {
        let _ = self.ids.upsert((entity, label.to_string()), id);
    }

    pub fn with(self, entity: ReferentialEntity, label: &str, id: i64) -> Self {
        self.insert(entity, label, id);
        self
    }
}

#[async_trait]
impl ReferentialService for MemoryReferentials {
    async fn id_by_label(&self, entity: ReferentialEntity, label: &str) -> Result<i64> {
        self.ids
            .read_async(&(entity, label.to_string()), |_, id| *id)
            .await
            .ok_or_else(|| not_found(entity, label))
    }
}

/// Resolves codes with plain lookups against the operational database.
/// Resolved ids are cached for the life of the service.
#[derive(Debug)]
pub struct DatabaseReferentials {
    db: Arc<dyn Database>,
    cache: scc::HashMap<(ReferentialEntity, String), i64>,
}

impl DatabaseReferentials {
    pub fn new(db: Arc<dyn Database>) -> Self {
        DatabaseReferentials {
            db,
            cache: scc::HashMap::new(),
        }
    }
}

#[async_trait]
impl ReferentialService for DatabaseReferentials {
    async fn id_by_label(&self, entity: ReferentialEntity, label: &str) -> Result<i64> {
        let key = (entity, label.to_string());
        if let Some(id) = self.cache.read_async(&key, |_, id| *id).await {
            return Ok(id);
        }

        let (table, column) = entity.source();
        let sql = format!(
            "SELECT ID FROM {table} WHERE {column} = {}",
            quote_literal(label)
        );
        let rows = self.db.query(&sql).await?;
        let id = match rows.rows.as_slice() {
            [row] => row
                .first()
                .and_then(|c| c.as_deref())
                .and_then(|v| v.trim().parse::<i64>().ok())
                .ok_or_else(|| not_found(entity, label))?,
            [] => return Err(not_found(entity, label)),
            _ => {
                return Err(ExtractionError::Persistence(format!(
                    "{entity} label '{label}' is not unique"
                )));
            }
        };

        debug!(%entity, %label, %id, "resolved referential");
        let _ = self.cache.insert_async(key, id).await;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MemoryDatabase, rows};

    #[tokio::test]
    async fn memory_lookup() {
        let refs = MemoryReferentials::new().with(ReferentialEntity::Pmfm, "SEX", 80);
        assert_eq!(80, refs.id_by_label(ReferentialEntity::Pmfm, "SEX").await.unwrap());

        let err = refs
            .id_by_label(ReferentialEntity::Unit, "SEX")
            .await
            .unwrap_err();
        assert_eq!(crate::errors::ErrorKind::ReferentialNotFound, err.kind());
    }

    #[tokio::test]
    async fn database_lookup_is_cached() {
        let db = Arc::new(MemoryDatabase::new());
        db.on_query(
            "FROM LOCATION_LEVEL WHERE LABEL = 'Country'",
            rows(&["id"], vec![vec![Some("1")]]),
        );
        let refs = DatabaseReferentials::new(db.clone());

        for _ in 0..3 {
            let id = refs
                .id_by_label(ReferentialEntity::LocationLevel, "Country")
                .await
                .unwrap();
            assert_eq!(1, id);
        }
        assert_eq!(1, db.statements_matching("LOCATION_LEVEL").len());
    }

    #[tokio::test]
    async fn database_lookup_requires_a_unique_label() {
        let db = Arc::new(MemoryDatabase::new());
        db.on_query(
            "FROM PMFM WHERE LABEL = 'DUP'",
            rows(&["id"], vec![vec![Some("1")], vec![Some("2")]]),
        );
        let refs = DatabaseReferentials::new(db);

        assert!(refs.id_by_label(ReferentialEntity::Pmfm, "DUP").await.is_err());
        let err = refs
            .id_by_label(ReferentialEntity::Pmfm, "MISSING")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::ReferentialNotFound { .. }));
    }
}
