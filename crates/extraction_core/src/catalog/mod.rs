//! Cached table metadata.
//!
//! The catalog is the only structure shared between concurrent extraction
//! runs. Each table key owns its own lock so that loading or invalidating one
//! table never blocks readers of another. Within a key, invalidation and
//! reload are serialized by that lock, so a reader never observes metadata of
//! a half-dropped table.

pub mod alias;
pub mod table;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use self::alias::AliasGenerator;
pub use self::table::{ColumnMetadata, TableMetadata};
use crate::database::Database;
use crate::errors::{ExtractionError, Result};

#[derive(Debug, Default)]
struct SlotState {
    /// Bumped on every load and invalidation of this key.
    generation: u64,
    table: Option<Arc<TableMetadata>>,
}

#[derive(Debug, Default)]
struct CatalogSlot {
    state: RwLock<SlotState>,
}

#[derive(Debug, Default)]
pub struct TableCatalog {
    slots: scc::HashMap<String, Arc<CatalogSlot>>,
    /// Table aliases are stable across invalidations, and released when the
    /// table is removed.
    aliases: Mutex<AliasGenerator>,
    generations: AtomicU64,
}

impl TableCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, key: String) -> Arc<CatalogSlot> {
        self.slots
            .entry_async(key)
            .await
            .or_insert_with(|| Arc::new(CatalogSlot::default()))
            .get()
            .clone()
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Get metadata for a table, loading it from the database on a miss.
    ///
    /// Returns `None` if the table does not exist. Missing tables are not
    /// cached since derived tables get created after being probed.
    pub async fn get_table(
        &self,
        db: &dyn Database,
        name: &str,
    ) -> Result<Option<Arc<TableMetadata>>> {
        let slot = self.slot(name.to_ascii_lowercase()).await;

        {
            let state = slot.state.read().await;
            if let Some(table) = &state.table {
                trace!(table = %name, "table metadata cache hit");
                return Ok(Some(table.clone()));
            }
        }

        let mut state = slot.state.write().await;
        // Another reader may have loaded it while we waited.
        if let Some(table) = &state.table {
            return Ok(Some(table.clone()));
        }

        let descriptors = match db.describe_table(name).await? {
            Some(descriptors) => descriptors,
            None => {
                drop(state);
                self.forget_empty_slot(&slot, name).await;
                return Ok(None);
            }
        };

        let generation = self.next_generation();
        let alias = self.aliases.lock().alias_for(name);
        let table = Arc::new(TableMetadata::from_descriptors(
            name,
            alias,
            descriptors,
            generation,
        ));
        debug!(table = %name, columns = table.columns.len(), %generation, "loaded table metadata");

        state.generation = generation;
        state.table = Some(table.clone());

        Ok(Some(table))
    }

    /// Like [`TableCatalog::get_table`], but a missing table is an error.
    pub async fn require_table(&self, db: &dyn Database, name: &str) -> Result<Arc<TableMetadata>> {
        self.get_table(db, name)
            .await?
            .ok_or_else(|| ExtractionError::TableNotFound(name.to_string()))
    }

    /// Probe for an optional column.
    ///
    /// Any failure to load the table is treated as the column being absent.
    pub async fn has_column(&self, db: &dyn Database, table: &str, column: &str) -> bool {
        match self.get_table(db, table).await {
            Ok(Some(t)) => t.has_column(column),
            Ok(None) => false,
            Err(e) => {
                debug!(%table, %column, %e, "failed to probe column, treating as absent");
                false
            }
        }
    }

    /// Drop the cached entry for a table. Must be called after any DDL
    /// changing the table's columns.
    pub async fn invalidate(&self, name: &str) {
        let key = name.to_ascii_lowercase();
        let slot = match self.slots.read_async(&key, |_, slot| slot.clone()).await {
            Some(slot) => slot,
            None => return,
        };

        let mut state = slot.state.write().await;
        state.table = None;
        state.generation = self.next_generation();
        debug!(table = %name, generation = state.generation, "invalidated table metadata");
    }

    /// Forget a table that was dropped, releasing its slot and alias.
    pub async fn remove(&self, name: &str) {
        let key = name.to_ascii_lowercase();
        let Some((_, slot)) = self.slots.remove_async(&key).await else {
            return;
        };

        // Readers holding the slot see the table as gone.
        let mut state = slot.state.write().await;
        state.table = None;
        state.generation = self.next_generation();
        self.aliases.lock().release(name);
        debug!(table = %name, "removed table metadata");
    }

    /// Number of table slots currently held.
    pub fn cached_tables(&self) -> usize {
        self.slots.len()
    }

    async fn forget_empty_slot(&self, slot: &Arc<CatalogSlot>, name: &str) {
        let key = name.to_ascii_lowercase();
        let removed = self
            .slots
            .remove_if_async(&key, |current| {
                Arc::ptr_eq(current, slot)
                    && current.state.try_read().is_ok_and(|s| s.table.is_none())
            })
            .await;
        if removed.is_some() {
            trace!(table = %name, "forgot missing table");
        }
    }

    /// Check whether previously read metadata is still the cached version.
    pub async fn is_current(&self, table: &TableMetadata) -> bool {
        let key = table.name.to_ascii_lowercase();
        let slot = match self.slots.read_async(&key, |_, slot| slot.clone()).await {
            Some(slot) => slot,
            None => return false,
        };
        let state = slot.state.read().await;
        state.generation == table.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ColumnDescriptor;
    use crate::testutil::MemoryDatabase;

    fn db() -> MemoryDatabase {
        logutil::init_test();
        let db = MemoryDatabase::new();
        db.create_table(
            "TRIP",
            vec![
                ColumnDescriptor::new("id", "INTEGER", false),
                ColumnDescriptor::new("departure_date_time", "TIMESTAMP", false),
            ],
            10,
        );
        db
    }

    #[tokio::test]
    async fn loads_once_then_hits_cache() {
        let db = db();
        let catalog = TableCatalog::new();

        let first = catalog.get_table(&db, "trip").await.unwrap().unwrap();
        let second = catalog.get_table(&db, "TRIP").await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(1, db.describe_count("trip"));
        assert_eq!("T", first.alias);
    }

    #[tokio::test]
    async fn missing_tables_are_not_cached() {
        let db = db();
        let catalog = TableCatalog::new();

        assert!(catalog.get_table(&db, "EXT_TR_1").await.unwrap().is_none());
        db.create_table(
            "EXT_TR_1",
            vec![ColumnDescriptor::new("trip_code", "INTEGER", false)],
            1,
        );
        let table = catalog.get_table(&db, "EXT_TR_1").await.unwrap().unwrap();
        assert!(table.has_column("trip_code"));
    }

    #[tokio::test]
    async fn invalidate_then_reload_sees_new_columns() {
        let db = db();
        let catalog = TableCatalog::new();

        let before = catalog.require_table(&db, "trip").await.unwrap();
        assert!(catalog.is_current(&before).await);

        db.drop_column("TRIP", "departure_date_time");
        catalog.invalidate("TRIP").await;
        assert!(!catalog.is_current(&before).await);

        let after = catalog.require_table(&db, "trip").await.unwrap();
        assert!(!after.has_column("departure_date_time"));
        assert!(after.generation > before.generation);
        assert!(catalog.is_current(&after).await);
        // Alias is stable across reloads.
        assert_eq!(before.alias, after.alias);
    }

    #[tokio::test]
    async fn removed_tables_release_their_slot_and_alias() {
        let db = db();
        let catalog = TableCatalog::new();
        catalog.require_table(&db, "trip").await.unwrap();
        let baseline = catalog.cached_tables();

        assert!(catalog.get_table(&db, "EXT_TR_1").await.unwrap().is_none());
        assert_eq!(baseline, catalog.cached_tables());

        db.create_table("EXT_TR_1", vec![ColumnDescriptor::new("year", "INTEGER", false)], 1);
        db.create_table("EXT_TR_10", vec![ColumnDescriptor::new("year", "INTEGER", false)], 1);
        let first = catalog.require_table(&db, "EXT_TR_1").await.unwrap();
        let second = catalog.require_table(&db, "EXT_TR_10").await.unwrap();
        assert_eq!("ET1", first.alias);
        assert_eq!("ET11", second.alias);
        assert_eq!(baseline + 2, catalog.cached_tables());

        catalog.remove("EXT_TR_1").await;
        catalog.remove("ext_tr_10").await;
        assert_eq!(baseline, catalog.cached_tables());
        assert!(!catalog.is_current(&first).await);

        db.create_table("EXT_TR_12", vec![ColumnDescriptor::new("year", "INTEGER", false)], 1);
        let third = catalog.require_table(&db, "EXT_TR_12").await.unwrap();
        assert_eq!("ET1", third.alias);
    }

    #[tokio::test]
    async fn probe_missing_column_is_false() {
        let db = db();
        let catalog = TableCatalog::new();

        assert!(catalog.has_column(&db, "trip", "ID").await);
        assert!(!catalog.has_column(&db, "trip", "national_metier").await);
        assert!(!catalog.has_column(&db, "no_such_table", "id").await);
    }

    #[tokio::test]
    async fn probe_failure_is_treated_as_absent() {
        let db = db();
        db.fail_on("describe:trip");
        let catalog = TableCatalog::new();
        assert!(!catalog.has_column(&db, "trip", "id").await);
        assert!(catalog.get_table(&db, "trip").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reads_and_invalidations() {
        let db = Arc::new(db());
        let catalog = Arc::new(TableCatalog::new());

        let mut handles = Vec::new();
        for i in 0..32 {
            let db = db.clone();
            let catalog = catalog.clone();
            handles.push(tokio::spawn(async move {
                if i % 4 == 0 {
                    catalog.invalidate("trip").await;
                    None
                } else {
                    let table = catalog.require_table(db.as_ref(), "trip").await.unwrap();
                    Some(table.columns.len())
                }
            }));
        }

        for handle in handles {
            // Every read sees a complete table, never a partial one.
            if let Some(cols) = handle.await.unwrap() {
                assert_eq!(2, cols);
            }
        }

        let table = catalog.require_table(db.as_ref(), "trip").await.unwrap();
        assert!(catalog.is_current(&table).await);
    }
}
