//! Per-run state.
//!
//! A context is owned by the pipeline call that created it. Tables are
//! registered as raw as soon as they exist in the database, and moved under
//! their sheet once the stage producing them completed with rows. Cleanup
//! drops both.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde::Serialize;

use crate::filter::{ExtractionFilter, TripFilter};
use crate::format::ExtractionFormat;
use crate::pmfm::PmfmStrategy;
use crate::sheet::Sheet;
use crate::strata::Strata;

static LAST_CONTEXT_ID: AtomicI64 = AtomicI64::new(0);

/// Time based run id. Strictly increasing within the process, even when
/// several contexts are created in the same millisecond.
pub fn next_context_id() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    let mut last = LAST_CONTEXT_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_CONTEXT_ID.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// What the pipeline learned about a table it produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub sheet: Option<Sheet>,
    pub rows: u64,
    pub hidden_columns: BTreeSet<String>,
    pub distinct: bool,
    pub spatial_columns: BTreeSet<String>,
    /// Sampled distinct values of categorical columns.
    pub column_values: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ExtractionContext {
    id: i64,
    format: ExtractionFormat,
    filter: ExtractionFilter,
    strata: Option<Strata>,
    trip_filter: TripFilter,
    /// Every table created by the run, in creation order.
    created: Vec<String>,
    raw_tables: BTreeSet<String>,
    sheets: BTreeMap<Sheet, String>,
    tables: HashMap<String, TableInfo>,
    pmfm_cache: HashMap<String, Arc<Vec<PmfmStrategy>>>,
}

impl ExtractionContext {
    /// Create a context for `format` with a fresh id.
    pub fn new(format: ExtractionFormat, filter: ExtractionFilter, strata: Option<Strata>) -> Self {
        Self::with_id(next_context_id(), format, filter, strata)
    }

    pub fn with_id(
        id: i64,
        format: ExtractionFormat,
        filter: ExtractionFilter,
        strata: Option<Strata>,
    ) -> Self {
        ExtractionContext {
            id,
            format,
            filter,
            strata,
            trip_filter: TripFilter::default(),
            created: Vec::new(),
            raw_tables: BTreeSet::new(),
            sheets: BTreeMap::new(),
            tables: HashMap::new(),
            pmfm_cache: HashMap::new(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn format(&self) -> ExtractionFormat {
        self.format
    }

    pub fn filter(&self) -> &ExtractionFilter {
        &self.filter
    }

    pub fn strata(&self) -> Option<&Strata> {
        self.strata.as_ref()
    }

    pub fn trip_filter(&self) -> &TripFilter {
        &self.trip_filter
    }

    pub fn set_trip_filter(&mut self, trip_filter: TripFilter) {
        self.trip_filter = trip_filter;
    }

    /// Planned name of the table for `sheet`.
    pub fn table_name(&self, sheet: Sheet) -> String {
        self.format.table_name(sheet, self.id)
    }

    /// Record a table that now exists in the database but is not committed
    /// under a sheet.
    pub fn register_raw(&mut self, table: &str) {
        if !self.created.iter().any(|t| t.eq_ignore_ascii_case(table)) {
            self.created.push(table.to_string());
        }
        self.raw_tables.insert(table.to_string());
    }

    /// Commit a table under its sheet.
    pub fn register_table(&mut self, sheet: Sheet, table: &str, mut info: TableInfo) {
        self.register_raw(table);
        self.raw_tables.remove(table);
        info.sheet = Some(sheet);
        self.sheets.insert(sheet, table.to_string());
        self.tables.insert(table.to_string(), info);
    }

    pub fn sheet_table(&self, sheet: Sheet) -> Option<&str> {
        self.sheets.get(&sheet).map(|t| t.as_str())
    }

    pub fn has_sheet(&self, sheet: Sheet) -> bool {
        self.sheets.contains_key(&sheet)
    }

    /// Committed sheets and their tables.
    pub fn sheets(&self) -> impl Iterator<Item = (Sheet, &str)> {
        self.sheets.iter().map(|(s, t)| (*s, t.as_str()))
    }

    /// Committed sheets exposed to consumers.
    pub fn public_sheets(&self) -> Vec<Sheet> {
        self.sheets.keys().copied().filter(|s| s.is_public()).collect()
    }

    pub fn table_info(&self, table: &str) -> Option<&TableInfo> {
        self.tables.get(table)
    }

    pub fn table_info_mut(&mut self, table: &str) -> Option<&mut TableInfo> {
        self.tables.get_mut(table)
    }

    pub fn raw_table_names(&self) -> impl Iterator<Item = &str> {
        self.raw_tables.iter().map(|t| t.as_str())
    }

    /// Every table the run created, committed or raw, in creation order.
    pub fn table_names(&self) -> &[String] {
        &self.created
    }

    /// Rows across committed tables.
    pub fn total_rows(&self) -> u64 {
        self.tables.values().map(|t| t.rows).sum()
    }

    pub fn cached_pmfms(&self, key: &str) -> Option<Arc<Vec<PmfmStrategy>>> {
        self.pmfm_cache.get(key).cloned()
    }

    pub fn cache_pmfms(&mut self, key: String, pmfms: Arc<Vec<PmfmStrategy>>) {
        self.pmfm_cache.insert(key, pmfms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let ids: Vec<_> = (0..1000).map(|_| next_context_id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(ids[0] > 1_600_000_000_000);
    }

    #[test]
    fn raw_then_committed() {
        let mut ctx = ExtractionContext::with_id(7, ExtractionFormat::Rdb, Default::default(), None);
        let tr = ctx.table_name(Sheet::Trip);
        let hh = ctx.table_name(Sheet::Station);
        assert_eq!("EXT_TR_7", tr);

        ctx.register_raw(&tr);
        ctx.register_raw(&hh);
        ctx.register_table(
            Sheet::Trip,
            &tr,
            TableInfo {
                rows: 3,
                ..Default::default()
            },
        );

        assert_eq!(Some("EXT_TR_7"), ctx.sheet_table(Sheet::Trip));
        assert_eq!(None, ctx.sheet_table(Sheet::Station));
        assert_eq!(vec!["EXT_HH_7"], ctx.raw_table_names().collect::<Vec<_>>());
        assert_eq!(&["EXT_TR_7".to_string(), "EXT_HH_7".to_string()], ctx.table_names());
        assert_eq!(Some(Sheet::Trip), ctx.table_info(&tr).unwrap().sheet);
        assert_eq!(3, ctx.total_rows());
    }

    #[test]
    fn private_sheets_are_not_public() {
        let mut ctx = ExtractionContext::with_id(1, ExtractionFormat::Rdb, Default::default(), None);
        ctx.register_table(Sheet::RawSpeciesList, "EXT_RAW_SL_1", TableInfo::default());
        ctx.register_table(Sheet::SpeciesList, "EXT_SL_1", TableInfo::default());
        assert_eq!(vec![Sheet::SpeciesList], ctx.public_sheets());
    }
}
