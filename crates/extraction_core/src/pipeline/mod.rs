//! Pipeline orchestration.
//!
//! A pipeline materializes a chain of dependent tables for one context. Each
//! stage renders a template, creates its table, and commits it under its
//! sheet when it holds rows. Any failure drops every table of the context
//! before the error is returned.

pub mod agg_rdb;
pub mod rdb;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::catalog::TableCatalog;
use crate::config::ExtractionConfig;
use crate::context::{ExtractionContext, TableInfo};
use crate::database::Database;
use crate::errors::{ExtractionError, Result};
use crate::filter::translate::MATCH_NOTHING;
use crate::filter::{ExtractionFilter, inverse_where_clause};
use crate::format::ExtractionFormat;
use crate::pmfm::{PmfmStrategy, StrategyService, cache_key};
use crate::referential::{ReferentialEntity, ReferentialService};
use crate::sheet::Sheet;
use crate::sql::{Dialect, Ident};
use crate::strata::{
    COLUMN_AREA, COLUMN_MONTH, COLUMN_QUARTER, COLUMN_RECT, COLUMN_SQUARE, COLUMN_YEAR, SpaceColumn,
};
use crate::template::{QueryBuilder, TemplateStore};

/// Shared services a pipeline runs against.
#[derive(Debug, Clone)]
pub struct ExtractionEnv {
    pub db: Arc<dyn Database>,
    pub catalog: Arc<TableCatalog>,
    pub templates: Arc<TemplateStore>,
    pub referentials: Arc<dyn ReferentialService>,
    pub strategies: Arc<dyn StrategyService>,
    pub config: Arc<ExtractionConfig>,
}

impl ExtractionEnv {
    pub fn new(
        db: Arc<dyn Database>,
        config: ExtractionConfig,
        referentials: Arc<dyn ReferentialService>,
        strategies: Arc<dyn StrategyService>,
    ) -> Result<Self> {
        config.validate()?;
        if config.dialect != db.dialect() {
            return Err(ExtractionError::Config(format!(
                "Configured dialect {:?} does not match the database dialect {:?}",
                config.dialect,
                db.dialect()
            )));
        }
        Ok(ExtractionEnv {
            db,
            catalog: Arc::new(TableCatalog::new()),
            templates: Arc::new(TemplateStore::new(config.template_dir.clone())),
            referentials,
            strategies,
            config: Arc::new(config),
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.db.dialect()
    }

    /// Load a template of `format` and wrap it in a builder.
    pub async fn query_builder(&self, format: ExtractionFormat, name: &str) -> Result<QueryBuilder> {
        let template = self
            .templates
            .load(format.label(), format.version(), name)
            .await?;
        Ok(QueryBuilder::new(template, self.dialect()))
    }

    /// Table description implied by the template of `sheet`, for tables
    /// read without the context that created them.
    pub async fn declared_table_info(
        &self,
        format: ExtractionFormat,
        sheet: Sheet,
    ) -> Result<TableInfo> {
        let template = self
            .templates
            .load(format.label(), format.version(), sheet.template_name())
            .await?;
        Ok(TableInfo {
            sheet: Some(sheet),
            hidden_columns: template.hidden_columns(),
            distinct: template.distinct,
            ..Default::default()
        })
    }

    pub async fn referential_id(&self, entity: ReferentialEntity, label: &str) -> Result<i64> {
        self.referentials.id_by_label(entity, label).await
    }
}

#[async_trait]
pub trait ExtractionPipeline: Send + Sync + fmt::Debug {
    fn format(&self) -> ExtractionFormat;

    /// Run the whole pipeline. On success the returned context owns every
    /// table created. `DataNotFound` is returned when no stage produced rows.
    async fn execute(
        &self,
        env: &ExtractionEnv,
        filter: ExtractionFilter,
        strata: Option<crate::strata::Strata>,
    ) -> Result<ExtractionContext>;
}

/// States of the RDB pipeline. Stages run in this order only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Trip,
    Station,
    RawSpeciesList,
    SpeciesList,
    SpeciesLengthMap,
    SpeciesLength,
    Landing,
    Done,
    Failed,
}

impl PipelineState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    /// Sheet produced by the state, if any.
    pub const fn sheet(&self) -> Option<Sheet> {
        match self {
            PipelineState::Trip => Some(Sheet::Trip),
            PipelineState::Station => Some(Sheet::Station),
            PipelineState::RawSpeciesList => Some(Sheet::RawSpeciesList),
            PipelineState::SpeciesList => Some(Sheet::SpeciesList),
            PipelineState::SpeciesLengthMap => Some(Sheet::SpeciesLengthMap),
            PipelineState::SpeciesLength => Some(Sheet::SpeciesLength),
            PipelineState::Landing => Some(Sheet::Landing),
            PipelineState::Init | PipelineState::Done | PipelineState::Failed => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sheet() {
            Some(sheet) => write!(f, "{sheet}"),
            None => write!(f, "{self:?}"),
        }
    }
}

/// Columns indexed after a stage, when present.
const STRATA_COLUMNS: &[&str] = &[
    COLUMN_YEAR,
    COLUMN_QUARTER,
    COLUMN_MONTH,
    COLUMN_AREA,
    COLUMN_RECT,
    COLUMN_SQUARE,
];

pub(crate) async fn count_rows(env: &ExtractionEnv, table: &str) -> Result<u64> {
    let count = env
        .db
        .query_count(&format!("SELECT COUNT(*) FROM {table}"))
        .await?;
    Ok(u64::try_from(count).unwrap_or(0))
}

/// Create the table of one stage.
///
/// The table is registered as raw as soon as its creation is attempted, and
/// only committed under `sheet` once it holds rows after the generic filter
/// was applied. Returns the number of rows kept.
pub(crate) async fn create_table(
    env: &ExtractionEnv,
    ctx: &mut ExtractionContext,
    sheet: Sheet,
    table: &str,
    builder: &QueryBuilder,
    analyze_columns: &[&str],
) -> Result<u64> {
    let rendered = builder.render()?;
    let context_id = ctx.id();

    ctx.register_raw(table);
    debug!(context_id, %sheet, %table, template = builder.template_name(), "creating table");
    trace!(sql = %rendered.sql, "create statement");
    env.db.execute(&rendered.sql).await?;
    env.catalog.invalidate(table).await;

    let mut rows = count_rows(env, table).await?;
    if rows == 0 {
        debug!(context_id, %sheet, %table, "stage produced no rows");
        return Ok(0);
    }

    let metadata = env.catalog.require_table(env.db.as_ref(), table).await?;
    let inverse = inverse_where_clause(&metadata, ctx.filter(), sheet.name(), env.dialect())?;
    if inverse != MATCH_NOTHING {
        let deleted = env
            .db
            .execute(&format!("DELETE FROM {table} WHERE {inverse}"))
            .await?;
        rows = rows.saturating_sub(deleted);
        debug!(context_id, %table, deleted, rows, "applied filter to table");
        if rows == 0 {
            return Ok(0);
        }
    }

    let mut spatial_columns = BTreeSet::new();
    for column in STRATA_COLUMNS {
        if !metadata.has_column(column) {
            continue;
        }
        if SpaceColumn::ALL.iter().any(|c| c.column_name() == *column) {
            spatial_columns.insert(column.to_string());
        }
        let index = env.dialect().index_name(table, column);
        env.db
            .execute(&format!("CREATE INDEX {index} ON {table} ({column})"))
            .await?;
    }

    let mut column_values = BTreeMap::new();
    if env.config.analyze {
        let candidates = rendered
            .not_numeric_columns
            .iter()
            .map(|c| c.as_str())
            .chain(analyze_columns.iter().copied());
        for column in candidates {
            if rendered.hidden_columns.contains(column) || column_values.contains_key(column) {
                continue;
            }
            match metadata.column(column) {
                Some(c) if c.is_distinctable() => (),
                _ => continue,
            }
            let values = sample_values(env, table, column).await?;
            column_values.insert(column.to_string(), values);
        }
    }

    ctx.register_table(
        sheet,
        table,
        TableInfo {
            sheet: Some(sheet),
            rows,
            hidden_columns: rendered.hidden_columns,
            distinct: rendered.distinct,
            spatial_columns,
            column_values,
        },
    );
    debug!(context_id, %sheet, %table, rows, "committed table");
    Ok(rows)
}

async fn sample_values(env: &ExtractionEnv, table: &str, column: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT DISTINCT {column} FROM {table} WHERE {column} IS NOT NULL ORDER BY {column}{}",
        env.dialect()
            .limit_offset(env.config.analyze_sample_size, 0)
    );
    let rows = env.db.query(&sql).await?;
    Ok(rows
        .rows
        .into_iter()
        .filter_map(|r| r.into_iter().next().flatten())
        .collect())
}

/// Drop every table of a context, committed or raw, newest first.
///
/// Best effort: a failed drop is logged and the remaining tables are still
/// dropped. Returns the number of tables dropped.
pub async fn clean(env: &ExtractionEnv, ctx: &ExtractionContext) -> usize {
    drop_tables(env, ctx.id(), ctx.table_names().iter().rev().map(|t| t.as_str())).await
}

pub(crate) async fn drop_tables<'a>(
    env: &ExtractionEnv,
    context_id: i64,
    tables: impl Iterator<Item = &'a str>,
) -> usize {
    let mut dropped = 0;
    for table in tables {
        match env
            .db
            .execute(&format!("DROP TABLE IF EXISTS {table}"))
            .await
        {
            Ok(_) => dropped += 1,
            Err(e) => warn!(context_id, %table, %e, "failed to drop table"),
        }
        env.catalog.remove(table).await;
    }
    debug!(
        context_id,
        dropped,
        cached_tables = env.catalog.cached_tables(),
        "cleaned context tables"
    );
    dropped
}

/// Remove hidden columns from every committed table.
pub(crate) async fn drop_hidden_columns(env: &ExtractionEnv, ctx: &mut ExtractionContext) -> Result<()> {
    let tables: Vec<(String, BTreeSet<String>)> = ctx
        .sheets()
        .filter_map(|(_, table)| {
            let info = ctx.table_info(table)?;
            (!info.hidden_columns.is_empty())
                .then(|| (table.to_string(), info.hidden_columns.clone()))
        })
        .collect();

    for (table, hidden) in tables {
        for column in &hidden {
            let column = Ident::new(column.clone())?;
            env.db
                .execute(&format!("ALTER TABLE {table} DROP COLUMN {column}"))
                .await?;
        }
        env.catalog.invalidate(&table).await;
        if let Some(info) = ctx.table_info_mut(&table) {
            info.hidden_columns.clear();
        }
        debug!(context_id = ctx.id(), %table, columns = hidden.len(), "dropped hidden columns");
    }
    Ok(())
}

/// Strategy PMFMs of the context's programs at one acquisition level,
/// cached per context.
pub(crate) async fn load_pmfms(
    env: &ExtractionEnv,
    ctx: &mut ExtractionContext,
    acquisition_level: &str,
) -> Result<Arc<Vec<PmfmStrategy>>> {
    let program_labels = ctx.trip_filter().program_labels.clone();
    if program_labels.is_empty() {
        return Ok(Arc::new(Vec::new()));
    }

    let level_id = env
        .referential_id(ReferentialEntity::AcquisitionLevel, acquisition_level)
        .await?;
    let key = cache_key(&program_labels, &[level_id]);
    if let Some(pmfms) = ctx.cached_pmfms(&key) {
        return Ok(pmfms);
    }

    let pmfms = Arc::new(env.strategies.pmfms(&program_labels, &[level_id]).await?);
    debug!(context_id = ctx.id(), %key, pmfms = pmfms.len(), "loaded strategy pmfms");
    ctx.cache_pmfms(key, pmfms.clone());
    Ok(pmfms)
}

#[cfg(test)]
pub(crate) mod testenv {
    use super::*;
    use crate::pmfm::MemoryStrategies;
    use crate::referential::MemoryReferentials;
    use crate::testutil::MemoryDatabase;

    /// Referentials resolving every label of the default configuration.
    pub fn referentials() -> MemoryReferentials {
        let labels = ExtractionConfig::default().referentials;
        MemoryReferentials::new()
            .with(ReferentialEntity::LocationLevel, &labels.country_location_level, 1)
            .with(ReferentialEntity::LocationLevel, &labels.area_location_level, 2)
            .with(ReferentialEntity::LocationLevel, &labels.rectangle_location_level, 3)
            .with(ReferentialEntity::LocationLevel, &labels.square_location_level, 4)
            .with(ReferentialEntity::Pmfm, &labels.mesh_size_pmfm, 10)
            .with(ReferentialEntity::Pmfm, &labels.fishing_depth_pmfm, 11)
            .with(ReferentialEntity::Pmfm, &labels.selectivity_device_pmfm, 12)
            .with(ReferentialEntity::Pmfm, &labels.sex_pmfm, 13)
            .with(ReferentialEntity::Pmfm, &labels.length_pmfm, 14)
            .with(ReferentialEntity::Unit, &labels.centimeter_unit, 20)
            .with(ReferentialEntity::Unit, &labels.millimeter_unit, 21)
            .with(ReferentialEntity::AcquisitionLevel, &labels.trip_acquisition_level, 30)
            .with(ReferentialEntity::AcquisitionLevel, &labels.operation_acquisition_level, 31)
    }

    pub fn env_with(db: Arc<MemoryDatabase>, config: ExtractionConfig) -> ExtractionEnv {
        logutil::init_test();
        ExtractionEnv::new(
            db,
            config,
            Arc::new(referentials()),
            Arc::new(MemoryStrategies::new()),
        )
        .unwrap()
    }

    pub fn env(db: Arc<MemoryDatabase>) -> ExtractionEnv {
        env_with(db, ExtractionConfig::default())
    }
}
