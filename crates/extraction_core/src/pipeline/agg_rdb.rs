//! Aggregated RDB: runs an RDB extraction, then groups its tables on the
//! requested strata into `AGG_<SHEET>_<id>` tables. The intermediate RDB
//! tables are always dropped.

use async_trait::async_trait;
use tracing::{debug, info};

use super::rdb::RdbPipeline;
use super::{ExtractionEnv, ExtractionPipeline, clean, create_table};
use crate::context::ExtractionContext;
use crate::errors::{ExtractionError, Result};
use crate::filter::ExtractionFilter;
use crate::format::ExtractionFormat;
use crate::sheet::Sheet;
use crate::sql::SqlValue;
use crate::strata::{SpaceColumn, Strata, TimeColumn};

#[derive(Debug, Clone, Copy)]
struct AggStage {
    sheet: Sheet,
    /// Sheet of the source run holding the strata columns.
    strata_sheet: Sheet,
}

const STAGES: &[AggStage] = &[
    AggStage {
        sheet: Sheet::Station,
        strata_sheet: Sheet::Station,
    },
    AggStage {
        sheet: Sheet::SpeciesList,
        strata_sheet: Sheet::Station,
    },
    AggStage {
        sheet: Sheet::SpeciesLength,
        strata_sheet: Sheet::Station,
    },
    AggStage {
        sheet: Sheet::Landing,
        strata_sheet: Sheet::Landing,
    },
];

/// Strata used when the caller gives none.
pub fn default_strata() -> Strata {
    Strata::new(Some(SpaceColumn::Area), Some(TimeColumn::Year))
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AggRdbPipeline;

impl AggRdbPipeline {
    pub fn new() -> Self {
        AggRdbPipeline
    }

    async fn run(
        &self,
        env: &ExtractionEnv,
        source: &ExtractionContext,
        ctx: &mut ExtractionContext,
        preview: Option<Sheet>,
    ) -> Result<()> {
        let mut rows = 0;
        for stage in STAGES {
            if preview.is_some_and(|p| p != stage.sheet) {
                continue;
            }
            let (Some(source_table), Some(strata_table)) = (
                source.sheet_table(stage.sheet),
                source.sheet_table(stage.strata_sheet),
            ) else {
                debug!(context_id = ctx.id(), sheet = %stage.sheet, "no source rows, skipping aggregation");
                continue;
            };
            rows += self
                .create_agg_table(env, source, ctx, stage, source_table, strata_table)
                .await?;
        }

        if rows == 0 {
            return Err(ExtractionError::DataNotFound);
        }
        Ok(())
    }

    async fn create_agg_table(
        &self,
        env: &ExtractionEnv,
        source: &ExtractionContext,
        ctx: &mut ExtractionContext,
        stage: &AggStage,
        source_table: &str,
        strata_table: &str,
    ) -> Result<u64> {
        let table = ctx.table_name(stage.sheet);
        let strata = ctx.strata().cloned().unwrap_or_else(default_strata);
        let strata_source = env.catalog.require_table(env.db.as_ref(), strata_table).await?;

        let mut builder = env.query_builder(ctx.format(), stage.sheet.template_name()).await?;
        builder
            .bind("aggTableName", SqlValue::ident(table.as_str())?)
            .bind("sourceTableName", SqlValue::ident(source_table)?);
        if let Some(station_table) = source.sheet_table(Sheet::Station) {
            builder.bind("stationTableName", SqlValue::ident(station_table)?);
        }

        let group_by = strata.group_by_columns();
        for column in &group_by {
            let present = strata_source.has_column(column);
            if !present {
                debug!(context_id = ctx.id(), sheet = %stage.sheet, %column, "strata column missing from source, not grouped");
            }
            builder.set_group(column, present);
        }

        create_table(env, ctx, stage.sheet, &table, &builder, &group_by).await
    }
}

#[async_trait]
impl ExtractionPipeline for AggRdbPipeline {
    fn format(&self) -> ExtractionFormat {
        ExtractionFormat::AggRdb
    }

    async fn execute(
        &self,
        env: &ExtractionEnv,
        filter: ExtractionFilter,
        strata: Option<Strata>,
    ) -> Result<ExtractionContext> {
        let strata = strata.unwrap_or_else(default_strata);
        let preview = filter
            .preview_sheet()
            .map(|s| s.parse::<Sheet>())
            .transpose()?;
        if let Some(sheet) = preview {
            if !self.format().sheets().contains(&sheet) {
                return Err(ExtractionError::InvalidFilter(format!(
                    "Sheet {sheet} is not produced by {}",
                    self.format()
                )));
            }
        }

        // A preview of the source run stops at the same sheet.
        let source = RdbPipeline::new()
            .execute(env, filter.clone(), None)
            .await?;

        let mut ctx = ExtractionContext::new(self.format(), filter, Some(strata));
        info!(
            context_id = ctx.id(),
            source_context_id = source.id(),
            strata = ?ctx.strata().map(|s| s.group_by_columns()),
            "starting aggregation"
        );
        let result = self.run(env, &source, &mut ctx, preview).await;
        clean(env, &source).await;

        match result {
            Ok(()) => {
                info!(context_id = ctx.id(), sheets = ?ctx.public_sheets(), "aggregation finished");
                Ok(ctx)
            }
            Err(e) => {
                debug!(context_id = ctx.id(), %e, "aggregation failed, dropping tables");
                clean(env, &ctx).await;
                Err(e)
            }
        }
    }
}
