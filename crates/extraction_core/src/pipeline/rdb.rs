//! RDB extraction: Trip, Station, species lists, species lengths and
//! landings, each into its own `EXT_<SHEET>_<id>` table.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Datelike;
use tracing::{debug, error, info, trace};

use super::{
    ExtractionEnv, ExtractionPipeline, PipelineState, clean, create_table, drop_hidden_columns,
    load_pmfms,
};
use crate::context::ExtractionContext;
use crate::errors::{ExtractionError, Result, internal};
use crate::filter::{ExtractionFilter, TripFilter};
use crate::format::ExtractionFormat;
use crate::pmfm::{MeasurementSource, pmfm_injections};
use crate::referential::ReferentialEntity;
use crate::sheet::Sheet;
use crate::sql::SqlValue;
use crate::strata::{COLUMN_MONTH, COLUMN_QUARTER, COLUMN_YEAR, Strata};
use crate::template::QueryBuilder;

const TIME_COLUMNS: &[&str] = &[COLUMN_YEAR, COLUMN_QUARTER, COLUMN_MONTH];

/// Station template groups enabled when the trip table carries the column.
const STATION_OPTIONAL_COLUMNS: &[(&str, &str)] = &[
    ("nationalMetier", "national_metier"),
    ("euMetierLevel5", "eu_metier_level5"),
    ("euMetierLevel6", "eu_metier_level6"),
    ("gearType", "gear_type"),
];

/// How species lengths are linked back to species list rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpeciesLinkage {
    /// The raw species list aggregates its sample ids in one column.
    SampleIds,
    /// One raw row per sample, linked through a map table.
    MapTable,
}

#[derive(Debug)]
struct Progress {
    state: PipelineState,
    preview: Option<Sheet>,
    /// Rows committed under public sheets.
    rows: u64,
    linkage: Option<SpeciesLinkage>,
    /// Rows of the map table, `-1` when skipped on purpose.
    map_rows: i64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RdbPipeline;

impl RdbPipeline {
    pub fn new() -> Self {
        RdbPipeline
    }

    fn bind_table(builder: &mut QueryBuilder, slot: &str, table: &str) -> Result<()> {
        builder.bind(slot, SqlValue::ident(table)?);
        Ok(())
    }

    fn required_table(ctx: &ExtractionContext, sheet: Sheet) -> Result<String> {
        ctx.sheet_table(sheet)
            .map(|t| t.to_string())
            .ok_or_else(|| internal!("Missing {sheet} table in context {}", ctx.id()))
    }

    /// Transition after a stage produced `rows`.
    ///
    /// An empty stage short-circuits the chain to the independent landing
    /// stage. A preview stops once its sheet is produced.
    fn after_stage(progress: &mut Progress, sheet: Sheet, rows: u64, next: PipelineState) -> PipelineState {
        if sheet.is_public() {
            progress.rows += rows;
        }
        match progress.preview {
            Some(preview) if preview == sheet => PipelineState::Done,
            Some(preview) if rows == 0 && preview != Sheet::Landing => PipelineState::Done,
            _ if rows == 0 => PipelineState::Landing,
            _ => next,
        }
    }

    async fn step(
        &self,
        env: &ExtractionEnv,
        ctx: &mut ExtractionContext,
        progress: &mut Progress,
    ) -> Result<PipelineState> {
        Ok(match progress.state {
            PipelineState::Init => match progress.preview {
                Some(Sheet::Landing) => PipelineState::Landing,
                _ => PipelineState::Trip,
            },
            PipelineState::Trip => {
                let rows = self.create_trip_table(env, ctx).await?;
                Self::after_stage(progress, Sheet::Trip, rows, PipelineState::Station)
            }
            PipelineState::Station => {
                let rows = self.create_station_table(env, ctx).await?;
                Self::after_stage(progress, Sheet::Station, rows, PipelineState::RawSpeciesList)
            }
            PipelineState::RawSpeciesList => {
                let rows = self.create_raw_species_list_table(env, ctx).await?;
                Self::after_stage(progress, Sheet::RawSpeciesList, rows, PipelineState::SpeciesList)
            }
            PipelineState::SpeciesList => {
                let linkage = self.species_linkage(env, ctx).await?;
                progress.linkage = Some(linkage);
                let rows = self.create_species_list_table(env, ctx).await?;
                let next = match linkage {
                    SpeciesLinkage::MapTable => PipelineState::SpeciesLengthMap,
                    SpeciesLinkage::SampleIds => {
                        progress.map_rows = -1;
                        PipelineState::SpeciesLength
                    }
                };
                Self::after_stage(progress, Sheet::SpeciesList, rows, next)
            }
            PipelineState::SpeciesLengthMap => {
                let rows = self.create_species_length_map_table(env, ctx).await?;
                progress.map_rows = i64::try_from(rows).unwrap_or(i64::MAX);
                Self::after_stage(progress, Sheet::SpeciesLengthMap, rows, PipelineState::SpeciesLength)
            }
            PipelineState::SpeciesLength => {
                let linkage = progress
                    .linkage
                    .ok_or_else(|| internal!("Species linkage not resolved"))?;
                let rows = self.create_species_length_table(env, ctx, linkage).await?;
                Self::after_stage(progress, Sheet::SpeciesLength, rows, PipelineState::Landing)
            }
            PipelineState::Landing => {
                let rows = self.create_landing_table(env, ctx).await?;
                progress.rows += rows;
                PipelineState::Done
            }
            PipelineState::Done | PipelineState::Failed => progress.state,
        })
    }

    /// Run every stage in order. Returns the rows committed under public
    /// sheets.
    async fn run(&self, env: &ExtractionEnv, ctx: &mut ExtractionContext) -> Result<u64> {
        let preview = ctx
            .filter()
            .preview_sheet()
            .map(|s| s.parse::<Sheet>())
            .transpose()?;
        let mut progress = Progress {
            state: PipelineState::Init,
            preview,
            rows: 0,
            linkage: None,
            map_rows: 0,
        };

        while !progress.state.is_terminal() {
            match self.step(env, ctx, &mut progress).await {
                Ok(next) => {
                    trace!(context_id = ctx.id(), from = %progress.state, to = %next, "pipeline transition");
                    progress.state = next;
                }
                Err(e) => {
                    error!(context_id = ctx.id(), stage = %progress.state, %e, "extraction stage failed");
                    progress.state = PipelineState::Failed;
                    return Err(e);
                }
            }
        }

        debug!(context_id = ctx.id(), rows = progress.rows, map_rows = progress.map_rows, "pipeline done");
        Ok(progress.rows)
    }

    async fn run_to_completion(&self, env: &ExtractionEnv, ctx: &mut ExtractionContext) -> Result<()> {
        let rows = self.run(env, ctx).await?;
        if rows == 0 {
            return Err(ExtractionError::DataNotFound);
        }
        if env.config.drop_hidden_columns {
            drop_hidden_columns(env, ctx).await?;
        }
        Ok(())
    }

    async fn create_trip_table(&self, env: &ExtractionEnv, ctx: &mut ExtractionContext) -> Result<u64> {
        let table = ctx.table_name(Sheet::Trip);
        let labels = &env.config.referentials;
        let country_level_id = env
            .referential_id(ReferentialEntity::LocationLevel, &labels.country_location_level)
            .await?;
        let pmfms = load_pmfms(env, ctx, &labels.trip_acquisition_level).await?;

        let mut builder = env.query_builder(ctx.format(), Sheet::Trip.template_name()).await?;
        Self::bind_table(&mut builder, "tripTableName", &table)?;
        builder.bind("countryLocationLevelId", country_level_id);

        let filter = ctx.trip_filter();
        builder.set_group("startDateFilter", filter.start_date.is_some());
        if let Some(start) = filter.start_date {
            builder.bind("startDate", start);
        }
        builder.set_group("endDateFilter", filter.end_date.is_some());
        if let Some(end) = filter.end_date {
            // Compared as `< endDate`, so trips of the last day are kept.
            builder.bind("endDate", end.succ_opt().unwrap_or(end));
        }
        builder.set_group("programFilter", !filter.program_labels.is_empty());
        builder.bind("progLabels", SqlValue::text_list(filter.program_labels.iter().cloned()));
        builder.set_group("locationFilter", !filter.location_ids.is_empty());
        builder.bind("locationIds", SqlValue::int_list(filter.location_ids.iter().copied()));
        builder.set_group("departmentFilter", !filter.recorder_department_ids.is_empty());
        builder.bind(
            "recDepIds",
            SqlValue::int_list(filter.recorder_department_ids.iter().copied()),
        );
        builder.set_group("vesselFilter", !filter.vessel_ids.is_empty());
        builder.bind("vesselIds", SqlValue::int_list(filter.vessel_ids.iter().copied()));
        builder.set_group("tripFilter", filter.trip_id.is_some());
        if let Some(trip_id) = filter.trip_id {
            builder.bind("tripId", trip_id);
        }

        let reserved: BTreeSet<&str> = builder.template().select_aliases();
        let injections = pmfm_injections(
            &pmfms,
            &MeasurementSource {
                acquisition_level: &labels.trip_acquisition_level,
                table: "VESSEL_USE_MEASUREMENT",
                parent_column: "TRIP_FK",
                parent_expr: "T.ID",
                reserved_aliases: &["T", "P", "V", "VF", "H", "LH", "C", "O", "COUNTRY"],
            },
            &reserved,
        )?;
        for injection in injections {
            builder.inject("tripPmfms", injection);
        }

        create_table(env, ctx, Sheet::Trip, &table, &builder, &[COLUMN_YEAR]).await
    }

    async fn create_station_table(&self, env: &ExtractionEnv, ctx: &mut ExtractionContext) -> Result<u64> {
        let trip_table = Self::required_table(ctx, Sheet::Trip)?;
        let table = ctx.table_name(Sheet::Station);
        let labels = &env.config.referentials;

        let area_level_id = env
            .referential_id(ReferentialEntity::LocationLevel, &labels.area_location_level)
            .await?;
        let rect_level_id = env
            .referential_id(ReferentialEntity::LocationLevel, &labels.rectangle_location_level)
            .await?;
        let square_level_id = env
            .referential_id(ReferentialEntity::LocationLevel, &labels.square_location_level)
            .await?;
        let mesh_size_id = env
            .referential_id(ReferentialEntity::Pmfm, &labels.mesh_size_pmfm)
            .await?;
        let gear_depth_id = env
            .referential_id(ReferentialEntity::Pmfm, &labels.fishing_depth_pmfm)
            .await?;
        let selection_device_id = env
            .referential_id(ReferentialEntity::Pmfm, &labels.selectivity_device_pmfm)
            .await?;
        let pmfms = load_pmfms(env, ctx, &labels.operation_acquisition_level).await?;

        let mut builder = env.query_builder(ctx.format(), Sheet::Station.template_name()).await?;
        Self::bind_table(&mut builder, "tripTableName", &trip_table)?;
        Self::bind_table(&mut builder, "stationTableName", &table)?;
        builder
            .bind("areaLocationLevelId", area_level_id)
            .bind("rectLocationLevelId", rect_level_id)
            .bind("squareLocationLevelId", square_level_id)
            .bind("meshSizePmfmId", mesh_size_id)
            .bind("gearDepthPmfmId", gear_depth_id)
            .bind("selectionDevicePmfmId", selection_device_id);

        // Columns of the trip table take precedence over the ones derived
        // from operations.
        for (group, column) in STATION_OPTIONAL_COLUMNS {
            let enabled = env.catalog.has_column(env.db.as_ref(), &trip_table, column).await;
            builder.set_group(group, enabled);
        }

        let reserved: BTreeSet<&str> = builder.template().select_aliases();
        let injections = pmfm_injections(
            &pmfms,
            &MeasurementSource {
                acquisition_level: &labels.operation_acquisition_level,
                table: "VESSEL_USE_MEASUREMENT",
                parent_column: "OPERATION_FK",
                parent_expr: "O.ID",
                reserved_aliases: &["T", "O", "PG", "G", "M", "FA", "LHA", "AL", "GUM", "QV"],
            },
            &reserved,
        )?;
        for injection in injections {
            builder.inject("stationPmfms", injection);
        }

        create_table(env, ctx, Sheet::Station, &table, &builder, TIME_COLUMNS).await
    }

    async fn create_raw_species_list_table(
        &self,
        env: &ExtractionEnv,
        ctx: &mut ExtractionContext,
    ) -> Result<u64> {
        let station_table = Self::required_table(ctx, Sheet::Station)?;
        let table = ctx.table_name(Sheet::RawSpeciesList);

        let mut builder = env.query_builder(ctx.format(), Sheet::RawSpeciesList.template_name()).await?;
        Self::bind_table(&mut builder, "stationTableName", &station_table)?;
        Self::bind_table(&mut builder, "rawSpeciesListTableName", &table)?;

        create_table(env, ctx, Sheet::RawSpeciesList, &table, &builder, &[]).await
    }

    /// Pick the linkage strategy from the shape of the raw species table.
    async fn species_linkage(&self, env: &ExtractionEnv, ctx: &ExtractionContext) -> Result<SpeciesLinkage> {
        let raw_table = Self::required_table(ctx, Sheet::RawSpeciesList)?;
        let raw = env.catalog.require_table(env.db.as_ref(), &raw_table).await?;
        if raw.has_column("sample_ids") {
            Ok(SpeciesLinkage::SampleIds)
        } else if raw.has_column("id") {
            Ok(SpeciesLinkage::MapTable)
        } else {
            Err(ExtractionError::SchemaMismatch {
                table: raw_table,
                column: "sample_ids".to_string(),
            })
        }
    }

    async fn create_species_list_table(&self, env: &ExtractionEnv, ctx: &mut ExtractionContext) -> Result<u64> {
        let raw_table = Self::required_table(ctx, Sheet::RawSpeciesList)?;
        let table = ctx.table_name(Sheet::SpeciesList);

        let mut builder = env.query_builder(ctx.format(), Sheet::SpeciesList.template_name()).await?;
        Self::bind_table(&mut builder, "rawSpeciesListTableName", &raw_table)?;
        Self::bind_table(&mut builder, "speciesListTableName", &table)?;

        create_table(env, ctx, Sheet::SpeciesList, &table, &builder, &[]).await
    }

    async fn create_species_length_map_table(
        &self,
        env: &ExtractionEnv,
        ctx: &mut ExtractionContext,
    ) -> Result<u64> {
        let raw_table = Self::required_table(ctx, Sheet::RawSpeciesList)?;
        let table = ctx.table_name(Sheet::SpeciesLengthMap);

        let mut builder = env.query_builder(ctx.format(), Sheet::SpeciesLengthMap.template_name()).await?;
        Self::bind_table(&mut builder, "rawSpeciesListTableName", &raw_table)?;
        Self::bind_table(&mut builder, "speciesLengthMapTableName", &table)?;

        create_table(env, ctx, Sheet::SpeciesLengthMap, &table, &builder, &[]).await
    }

    async fn create_species_length_table(
        &self,
        env: &ExtractionEnv,
        ctx: &mut ExtractionContext,
        linkage: SpeciesLinkage,
    ) -> Result<u64> {
        let species_list_table = Self::required_table(ctx, Sheet::SpeciesList)?;
        let raw_table = Self::required_table(ctx, Sheet::RawSpeciesList)?;
        let table = ctx.table_name(Sheet::SpeciesLength);
        let labels = &env.config.referentials;

        let sex_id = env
            .referential_id(ReferentialEntity::Pmfm, &labels.sex_pmfm)
            .await?;
        let length_id = env
            .referential_id(ReferentialEntity::Pmfm, &labels.length_pmfm)
            .await?;
        let centimeter_id = env
            .referential_id(ReferentialEntity::Unit, &labels.centimeter_unit)
            .await?;
        let millimeter_id = env
            .referential_id(ReferentialEntity::Unit, &labels.millimeter_unit)
            .await?;

        let mut builder = env.query_builder(ctx.format(), Sheet::SpeciesLength.template_name()).await?;
        Self::bind_table(&mut builder, "speciesListTableName", &species_list_table)?;
        Self::bind_table(&mut builder, "rawSpeciesListTableName", &raw_table)?;
        Self::bind_table(&mut builder, "speciesLengthTableName", &table)?;
        builder
            .bind("sexPmfmId", sex_id)
            .bind("lengthPmfmId", length_id)
            .bind("centimeterUnitId", centimeter_id)
            .bind("millimeterUnitId", millimeter_id)
            .set_group("sampleIds", linkage == SpeciesLinkage::SampleIds);
        if linkage == SpeciesLinkage::MapTable {
            let map_table = Self::required_table(ctx, Sheet::SpeciesLengthMap)?;
            Self::bind_table(&mut builder, "speciesLengthMapTableName", &map_table)?;
        }

        create_table(env, ctx, Sheet::SpeciesLength, &table, &builder, &[]).await
    }

    /// Landings come from their own source table. Without it the stage is
    /// skipped.
    async fn create_landing_table(&self, env: &ExtractionEnv, ctx: &mut ExtractionContext) -> Result<u64> {
        let source = env.config.raw_landing_table.as_str();
        match env.catalog.get_table(env.db.as_ref(), source).await {
            Ok(Some(_)) => (),
            Ok(None) => {
                debug!(context_id = ctx.id(), %source, "no raw landing table, skipping landings");
                return Ok(0);
            }
            Err(e) => {
                debug!(context_id = ctx.id(), %source, %e, "failed to probe raw landing table, skipping landings");
                return Ok(0);
            }
        }

        let table = ctx.table_name(Sheet::Landing);
        let mut builder = env.query_builder(ctx.format(), Sheet::Landing.template_name()).await?;
        Self::bind_table(&mut builder, "rawLandingTableName", source)?;
        Self::bind_table(&mut builder, "landingTableName", &table)?;

        let filter = ctx.trip_filter();
        builder.set_group("startYearFilter", filter.start_date.is_some());
        if let Some(start) = filter.start_date {
            builder.bind("startYear", i64::from(start.year()));
        }
        builder.set_group("endYearFilter", filter.end_date.is_some());
        if let Some(end) = filter.end_date {
            builder.bind("endYear", i64::from(end.year()));
        }

        create_table(env, ctx, Sheet::Landing, &table, &builder, TIME_COLUMNS).await
    }
}

#[async_trait]
impl ExtractionPipeline for RdbPipeline {
    fn format(&self) -> ExtractionFormat {
        ExtractionFormat::Rdb
    }

    async fn execute(
        &self,
        env: &ExtractionEnv,
        filter: ExtractionFilter,
        strata: Option<Strata>,
    ) -> Result<ExtractionContext> {
        let trip_filter = TripFilter::from_extraction_filter(&filter)?;
        let mut ctx = ExtractionContext::new(self.format(), filter, strata);
        ctx.set_trip_filter(trip_filter);
        info!(context_id = ctx.id(), format = %self.format(), "starting extraction");

        match self.run_to_completion(env, &mut ctx).await {
            Ok(()) => {
                info!(
                    context_id = ctx.id(),
                    sheets = ?ctx.public_sheets(),
                    rows = ctx.total_rows(),
                    "extraction finished"
                );
                Ok(ctx)
            }
            Err(e) => {
                if e.is_data_not_found() {
                    debug!(context_id = ctx.id(), "extraction found no data");
                }
                clean(env, &ctx).await;
                Err(e)
            }
        }
    }
}
