//! Entry points used by the API and the command line.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::aggregation;
use crate::context::ExtractionContext;
use crate::errors::{ExtractionError, Result};
use crate::filter::ExtractionFilter;
use crate::format::{ExtractionFormat, FormatRegistry};
use crate::pipeline::agg_rdb::default_strata;
use crate::pipeline::{self, ExtractionEnv};
use crate::reader;
use crate::result::{AggregationResult, ExtractionResult, MinMax, Page};
use crate::sheet::Sheet;
use crate::strata::Strata;

#[derive(Debug, Clone)]
pub struct ExtractionService {
    env: ExtractionEnv,
    registry: FormatRegistry,
}

impl ExtractionService {
    pub fn new(env: ExtractionEnv, registry: FormatRegistry) -> Self {
        ExtractionService { env, registry }
    }

    pub fn env(&self) -> &ExtractionEnv {
        &self.env
    }

    /// Run the pipeline of `format`. Returns `None` when the filter matched
    /// no data.
    pub async fn extract(
        &self,
        format: ExtractionFormat,
        filter: ExtractionFilter,
    ) -> Result<Option<ExtractionContext>> {
        self.run(format, filter, None).await
    }

    /// Run the aggregation pipeline. Returns `None` when the filter matched
    /// no data.
    pub async fn aggregate(
        &self,
        filter: ExtractionFilter,
        strata: Option<Strata>,
    ) -> Result<Option<ExtractionContext>> {
        self.run(ExtractionFormat::AggRdb, filter, strata).await
    }

    async fn run(
        &self,
        format: ExtractionFormat,
        filter: ExtractionFilter,
        strata: Option<Strata>,
    ) -> Result<Option<ExtractionContext>> {
        let pipeline = self.registry.get(format)?;
        info!(%format, "starting extraction");
        match pipeline.execute(&self.env, filter, strata).await {
            Ok(ctx) => Ok(Some(ctx)),
            Err(ExtractionError::DataNotFound) => {
                debug!(%format, "extraction matched no data");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Read one page of a sheet of `ctx`. The sheet defaults to the filter's
    /// sheet, then to the first sheet of the context.
    pub async fn read(
        &self,
        ctx: &ExtractionContext,
        sheet: Option<Sheet>,
        filter: &ExtractionFilter,
        page: &Page,
    ) -> Result<ExtractionResult> {
        let (sheet, table) = context_table(ctx, sheet, filter)?;
        reader::read_table(&self.env, table, sheet, filter, ctx.table_info(table), page).await
    }

    /// Read a sheet of a context known only by its id, e.g. from a
    /// previous process.
    pub async fn read_by_id(
        &self,
        format: ExtractionFormat,
        context_id: i64,
        sheet: Sheet,
        filter: &ExtractionFilter,
        page: &Page,
    ) -> Result<ExtractionResult> {
        let table = table_by_id(format, context_id, sheet)?;
        let info = self.env.declared_table_info(format, sheet).await?;
        reader::read_table(&self.env, &table, sheet, filter, Some(&info), page).await
    }

    /// Read one page of groups of a sheet of `ctx`. The strata defaults to
    /// the one the context was aggregated with.
    pub async fn aggregate_read(
        &self,
        ctx: &ExtractionContext,
        sheet: Option<Sheet>,
        filter: &ExtractionFilter,
        strata: Option<&Strata>,
        page: &Page,
    ) -> Result<AggregationResult> {
        let (sheet, table) = context_table(ctx, sheet, filter)?;
        let strata = context_strata(ctx, strata);
        aggregation::read(&self.env, table, sheet, filter, &strata, page).await
    }

    pub async fn aggregate_read_by_id(
        &self,
        context_id: i64,
        sheet: Sheet,
        filter: &ExtractionFilter,
        strata: &Strata,
        page: &Page,
    ) -> Result<AggregationResult> {
        let table = table_by_id(ExtractionFormat::AggRdb, context_id, sheet)?;
        aggregation::read(&self.env, &table, sheet, filter, strata, page).await
    }

    pub async fn read_by_tech(
        &self,
        ctx: &ExtractionContext,
        sheet: Option<Sheet>,
        filter: &ExtractionFilter,
        strata: Option<&Strata>,
    ) -> Result<BTreeMap<String, f64>> {
        let (sheet, table) = context_table(ctx, sheet, filter)?;
        let strata = context_strata(ctx, strata);
        aggregation::read_by_tech(&self.env, table, sheet, filter, &strata).await
    }

    pub async fn tech_min_max(
        &self,
        ctx: &ExtractionContext,
        sheet: Option<Sheet>,
        filter: &ExtractionFilter,
        strata: Option<&Strata>,
    ) -> Result<MinMax> {
        let (sheet, table) = context_table(ctx, sheet, filter)?;
        let strata = context_strata(ctx, strata);
        aggregation::tech_min_max(&self.env, table, sheet, filter, &strata).await
    }

    /// Drop every table of `ctx`. Returns the number of tables dropped.
    pub async fn clean(&self, ctx: &ExtractionContext) -> usize {
        info!(context_id = ctx.id(), format = %ctx.format(), "cleaning context");
        pipeline::clean(&self.env, ctx).await
    }

    /// Drop every table a context of `format` with this id may have
    /// created.
    pub async fn clean_by_id(&self, format: ExtractionFormat, context_id: i64) -> usize {
        info!(context_id, %format, "cleaning context by id");
        let tables: Vec<String> = format
            .sheets()
            .iter()
            .rev()
            .map(|sheet| format.table_name(*sheet, context_id))
            .collect();
        pipeline::drop_tables(&self.env, context_id, tables.iter().map(|t| t.as_str())).await
    }
}

fn context_table<'a>(
    ctx: &'a ExtractionContext,
    sheet: Option<Sheet>,
    filter: &ExtractionFilter,
) -> Result<(Sheet, &'a str)> {
    let sheet = match sheet {
        Some(sheet) => sheet,
        None => match filter.sheet_name.as_deref() {
            Some(name) => name.parse()?,
            None => ctx
                .public_sheets()
                .first()
                .copied()
                .ok_or(ExtractionError::DataNotFound)?,
        },
    };
    if !sheet.is_public() {
        return Err(ExtractionError::InvalidFilter(format!(
            "Sheet {sheet} cannot be read"
        )));
    }
    let table = ctx.sheet_table(sheet).ok_or_else(|| {
        ExtractionError::InvalidFilter(format!(
            "Sheet {sheet} is not part of context {}",
            ctx.id()
        ))
    })?;
    Ok((sheet, table))
}

fn table_by_id(format: ExtractionFormat, context_id: i64, sheet: Sheet) -> Result<String> {
    if !sheet.is_public() || !format.sheets().contains(&sheet) {
        return Err(ExtractionError::InvalidFilter(format!(
            "Sheet {sheet} is not produced by {format}"
        )));
    }
    Ok(format.table_name(sheet, context_id))
}

fn context_strata(ctx: &ExtractionContext, strata: Option<&Strata>) -> Strata {
    strata
        .or(ctx.strata())
        .cloned()
        .unwrap_or_else(default_strata)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::TableInfo;
    use crate::errors::ErrorKind;
    use crate::pipeline::testenv;
    use crate::testutil::{MemoryDatabase, columns, rows};

    fn service(db: Arc<MemoryDatabase>) -> ExtractionService {
        ExtractionService::new(testenv::env(db), FormatRegistry::with_builtins())
    }

    fn station_context(db: &MemoryDatabase) -> ExtractionContext {
        db.create_table(
            "EXT_HH_3",
            columns(&[
                ("trip_code", "INTEGER", false),
                ("area", "VARCHAR", true),
                ("gear_type", "VARCHAR", true),
                ("station_count", "INTEGER", true),
            ]),
            4,
        );
        let mut ctx = ExtractionContext::with_id(
            3,
            ExtractionFormat::Rdb,
            ExtractionFilter::default(),
            None,
        );
        ctx.register_table(
            Sheet::Station,
            "EXT_HH_3",
            TableInfo {
                sheet: Some(Sheet::Station),
                rows: 4,
                ..Default::default()
            },
        );
        ctx
    }

    #[tokio::test]
    async fn no_data_is_an_absent_result() {
        let db = Arc::new(MemoryDatabase::new());
        let service = service(db);

        let ctx = service
            .extract(ExtractionFormat::Rdb, ExtractionFilter::default())
            .await
            .unwrap();
        assert!(ctx.is_none());
    }

    #[tokio::test]
    async fn unregistered_format_is_a_configuration_error() {
        let db = Arc::new(MemoryDatabase::new());
        let service = ExtractionService::new(testenv::env(db), FormatRegistry::empty());

        let err = service
            .extract(ExtractionFormat::Rdb, ExtractionFilter::default())
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Configuration, err.kind());
    }

    #[tokio::test]
    async fn read_defaults_to_the_first_sheet() {
        let db = Arc::new(MemoryDatabase::new());
        let ctx = station_context(&db);
        db.on_query("SELECT COUNT(*) FROM (", rows(&["count"], vec![vec![Some("4")]]));
        let service = service(db.clone());

        let result = service
            .read(&ctx, None, &ExtractionFilter::default(), &Page::default())
            .await
            .unwrap();
        assert_eq!(4, result.total_count);
        assert!(db.statements()[1].starts_with("SELECT trip_code, area, gear_type, station_count FROM EXT_HH_3"));

        let err = service
            .read(&ctx, Some(Sheet::Landing), &ExtractionFilter::default(), &Page::default())
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::InvalidInput, err.kind());
    }

    #[tokio::test]
    async fn aggregate_read_uses_the_default_strata() {
        let db = Arc::new(MemoryDatabase::new());
        let ctx = station_context(&db);
        db.on_query("SELECT COUNT(*) FROM (", rows(&["count"], vec![vec![Some("2")]]));
        let service = service(db.clone());

        let result = service
            .aggregate_read(&ctx, Some(Sheet::Station), &ExtractionFilter::default(), None, &Page::default())
            .await
            .unwrap();
        assert_eq!(vec!["area"], result.space_strata);
        assert!(result.time_strata.is_empty());
        assert_eq!(Some("gear_type".to_string()), result.tech_strata);
        assert!(
            db.statements()[1].starts_with(
                "SELECT area, gear_type, SUM(COALESCE(station_count, 0)) AS station_count FROM EXT_HH_3 GROUP BY area, gear_type"
            ),
            "{:?}",
            db.statements()
        );
    }

    #[tokio::test]
    async fn read_by_id_never_returns_hidden_columns() {
        let db = Arc::new(MemoryDatabase::new());
        db.on_create(
            "EXT_TR",
            columns(&[("trip_code", "INTEGER", false), ("year", "INTEGER", false)]),
            2,
        );
        db.on_create(
            "EXT_HH",
            columns(&[
                ("trip_code", "INTEGER", false),
                ("station_number", "INTEGER", false),
                ("area", "VARCHAR", true),
                ("station_id", "INTEGER", false),
            ]),
            5,
        );
        db.on_query("SELECT COUNT(*) FROM (", rows(&["count"], vec![vec![Some("5")]]));
        let service = service(db.clone());
        let filter = ExtractionFilter {
            sheet_name: Some("HH".to_string()),
            preview: true,
            ..Default::default()
        };

        let ctx = service
            .extract(ExtractionFormat::Rdb, filter)
            .await
            .unwrap()
            .unwrap();
        assert!(!service.env().config.drop_hidden_columns);

        let result = service
            .read_by_id(
                ExtractionFormat::Rdb,
                ctx.id(),
                Sheet::Station,
                &ExtractionFilter::default(),
                &Page::default(),
            )
            .await
            .unwrap();
        let names: Vec<_> = result.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(vec!["trip_code", "station_number", "area"], names);
        let page_query = db.statements_matching("ORDER BY").pop().unwrap();
        assert!(!page_query.contains("station_id"), "{page_query}");
    }

    #[tokio::test]
    async fn read_by_id_rejects_hidden_sheets() {
        let db = Arc::new(MemoryDatabase::new());
        let service = service(db);

        let err = service
            .read_by_id(
                ExtractionFormat::Rdb,
                3,
                Sheet::RawSpeciesList,
                &ExtractionFilter::default(),
                &Page::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::InvalidInput, err.kind());

        let err = service
            .aggregate_read_by_id(3, Sheet::Trip, &ExtractionFilter::default(), &default_strata(), &Page::default())
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::InvalidInput, err.kind());
    }

    #[tokio::test]
    async fn clean_by_id_drops_every_possible_table() {
        let db = Arc::new(MemoryDatabase::new());
        db.create_table("EXT_TR_9", columns(&[("year", "INTEGER", false)]), 1);
        db.create_table("EXT_HH_9", columns(&[("year", "INTEGER", false)]), 1);
        db.create_table("EXT_HH_10", columns(&[("year", "INTEGER", false)]), 1);
        let service = service(db.clone());

        let dropped = service.clean_by_id(ExtractionFormat::Rdb, 9).await;
        assert_eq!(7, dropped);
        assert_eq!(vec!["ext_hh_10"], db.table_names());
        assert_eq!("DROP TABLE IF EXISTS EXT_CL_9", db.statements()[0]);
    }

    #[tokio::test]
    async fn cleaned_runs_leave_no_cached_metadata() {
        let db = Arc::new(MemoryDatabase::new());
        db.on_create("EXT_TR", columns(&[("trip_code", "INTEGER", false)]), 2);
        db.on_create("EXT_HH", columns(&[("trip_code", "INTEGER", false)]), 3);
        let service = service(db.clone());
        let baseline = service.env().catalog.cached_tables();

        for _ in 0..3 {
            let filter = ExtractionFilter {
                sheet_name: Some("HH".to_string()),
                preview: true,
                ..Default::default()
            };
            let ctx = service
                .extract(ExtractionFormat::Rdb, filter)
                .await
                .unwrap()
                .unwrap();
            assert!(service.env().catalog.cached_tables() > baseline);
            service.clean(&ctx).await;
            assert_eq!(baseline, service.env().catalog.cached_tables());
        }
    }

    #[tokio::test]
    async fn clean_drops_the_context_tables() {
        let db = Arc::new(MemoryDatabase::new());
        let ctx = station_context(&db);
        let service = service(db.clone());

        assert_eq!(1, service.clean(&ctx).await);
        assert!(db.table_names().is_empty());
    }
}
