use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use extraction_core::config::ExtractionConfig;
use extraction_core::context::ExtractionContext;
use extraction_core::database::Database;
use extraction_core::errors::Result;
use extraction_core::filter::ExtractionFilter;
use extraction_core::format::{ExtractionFormat, FormatRegistry};
use extraction_core::pipeline::ExtractionEnv;
use extraction_core::pmfm::{MemoryStrategies, PmfmStrategy};
use extraction_core::referential::DatabaseReferentials;
use extraction_core::result::{Page, SortDirection};
use extraction_core::service::ExtractionService;
use extraction_core::sheet::Sheet;
use extraction_core::strata::Strata;
use extraction_postgres::PostgresDatabase;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run an extraction and print the tables it produced.
    Extract(ExtractArgs),
    /// Run an aggregation and print the tables it produced.
    Aggregate(AggregateArgs),
    /// Print one page of a table of a previous run.
    Read(ReadArgs),
    /// Drop every table of a previous run.
    Clean(CleanArgs),
}

#[derive(Debug, Parser)]
pub struct FilterArgs {
    /// Filter as JSON, or `@<path>` to read it from a file.
    #[clap(long)]
    pub filter: Option<String>,

    /// Only produce this sheet.
    #[clap(long)]
    pub preview: Option<Sheet>,
}

#[derive(Debug, Parser)]
pub struct ExtractArgs {
    #[clap(long, default_value = "RDB")]
    pub format: ExtractionFormat,

    #[clap(flatten)]
    pub filter: FilterArgs,
}

#[derive(Debug, Parser)]
pub struct AggregateArgs {
    #[clap(flatten)]
    pub filter: FilterArgs,

    /// Strata as JSON, or `@<path>` to read it from a file.
    #[clap(long)]
    pub strata: Option<String>,
}

#[derive(Debug, Parser)]
pub struct ReadArgs {
    #[clap(long, default_value = "RDB")]
    pub format: ExtractionFormat,

    /// Id of the run that produced the table.
    #[clap(long)]
    pub id: i64,

    #[clap(long)]
    pub sheet: Sheet,

    /// Filter as JSON, or `@<path>` to read it from a file.
    #[clap(long)]
    pub filter: Option<String>,

    /// Read groups of an aggregated table with this strata.
    #[clap(long)]
    pub strata: Option<String>,

    #[clap(long, default_value_t = 0)]
    pub offset: usize,

    /// Page size, defaults to the configured page size.
    #[clap(long)]
    pub size: Option<usize>,

    #[clap(long)]
    pub sort: Option<String>,

    #[clap(long, default_value = "ASC")]
    pub direction: SortDirection,
}

#[derive(Debug, Parser)]
pub struct CleanArgs {
    #[clap(long, default_value = "RDB")]
    pub format: ExtractionFormat,

    #[clap(long)]
    pub id: i64,
}

/// Printed description of a finished run.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunSummary {
    id: i64,
    format: ExtractionFormat,
    tables: BTreeMap<String, String>,
    total_rows: u64,
}

impl From<&ExtractionContext> for RunSummary {
    fn from(ctx: &ExtractionContext) -> Self {
        RunSummary {
            id: ctx.id(),
            format: ctx.format(),
            tables: ctx
                .sheets()
                .filter(|(sheet, _)| sheet.is_public())
                .map(|(sheet, table)| (sheet.name().to_string(), table.to_string()))
                .collect(),
            total_rows: ctx.total_rows(),
        }
    }
}

/// Parse a JSON argument, reading it from a file when prefixed by `@`.
pub async fn parse_json<T: DeserializeOwned>(arg: &str) -> Result<T> {
    let json = match arg.strip_prefix('@') {
        Some(path) => tokio::fs::read_to_string(path).await?,
        None => arg.to_string(),
    };
    Ok(serde_json::from_str(&json)?)
}

async fn parse_optional<T: DeserializeOwned + Default>(arg: Option<&str>) -> Result<T> {
    match arg {
        Some(arg) => parse_json(arg).await,
        None => Ok(T::default()),
    }
}

impl FilterArgs {
    async fn filter(&self) -> Result<ExtractionFilter> {
        let mut filter: ExtractionFilter = parse_optional(self.filter.as_deref()).await?;
        if let Some(sheet) = self.preview {
            filter.sheet_name = Some(sheet.name().to_string());
            filter.preview = true;
        }
        Ok(filter)
    }
}

fn write_json<W: Write, T: Serialize>(out: &mut W, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)?;
    Ok(())
}

fn write_run<W: Write>(out: &mut W, ctx: Option<ExtractionContext>) -> Result<()> {
    match ctx {
        Some(ctx) => write_json(out, &RunSummary::from(&ctx)),
        None => {
            info!("no data found");
            write_json(out, &serde_json::Value::Null)
        }
    }
}

impl Commands {
    pub async fn run<W: Write>(self, service: &ExtractionService, out: &mut W) -> Result<()> {
        match self {
            Commands::Extract(args) => {
                let filter = args.filter.filter().await?;
                let ctx = service.extract(args.format, filter).await?;
                write_run(out, ctx)
            }
            Commands::Aggregate(args) => {
                let filter = args.filter.filter().await?;
                let strata = match args.strata.as_deref() {
                    Some(strata) => Some(parse_json::<Strata>(strata).await?),
                    None => None,
                };
                let ctx = service.aggregate(filter, strata).await?;
                write_run(out, ctx)
            }
            Commands::Read(args) => {
                let filter: ExtractionFilter = parse_optional(args.filter.as_deref()).await?;
                let page = Page {
                    offset: args.offset,
                    size: args.size.unwrap_or(0),
                    sort: args.sort,
                    direction: args.direction,
                };
                match args.strata.as_deref() {
                    Some(strata) => {
                        let strata: Strata = parse_json(strata).await?;
                        let result = service
                            .aggregate_read_by_id(args.id, args.sheet, &filter, &strata, &page)
                            .await?;
                        write_json(out, &result)
                    }
                    None => {
                        let result = service
                            .read_by_id(args.format, args.id, args.sheet, &filter, &page)
                            .await?;
                        write_json(out, &result)
                    }
                }
            }
            Commands::Clean(args) => {
                let dropped = service.clean_by_id(args.format, args.id).await;
                write_json(out, &serde_json::json!({ "dropped": dropped }))
            }
        }
    }
}

/// Strategies keyed by program label.
async fn load_strategies(path: Option<&Path>) -> Result<MemoryStrategies> {
    let strategies = MemoryStrategies::new();
    let Some(path) = path else {
        return Ok(strategies);
    };
    let json = tokio::fs::read_to_string(path).await?;
    let programs: BTreeMap<String, Vec<PmfmStrategy>> = serde_json::from_str(&json)?;
    for (program, pmfms) in programs {
        debug!(%program, pmfms = pmfms.len(), "loaded program strategy");
        for pmfm in pmfms {
            strategies.add(&program, pmfm);
        }
    }
    Ok(strategies)
}

pub async fn connect(
    database_url: &str,
    config: Option<&Path>,
    strategies: Option<&Path>,
) -> Result<ExtractionService> {
    let config = match config {
        Some(path) => ExtractionConfig::load(path).await?,
        None => ExtractionConfig::default(),
    };
    let db: Arc<dyn Database> = Arc::new(PostgresDatabase::connect(database_url, &config).await?);
    let referentials = Arc::new(DatabaseReferentials::new(db.clone()));
    let strategies = Arc::new(load_strategies(strategies).await?);

    let env = ExtractionEnv::new(db, config, referentials, strategies)?;
    Ok(ExtractionService::new(env, FormatRegistry::with_builtins()))
}
