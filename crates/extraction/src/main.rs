mod commands;

use std::io;
use std::path::PathBuf;

use clap::Parser;
use logutil::LogFormat;
use tracing::{Level, info};

use crate::commands::Commands;

#[derive(Debug, Parser)]
#[clap(name = "rdbx")]
#[clap(version)]
#[clap(about = "Extract fishing trip data into RDB tables", long_about = None)]
struct Cli {
    /// Connection string of the operational database.
    #[clap(long, env = "DATABASE_URL")]
    database_url: String,

    /// JSON configuration file.
    #[clap(long, env = "RDBX_CONFIG")]
    config: Option<PathBuf>,

    /// JSON file of strategy PMFMs keyed by program label.
    #[clap(long)]
    strategies: Option<PathBuf>,

    /// Log verbosity.
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format, `json` or `human`.
    #[clap(long, default_value = "human")]
    log_format: LogFormat,

    #[clap(subcommand)]
    command: Commands,
}

fn log_level(verbose: u8) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn main() {
    let cli = Cli::parse();
    logutil::configure_global_logger(log_level(cli.verbose), cli.log_format, io::stderr);
    info!(version = env!("CARGO_PKG_VERSION"), "starting...");

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .thread_name("rdbx")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("ERROR: failed to build runtime: {err}");
            std::process::exit(2);
        }
    };

    let result = runtime.block_on(async move {
        let service = commands::connect(
            &cli.database_url,
            cli.config.as_deref(),
            cli.strategies.as_deref(),
        )
        .await?;
        cli.command.run(&service, &mut io::stdout()).await
    });

    if let Err(err) = result {
        eprintln!("ERROR: {err}");
        std::process::exit(1);
    }
}
