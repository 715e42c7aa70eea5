//! Utilities for logging.

use std::io;

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Output format of the global logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    Json,
    #[default]
    HumanReadable,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "human" | "human_readable" | "text" => Ok(LogFormat::HumanReadable),
            other => Err(format!("Unknown log format: {other}")),
        }
    }
}

fn env_filter(level: Level) -> EnvFilter {
    // Postgres driver internals are noisy at debug.
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    match "tokio_postgres=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

/// Configure the global logger.
///
/// `RUST_LOG` takes precedence over `level` when set. Only the first call
/// installs a subscriber, later calls are no-ops.
pub fn configure_global_logger<W>(level: Level, format: LogFormat, writer: W)
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_writer(writer)
        .with_file(true)
        .with_line_number(true);

    let _ = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::HumanReadable => builder.try_init(),
    };
}

/// Configure a logger suitable for tests, capturing output per test.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(Level::DEBUG))
        .with_test_writer()
        .try_init();
}

/// Configure a human readable logger writing to stderr.
pub fn init_stderr(level: Level) {
    configure_global_logger(level, LogFormat::HumanReadable, io::stderr);
}
