use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{ExtractionError, Result};
use crate::pipeline::ExtractionPipeline;
use crate::pipeline::agg_rdb::AggRdbPipeline;
use crate::pipeline::rdb::RdbPipeline;
use crate::sheet::Sheet;

/// Output format of an extraction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ExtractionFormat {
    /// Raw data exchange format, one table per record type.
    Rdb,
    /// RDB tables grouped on strata columns.
    AggRdb,
}

impl ExtractionFormat {
    pub const fn label(&self) -> &'static str {
        match self {
            ExtractionFormat::Rdb => "RDB",
            ExtractionFormat::AggRdb => "AGG_RDB",
        }
    }

    pub const fn version(&self) -> &'static str {
        "1.3"
    }

    /// Prefix of every table created for this format.
    pub const fn table_prefix(&self) -> &'static str {
        match self {
            ExtractionFormat::Rdb => "EXT_",
            ExtractionFormat::AggRdb => "AGG_",
        }
    }

    /// Sheets the format may produce, in production order.
    pub const fn sheets(&self) -> &'static [Sheet] {
        match self {
            ExtractionFormat::Rdb => &[
                Sheet::Trip,
                Sheet::Station,
                Sheet::RawSpeciesList,
                Sheet::SpeciesList,
                Sheet::SpeciesLengthMap,
                Sheet::SpeciesLength,
                Sheet::Landing,
            ],
            ExtractionFormat::AggRdb => &[
                Sheet::Station,
                Sheet::SpeciesList,
                Sheet::SpeciesLength,
                Sheet::Landing,
            ],
        }
    }

    /// `<PREFIX><SHEET>_<id>`.
    pub fn table_name(&self, sheet: Sheet, context_id: i64) -> String {
        format!("{}{}_{}", self.table_prefix(), sheet.name(), context_id)
    }
}

impl fmt::Display for ExtractionFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ExtractionFormat {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "RDB" => Ok(ExtractionFormat::Rdb),
            "AGG_RDB" => Ok(ExtractionFormat::AggRdb),
            other => Err(ExtractionError::UnknownFormat(other.to_string())),
        }
    }
}

impl TryFrom<String> for ExtractionFormat {
    type Error = ExtractionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ExtractionFormat> for String {
    fn from(value: ExtractionFormat) -> Self {
        value.label().to_string()
    }
}

pub type PipelineConstructor = fn() -> Arc<dyn ExtractionPipeline>;

fn new_rdb() -> Arc<dyn ExtractionPipeline> {
    Arc::new(RdbPipeline::new())
}

fn new_agg_rdb() -> Arc<dyn ExtractionPipeline> {
    Arc::new(AggRdbPipeline::new())
}

/// Explicit format to pipeline constructor map, built once at start-up.
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    constructors: HashMap<ExtractionFormat, PipelineConstructor>,
}

impl FormatRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(ExtractionFormat::Rdb, new_rdb);
        registry.register(ExtractionFormat::AggRdb, new_agg_rdb);
        registry
    }

    pub fn register(&mut self, format: ExtractionFormat, constructor: PipelineConstructor) {
        self.constructors.insert(format, constructor);
    }

    pub fn get(&self, format: ExtractionFormat) -> Result<Arc<dyn ExtractionPipeline>> {
        self.constructors
            .get(&format)
            .map(|constructor| constructor())
            .ok_or_else(|| ExtractionError::UnknownFormat(format.label().to_string()))
    }

    pub fn formats(&self) -> Vec<ExtractionFormat> {
        let mut formats: Vec<_> = self.constructors.keys().copied().collect();
        formats.sort_by_key(|f| f.label());
        formats
    }
}
