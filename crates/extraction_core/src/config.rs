//! Extraction settings.
//!
//! Every field has a default so that a partial JSON document (or none at all)
//! gives a usable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{ExtractionError, Result};
use crate::sql::{Dialect, is_valid_ident};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionConfig {
    pub dialect: Dialect,
    /// Directory searched for `<format>/v<version>/<name>.xml` before the
    /// built-in templates.
    pub template_dir: Option<PathBuf>,
    /// Ceiling on a single statement, in seconds. Zero disables it.
    pub query_timeout_secs: u64,
    /// Sample distinct values of categorical columns after each stage.
    pub analyze: bool,
    pub analyze_sample_size: usize,
    /// Drop hidden linkage columns once the whole run succeeded.
    pub drop_hidden_columns: bool,
    pub default_page_size: usize,
    /// Source table of the landing stage, skipped when absent.
    pub raw_landing_table: String,
    pub referentials: ReferentialLabels,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        ExtractionConfig {
            dialect: Dialect::default(),
            template_dir: None,
            query_timeout_secs: 300,
            analyze: true,
            analyze_sample_size: 100,
            drop_hidden_columns: false,
            default_page_size: 100,
            raw_landing_table: "P01_RDB_LANDING".to_string(),
            referentials: ReferentialLabels::default(),
        }
    }
}

impl ExtractionConfig {
    pub fn query_timeout(&self) -> Option<Duration> {
        match self.query_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: ExtractionConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_ident(&self.raw_landing_table) {
            return Err(ExtractionError::Config(format!(
                "Invalid raw landing table name: '{}'",
                self.raw_landing_table
            )));
        }
        if self.default_page_size == 0 {
            return Err(ExtractionError::Config(
                "Default page size must be positive".to_string(),
            ));
        }
        if self.analyze && self.analyze_sample_size == 0 {
            return Err(ExtractionError::Config(
                "Analyze sample size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Labels of the referential entities resolved at run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReferentialLabels {
    pub country_location_level: String,
    pub area_location_level: String,
    pub rectangle_location_level: String,
    pub square_location_level: String,
    pub mesh_size_pmfm: String,
    pub fishing_depth_pmfm: String,
    pub selectivity_device_pmfm: String,
    pub sex_pmfm: String,
    pub length_pmfm: String,
    pub centimeter_unit: String,
    pub millimeter_unit: String,
    pub trip_acquisition_level: String,
    pub operation_acquisition_level: String,
}

impl Default for ReferentialLabels {
    fn default() -> Self {
        ReferentialLabels {
            country_location_level: "Country".to_string(),
            area_location_level: "ICES_DIVISION".to_string(),
            rectangle_location_level: "ICES_RECTANGLE".to_string(),
            square_location_level: "SQUARE_10".to_string(),
            mesh_size_pmfm: "SMALLER_MESH_GAUGE_MM".to_string(),
            fishing_depth_pmfm: "GEAR_DEPTH_M".to_string(),
            selectivity_device_pmfm: "SELECTIVITY_DEVICE".to_string(),
            sex_pmfm: "SEX".to_string(),
            length_pmfm: "LENGTH_TOTAL_CM".to_string(),
            centimeter_unit: "cm".to_string(),
            millimeter_unit: "mm".to_string(),
            trip_acquisition_level: "TRIP".to_string(),
            operation_acquisition_level: "OPERATION".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config = ExtractionConfig::from_json(
            r#"{"dialect": "hsqldb", "queryTimeoutSecs": 0, "referentials": {"sexPmfm": "SEX_CODE"}}"#,
        )
        .unwrap();
        assert_eq!(Dialect::Hsqldb, config.dialect);
        assert_eq!(None, config.query_timeout());
        assert_eq!("SEX_CODE", config.referentials.sex_pmfm);
        assert_eq!("Country", config.referentials.country_location_level);
        assert_eq!(100, config.default_page_size);
    }

    #[test]
    fn rejects_invalid_landing_table() {
        let err = ExtractionConfig::from_json(r#"{"rawLandingTable": "x; DROP TABLE y"}"#)
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Config(_)));
    }

    #[test]
    fn default_timeout() {
        assert_eq!(
            Some(Duration::from_secs(300)),
            ExtractionConfig::default().query_timeout()
        );
    }
}
