//! Result shapes returned to consumers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::catalog::ColumnMetadata;
use crate::database::Row;
use crate::errors::{ExtractionError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnResult {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    pub alias: String,
}

impl From<&ColumnMetadata> for ColumnResult {
    fn from(column: &ColumnMetadata) -> Self {
        ColumnResult {
            name: column.name.clone(),
            data_type: column.data_type.clone(),
            nullable: column.nullable,
            alias: column.alias.clone(),
        }
    }
}

/// One page of rows. Cells are display strings, NULL stays `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    pub columns: Vec<ColumnResult>,
    /// Rows (or groups) matching the filter, across every page.
    pub total_count: u64,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationResult {
    #[serde(flatten)]
    pub result: ExtractionResult,
    pub space_strata: Vec<String>,
    pub time_strata: Vec<String>,
    pub tech_strata: Option<String>,
}

/// Bounds of an aggregate grouped by tech, see
/// [`crate::aggregation::tech_min_max`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MinMax {
    /// Smallest aggregate of one strata and tech group.
    pub agg_min: Option<f64>,
    pub agg_max: Option<f64>,
    /// Smallest aggregate of one tech value across every strata.
    pub tech_min: Option<f64>,
    pub tech_max: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub const fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for SortDirection {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASC" => Ok(SortDirection::Asc),
            "DESC" => Ok(SortDirection::Desc),
            other => Err(ExtractionError::InvalidFilter(format!(
                "Unknown sort direction: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Page {
    pub offset: usize,
    pub size: usize,
    /// Column to sort on. Defaults to a stable column order.
    pub sort: Option<String>,
    pub direction: SortDirection,
}

impl Default for Page {
    fn default() -> Self {
        Page {
            offset: 0,
            size: 100,
            sort: None,
            direction: SortDirection::Asc,
        }
    }
}

impl Page {
    pub fn new(offset: usize, size: usize) -> Self {
        Page {
            offset,
            size,
            ..Default::default()
        }
    }

    pub fn sorted_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some(column.into());
        self.direction = direction;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nulls_are_serialized_as_null() {
        let result = ExtractionResult {
            columns: vec![ColumnResult {
                name: "area".to_string(),
                data_type: "VARCHAR".to_string(),
                nullable: true,
                alias: "A".to_string(),
            }],
            total_count: 2,
            rows: vec![vec![Some("27.7.d".to_string())], vec![None]],
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(
            serde_json::json!({
                "columns": [{"name": "area", "type": "VARCHAR", "nullable": true, "alias": "A"}],
                "totalCount": 2,
                "rows": [["27.7.d"], [null]],
            }),
            json
        );
    }

    #[test]
    fn aggregation_result_is_flattened() {
        let result = AggregationResult {
            space_strata: vec!["area".to_string()],
            time_strata: vec!["year".to_string()],
            ..Default::default()
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(0, json["totalCount"]);
        assert_eq!("area", json["spaceStrata"][0]);
        assert!(json["techStrata"].is_null());
    }

    #[test]
    fn page_from_json() {
        let page: Page = serde_json::from_str(r#"{"size": 10, "sort": "year", "direction": "DESC"}"#).unwrap();
        assert_eq!(Page::new(0, 10).sorted_by("year", SortDirection::Desc), page);
        assert!("up".parse::<SortDirection>().is_err());
    }
}
