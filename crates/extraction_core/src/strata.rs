//! Aggregation strata: the space, time and tech dimensions results are
//! grouped on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{ExtractionError, Result};
use crate::sheet::Sheet;

pub const COLUMN_AREA: &str = "area";
pub const COLUMN_RECT: &str = "rect";
pub const COLUMN_SQUARE: &str = "square";
pub const COLUMN_YEAR: &str = "year";
pub const COLUMN_QUARTER: &str = "quarter";
pub const COLUMN_MONTH: &str = "month";

/// Spatial granularity, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SpaceColumn {
    Area,
    Rect,
    Square,
}

impl SpaceColumn {
    pub const ALL: [SpaceColumn; 3] = [SpaceColumn::Area, SpaceColumn::Rect, SpaceColumn::Square];

    pub const fn column_name(&self) -> &'static str {
        match self {
            SpaceColumn::Area => COLUMN_AREA,
            SpaceColumn::Rect => COLUMN_RECT,
            SpaceColumn::Square => COLUMN_SQUARE,
        }
    }

    /// This column and every coarser one, coarsest first.
    pub fn with_coarser(&self) -> Vec<SpaceColumn> {
        Self::ALL.into_iter().filter(|c| c <= self).collect()
    }
}

impl FromStr for SpaceColumn {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "area" => Ok(SpaceColumn::Area),
            "rect" | "rectangle" | "statistical_rectangle" => Ok(SpaceColumn::Rect),
            "square" => Ok(SpaceColumn::Square),
            other => Err(ExtractionError::InvalidStrata(format!(
                "Unknown space column: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for SpaceColumn {
    type Error = ExtractionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<SpaceColumn> for String {
    fn from(value: SpaceColumn) -> Self {
        value.column_name().to_string()
    }
}

/// Temporal granularity, coarsest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TimeColumn {
    Year,
    Quarter,
    Month,
}

impl TimeColumn {
    pub const ALL: [TimeColumn; 3] = [TimeColumn::Year, TimeColumn::Quarter, TimeColumn::Month];

    pub const fn column_name(&self) -> &'static str {
        match self {
            TimeColumn::Year => COLUMN_YEAR,
            TimeColumn::Quarter => COLUMN_QUARTER,
            TimeColumn::Month => COLUMN_MONTH,
        }
    }

    pub fn with_coarser(&self) -> Vec<TimeColumn> {
        Self::ALL.into_iter().filter(|c| c <= self).collect()
    }
}

impl FromStr for TimeColumn {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "year" => Ok(TimeColumn::Year),
            "quarter" => Ok(TimeColumn::Quarter),
            "month" => Ok(TimeColumn::Month),
            other => Err(ExtractionError::InvalidStrata(format!(
                "Unknown time column: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for TimeColumn {
    type Error = ExtractionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimeColumn> for String {
    fn from(value: TimeColumn) -> Self {
        value.column_name().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AggFunction {
    #[default]
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl AggFunction {
    pub const fn as_sql(&self) -> &'static str {
        match self {
            AggFunction::Sum => "SUM",
            AggFunction::Avg => "AVG",
            AggFunction::Min => "MIN",
            AggFunction::Max => "MAX",
            AggFunction::Count => "COUNT",
        }
    }
}

impl FromStr for AggFunction {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUM" => Ok(AggFunction::Sum),
            "AVG" => Ok(AggFunction::Avg),
            "MIN" => Ok(AggFunction::Min),
            "MAX" => Ok(AggFunction::Max),
            "COUNT" => Ok(AggFunction::Count),
            other => Err(ExtractionError::InvalidStrata(format!(
                "Unknown aggregate function: {other}"
            ))),
        }
    }
}

impl fmt::Display for AggFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Aggregation specification supplied by the caller.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Strata {
    pub space_column: Option<SpaceColumn>,
    pub time_column: Option<TimeColumn>,
    pub tech_column: Option<String>,
    pub agg_column: Option<String>,
    pub agg_function: Option<AggFunction>,
    pub sheet_name: Option<String>,
}

impl Strata {
    pub fn new(space: Option<SpaceColumn>, time: Option<TimeColumn>) -> Self {
        Strata {
            space_column: space,
            time_column: time,
            ..Default::default()
        }
    }

    /// Spatial group-by columns, coarsest first.
    pub fn space_columns(&self) -> Vec<&'static str> {
        self.space_column
            .map(|c| c.with_coarser().iter().map(|c| c.column_name()).collect())
            .unwrap_or_default()
    }

    /// Temporal group-by columns, coarsest first.
    pub fn time_columns(&self) -> Vec<&'static str> {
        self.time_column
            .map(|c| c.with_coarser().iter().map(|c| c.column_name()).collect())
            .unwrap_or_default()
    }

    /// Full group-by column set: space columns then time columns, each
    /// ordered coarsest to finest, without duplicates.
    pub fn group_by_columns(&self) -> Vec<&'static str> {
        let mut columns = self.space_columns();
        for col in self.time_columns() {
            if !columns.contains(&col) {
                columns.push(col);
            }
        }
        columns
    }

    /// Resolve the aggregate column and function, falling back to the
    /// defaults of `sheet`.
    pub fn resolve_agg(&self, sheet: Sheet) -> Result<(String, AggFunction)> {
        let column = match &self.agg_column {
            Some(col) => col.to_ascii_lowercase(),
            None => sheet
                .default_agg_column()
                .ok_or_else(|| {
                    ExtractionError::InvalidStrata(format!(
                        "No default aggregate column for sheet {sheet}"
                    ))
                })?
                .to_string(),
        };
        Ok((column, self.agg_function.unwrap_or_default()))
    }

    /// Resolve the tech column, falling back to the defaults of `sheet`.
    pub fn resolve_tech(&self, sheet: Sheet) -> Option<String> {
        self.tech_column
            .as_ref()
            .map(|c| c.to_ascii_lowercase())
            .or_else(|| sheet.default_tech_column().map(|c| c.to_string()))
    }
}
