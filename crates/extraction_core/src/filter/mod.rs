//! Format agnostic extraction filters.

pub mod translate;
pub mod trip;

use std::fmt;
use std::str::FromStr;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

pub use self::translate::{inverse_where_clause, where_clause};
pub use self::trip::TripFilter;
use crate::errors::{ExtractionError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    GreaterThan,
    GreaterOrEqual,
    LessThan,
    LessOrEqual,
    Between,
    Like,
    IsNull,
    IsNotNull,
}

impl Operator {
    pub const fn symbol(&self) -> &'static str {
        match self {
            Operator::Equals => "=",
            Operator::NotEquals => "!=",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::GreaterThan => ">",
            Operator::GreaterOrEqual => ">=",
            Operator::LessThan => "<",
            Operator::LessOrEqual => "<=",
            Operator::Between => "BETWEEN",
            Operator::Like => "LIKE",
            Operator::IsNull => "NULL",
            Operator::IsNotNull => "NOT NULL",
        }
    }

    /// Whether the operator takes no value.
    pub const fn is_unary(&self) -> bool {
        matches!(self, Operator::IsNull | Operator::IsNotNull)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Operator {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
        Ok(match normalized.as_str() {
            "=" | "==" => Operator::Equals,
            "!=" | "<>" => Operator::NotEquals,
            "IN" => Operator::In,
            "NOT IN" => Operator::NotIn,
            ">" => Operator::GreaterThan,
            ">=" => Operator::GreaterOrEqual,
            "<" => Operator::LessThan,
            "<=" => Operator::LessOrEqual,
            "BETWEEN" => Operator::Between,
            "LIKE" => Operator::Like,
            "NULL" | "IS NULL" => Operator::IsNull,
            "NOT NULL" | "IS NOT NULL" => Operator::IsNotNull,
            other => {
                return Err(ExtractionError::InvalidFilter(format!(
                    "Unknown operator: {other}"
                )));
            }
        })
    }
}

impl TryFrom<String> for Operator {
    type Error = ExtractionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Operator> for String {
    fn from(value: Operator) -> Self {
        value.symbol().to_string()
    }
}

/// One restriction on one column of one sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criterion {
    /// Sheet the criterion applies to. Falls back to the filter's sheet, and
    /// applies to every sheet when both are absent.
    #[serde(default)]
    pub sheet_name: Option<String>,
    pub column_name: String,
    pub operator: Operator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl Criterion {
    pub fn new<S: Into<String>>(
        sheet: Option<&str>,
        column: &str,
        operator: Operator,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        Criterion {
            sheet_name: sheet.map(|s| s.to_string()),
            column_name: column.to_string(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionFilter {
    pub criteria: Vec<Criterion>,
    pub sheet_name: Option<String>,
    /// Only `sheet_name` is wanted, the pipeline stops once it is produced.
    pub preview: bool,
    pub include_columns: Vec<String>,
    pub exclude_columns: Vec<String>,
}

impl ExtractionFilter {
    pub fn is_empty(&self) -> bool {
        self.criteria.is_empty()
    }

    /// Criteria applying to `sheet`.
    pub fn criteria_for<'a>(&'a self, sheet: &'a str) -> impl Iterator<Item = &'a Criterion> + 'a {
        self.criteria.iter().filter(move |c| {
            match c.sheet_name.as_deref().or(self.sheet_name.as_deref()) {
                Some(s) => s.eq_ignore_ascii_case(sheet),
                None => true,
            }
        })
    }

    /// The single sheet requested in preview mode.
    pub fn preview_sheet(&self) -> Option<&str> {
        if self.preview {
            self.sheet_name.as_deref()
        } else {
            None
        }
    }

    pub fn column_selector(&self) -> Result<ColumnSelector> {
        ColumnSelector::new(&self.include_columns, &self.exclude_columns)
    }
}

/// Include/exclude glob patterns on column names.
#[derive(Debug, Clone)]
pub struct ColumnSelector {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl ColumnSelector {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        fn build(patterns: &[String]) -> Result<Option<GlobSet>> {
            if patterns.is_empty() {
                return Ok(None);
            }
            let mut builder = GlobSetBuilder::new();
            for p in patterns {
                let glob = Glob::new(&p.to_ascii_lowercase()).map_err(|e| {
                    ExtractionError::InvalidFilter(format!("Invalid column pattern '{p}': {e}"))
                })?;
                builder.add(glob);
            }
            builder
                .build()
                .map(Some)
                .map_err(|e| ExtractionError::InvalidFilter(e.to_string()))
        }

        Ok(ColumnSelector {
            include: build(include)?,
            exclude: build(exclude)?,
        })
    }

    pub fn is_selected(&self, column: &str) -> bool {
        let column = column.to_ascii_lowercase();
        let included = self.include.as_ref().is_none_or(|g| g.is_match(&column));
        let excluded = self.exclude.as_ref().is_some_and(|g| g.is_match(&column));
        included && !excluded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_filter() {
        let filter: ExtractionFilter = serde_json::from_str(
            r#"{
                "sheetName": "HH",
                "preview": true,
                "criteria": [
                    {"sheetName": "TR", "columnName": "project", "operator": "IN", "values": ["PRG1"]},
                    {"columnName": "area", "operator": "not in", "values": ["27.7.d"]}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(Some("HH"), filter.preview_sheet());
        assert_eq!(Operator::In, filter.criteria[0].operator);
        assert_eq!(Operator::NotIn, filter.criteria[1].operator);
    }

    #[test]
    fn criteria_for_sheet() {
        let filter = ExtractionFilter {
            sheet_name: Some("HH".to_string()),
            criteria: vec![
                Criterion::new(Some("TR"), "project", Operator::Equals, ["PRG1"]),
                Criterion::new(None, "area", Operator::Equals, ["27.7.d"]),
            ],
            ..Default::default()
        };
        let tr: Vec<_> = filter.criteria_for("tr").map(|c| &c.column_name).collect();
        let hh: Vec<_> = filter.criteria_for("HH").map(|c| &c.column_name).collect();
        assert_eq!(vec!["project"], tr);
        assert_eq!(vec!["area"], hh);

        let unscoped = ExtractionFilter {
            criteria: vec![Criterion::new(None, "year", Operator::Equals, ["2020"])],
            ..Default::default()
        };
        assert_eq!(1, unscoped.criteria_for("SL").count());
    }

    #[test]
    fn preview_requires_flag() {
        let filter = ExtractionFilter {
            sheet_name: Some("HH".to_string()),
            ..Default::default()
        };
        assert_eq!(None, filter.preview_sheet());
    }

    #[test]
    fn column_selector() {
        let selector = ColumnSelector::new(
            &["pos_*".to_string(), "year".to_string()],
            &["*_end_*".to_string()],
        )
        .unwrap();
        assert!(selector.is_selected("POS_START_LAT"));
        assert!(selector.is_selected("year"));
        assert!(!selector.is_selected("pos_end_lat"));
        assert!(!selector.is_selected("area"));

        let all = ColumnSelector::new(&[], &[]).unwrap();
        assert!(all.is_selected("anything"));
    }
}
