use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{ExtractionFilter, Operator};
use crate::errors::{ExtractionError, Result};
use crate::sheet::Sheet;

/// Restrictions baked into the trip stage template.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TripFilter {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub program_labels: Vec<String>,
    pub location_ids: Vec<i64>,
    pub recorder_department_ids: Vec<i64>,
    pub vessel_ids: Vec<i64>,
    pub trip_id: Option<i64>,
}

fn parse_year(value: &str) -> Result<i32> {
    value
        .trim()
        .parse()
        .map_err(|_| ExtractionError::InvalidFilter(format!("Invalid year: '{value}'")))
}

fn parse_ids(values: &[String]) -> Result<Vec<i64>> {
    values
        .iter()
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| ExtractionError::InvalidFilter(format!("Invalid id: '{v}'")))
        })
        .collect()
}

fn year_start(year: i32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, 1, 1)
        .ok_or_else(|| ExtractionError::InvalidFilter(format!("Year out of range: {year}")))
}

fn year_end(year: i32) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(year, 12, 31)
        .ok_or_else(|| ExtractionError::InvalidFilter(format!("Year out of range: {year}")))
}

impl TripFilter {
    /// Derive the trip restrictions from the trip sheet criteria of a generic
    /// filter. Criteria that do not map onto a trip restriction are left to
    /// the generic post-filter.
    pub fn from_extraction_filter(filter: &ExtractionFilter) -> Result<Self> {
        let mut trip = TripFilter::default();

        for criterion in filter.criteria_for(Sheet::Trip.name()) {
            let values = &criterion.values;
            match (criterion.column_name.to_ascii_lowercase().as_str(), criterion.operator) {
                ("project", Operator::Equals | Operator::In) => {
                    trip.program_labels.extend(values.iter().cloned());
                }
                ("year", Operator::Equals | Operator::In) => {
                    let years = values.iter().map(|v| parse_year(v)).collect::<Result<Vec<_>>>()?;
                    if let (Some(min), Some(max)) = (years.iter().min(), years.iter().max()) {
                        trip.start_date = Some(year_start(*min)?);
                        trip.end_date = Some(year_end(*max)?);
                    }
                }
                ("year", Operator::Between) if values.len() == 2 => {
                    trip.start_date = Some(year_start(parse_year(&values[0])?)?);
                    trip.end_date = Some(year_end(parse_year(&values[1])?)?);
                }
                ("year", Operator::GreaterOrEqual) if values.len() == 1 => {
                    trip.start_date = Some(year_start(parse_year(&values[0])?)?);
                }
                ("year", Operator::LessOrEqual) if values.len() == 1 => {
                    trip.end_date = Some(year_end(parse_year(&values[0])?)?);
                }
                ("trip_code", Operator::Equals) if values.len() == 1 => {
                    trip.trip_id = parse_ids(values)?.first().copied();
                }
                ("vessel_identifier", Operator::Equals | Operator::In) => {
                    trip.vessel_ids.extend(parse_ids(values)?);
                }
                ("harbour_id", Operator::Equals | Operator::In) => {
                    trip.location_ids.extend(parse_ids(values)?);
                }
                ("recorder_department_id", Operator::Equals | Operator::In) => {
                    trip.recorder_department_ids.extend(parse_ids(values)?);
                }
                _ => (),
            }
        }

        Ok(trip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Criterion;

    #[test]
    fn derive_from_trip_criteria() {
        let filter = ExtractionFilter {
            criteria: vec![
                Criterion::new(Some("TR"), "project", Operator::In, ["PRG1"]),
                Criterion::new(Some("TR"), "year", Operator::Equals, ["2020"]),
                Criterion::new(Some("TR"), "vessel_identifier", Operator::In, ["12", "13"]),
                Criterion::new(Some("HH"), "trip_code", Operator::Equals, ["99"]),
            ],
            ..Default::default()
        };
        let trip = TripFilter::from_extraction_filter(&filter).unwrap();
        assert_eq!(vec!["PRG1".to_string()], trip.program_labels);
        assert_eq!(NaiveDate::from_ymd_opt(2020, 1, 1), trip.start_date);
        assert_eq!(NaiveDate::from_ymd_opt(2020, 12, 31), trip.end_date);
        assert_eq!(vec![12, 13], trip.vessel_ids);
        assert_eq!(None, trip.trip_id);
    }

    #[test]
    fn year_range() {
        let filter = ExtractionFilter {
            criteria: vec![Criterion::new(None, "year", Operator::Between, ["2018", "2020"])],
            ..Default::default()
        };
        let trip = TripFilter::from_extraction_filter(&filter).unwrap();
        assert_eq!(NaiveDate::from_ymd_opt(2018, 1, 1), trip.start_date);
        assert_eq!(NaiveDate::from_ymd_opt(2020, 12, 31), trip.end_date);
    }

    #[test]
    fn invalid_ids() {
        let filter = ExtractionFilter {
            criteria: vec![Criterion::new(None, "vessel_identifier", Operator::Equals, ["abc"])],
            ..Default::default()
        };
        assert!(TripFilter::from_extraction_filter(&filter).is_err());
    }
}
