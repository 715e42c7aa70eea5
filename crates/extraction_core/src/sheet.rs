use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{ExtractionError, Result};

/// A tabular output of the extraction pipeline, named by its record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Sheet {
    Trip,
    Station,
    /// Wide species list carrying hidden sample linkage. Never public.
    RawSpeciesList,
    SpeciesList,
    /// Species list to sample mapping. Never public.
    SpeciesLengthMap,
    SpeciesLength,
    Landing,
}

impl Sheet {
    pub const fn name(&self) -> &'static str {
        match self {
            Sheet::Trip => "TR",
            Sheet::Station => "HH",
            Sheet::RawSpeciesList => "RAW_SL",
            Sheet::SpeciesList => "SL",
            Sheet::SpeciesLengthMap => "SL_MAP",
            Sheet::SpeciesLength => "HL",
            Sheet::Landing => "CL",
        }
    }

    /// Whether the sheet is exposed to consumers.
    pub const fn is_public(&self) -> bool {
        !matches!(self, Sheet::RawSpeciesList | Sheet::SpeciesLengthMap)
    }

    /// Name of the template creating the sheet's table.
    pub const fn template_name(&self) -> &'static str {
        match self {
            Sheet::Trip => "createTripTable",
            Sheet::Station => "createStationTable",
            Sheet::RawSpeciesList => "createRawSpeciesListTable",
            Sheet::SpeciesList => "createSpeciesListTable",
            Sheet::SpeciesLengthMap => "createSpeciesLengthMapTable",
            Sheet::SpeciesLength => "createSpeciesLengthTable",
            Sheet::Landing => "createLandingTable",
        }
    }

    pub const fn default_agg_column(&self) -> Option<&'static str> {
        match self {
            Sheet::Trip => Some("trip_count"),
            Sheet::Station => Some("station_count"),
            Sheet::SpeciesList => Some("weight"),
            Sheet::SpeciesLength => Some("number_at_length"),
            Sheet::Landing => Some("landing_weight"),
            Sheet::RawSpeciesList | Sheet::SpeciesLengthMap => None,
        }
    }

    pub const fn default_tech_column(&self) -> Option<&'static str> {
        match self {
            Sheet::Trip => Some("vessel_length_class"),
            Sheet::Station => Some("gear_type"),
            Sheet::SpeciesList | Sheet::SpeciesLength | Sheet::Landing => Some("species"),
            Sheet::RawSpeciesList | Sheet::SpeciesLengthMap => None,
        }
    }
}

impl fmt::Display for Sheet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Sheet {
    type Err = ExtractionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TR" => Ok(Sheet::Trip),
            "HH" => Ok(Sheet::Station),
            "RAW_SL" => Ok(Sheet::RawSpeciesList),
            "SL" => Ok(Sheet::SpeciesList),
            "SL_MAP" => Ok(Sheet::SpeciesLengthMap),
            "HL" => Ok(Sheet::SpeciesLength),
            "CL" => Ok(Sheet::Landing),
            other => Err(ExtractionError::InvalidFilter(format!(
                "Unknown sheet: {other}"
            ))),
        }
    }
}

impl TryFrom<String> for Sheet {
    type Error = ExtractionError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Sheet> for String {
    fn from(value: Sheet) -> Self {
        value.name().to_string()
    }
}
