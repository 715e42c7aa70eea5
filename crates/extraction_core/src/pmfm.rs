//! Program strategies and the measurement columns they add to a stage.
//!
//! A strategy lists, per acquisition level, the PMFMs (parameter, matrix,
//! fraction, method) recorded by a program. Each one becomes an injected
//! column reading the measurement from its table.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::alias::AliasGenerator;
use crate::errors::Result;
use crate::template::{ColumnKind, Injection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PmfmType {
    Numeric,
    Qualitative,
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PmfmStrategy {
    pub pmfm_id: i64,
    pub label: String,
    pub acquisition_level_id: i64,
    pub rank_order: i32,
    #[serde(rename = "type")]
    pub pmfm_type: PmfmType,
}

#[async_trait]
pub trait StrategyService: Send + Sync + fmt::Debug {
    /// PMFMs of the given programs at the given acquisition levels, ordered
    /// by level then rank, without duplicates.
    async fn pmfms(
        &self,
        program_labels: &[String],
        acquisition_level_ids: &[i64],
    ) -> Result<Vec<PmfmStrategy>>;
}

/// Strategies held in memory, keyed by program label.
#[derive(Debug, Default)]
pub struct MemoryStrategies {
    strategies: Mutex<Vec<(String, PmfmStrategy)>>,
}

impl MemoryStrategies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, program_label: &str, pmfm: PmfmStrategy) {
        self.strategies.lock().push((program_label.to_string(), pmfm));
    }
}

#[async_trait]
impl StrategyService for MemoryStrategies {
    async fn pmfms(
        &self,
        program_labels: &[String],
        acquisition_level_ids: &[i64],
    ) -> Result<Vec<PmfmStrategy>> {
        let mut pmfms: Vec<PmfmStrategy> = self
            .strategies
            .lock()
            .iter()
            .filter(|(program, pmfm)| {
                program_labels.contains(program)
                    && acquisition_level_ids.contains(&pmfm.acquisition_level_id)
            })
            .map(|(_, pmfm)| pmfm.clone())
            .collect();
        pmfms.sort_by_key(|p| (p.acquisition_level_id, p.rank_order, p.pmfm_id));
        let mut seen = BTreeSet::new();
        pmfms.retain(|p| seen.insert((p.acquisition_level_id, p.pmfm_id)));
        Ok(pmfms)
    }
}

/// Cache key of a strategy lookup, `<labels>|<level ids>`.
pub fn cache_key(program_labels: &[String], acquisition_level_ids: &[i64]) -> String {
    let mut labels = program_labels.to_vec();
    labels.sort();
    let mut ids = acquisition_level_ids.to_vec();
    ids.sort_unstable();
    format!(
        "{}|{}",
        labels.join(","),
        ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",")
    )
}

/// Column name of a PMFM, `LENGTH_TOTAL_CM` gives `length_total_cm`.
pub fn column_name(label: &str) -> String {
    let name: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    match name.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => name,
        _ => format!("pmfm_{name}"),
    }
}

/// Where the measurements of one acquisition level are stored.
#[derive(Debug, Clone)]
pub struct MeasurementSource<'a> {
    /// Label of the acquisition level, used to build subquery aliases.
    pub acquisition_level: &'a str,
    pub table: &'a str,
    /// Foreign key column of the measurement table.
    pub parent_column: &'a str,
    /// Outer expression the foreign key is matched against.
    pub parent_expr: &'a str,
    /// Aliases used by the outer query.
    pub reserved_aliases: &'a [&'a str],
}

/// Build one select injection per PMFM.
///
/// PMFMs whose column would collide with a column of the template, or with
/// a previous PMFM, are skipped.
pub fn pmfm_injections(
    pmfms: &[PmfmStrategy],
    source: &MeasurementSource<'_>,
    reserved_columns: &BTreeSet<&str>,
) -> Result<Vec<Injection>> {
    let mut aliases = AliasGenerator::new();
    for alias in source.reserved_aliases {
        aliases.reserve(alias);
    }

    let mut columns = BTreeSet::new();
    let mut injections = Vec::with_capacity(pmfms.len());
    for pmfm in pmfms {
        let column = column_name(&pmfm.label);
        if reserved_columns.contains(column.as_str()) || !columns.insert(column.clone()) {
            warn!(pmfm = %pmfm.label, %column, "skipping pmfm colliding with an existing column");
            continue;
        }

        let m = aliases.alias_for(&format!("{}_{}", source.acquisition_level, pmfm.label));
        let filter = format!(
            "{m}.{} = {} AND {m}.PMFM_FK = {}",
            source.parent_column, source.parent_expr, pmfm.pmfm_id
        );
        let (expr, kind) = match pmfm.pmfm_type {
            PmfmType::Numeric => (
                format!(
                    "(SELECT MAX({m}.NUMERICAL_VALUE) FROM {} {m} WHERE {filter})",
                    source.table
                ),
                ColumnKind::Number,
            ),
            PmfmType::Text => (
                format!(
                    "(SELECT MAX({m}.ALPHANUMERICAL_VALUE) FROM {} {m} WHERE {filter})",
                    source.table
                ),
                ColumnKind::Text,
            ),
            PmfmType::Qualitative => (
                format!(
                    "(SELECT MAX({m}QV.LABEL) FROM {} {m} \
                     INNER JOIN QUALITATIVE_VALUE {m}QV ON {m}QV.ID = {m}.QUALITATIVE_VALUE_FK \
                     WHERE {filter})",
                    source.table
                ),
                ColumnKind::Text,
            ),
        };
        injections.push(Injection::select(expr, &column, kind)?);
    }
    Ok(injections)
}
