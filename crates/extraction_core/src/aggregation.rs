//! Grouped reads of aggregated tables.
//!
//! Every read groups the table on the strata columns it actually has, with
//! the aggregate column resolved from the strata or the sheet defaults.
//! Nullable aggregate columns are coalesced for SUM and COUNT only, see
//! [`aggregate_expr`].

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::catalog::{ColumnMetadata, TableMetadata};
use crate::errors::{ExtractionError, Result};
use crate::filter::{ExtractionFilter, where_clause};
use crate::pipeline::ExtractionEnv;
use crate::reader::page_size;
use crate::result::{AggregationResult, ColumnResult, ExtractionResult, MinMax, Page};
use crate::sheet::Sheet;
use crate::sql::{Ident, aggregate_expr};
use crate::strata::{AggFunction, Strata};

/// Alias of the aggregate in nested queries.
const AGG_VALUE: &str = "agg_value";

/// A strata resolved against the columns of one table.
#[derive(Debug)]
struct ResolvedStrata {
    table: Arc<TableMetadata>,
    space_columns: Vec<String>,
    time_columns: Vec<String>,
    tech_column: Option<String>,
    agg_column: Ident,
    agg_function: AggFunction,
    agg_nullable: bool,
    /// WHERE keyword included, empty when unfiltered.
    where_sql: String,
}

impl ResolvedStrata {
    async fn resolve(
        env: &ExtractionEnv,
        table: &str,
        sheet: Sheet,
        filter: &ExtractionFilter,
        strata: &Strata,
    ) -> Result<Self> {
        let metadata = env.catalog.require_table(env.db.as_ref(), table).await?;

        let present = |columns: Vec<&str>| -> Vec<String> {
            columns
                .into_iter()
                .filter(|c| {
                    let has = metadata.has_column(c);
                    if !has {
                        debug!(%table, column = %c, "strata column missing, not grouped");
                    }
                    has
                })
                .map(|c| c.to_string())
                .collect()
        };
        let space_columns = present(strata.space_columns());
        let time_columns = present(strata.time_columns());

        let tech_column = match strata.resolve_tech(sheet) {
            Some(tech) if metadata.has_column(&tech) => Some(tech),
            Some(tech) if strata.tech_column.is_some() => {
                return Err(ExtractionError::InvalidStrata(format!(
                    "Unknown tech column '{tech}' on {table}"
                )));
            }
            _ => None,
        };

        let (agg_name, agg_function) = strata.resolve_agg(sheet)?;
        let agg = aggregate_column(&metadata, &agg_name, agg_function)?;
        let agg_column = agg.ident().ok_or_else(|| {
            ExtractionError::InvalidStrata(format!("Invalid aggregate column '{agg_name}'"))
        })?;
        let agg_nullable = agg.nullable;

        let clause = where_clause(&metadata, filter, sheet.name(), env.dialect())?;
        let where_sql = if clause.is_empty() {
            String::new()
        } else {
            format!(" WHERE {clause}")
        };

        Ok(ResolvedStrata {
            table: metadata,
            space_columns,
            time_columns,
            tech_column,
            agg_column,
            agg_function,
            agg_nullable,
            where_sql,
        })
    }

    fn strata_columns(&self) -> Vec<&str> {
        self.space_columns
            .iter()
            .chain(self.time_columns.iter())
            .map(|c| c.as_str())
            .collect()
    }

    fn aggregate(&self) -> String {
        aggregate_expr(self.agg_function, &self.agg_column, self.agg_nullable)
    }

    /// `SELECT <groups>, <agg> AS <alias> FROM .. GROUP BY <groups>`.
    fn grouped_select(&self, groups: &[&str], alias: &str) -> String {
        let mut sql = String::from("SELECT ");
        for column in groups {
            sql.push_str(column);
            sql.push_str(", ");
        }
        sql.push_str(&format!(
            "{} AS {alias} FROM {}{}",
            self.aggregate(),
            self.table.name,
            self.where_sql
        ));
        if !groups.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&groups.join(", "));
        }
        sql
    }

    fn tech_or_error(&self) -> Result<&str> {
        self.tech_column.as_deref().ok_or_else(|| {
            ExtractionError::InvalidStrata(format!("No tech column on {}", self.table.name))
        })
    }
}

fn aggregate_column<'a>(
    table: &'a TableMetadata,
    name: &str,
    function: AggFunction,
) -> Result<&'a ColumnMetadata> {
    let column = table.column(name).ok_or_else(|| {
        ExtractionError::InvalidStrata(format!(
            "Unknown aggregate column '{name}' on {}",
            table.name
        ))
    })?;
    if function != AggFunction::Count && !column.is_numeric() {
        return Err(ExtractionError::InvalidStrata(format!(
            "Cannot compute {function} of non numeric column '{name}'"
        )));
    }
    Ok(column)
}

fn parse_number(value: Option<&str>) -> Result<Option<f64>> {
    value
        .map(|v| {
            v.trim().parse::<f64>().map_err(|e| {
                ExtractionError::Persistence(format!("Expected a number, got '{v}': {e}"))
            })
        })
        .transpose()
}

/// Read one page of groups of `table`.
pub async fn read(
    env: &ExtractionEnv,
    table: &str,
    sheet: Sheet,
    filter: &ExtractionFilter,
    strata: &Strata,
    page: &Page,
) -> Result<AggregationResult> {
    let resolved = ResolvedStrata::resolve(env, table, sheet, filter, strata).await?;

    let mut groups = resolved.strata_columns();
    if let Some(tech) = &resolved.tech_column {
        if !groups.contains(&tech.as_str()) {
            groups.push(tech.as_str());
        }
    }
    let agg_name = resolved.agg_column.as_str();
    let select = resolved.grouped_select(&groups, agg_name);

    let mut columns: Vec<ColumnResult> = groups
        .iter()
        .filter_map(|c| resolved.table.column(c))
        .map(ColumnResult::from)
        .collect();
    if let Some(agg) = resolved.table.column(agg_name) {
        let mut column = ColumnResult::from(agg);
        column.nullable = agg.nullable
            && !matches!(resolved.agg_function, AggFunction::Sum | AggFunction::Count);
        columns.push(column);
    }

    let mut result = AggregationResult {
        result: ExtractionResult {
            columns,
            total_count: 0,
            rows: Vec::new(),
        },
        space_strata: resolved.space_columns.clone(),
        time_strata: resolved.time_columns.clone(),
        tech_strata: resolved.tech_column.clone(),
    };

    let total = env
        .db
        .query_count(&format!("SELECT COUNT(*) FROM ({select}) C"))
        .await?;
    if total <= 0 {
        debug!(%table, "no groups match, skipping page query");
        return Ok(result);
    }

    let order: Vec<&str> = match &page.sort {
        Some(sort) => {
            let column = groups
                .iter()
                .copied()
                .chain(std::iter::once(agg_name))
                .find(|c| c.eq_ignore_ascii_case(sort))
                .ok_or_else(|| {
                    ExtractionError::InvalidFilter(format!("Cannot sort on column '{sort}'"))
                })?;
            vec![column]
        }
        None if groups.is_empty() => vec![agg_name],
        None => groups.clone(),
    };
    let order_by = order
        .iter()
        .map(|c| format!("{c} {}", page.direction))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "{select} ORDER BY {order_by}{}",
        env.dialect().limit_offset(page_size(env, page), page.offset)
    );
    let rows = env.db.query(&sql).await?;
    debug!(%table, total, rows = rows.rows.len(), "read aggregation page");

    result.result.total_count = total as u64;
    result.result.rows = rows.rows;
    Ok(result)
}

/// Aggregate of `table` per tech value. Groups with a NULL tech value or a
/// NULL aggregate are left out.
pub async fn read_by_tech(
    env: &ExtractionEnv,
    table: &str,
    sheet: Sheet,
    filter: &ExtractionFilter,
    strata: &Strata,
) -> Result<BTreeMap<String, f64>> {
    let resolved = ResolvedStrata::resolve(env, table, sheet, filter, strata).await?;
    let tech = resolved.tech_or_error()?;

    let sql = format!(
        "{} ORDER BY {tech}",
        resolved.grouped_select(&[tech], AGG_VALUE)
    );
    let rows = env.db.query(&sql).await?;

    let mut values = BTreeMap::new();
    for row in &rows.rows {
        let key = row.first().and_then(|c| c.as_deref());
        let value = parse_number(row.get(1).and_then(|c| c.as_deref()))?;
        if let (Some(key), Some(value)) = (key, value) {
            values.insert(key.to_string(), value);
        }
    }
    Ok(values)
}

/// Bounds of the aggregate per strata and tech group, and per tech value.
pub async fn tech_min_max(
    env: &ExtractionEnv,
    table: &str,
    sheet: Sheet,
    filter: &ExtractionFilter,
    strata: &Strata,
) -> Result<MinMax> {
    let resolved = ResolvedStrata::resolve(env, table, sheet, filter, strata).await?;
    let tech = resolved.tech_or_error()?;

    let mut groups = resolved.strata_columns();
    if !groups.contains(&tech) {
        groups.push(tech);
    }
    let by_strata = resolved.grouped_select(&groups, AGG_VALUE);
    let by_tech = resolved.grouped_select(&[tech], AGG_VALUE);
    let sql = format!(
        "SELECT A.agg_min, A.agg_max, T.tech_min, T.tech_max FROM \
         (SELECT MIN({AGG_VALUE}) AS agg_min, MAX({AGG_VALUE}) AS agg_max FROM ({by_strata}) S) A, \
         (SELECT MIN({AGG_VALUE}) AS tech_min, MAX({AGG_VALUE}) AS tech_max FROM ({by_tech}) G) T"
    );
    let rows = env.db.query(&sql).await?;

    let Some(row) = rows.rows.first() else {
        return Ok(MinMax::default());
    };
    let cell = |i: usize| parse_number(row.get(i).and_then(|c| c.as_deref()));
    Ok(MinMax {
        agg_min: cell(0)?,
        agg_max: cell(1)?,
        tech_min: cell(2)?,
        tech_max: cell(3)?,
    })
}
