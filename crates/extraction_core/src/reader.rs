//! Paginated reads of a single extraction table.

use tracing::debug;

use crate::catalog::ColumnMetadata;
use crate::context::TableInfo;
use crate::errors::{ExtractionError, Result};
use crate::filter::{ExtractionFilter, where_clause};
use crate::pipeline::ExtractionEnv;
use crate::result::{ColumnResult, ExtractionResult, Page};
use crate::sheet::Sheet;

/// Resolve the sort column of `page` against the selected columns, falling
/// back to the first one.
pub(crate) fn sort_column<'a>(page: &Page, selected: &[&'a str]) -> Result<&'a str> {
    match &page.sort {
        Some(sort) => selected
            .iter()
            .find(|c| c.eq_ignore_ascii_case(sort))
            .copied()
            .ok_or_else(|| ExtractionError::InvalidFilter(format!("Cannot sort on column '{sort}'"))),
        None => selected
            .first()
            .copied()
            .ok_or_else(|| ExtractionError::InvalidFilter("No column selected".to_string())),
    }
}

pub(crate) fn page_size(env: &ExtractionEnv, page: &Page) -> usize {
    match page.size {
        0 => env.config.default_page_size,
        size => size,
    }
}

/// Read one page of `table`.
///
/// Hidden columns are never returned. The total is counted first and the
/// page query is skipped when nothing matches.
pub async fn read_table(
    env: &ExtractionEnv,
    table: &str,
    sheet: Sheet,
    filter: &ExtractionFilter,
    info: Option<&TableInfo>,
    page: &Page,
) -> Result<ExtractionResult> {
    let metadata = env.catalog.require_table(env.db.as_ref(), table).await?;
    let selector = filter.column_selector()?;

    let columns: Vec<&ColumnMetadata> = metadata
        .columns
        .iter()
        .filter(|c| info.is_none_or(|i| !i.hidden_columns.contains(&c.name)))
        .filter(|c| selector.is_selected(&c.name))
        .collect();
    if columns.is_empty() {
        return Err(ExtractionError::InvalidFilter(format!(
            "No column of {table} matches the column selection"
        )));
    }
    let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();

    let distinct =
        info.is_some_and(|i| i.distinct) && columns.iter().all(|c| c.is_distinctable());
    let mut select = format!(
        "SELECT {}{} FROM {}",
        if distinct { "DISTINCT " } else { "" },
        names.join(", "),
        metadata.name
    );
    let clause = where_clause(&metadata, filter, sheet.name(), env.dialect())?;
    if !clause.is_empty() {
        select.push_str(" WHERE ");
        select.push_str(&clause);
    }

    let result_columns = columns.iter().map(|c| ColumnResult::from(*c)).collect();
    let total = env
        .db
        .query_count(&format!("SELECT COUNT(*) FROM ({select}) C"))
        .await?;
    if total <= 0 {
        debug!(%table, "no rows match, skipping page query");
        return Ok(ExtractionResult {
            columns: result_columns,
            total_count: 0,
            rows: Vec::new(),
        });
    }

    let sort = sort_column(page, &names)?;
    let sql = format!(
        "{select} ORDER BY {sort} {}{}",
        page.direction,
        env.dialect().limit_offset(page_size(env, page), page.offset)
    );
    let rows = env.db.query(&sql).await?;
    debug!(%table, total, rows = rows.rows.len(), "read table page");

    Ok(ExtractionResult {
        columns: result_columns,
        total_count: total as u64,
        rows: rows.rows,
    })
}
