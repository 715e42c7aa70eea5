//! Translation of an [`ExtractionFilter`] into SQL predicates against one
//! table.
//!
//! Criteria are a conjunction: every criterion applying to the sheet must
//! hold. Criteria on columns the table does not have are dropped.

use tracing::debug;

use super::{Criterion, ExtractionFilter, Operator};
use crate::catalog::{ColumnMetadata, TableMetadata};
use crate::errors::{ExtractionError, Result};
use crate::sql::{Dialect, and_all, quote_literal};

/// Predicate that no row satisfies.
pub const MATCH_NOTHING: &str = "1=0";

fn literal(column: &ColumnMetadata, value: &str) -> Result<String> {
    if column.is_numeric() {
        let trimmed = value.trim();
        match trimmed.parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(trimmed.to_string()),
            _ => Err(ExtractionError::InvalidFilter(format!(
                "Expected a number for column '{}', got '{value}'",
                column.name
            ))),
        }
    } else {
        Ok(quote_literal(value))
    }
}

fn literal_list(column: &ColumnMetadata, values: &[String]) -> Result<String> {
    Ok(values
        .iter()
        .map(|v| literal(column, v))
        .collect::<Result<Vec<_>>>()?
        .join(", "))
}

const LIKE_ESCAPE: char = '\\';

/// LIKE pattern where `*` is the only wildcard. SQL wildcards given by the
/// user match literally.
fn like_pattern(value: &str) -> String {
    let mut pattern = String::with_capacity(value.len());
    let mut escaped = false;
    for c in value.chars() {
        match c {
            '*' => pattern.push('%'),
            '%' | '_' | LIKE_ESCAPE => {
                pattern.push(LIKE_ESCAPE);
                pattern.push(c);
                escaped = true;
            }
            c => pattern.push(c),
        }
    }
    let quoted = quote_literal(&pattern);
    if escaped {
        format!("{quoted} ESCAPE '{LIKE_ESCAPE}'")
    } else {
        quoted
    }
}

/// Left side of a LIKE, non-text columns are matched on their text form.
fn like_operand(column: &ColumnMetadata, dialect: Dialect) -> String {
    if column.is_numeric() {
        dialect.text_cast(&column.name)
    } else {
        column.name.clone()
    }
}

fn single_value<'a>(criterion: &'a Criterion) -> Result<&'a str> {
    match criterion.values.as_slice() {
        [value] => Ok(value),
        _ => Err(ExtractionError::InvalidFilter(format!(
            "Operator {} on '{}' expects exactly one value, got {}",
            criterion.operator,
            criterion.column_name,
            criterion.values.len()
        ))),
    }
}

/// Render one criterion against `column`.
fn criterion_predicate(
    column: &ColumnMetadata,
    criterion: &Criterion,
    dialect: Dialect,
) -> Result<String> {
    let name = &column.name;
    let values = &criterion.values;
    if !criterion.operator.is_unary() && values.is_empty() {
        return Err(ExtractionError::InvalidFilter(format!(
            "Missing value for '{}' {}",
            criterion.column_name, criterion.operator
        )));
    }
    let has_wildcard = values.iter().any(|v| v.contains('*'));
    let like_operand = like_operand(column, dialect);

    Ok(match criterion.operator {
        Operator::Equals | Operator::In if has_wildcard => values
            .iter()
            .map(|v| format!("{like_operand} LIKE {}", like_pattern(v)))
            .collect::<Vec<_>>()
            .join(" OR "),
        Operator::NotEquals | Operator::NotIn if has_wildcard => values
            .iter()
            .map(|v| format!("{like_operand} NOT LIKE {}", like_pattern(v)))
            .collect::<Vec<_>>()
            .join(" AND "),
        Operator::Equals | Operator::In if values.len() == 1 => {
            format!("{name} = {}", literal(column, &values[0])?)
        }
        Operator::Equals | Operator::In => {
            format!("{name} IN ({})", literal_list(column, values)?)
        }
        Operator::NotEquals | Operator::NotIn if values.len() == 1 => {
            format!("{name} <> {}", literal(column, &values[0])?)
        }
        Operator::NotEquals | Operator::NotIn => {
            format!("{name} NOT IN ({})", literal_list(column, values)?)
        }
        Operator::GreaterThan => format!("{name} > {}", literal(column, single_value(criterion)?)?),
        Operator::GreaterOrEqual => {
            format!("{name} >= {}", literal(column, single_value(criterion)?)?)
        }
        Operator::LessThan => format!("{name} < {}", literal(column, single_value(criterion)?)?),
        Operator::LessOrEqual => {
            format!("{name} <= {}", literal(column, single_value(criterion)?)?)
        }
        Operator::Between => match values.as_slice() {
            [from, to] => format!(
                "{name} BETWEEN {} AND {}",
                literal(column, from)?,
                literal(column, to)?
            ),
            _ => {
                return Err(ExtractionError::InvalidFilter(format!(
                    "BETWEEN on '{}' expects two values",
                    criterion.column_name
                )));
            }
        },
        Operator::Like => format!(
            "{like_operand} LIKE {}",
            like_pattern(single_value(criterion)?)
        ),
        Operator::IsNull => format!("{name} IS NULL"),
        Operator::IsNotNull => format!("{name} IS NOT NULL"),
    })
}

/// Predicates for `sheet`, grouped by column in order of first appearance.
fn column_predicates(
    table: &TableMetadata,
    filter: &ExtractionFilter,
    sheet: &str,
    dialect: Dialect,
) -> Result<Vec<String>> {
    let mut groups: Vec<(&ColumnMetadata, Vec<String>)> = Vec::new();

    for criterion in filter.criteria_for(sheet) {
        let column = match table.column(&criterion.column_name) {
            Some(column) => column,
            None => {
                debug!(table = %table.name, column = %criterion.column_name, "dropping criterion on missing column");
                continue;
            }
        };
        let predicate = criterion_predicate(column, criterion, dialect)?;
        match groups.iter_mut().find(|(c, _)| c.name == column.name) {
            Some((_, preds)) => preds.push(predicate),
            None => groups.push((column, vec![predicate])),
        }
    }

    Ok(groups
        .into_iter()
        .map(|(_, mut preds)| {
            if preds.len() == 1 {
                preds.remove(0)
            } else {
                and_all(&preds)
            }
        })
        .collect())
}

/// WHERE clause body (without the keyword) restricting `table` to rows
/// matching `filter` for `sheet`. Returns an empty string when nothing
/// restricts the table.
pub fn where_clause(
    table: &TableMetadata,
    filter: &ExtractionFilter,
    sheet: &str,
    dialect: Dialect,
) -> Result<String> {
    let predicates = column_predicates(table, filter, sheet, dialect)?;
    Ok(and_all(&predicates))
}

/// Logical inverse of [`where_clause`], used to delete rows failing the
/// filter.
///
/// A row whose predicate evaluates to NULL does not match the filter, so it
/// matches the inverse. Without any restriction the inverse matches nothing.
pub fn inverse_where_clause(
    table: &TableMetadata,
    filter: &ExtractionFilter,
    sheet: &str,
    dialect: Dialect,
) -> Result<String> {
    let clause = where_clause(table, filter, sheet, dialect)?;
    if clause.is_empty() {
        return Ok(MATCH_NOTHING.to_string());
    }
    Ok(format!("CASE WHEN {clause} THEN 0 ELSE 1 END = 1"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::ColumnDescriptor;

    fn table() -> TableMetadata {
        TableMetadata::from_descriptors(
            "EXT_HH_1",
            "EH1".to_string(),
            vec![
                ColumnDescriptor::new("project", "VARCHAR", false),
                ColumnDescriptor::new("year", "INTEGER", false),
                ColumnDescriptor::new("area", "VARCHAR", true),
                ColumnDescriptor::new("fishing_time", "NUMERIC", true),
            ],
            1,
        )
    }

    fn filter(criteria: Vec<Criterion>) -> ExtractionFilter {
        ExtractionFilter {
            criteria,
            ..Default::default()
        }
    }

    fn clause(criteria: Vec<Criterion>) -> String {
        where_clause(&table(), &filter(criteria), "HH", Dialect::Postgres).unwrap()
    }

    #[test]
    fn empty_filter_is_no_restriction() {
        assert_eq!("", clause(vec![]));
        assert_eq!(
            MATCH_NOTHING,
            inverse_where_clause(&table(), &filter(vec![]), "HH", Dialect::Postgres).unwrap()
        );
    }

    #[test]
    fn operators() {
        assert_eq!(
            "(project = 'PRG1')",
            clause(vec![Criterion::new(None, "PROJECT", Operator::Equals, ["PRG1"])])
        );
        assert_eq!(
            "(year IN (2019, 2020))",
            clause(vec![Criterion::new(None, "year", Operator::In, ["2019", "2020"])])
        );
        assert_eq!(
            "(area LIKE '27.7.%')",
            clause(vec![Criterion::new(None, "area", Operator::Equals, ["27.7.*"])])
        );
        assert_eq!(
            "(year BETWEEN 2018 AND 2020)",
            clause(vec![Criterion::new(None, "year", Operator::Between, ["2018", "2020"])])
        );
        assert_eq!(
            "(area IS NULL)",
            clause(vec![Criterion::new::<String>(None, "area", Operator::IsNull, [])])
        );
        assert_eq!(
            "(area NOT IN ('a', 'b'))",
            clause(vec![Criterion::new(None, "area", Operator::NotIn, ["a", "b"])])
        );
        assert_eq!(
            "(fishing_time >= 1.5)",
            clause(vec![Criterion::new(None, "fishing_time", Operator::GreaterOrEqual, ["1.5"])])
        );
    }

    #[test]
    fn wildcards_on_numbers_match_their_text() {
        let criteria = || vec![Criterion::new(None, "year", Operator::Equals, ["20*"])];
        let sql = |dialect| where_clause(&table(), &filter(criteria()), "HH", dialect).unwrap();
        assert_eq!("(CAST(year AS VARCHAR) LIKE '20%')", sql(Dialect::Postgres));
        assert_eq!("(TO_CHAR(year) LIKE '20%')", sql(Dialect::Oracle));
        assert_eq!(
            "(CAST(fishing_time AS VARCHAR) LIKE '1.%')",
            clause(vec![Criterion::new(None, "fishing_time", Operator::Like, ["1.*"])])
        );
    }

    #[test]
    fn sql_wildcards_in_values_match_literally() {
        assert_eq!(
            r"(project LIKE 'PRG\_1\%%' ESCAPE '\')",
            clause(vec![Criterion::new(None, "project", Operator::Equals, ["PRG_1%*"])])
        );
        assert_eq!(
            r"(area NOT LIKE 'a\\b%' ESCAPE '\')",
            clause(vec![Criterion::new(None, "area", Operator::NotEquals, [r"a\b*"])])
        );
        // Without a star the value is compared as is.
        assert_eq!(
            "(project = 'PRG_1')",
            clause(vec![Criterion::new(None, "project", Operator::Equals, ["PRG_1"])])
        );
    }

    #[test]
    fn criteria_are_a_conjunction() {
        let sql = clause(vec![
            Criterion::new(None, "year", Operator::GreaterOrEqual, ["2018"]),
            Criterion::new(None, "project", Operator::Equals, ["PRG1"]),
            Criterion::new(None, "year", Operator::LessOrEqual, ["2020"]),
        ]);
        assert_eq!("((year >= 2018) AND (year <= 2020)) AND (project = 'PRG1')", sql);
    }

    #[test]
    fn criteria_of_other_sheets_and_missing_columns_are_ignored() {
        let sql = clause(vec![
            Criterion::new(Some("SL"), "year", Operator::Equals, ["2020"]),
            Criterion::new(None, "species", Operator::Equals, ["COD"]),
        ]);
        assert_eq!("", sql);
    }

    #[test]
    fn inverse_covers_null() {
        let criteria = vec![Criterion::new(None, "area", Operator::Equals, ["27.7.d"])];
        let inverse =
            inverse_where_clause(&table(), &filter(criteria), "HH", Dialect::Postgres).unwrap();
        assert_eq!("CASE WHEN (area = '27.7.d') THEN 0 ELSE 1 END = 1", inverse);
    }

    #[test]
    fn literals_are_escaped_and_numbers_validated() {
        assert_eq!(
            "(project = 'x'' OR ''1''=''1')",
            clause(vec![Criterion::new(None, "project", Operator::Equals, ["x' OR '1'='1"])])
        );
        let err = where_clause(
            &table(),
            &filter(vec![Criterion::new(None, "year", Operator::Equals, ["2020; DROP"])]),
            "HH",
            Dialect::Postgres,
        )
        .unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidFilter(_)));
    }

    #[test]
    fn missing_values_are_rejected() {
        let err = where_clause(
            &table(),
            &filter(vec![Criterion::new::<String>(None, "year", Operator::Equals, [])]),
            "HH",
            Dialect::Postgres,
        )
        .unwrap_err();
        assert!(matches!(err, ExtractionError::InvalidFilter(_)));
    }
}
