//! Scripted in-memory database for tests.
//!
//! Statements are not interpreted as SQL. The database only understands the
//! statement shapes the pipeline emits (`CREATE TABLE .. AS`, `DELETE FROM`,
//! `DROP TABLE`, `SELECT COUNT(*) FROM`, ...) and answers from a script.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::database::{ColumnDescriptor, Database, QueryRows};
use crate::errors::{ExtractionError, Result};
use crate::sql::Dialect;

#[derive(Debug, Clone)]
struct MemoryTable {
    columns: Vec<ColumnDescriptor>,
    rows: u64,
}

#[derive(Debug, Clone)]
struct CreateScript {
    marker: String,
    columns: Vec<ColumnDescriptor>,
    rows: u64,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, MemoryTable>,
    creates: Vec<CreateScript>,
    deletes: Vec<(String, u64)>,
    queries: Vec<(String, QueryRows)>,
    failures: Vec<String>,
    statements: Vec<String>,
    describes: HashMap<String, usize>,
}

#[derive(Debug)]
pub struct MemoryDatabase {
    dialect: Dialect,
    state: Mutex<State>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_dialect(Dialect::Postgres)
    }

    pub fn with_dialect(dialect: Dialect) -> Self {
        MemoryDatabase {
            dialect,
            state: Mutex::new(State::default()),
        }
    }

    /// Create a table directly, as if it existed in the source schema.
    pub fn create_table(&self, name: &str, columns: Vec<ColumnDescriptor>, rows: u64) {
        self.state
            .lock()
            .tables
            .insert(name.to_ascii_lowercase(), MemoryTable { columns, rows });
    }

    /// Script the outcome of `CREATE TABLE <name> AS ...` for every table
    /// whose name contains `marker`.
    pub fn on_create(&self, marker: &str, columns: Vec<ColumnDescriptor>, rows: u64) {
        self.state.lock().creates.push(CreateScript {
            marker: marker.to_ascii_lowercase(),
            columns,
            rows,
        });
    }

    /// Script the number of rows removed by `DELETE FROM` on tables whose
    /// name contains `marker`.
    pub fn on_delete(&self, marker: &str, deleted: u64) {
        self.state
            .lock()
            .deletes
            .push((marker.to_ascii_lowercase(), deleted));
    }

    /// Script the result of any query containing `pattern`.
    pub fn on_query(&self, pattern: &str, rows: QueryRows) {
        self.state.lock().queries.push((pattern.to_string(), rows));
    }

    /// Fail every statement containing `pattern`. Use `describe:<table>` to
    /// fail introspection of a table.
    pub fn fail_on(&self, pattern: &str) {
        self.state.lock().failures.push(pattern.to_string());
    }

    pub fn drop_column(&self, table: &str, column: &str) {
        if let Some(t) = self.state.lock().tables.get_mut(&table.to_ascii_lowercase()) {
            t.columns.retain(|c| !c.name.eq_ignore_ascii_case(column));
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    pub fn statements_matching(&self, pattern: &str) -> Vec<String> {
        self.statements()
            .into_iter()
            .filter(|s| s.contains(pattern))
            .collect()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.state
            .lock()
            .tables
            .contains_key(&name.to_ascii_lowercase())
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn describe_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .describes
            .get(&name.to_ascii_lowercase())
            .copied()
            .unwrap_or(0)
    }

    fn check_failure(state: &State, subject: &str) -> Result<()> {
        match state.failures.iter().find(|f| subject.contains(f.as_str())) {
            Some(f) => Err(ExtractionError::Persistence(format!(
                "injected failure matching '{f}'"
            ))),
            None => Ok(()),
        }
    }
}

/// Table name following a keyword sequence, e.g. the name after
/// `DROP TABLE IF EXISTS`.
fn name_after(sql: &str, keywords: &[&str]) -> Option<String> {
    let mut tokens = sql.split_whitespace();
    for kw in keywords {
        if !tokens.next()?.eq_ignore_ascii_case(kw) {
            return None;
        }
    }
    tokens
        .next()
        .map(|t| t.trim_end_matches(';').to_ascii_lowercase())
}

#[async_trait]
impl Database for MemoryDatabase {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn execute(&self, sql: &str) -> Result<u64> {
        let mut state = self.state.lock();
        Self::check_failure(&state, sql)?;
        state.statements.push(sql.to_string());

        if let Some(name) = name_after(sql, &["CREATE", "TABLE"]) {
            let script = state
                .creates
                .iter()
                .find(|s| name.contains(&s.marker))
                .cloned();
            let (columns, rows) = script.map(|s| (s.columns, s.rows)).unwrap_or_default();
            state.tables.insert(name, MemoryTable { columns, rows });
            return Ok(rows);
        }

        if let Some(name) = name_after(sql, &["DROP", "TABLE", "IF", "EXISTS"]) {
            state.tables.remove(&name);
            return Ok(0);
        }

        if let Some(name) = name_after(sql, &["DROP", "TABLE"]) {
            return match state.tables.remove(&name) {
                Some(_) => Ok(0),
                None => Err(ExtractionError::Persistence(format!(
                    "table {name} does not exist"
                ))),
            };
        }

        if let Some(name) = name_after(sql, &["DELETE", "FROM"]) {
            let deleted = state
                .deletes
                .iter()
                .find(|(marker, _)| name.contains(marker))
                .map(|(_, n)| *n)
                .unwrap_or(0);
            let table = state
                .tables
                .get_mut(&name)
                .ok_or_else(|| ExtractionError::Persistence(format!("table {name} does not exist")))?;
            let deleted = deleted.min(table.rows);
            table.rows -= deleted;
            return Ok(deleted);
        }

        if let Some(name) = name_after(sql, &["ALTER", "TABLE"]) {
            let column = sql
                .split_whitespace()
                .last()
                .unwrap_or_default()
                .trim_end_matches(';')
                .to_string();
            if let Some(t) = state.tables.get_mut(&name) {
                t.columns.retain(|c| !c.name.eq_ignore_ascii_case(&column));
            }
            return Ok(0);
        }

        Ok(0)
    }

    async fn query(&self, sql: &str) -> Result<QueryRows> {
        let mut state = self.state.lock();
        Self::check_failure(&state, sql)?;
        state.statements.push(sql.to_string());

        if let Some((_, rows)) = state.queries.iter().find(|(p, _)| sql.contains(p.as_str())) {
            return Ok(rows.clone());
        }

        if let Some(name) = name_after(sql, &["SELECT", "COUNT(*)", "FROM"]) {
            let rows = state.tables.get(&name).map(|t| t.rows).ok_or_else(|| {
                ExtractionError::Persistence(format!("table {name} does not exist"))
            })?;
            return Ok(QueryRows {
                columns: vec!["count".to_string()],
                rows: vec![vec![Some(rows.to_string())]],
            });
        }

        Ok(QueryRows::default())
    }

    async fn describe_table(&self, table: &str) -> Result<Option<Vec<ColumnDescriptor>>> {
        let key = table.to_ascii_lowercase();
        let mut state = self.state.lock();
        Self::check_failure(&state, &format!("describe:{key}"))?;
        *state.describes.entry(key.clone()).or_default() += 1;
        Ok(state.tables.get(&key).map(|t| t.columns.clone()))
    }
}

/// Shorthand for building column descriptors in tests.
pub fn columns(specs: &[(&str, &str, bool)]) -> Vec<ColumnDescriptor> {
    specs
        .iter()
        .map(|(name, typ, nullable)| ColumnDescriptor::new(*name, *typ, *nullable))
        .collect()
}

pub fn rows(columns: &[&str], values: Vec<Vec<Option<&str>>>) -> QueryRows {
    QueryRows {
        columns: columns.iter().map(|c| c.to_string()).collect(),
        rows: values
            .into_iter()
            .map(|r| r.into_iter().map(|c| c.map(|s| s.to_string())).collect())
            .collect(),
    }
}
