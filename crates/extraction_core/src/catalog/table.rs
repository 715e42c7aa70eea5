use crate::database::ColumnDescriptor;
use crate::sql::Ident;

/// Type names whose values cannot be compared for DISTINCT.
const NON_DISTINCT_TYPES: &[&str] = &["BLOB", "CLOB", "BYTEA", "JSON", "JSONB", "XML"];

const NUMERIC_TYPES: &[&str] = &[
    "SMALLINT", "INT2", "INTEGER", "INT", "INT4", "BIGINT", "INT8", "NUMERIC", "DECIMAL", "NUMBER",
    "REAL", "FLOAT", "FLOAT4", "FLOAT8", "DOUBLE", "DOUBLE PRECISION",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    /// Lower-cased column name.
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub alias: String,
}

impl ColumnMetadata {
    pub fn is_numeric(&self) -> bool {
        let base = self
            .data_type
            .split('(')
            .next()
            .unwrap_or_default()
            .trim();
        NUMERIC_TYPES.contains(&base)
    }

    pub fn is_distinctable(&self) -> bool {
        !NON_DISTINCT_TYPES.iter().any(|t| self.data_type.starts_with(t))
    }

    pub fn ident(&self) -> Option<Ident> {
        Ident::new(self.name.clone()).ok()
    }
}

/// Cached description of one physical table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    pub name: String,
    pub alias: String,
    pub columns: Vec<ColumnMetadata>,
    /// Load generation, used to detect metadata invalidated since it was read.
    pub generation: u64,
}

impl TableMetadata {
    pub(crate) fn from_descriptors(
        name: &str,
        alias: String,
        descriptors: Vec<ColumnDescriptor>,
        generation: u64,
    ) -> Self {
        let mut column_aliases = super::alias::AliasGenerator::new();
        let columns = descriptors
            .into_iter()
            .map(|d| {
                let name = d.name.to_ascii_lowercase();
                ColumnMetadata {
                    alias: column_aliases.alias_for(&name),
                    name,
                    data_type: d.data_type.to_ascii_uppercase(),
                    nullable: d.nullable,
                }
            })
            .collect();

        TableMetadata {
            name: name.to_string(),
            alias,
            columns,
            generation,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}
