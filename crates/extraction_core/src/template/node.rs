use std::collections::BTreeSet;

/// A piece of template text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// A named bind slot, written `&name`.
    Slot(String),
}

/// Declared kind of a selected column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Number,
    Text,
    /// Linkage column kept in the table but never shown to consumers.
    Hidden,
}

impl ColumnKind {
    pub(crate) fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.to_ascii_lowercase()).as_deref() {
            Some("text") | Some("string") => ColumnKind::Text,
            Some("hidden") => ColumnKind::Hidden,
            _ => ColumnKind::Number,
        }
    }
}

/// Group flags a clause depends on. Every term must hold for the clause to
/// be rendered. An empty condition always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Condition {
    terms: Vec<(bool, String)>,
}

impl Condition {
    /// Parse `"a !b"` (also accepts `,` as a separator).
    pub fn parse(s: &str) -> Self {
        let terms = s
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .map(|t| match t.strip_prefix('!') {
                Some(name) => (true, name.to_string()),
                None => (false, t.to_string()),
            })
            .collect();
        Condition { terms }
    }

    pub fn holds(&self, enabled: &BTreeSet<String>) -> bool {
        self.terms
            .iter()
            .all(|(negated, name)| enabled.contains(name) != *negated)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|(_, name)| name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClauseKind {
    Select { alias: String, column: ColumnKind },
    From { alias: Option<String>, join: bool },
    Where { operator: String },
    Having { operator: String },
    GroupBy,
    OrderBy { direction: Option<String> },
    Injection { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Segment(Segment),
    /// Nested condition, only allowed in WHERE and HAVING.
    Clause(Clause),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub kind: ClauseKind,
    pub condition: Condition,
    pub body: Vec<Node>,
}

impl Clause {
    /// Slots referenced by this clause and its nested clauses.
    pub fn slots(&self) -> Vec<&str> {
        let mut slots = Vec::new();
        for node in &self.body {
            match node {
                Node::Segment(Segment::Slot(name)) => slots.push(name.as_str()),
                Node::Segment(Segment::Literal(_)) => (),
                Node::Clause(clause) => slots.extend(clause.slots()),
            }
        }
        slots
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    Select,
    /// `CREATE TABLE <table> AS <select>`.
    Create { table: Vec<Segment> },
}

/// A parsed, immutable query template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    pub name: String,
    pub kind: QueryKind,
    pub distinct: bool,
    pub clauses: Vec<Clause>,
}

impl QueryTemplate {
    /// Every group name referenced anywhere in the template.
    pub fn group_names(&self) -> BTreeSet<String> {
        fn collect(clause: &Clause, out: &mut BTreeSet<String>) {
            out.extend(clause.condition.group_names().map(|g| g.to_string()));
            for node in &clause.body {
                if let Node::Clause(c) = node {
                    collect(c, out);
                }
            }
        }

        let mut out = BTreeSet::new();
        for clause in &self.clauses {
            collect(clause, &mut out);
        }
        out
    }

    /// Aliases of select clauses declared hidden, whatever their condition.
    pub fn hidden_columns(&self) -> BTreeSet<String> {
        self.clauses
            .iter()
            .filter_map(|c| match &c.kind {
                ClauseKind::Select {
                    alias,
                    column: ColumnKind::Hidden,
                } => Some(alias.clone()),
                _ => None,
            })
            .collect()
    }

    /// Aliases of every declared select clause, whatever its condition.
    pub fn select_aliases(&self) -> BTreeSet<&str> {
        self.clauses
            .iter()
            .filter_map(|c| match &c.kind {
                ClauseKind::Select { alias, .. } => Some(alias.as_str()),
                _ => None,
            })
            .collect()
    }
}
