use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::node::{Clause, ClauseKind, ColumnKind, Node, QueryKind, QueryTemplate, Segment};
use crate::errors::{ExtractionError, Result};
use crate::sql::{Dialect, Ident, SqlValue};

/// Extra clause inserted at an `<injection>` point.
#[derive(Debug, Clone, PartialEq)]
pub enum Injection {
    /// A selected expression. The expression is trusted SQL built by the
    /// caller, the alias is validated.
    Select {
        expr: String,
        alias: Ident,
        column: ColumnKind,
    },
    /// A join appended to the FROM clause.
    Join { sql: String },
}

impl Injection {
    pub fn select(expr: impl Into<String>, alias: &str, column: ColumnKind) -> Result<Self> {
        Ok(Injection::Select {
            expr: expr.into(),
            alias: Ident::new(alias.to_ascii_lowercase())?,
            column,
        })
    }

    pub fn join(sql: impl Into<String>) -> Self {
        Injection::Join { sql: sql.into() }
    }
}

/// Result of rendering a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedQuery {
    pub sql: String,
    pub hidden_columns: BTreeSet<String>,
    pub distinct: bool,
    pub not_numeric_columns: BTreeSet<String>,
}

/// Binding environment for one rendering of a template.
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    template: Arc<QueryTemplate>,
    dialect: Dialect,
    bindings: BTreeMap<String, SqlValue>,
    groups: BTreeSet<String>,
    injections: BTreeMap<String, Vec<Injection>>,
}

#[derive(Default)]
struct Buckets {
    select: Vec<String>,
    from: Vec<String>,
    injected_joins: Vec<String>,
    where_: Vec<(String, String)>,
    group_by: Vec<String>,
    having: Vec<(String, String)>,
    order_by: Vec<String>,
}

impl QueryBuilder {
    /// Create a builder with the dialect's group enabled.
    pub fn new(template: Arc<QueryTemplate>, dialect: Dialect) -> Self {
        let mut groups = BTreeSet::new();
        groups.insert(dialect.group_name().to_string());
        QueryBuilder {
            template,
            dialect,
            bindings: BTreeMap::new(),
            groups,
            injections: BTreeMap::new(),
        }
    }

    pub fn template_name(&self) -> &str {
        &self.template.name
    }

    pub fn template(&self) -> &QueryTemplate {
        &self.template
    }

    pub fn bind(&mut self, slot: &str, value: impl Into<SqlValue>) -> &mut Self {
        self.bindings.insert(slot.to_string(), value.into());
        self
    }

    pub fn set_group(&mut self, group: &str, enabled: bool) -> &mut Self {
        if enabled {
            self.groups.insert(group.to_string());
        } else {
            self.groups.remove(group);
        }
        self
    }

    pub fn inject(&mut self, point: &str, injection: Injection) -> &mut Self {
        self.injections
            .entry(point.to_string())
            .or_default()
            .push(injection);
        self
    }

    fn render_segments(&self, segments: impl IntoIterator<Item = Segment>) -> Result<String> {
        let mut out = String::new();
        for segment in segments {
            match segment {
                Segment::Literal(s) => out.push_str(&s),
                Segment::Slot(slot) => {
                    let value = self.bindings.get(&slot).ok_or_else(|| {
                        tracing::error!(template = %self.template.name, %slot, "unbound template slot");
                        ExtractionError::Binding {
                            template: self.template.name.clone(),
                            slot,
                        }
                    })?;
                    out.push_str(&value.to_sql(self.dialect));
                }
            }
        }
        Ok(out.trim().to_string())
    }

    /// Render a WHERE/HAVING clause body. Nested clauses are combined with
    /// their operators and wrapped in parentheses.
    fn render_condition_body(&self, clause: &Clause) -> Result<String> {
        let mut text = Vec::new();
        let mut nested = Vec::new();
        for node in &clause.body {
            match node {
                Node::Segment(s) => text.push(s.clone()),
                Node::Clause(c) if c.condition.holds(&self.groups) => {
                    let operator = match &c.kind {
                        ClauseKind::Where { operator } | ClauseKind::Having { operator } => {
                            operator.clone()
                        }
                        _ => "AND".to_string(),
                    };
                    let body = self.render_condition_body(c)?;
                    if !body.is_empty() {
                        nested.push((operator, body));
                    }
                }
                Node::Clause(_) => (),
            }
        }

        let mut out = self.render_segments(text)?;
        let nested = join_conditions(&nested);
        if !nested.is_empty() {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push('(');
            out.push_str(&nested);
            out.push(')');
        }
        Ok(out)
    }

    fn render_injections(&self, name: &str, buckets: &mut Buckets, rendered: &mut RenderedQuery) {
        for injection in self.injections.get(name).into_iter().flatten() {
            match injection {
                Injection::Select {
                    expr,
                    alias,
                    column,
                } => {
                    buckets.select.push(format!("{expr} AS {alias}"));
                    record_column(rendered, alias.as_str(), *column);
                }
                Injection::Join { sql } => buckets.injected_joins.push(sql.clone()),
            }
        }
    }

    /// Render the final SQL. Disabled clauses are dropped before any slot is
    /// resolved, so unbound slots inside them are not an error.
    pub fn render(&self) -> Result<RenderedQuery> {
        let mut rendered = RenderedQuery {
            sql: String::new(),
            hidden_columns: BTreeSet::new(),
            distinct: self.template.distinct,
            not_numeric_columns: BTreeSet::new(),
        };
        let mut buckets = Buckets::default();

        for clause in &self.template.clauses {
            if !clause.condition.holds(&self.groups) {
                continue;
            }

            match &clause.kind {
                ClauseKind::Select { alias, column } => {
                    let expr = self.render_condition_body(clause)?;
                    buckets.select.push(format!("{expr} AS {alias}"));
                    record_column(&mut rendered, alias, *column);
                }
                ClauseKind::From { alias, join } => {
                    let expr = self.render_condition_body(clause)?;
                    let item = match alias {
                        Some(alias) => format!("{expr} {alias}"),
                        None => expr,
                    };
                    if *join || buckets.from.is_empty() {
                        buckets.from.push(item);
                    } else {
                        buckets.from.push(format!(", {item}"));
                    }
                }
                ClauseKind::Where { operator } => {
                    let body = self.render_condition_body(clause)?;
                    if !body.is_empty() {
                        buckets.where_.push((operator.clone(), body));
                    }
                }
                ClauseKind::Having { operator } => {
                    let body = self.render_condition_body(clause)?;
                    if !body.is_empty() {
                        buckets.having.push((operator.clone(), body));
                    }
                }
                ClauseKind::GroupBy => buckets.group_by.push(self.render_condition_body(clause)?),
                ClauseKind::OrderBy { direction } => {
                    let expr = self.render_condition_body(clause)?;
                    buckets.order_by.push(match direction {
                        Some(d) => format!("{expr} {d}"),
                        None => expr,
                    });
                }
                ClauseKind::Injection { name } => {
                    self.render_injections(name, &mut buckets, &mut rendered)
                }
            }
        }

        if buckets.select.is_empty() {
            return Err(ExtractionError::TemplateParse {
                template: self.template.name.clone(),
                message: "no active select clause".to_string(),
            });
        }

        let mut sql = String::from("SELECT ");
        if rendered.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&buckets.select.join(", "));
        if !buckets.from.is_empty() {
            buckets.from.append(&mut buckets.injected_joins);
            sql.push_str(" FROM ");
            sql.push_str(&join_from(&buckets.from));
        }
        let where_ = join_conditions(&buckets.where_);
        if !where_.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_);
        }
        if !buckets.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&buckets.group_by.join(", "));
        }
        let having = join_conditions(&buckets.having);
        if !having.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&having);
        }
        if !buckets.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&buckets.order_by.join(", "));
        }

        if let QueryKind::Create { table } = &self.template.kind {
            let table = self.render_segments(table.clone())?;
            sql = format!("CREATE TABLE {table} AS {sql}");
        }

        rendered.sql = sql;
        Ok(rendered)
    }
}

fn record_column(rendered: &mut RenderedQuery, alias: &str, column: ColumnKind) {
    match column {
        ColumnKind::Hidden => {
            rendered.hidden_columns.insert(alias.to_string());
        }
        ColumnKind::Text => {
            rendered.not_numeric_columns.insert(alias.to_string());
        }
        ColumnKind::Number => (),
    }
}

fn join_from(items: &[String]) -> String {
    let mut out = String::new();
    for item in items {
        if !out.is_empty() && !item.starts_with(',') {
            out.push(' ');
        }
        out.push_str(item);
    }
    out
}

/// Join `(operator, condition)` pairs. The first operator is dropped.
fn join_conditions(items: &[(String, String)]) -> String {
    let mut out = String::new();
    for (idx, (operator, body)) in items.iter().enumerate() {
        if idx > 0 {
            out.push(' ');
            out.push_str(operator);
            out.push(' ');
        }
        out.push_str(body);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::parse::parse_template;

    const TEMPLATE: &str = r#"
<query type="create" table="&amp;tableName">
  <select alias="trip_code" type="number">T.ID</select>
  <select alias="project" type="text">P.LABEL</select>
  <select alias="sample_ids" type="hidden" group="pgsql">STRING_AGG(S.ID::text, ',')</select>
  <select alias="sample_id" type="hidden" group="!pgsql">S.ID</select>
  <injection name="pmfms"/>
  <from alias="T">TRIP</from>
  <from join="true">INNER JOIN PROGRAM P ON P.ID = T.PROGRAM_FK</from>
  <from join="true">LEFT OUTER JOIN SAMPLE S ON S.TRIP_FK = T.ID</from>
  <where>T.DEPARTURE_DATE_TIME &gt;= &amp;startDate</where>
  <where operator="AND" group="programFilter">P.LABEL IN (&amp;progLabels)</where>
  <where operator="AND" group="vesselFilter">T.VESSEL_FK IN (&amp;vesselIds)</where>
  <where operator="AND" group="either">
    <where>T.ID = 1</where>
    <where operator="OR">T.ID = 2</where>
  </where>
  <groupby>T.ID, P.LABEL</groupby>
  <orderby direction="ASC">T.ID</orderby>
</query>"#;

    fn builder() -> QueryBuilder {
        let template = Arc::new(parse_template("test", TEMPLATE).unwrap());
        let mut b = QueryBuilder::new(template, Dialect::Postgres);
        b.bind("tableName", SqlValue::ident("EXT_TR_1").unwrap());
        b.bind(
            "startDate",
            chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
        );
        b
    }

    #[test]
    fn render_with_defaults() {
        let rendered = builder().render().unwrap();
        assert_eq!(
            "CREATE TABLE EXT_TR_1 AS SELECT T.ID AS trip_code, P.LABEL AS project, \
             STRING_AGG(S.ID::text, ',') AS sample_ids \
             FROM TRIP T INNER JOIN PROGRAM P ON P.ID = T.PROGRAM_FK \
             LEFT OUTER JOIN SAMPLE S ON S.TRIP_FK = T.ID \
             WHERE T.DEPARTURE_DATE_TIME >= DATE '2020-01-01' \
             GROUP BY T.ID, P.LABEL ORDER BY T.ID ASC",
            rendered.sql
        );
        assert_eq!(
            vec!["sample_ids".to_string()],
            rendered.hidden_columns.into_iter().collect::<Vec<_>>()
        );
        assert!(rendered.not_numeric_columns.contains("project"));
        assert!(!rendered.distinct);
    }

    #[test]
    fn unbound_slot_in_disabled_group_is_ignored() {
        // progLabels is never bound, but its group is disabled.
        assert!(builder().render().is_ok());
    }

    #[test]
    fn unbound_slot_in_enabled_group_fails() {
        let mut b = builder();
        b.set_group("programFilter", true);
        match b.render() {
            Err(ExtractionError::Binding { template, slot }) => {
                assert_eq!("test", template);
                assert_eq!("progLabels", slot);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn enabled_groups_and_nested_conditions() {
        let mut b = builder();
        b.set_group("programFilter", true)
            .bind("progLabels", SqlValue::text_list(["PRG1", "PRG2"]))
            .set_group("either", true);
        let sql = b.render().unwrap().sql;
        assert!(
            sql.contains(
                "WHERE T.DEPARTURE_DATE_TIME >= DATE '2020-01-01' \
                 AND P.LABEL IN ('PRG1', 'PRG2') AND (T.ID = 1 OR T.ID = 2)"
            ),
            "{sql}"
        );
    }

    #[test]
    fn dialect_groups() {
        let template = Arc::new(parse_template("test", TEMPLATE).unwrap());
        let mut b = QueryBuilder::new(template, Dialect::Hsqldb);
        b.bind("tableName", SqlValue::ident("EXT_TR_1").unwrap())
            .bind("startDate", chrono::NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        let rendered = b.render().unwrap();
        assert!(rendered.sql.contains("S.ID AS sample_id"));
        assert!(rendered.hidden_columns.contains("sample_id"));
        assert!(!rendered.hidden_columns.contains("sample_ids"));
    }

    #[test]
    fn injections() {
        let mut b = builder();
        b.inject(
            "pmfms",
            Injection::select("(SELECT 1)", "MESH_SIZE", ColumnKind::Text).unwrap(),
        );
        b.inject("pmfms", Injection::join("LEFT OUTER JOIN X ON X.ID = T.ID"));
        let rendered = b.render().unwrap();
        assert!(rendered.sql.contains("AS sample_ids, (SELECT 1) AS mesh_size FROM"));
        assert!(rendered.sql.ends_with(
            "LEFT OUTER JOIN SAMPLE S ON S.TRIP_FK = T.ID LEFT OUTER JOIN X ON X.ID = T.ID \
             WHERE T.DEPARTURE_DATE_TIME >= DATE '2020-01-01' GROUP BY T.ID, P.LABEL ORDER BY T.ID ASC"
        ));
        assert!(rendered.not_numeric_columns.contains("mesh_size"));
        assert!(Injection::select("1", "bad alias", ColumnKind::Number).is_err());
    }

    #[test]
    fn rendering_is_deterministic_for_every_group_combination() {
        let groups = ["programFilter", "vesselFilter", "either", "pgsql"];
        for mask in 0..(1 << groups.len()) {
            let mut b = builder();
            b.bind("progLabels", SqlValue::text_list(["PRG1"]))
                .bind("vesselIds", SqlValue::int_list([1, 2]));
            for (i, g) in groups.iter().enumerate() {
                b.set_group(g, mask & (1 << i) != 0);
            }
            let first = b.render().unwrap();
            let second = b.clone().render().unwrap();
            assert_eq!(first, second);
        }
    }
}
