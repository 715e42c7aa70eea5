//! XML template parsing.
//!
//! ```xml
//! <query type="create" table="&amp;tripTableName" option="DISTINCT">
//!   <select alias="trip_code" type="number">T.ID</select>
//!   <select alias="sample_ids" type="hidden" group="pgsql">...</select>
//!   <injection name="tripPmfms"/>
//!   <from alias="T">TRIP</from>
//!   <from join="true">INNER JOIN PROGRAM P ON P.ID = T.PROGRAM_FK</from>
//!   <where>T.DEPARTURE_DATE_TIME &gt;= &amp;startDate</where>
//!   <where operator="AND" group="programFilter">P.LABEL IN (&amp;progLabels)</where>
//!   <groupby>T.ID</groupby>
//!   <orderby direction="ASC">T.ID</orderby>
//! </query>
//! ```

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::node::{
    Clause, ClauseKind, ColumnKind, Condition, Node, QueryKind, QueryTemplate, Segment,
};
use crate::errors::{ExtractionError, Result};

/// Untyped XML element.
#[derive(Debug, Default)]
struct Element {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<XmlNode>,
}

#[derive(Debug)]
enum XmlNode {
    Element(Element),
    Text(String),
}

impl Element {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    fn from_start(start: &BytesStart<'_>, template: &str) -> Result<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).to_ascii_lowercase();
        let mut attrs = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| parse_error(template, e))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
            let value = attr
                .unescape_value()
                .map_err(|e| parse_error(template, e))?
                .into_owned();
            attrs.push((key, value));
        }
        Ok(Element {
            name,
            attrs,
            children: Vec::new(),
        })
    }
}

fn parse_error(template: &str, e: impl std::fmt::Display) -> ExtractionError {
    ExtractionError::TemplateParse {
        template: template.to_string(),
        message: e.to_string(),
    }
}

fn read_document(template: &str, xml: &str) -> Result<Element> {
    let mut reader = Reader::from_str(xml);
    // Sentinel root holding the document element.
    let mut stack: Vec<Element> = vec![Element::default()];

    loop {
        match reader.read_event().map_err(|e| parse_error(template, e))? {
            Event::Start(start) => stack.push(Element::from_start(&start, template)?),
            Event::Empty(start) => {
                let el = Element::from_start(&start, template)?;
                push_child(&mut stack, XmlNode::Element(el), template)?;
            }
            Event::End(_) => {
                let el = stack
                    .pop()
                    .ok_or_else(|| parse_error(template, "unbalanced end tag"))?;
                push_child(&mut stack, XmlNode::Element(el), template)?;
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| parse_error(template, e))?;
                if !text.trim().is_empty() {
                    push_child(&mut stack, XmlNode::Text(text.into_owned()), template)?;
                }
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data.into_inner()).to_string();
                push_child(&mut stack, XmlNode::Text(text), template)?;
            }
            Event::Eof => break,
            // Comments, declarations, processing instructions.
            _ => (),
        }
    }

    let mut root = match stack.pop() {
        Some(root) if stack.is_empty() => root,
        _ => return Err(parse_error(template, "unclosed element")),
    };

    root.children
        .drain(..)
        .find_map(|n| match n {
            XmlNode::Element(el) => Some(el),
            XmlNode::Text(_) => None,
        })
        .ok_or_else(|| parse_error(template, "empty document"))
}

fn push_child(stack: &mut [Element], node: XmlNode, template: &str) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None => Err(parse_error(template, "unbalanced end tag")),
    }
}

/// Split text into literal and `&slot` segments, collapsing whitespace
/// outside of quoted literals.
pub(crate) fn parse_segments(text: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = text.chars().peekable();
    let mut in_quotes = false;
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        if in_quotes {
            literal.push(c);
            if c == '\'' {
                in_quotes = false;
            }
            continue;
        }

        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            if !literal.is_empty() || !segments.is_empty() {
                literal.push(' ');
            }
            pending_space = false;
        }

        match c {
            '\'' => {
                in_quotes = true;
                literal.push(c);
            }
            '&' if chars
                .peek()
                .is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') =>
            {
                let mut slot = String::new();
                while let Some(n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || *n == '_' {
                        slot.push(*n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Slot(slot));
            }
            _ => literal.push(c),
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

fn parse_condition(el: &Element) -> Condition {
    Condition::parse(el.attr("group").unwrap_or_default())
}

fn parse_body(el: &Element, template: &str) -> Result<Vec<Node>> {
    let mut body = Vec::new();
    for child in &el.children {
        match child {
            XmlNode::Text(text) => {
                body.extend(parse_segments(text).into_iter().map(Node::Segment));
            }
            XmlNode::Element(child) if child.name == "where" || child.name == "having" => {
                body.push(Node::Clause(parse_clause(child, template)?));
            }
            XmlNode::Element(child) => {
                return Err(parse_error(
                    template,
                    format!("unexpected <{}> inside <{}>", child.name, el.name),
                ));
            }
        }
    }
    Ok(body)
}

fn parse_clause(el: &Element, template: &str) -> Result<Clause> {
    let kind = match el.name.as_str() {
        "select" => {
            let alias = el
                .attr("alias")
                .ok_or_else(|| parse_error(template, "<select> without alias"))?;
            ClauseKind::Select {
                alias: alias.to_ascii_lowercase(),
                column: ColumnKind::parse(el.attr("type")),
            }
        }
        "from" => ClauseKind::From {
            alias: el.attr("alias").map(|a| a.to_string()),
            join: el.attr("join").is_some_and(|j| j.eq_ignore_ascii_case("true")),
        },
        "where" => ClauseKind::Where {
            operator: el.attr("operator").unwrap_or("AND").to_ascii_uppercase(),
        },
        "having" => ClauseKind::Having {
            operator: el.attr("operator").unwrap_or("AND").to_ascii_uppercase(),
        },
        "groupby" => ClauseKind::GroupBy,
        "orderby" => ClauseKind::OrderBy {
            direction: el.attr("direction").map(|d| d.to_ascii_uppercase()),
        },
        "injection" => ClauseKind::Injection {
            name: el
                .attr("name")
                .ok_or_else(|| parse_error(template, "<injection> without name"))?
                .to_string(),
        },
        other => {
            return Err(parse_error(template, format!("unknown element <{other}>")));
        }
    };

    if let ClauseKind::Where { operator } | ClauseKind::Having { operator } = &kind {
        if operator != "AND" && operator != "OR" {
            return Err(parse_error(template, format!("invalid operator '{operator}'")));
        }
    }

    Ok(Clause {
        kind,
        condition: parse_condition(el),
        body: parse_body(el, template)?,
    })
}

/// Parse a template document.
pub fn parse_template(name: &str, xml: &str) -> Result<QueryTemplate> {
    let root = read_document(name, xml)?;
    if root.name != "query" {
        return Err(parse_error(name, format!("expected <query>, got <{}>", root.name)));
    }

    let kind = match root.attr("type").unwrap_or("select") {
        t if t.eq_ignore_ascii_case("select") => QueryKind::Select,
        t if t.eq_ignore_ascii_case("create") => {
            let table = root
                .attr("table")
                .ok_or_else(|| parse_error(name, "create query without table"))?;
            QueryKind::Create {
                table: parse_segments(table),
            }
        }
        other => return Err(parse_error(name, format!("unknown query type '{other}'"))),
    };

    let distinct = root
        .attr("option")
        .is_some_and(|o| o.eq_ignore_ascii_case("DISTINCT"));

    let mut clauses = Vec::new();
    for child in &root.children {
        match child {
            XmlNode::Element(el) => clauses.push(parse_clause(el, name)?),
            XmlNode::Text(text) => {
                return Err(parse_error(name, format!("unexpected text '{}'", text.trim())));
            }
        }
    }

    Ok(QueryTemplate {
        name: name.to_string(),
        kind,
        distinct,
        clauses,
    })
}
