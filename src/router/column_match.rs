//! Column-Match Router
//!
//! The expression is one `COLUMN=value` or `COLUMN!=value` per line. The
//! column is read from the change's values (`OLD_COLUMN` for previous
//! values). The value is one of:
//!
//! - a literal, compared as text; `NULL` matches a null or absent column
//! - `:OTHER_COLUMN`, another column of the same row
//! - `:NODE_ID`, `:EXTERNAL_ID`, `:NODE_GROUP_ID`, an attribute of each candidate
//! - `:REDIRECT_NODE`, the node the column's value is redirected to
//!
//! Each line selects nodes on its own and the results are unioned.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rusqlite::Connection;

use super::{all_nodes, DataRouter, RouteInput};
use crate::config::RouterDef;
use crate::error::{Error, Result};
use crate::model::{Node, RowValues};
use crate::routing::RouterContext;
use crate::store::nodes as node_store;

const REDIRECTS_CACHE_KEY: &str = "column.redirects";

/// Right-hand side of a column expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchValue {
    Null,
    Literal(String),
    Column(String),
    NodeId,
    ExternalId,
    NodeGroupId,
    RedirectNode,
}

/// One parsed expression line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnExpression {
    pub column: String,
    pub negate: bool,
    pub value: MatchValue,
}

/// Parse a newline separated expression list
pub fn parse_expressions(expression: &str) -> Result<Vec<ColumnExpression>> {
    let mut parsed = Vec::new();
    for line in expression.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (column, negate, value) = match line.find("!=") {
            Some(pos) => (&line[..pos], true, &line[pos + 2..]),
            None => match line.find('=') {
                Some(pos) => (&line[..pos], false, &line[pos + 1..]),
                None => {
                    return Err(Error::Expression(format!(
                        "column match expression '{}' has no '=' or '!='",
                        line
                    )))
                }
            },
        };

        let column = column.trim();
        if column.is_empty() {
            return Err(Error::Expression(format!(
                "column match expression '{}' has no column",
                line
            )));
        }

        let value = value.trim();
        let value = match value {
            "NULL" => MatchValue::Null,
            ":NODE_ID" => MatchValue::NodeId,
            ":EXTERNAL_ID" => MatchValue::ExternalId,
            ":NODE_GROUP_ID" => MatchValue::NodeGroupId,
            ":REDIRECT_NODE" => MatchValue::RedirectNode,
            other => match other.strip_prefix(':') {
                Some(name) if !name.is_empty() => MatchValue::Column(name.to_uppercase()),
                _ => MatchValue::Literal(other.to_string()),
            },
        };

        parsed.push(ColumnExpression {
            column: column.to_uppercase(),
            negate,
            value,
        });
    }

    if parsed.is_empty() {
        return Err(Error::Expression("column match router has an empty expression".to_string()));
    }
    Ok(parsed)
}

impl ColumnExpression {
    /// Nodes this line selects
    fn select(&self, values: &RowValues, nodes: &[Node], redirects: &HashMap<String, String>) -> BTreeSet<String> {
        let column_value = values.get(&self.column);
        match &self.value {
            MatchValue::Null => self.whole_group(nodes, column_value.is_none()),
            MatchValue::Literal(literal) => self.whole_group(nodes, column_value == Some(literal.as_str())),
            MatchValue::Column(other) => self.whole_group(nodes, column_value == values.get(other)),
            MatchValue::NodeId => self.by_node(nodes, |n| column_value == Some(n.node_id.as_str())),
            MatchValue::ExternalId => self.by_node(nodes, |n| column_value == Some(n.external_id.as_str())),
            MatchValue::NodeGroupId => self.by_node(nodes, |n| column_value == Some(n.node_group_id.as_str())),
            MatchValue::RedirectNode => {
                let target = column_value.and_then(|v| redirects.get(v)).map(String::as_str);
                self.by_node(nodes, |n| target == Some(n.node_id.as_str()))
            }
        }
    }

    /// Every candidate or none, for comparisons that do not involve a node
    fn whole_group(&self, nodes: &[Node], matched: bool) -> BTreeSet<String> {
        if matched != self.negate {
            all_nodes(nodes)
        } else {
            BTreeSet::new()
        }
    }

    fn by_node(&self, nodes: &[Node], matches: impl Fn(&Node) -> bool) -> BTreeSet<String> {
        nodes
            .iter()
            .filter(|n| matches(n) != self.negate)
            .map(|n| n.node_id.clone())
            .collect()
    }
}

pub struct ColumnMatchRouter;

impl DataRouter for ColumnMatchRouter {
    fn router_type(&self) -> &'static str {
        "column"
    }

    fn validate(&self, router: &RouterDef) -> Result<()> {
        parse_expressions(router.expression())
            .map(|_| ())
            .map_err(|e| Error::Config(format!("Router '{}': {}", router.id, e)))
    }

    fn route(
        &self,
        ctx: &mut RouterContext,
        conn: &Connection,
        input: &RouteInput<'_>,
        nodes: &[Node],
        _initial_load: bool,
    ) -> Result<BTreeSet<String>> {
        let key = format!("column.{}", input.router.id);
        let expressions = ctx.get_or_try_insert_with(&key, || parse_expressions(input.router.expression()))?;

        let needs_redirects = expressions.iter().any(|e| e.value == MatchValue::RedirectNode);
        let redirects = if needs_redirects {
            ctx.get_or_try_insert_with(REDIRECTS_CACHE_KEY, || node_store::redirects(conn))?
        } else {
            Arc::new(HashMap::new())
        };

        let mut selected = BTreeSet::new();
        for expression in expressions.iter() {
            selected.extend(expression.select(input.values, nodes, &redirects));
        }
        Ok(selected)
    }
}
