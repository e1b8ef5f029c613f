//! Scripted Router
//!
//! Hands the router expression to an embedded script engine along with
//! the row's values (current and `OLD_` prefixed) and the candidate nodes.
//! The script may name target nodes, return a single node id, or return a
//! boolean meaning "all candidates" or "none".

use std::collections::BTreeSet;
use std::sync::Arc;

use rusqlite::Connection;

use super::{all_nodes, DataRouter, RouteInput};
use crate::config::RouterDef;
use crate::error::{Error, Result};
use crate::model::{EventType, Node, RowValues};
use crate::routing::RouterContext;

/// What a script produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// Node ids the script collected
    Targets(BTreeSet<String>),
    /// A single node id
    Node(String),
    /// `true` routes to every candidate, `false` to none
    Bool(bool),
    /// No result
    Nothing,
}

/// Variables visible to a script
#[derive(Debug, Clone, Copy)]
pub struct ScriptBindings<'a> {
    pub values: &'a RowValues,
    pub nodes: &'a [Node],
    /// Node doing the routing
    pub node_id: &'a str,
    pub node_group_id: &'a str,
    pub table_name: &'a str,
    pub event_type: EventType,
    pub initial_load: bool,
}

/// An embedded script engine
pub trait ScriptEngine: Send + Sync {
    /// Engine name, the router type string it registers under
    fn name(&self) -> &'static str;

    /// Check that a script compiles
    fn check(&self, _script: &str) -> Result<()> {
        Ok(())
    }

    fn evaluate(&self, script: &str, bindings: &ScriptBindings<'_>) -> Result<ScriptOutcome>;
}

pub struct ScriptRouter {
    engine: Arc<dyn ScriptEngine>,
}

impl ScriptRouter {
    pub fn new(engine: Arc<dyn ScriptEngine>) -> Self {
        Self { engine }
    }
}

impl DataRouter for ScriptRouter {
    fn router_type(&self) -> &'static str {
        self.engine.name()
    }

    fn validate(&self, router: &RouterDef) -> Result<()> {
        if router.expression().trim().is_empty() {
            return Err(Error::Config(format!("Router '{}': script router needs a script", router.id)));
        }
        self.engine
            .check(router.expression())
            .map_err(|e| Error::Config(format!("Router '{}': {}", router.id, e)))
    }

    fn route(
        &self,
        ctx: &mut RouterContext,
        _conn: &Connection,
        input: &RouteInput<'_>,
        nodes: &[Node],
        initial_load: bool,
    ) -> Result<BTreeSet<String>> {
        let bindings = ScriptBindings {
            values: input.values,
            nodes,
            node_id: ctx.node_id(),
            node_group_id: ctx.node_group_id(),
            table_name: &input.change.table_name,
            event_type: input.change.event_type,
            initial_load,
        };

        let outcome = self
            .engine
            .evaluate(input.router.expression(), &bindings)
            .map_err(|e| match e {
                Error::Script(_) => e,
                other => Error::Script(other.to_string()),
            })?;

        let candidates = all_nodes(nodes);
        Ok(match outcome {
            ScriptOutcome::Targets(ids) => ids.intersection(&candidates).cloned().collect(),
            ScriptOutcome::Node(id) if candidates.contains(&id) => [id].into_iter().collect(),
            ScriptOutcome::Node(_) => BTreeSet::new(),
            ScriptOutcome::Bool(true) => candidates,
            ScriptOutcome::Bool(false) | ScriptOutcome::Nothing => BTreeSet::new(),
        })
    }
}
