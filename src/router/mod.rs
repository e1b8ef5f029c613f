//! Router Strategies
//!
//! A router maps one change and its candidate nodes to the node ids that
//! should receive it. Router definitions name a strategy by type string;
//! the registry resolves that string to an implementation.

pub mod default;
pub mod column_match;
pub mod lookup_table;
pub mod subselect;
pub mod script;
pub mod config_changed;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rusqlite::Connection;

use crate::config::RouterDef;
use crate::error::{Error, Result};
use crate::model::{ChangeRecord, Node, RowValues, TriggerHistory};
use crate::routing::RouterContext;

pub use column_match::ColumnMatchRouter;
pub use config_changed::{ConfigChangedRouter, ConfigurationListener, LoggingListener};
pub use default::DefaultRouter;
pub use lookup_table::LookupTableRouter;
pub use script::{ScriptEngine, ScriptOutcome, ScriptRouter};
pub use subselect::SubselectRouter;

/// Everything a router sees about the change being routed
#[derive(Debug, Clone, Copy)]
pub struct RouteInput<'a> {
    pub change: &'a ChangeRecord,
    pub history: &'a TriggerHistory,
    /// Current values, plus previous values under the `OLD_` prefix
    pub values: &'a RowValues,
    pub router: &'a RouterDef,
}

/// A routing strategy
pub trait DataRouter: Send + Sync {
    /// Type string router definitions use to select this strategy
    fn router_type(&self) -> &'static str;

    /// Check a router definition when the service is built
    fn validate(&self, _router: &RouterDef) -> Result<()> {
        Ok(())
    }

    /// Node ids among `nodes` that should receive the change
    ///
    /// `nodes` holds the candidates: enabled nodes of the router's target
    /// group, minus the routing node and the change's source node.
    fn route(
        &self,
        ctx: &mut RouterContext,
        conn: &Connection,
        input: &RouteInput<'_>,
        nodes: &[Node],
        initial_load: bool,
    ) -> Result<BTreeSet<String>>;
}

/// All candidate node ids
pub fn all_nodes(nodes: &[Node]) -> BTreeSet<String> {
    nodes.iter().map(|n| n.node_id.clone()).collect()
}

/// Router type string to strategy
#[derive(Clone, Default)]
pub struct RouterRegistry {
    routers: HashMap<String, Arc<dyn DataRouter>>,
}

impl RouterRegistry {
    /// Registry without any strategies
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in strategies
    ///
    /// The scripted strategy is only available once an engine is registered
    /// with [`with_script_engine`](Self::with_script_engine).
    pub fn with_builtins(topology_table_prefix: &str, listener: Arc<dyn ConfigurationListener>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(DefaultRouter));
        registry.register(Arc::new(ColumnMatchRouter));
        registry.register(Arc::new(LookupTableRouter));
        registry.register(Arc::new(SubselectRouter));
        registry.register(Arc::new(ConfigChangedRouter::new(topology_table_prefix, listener)));
        registry
    }

    /// Add the scripted strategy backed by `engine`
    pub fn with_script_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.register(Arc::new(ScriptRouter::new(engine)));
        self
    }

    /// Register a strategy under its type string, replacing any previous one
    pub fn register(&mut self, router: Arc<dyn DataRouter>) {
        self.routers.insert(router.router_type().to_string(), router);
    }

    pub fn get(&self, router_type: &str) -> Option<Arc<dyn DataRouter>> {
        self.routers.get(router_type).cloned()
    }

    /// Resolve and validate the strategy for a router definition
    pub fn resolve(&self, router: &RouterDef) -> Result<Arc<dyn DataRouter>> {
        let strategy = self.get(&router.router_type).ok_or_else(|| {
            Error::Config(format!(
                "Router '{}' has unknown type '{}'",
                router.id, router.router_type
            ))
        })?;
        strategy.validate(router)?;
        Ok(strategy)
    }

    /// Registered type strings, sorted
    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.routers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
