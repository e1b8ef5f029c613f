//! Route Decisions

use std::collections::BTreeSet;

/// Nodes one router selected for one change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub router_id: String,
    /// Empty means the router left the change unrouted
    pub node_ids: BTreeSet<String>,
}

impl RouteDecision {
    pub fn new(router_id: &str, node_ids: BTreeSet<String>) -> Self {
        Self {
            router_id: router_id.to_string(),
            node_ids,
        }
    }

    /// A decision that routes nowhere
    pub fn unrouted(router_id: &str) -> Self {
        Self::new(router_id, BTreeSet::new())
    }

    pub fn is_unrouted(&self) -> bool {
        self.node_ids.is_empty()
    }
}
