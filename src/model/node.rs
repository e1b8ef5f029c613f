//! Nodes

use serde::{Deserialize, Serialize};

/// A node changes can be routed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub node_group_id: String,
    pub external_id: String,
    pub sync_enabled: bool,
    /// Node that registered this one; None for the root of the tree
    pub created_at_node_id: Option<String>,
}

impl Node {
    pub fn new(node_id: &str, node_group_id: &str, external_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            node_group_id: node_group_id.to_string(),
            external_id: external_id.to_string(),
            sync_enabled: true,
            created_at_node_id: None,
        }
    }

    /// Set the registering node
    pub fn created_by(mut self, node_id: &str) -> Self {
        self.created_at_node_id = Some(node_id.to_string());
        self
    }
}
