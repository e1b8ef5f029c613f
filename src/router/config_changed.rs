//! Configuration-Changed Router
//!
//! Routes changes to the topology tables (`{prefix}_node`,
//! `{prefix}_channel`, `{prefix}_trigger`, ...) and registers the cache
//! refreshes those changes require once the cycle commits.
//!
//! Rows of the node tables only travel along the registration tree: to
//! the node the row describes, to its ancestors, and to its descendants in
//! a different tier from the routing node. Every other topology table goes
//! to all candidates. Tables outside the prefix are not routed.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use rusqlite::Connection;

use super::{all_nodes, DataRouter, RouteInput};
use crate::error::Result;
use crate::model::Node;
use crate::routing::RouterContext;
use crate::store::nodes as node_store;

const TREE_CACHE_KEY: &str = "configurationChanged.tree";

pub const SYNC_TRIGGERS_HOOK: &str = "sync_triggers";
pub const FLUSH_CHANNELS_HOOK: &str = "flush_channels";
pub const FLUSH_TRANSFORMS_HOOK: &str = "flush_transforms";

/// Receives cache refresh requests after a topology change commits
pub trait ConfigurationListener: Send + Sync {
    /// Trigger, trigger-router or router definitions changed
    fn sync_triggers(&self);

    /// Channel definitions changed
    fn flush_channels(&self);

    /// Transform definitions changed
    fn flush_transforms(&self);
}

/// Listener that only logs the requests
pub struct LoggingListener;

impl ConfigurationListener for LoggingListener {
    fn sync_triggers(&self) {
        tracing::info!("Trigger configuration changed, triggers need a resync");
    }

    fn flush_channels(&self) {
        tracing::info!("Channel configuration changed, channel cache flushed");
    }

    fn flush_transforms(&self) {
        tracing::info!("Transform configuration changed, transform cache flushed");
    }
}

/// What a topology table describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopologyTable {
    /// node, node_security, node_host
    Node,
    Other(Option<&'static str>),
}

/// Registration tree built from the node table
struct NodeTree {
    parents: HashMap<String, String>,
}

impl NodeTree {
    fn new(nodes: &[Node]) -> Self {
        let parents = nodes
            .iter()
            .filter_map(|n| {
                n.created_at_node_id
                    .as_ref()
                    .filter(|parent| **parent != n.node_id)
                    .map(|parent| (n.node_id.clone(), parent.clone()))
            })
            .collect();
        Self { parents }
    }

    /// Nodes above `node_id`, nearest first
    fn ancestors(&self, node_id: &str) -> Vec<&str> {
        let mut seen = HashSet::from([node_id]);
        let mut chain = Vec::new();
        let mut current = node_id;
        while let Some(parent) = self.parents.get(current) {
            if !seen.insert(parent.as_str()) {
                break;
            }
            chain.push(parent.as_str());
            current = parent;
        }
        chain
    }

    fn depth(&self, node_id: &str) -> usize {
        self.ancestors(node_id).len()
    }

    fn is_descendant(&self, node_id: &str, of: &str) -> bool {
        self.ancestors(node_id).contains(&of)
    }
}

pub struct ConfigChangedRouter {
    /// Lowercased `{prefix}_`
    table_prefix: String,
    listener: Arc<dyn ConfigurationListener>,
}

impl ConfigChangedRouter {
    pub fn new(topology_table_prefix: &str, listener: Arc<dyn ConfigurationListener>) -> Self {
        Self {
            table_prefix: format!("{}_", topology_table_prefix.to_lowercase()),
            listener,
        }
    }

    fn classify(&self, table_name: &str) -> Option<TopologyTable> {
        let table = table_name.to_lowercase();
        let suffix = table.strip_prefix(&self.table_prefix)?;
        Some(match suffix {
            "node" | "node_security" | "node_host" => TopologyTable::Node,
            "trigger" | "trigger_router" | "router" => TopologyTable::Other(Some(SYNC_TRIGGERS_HOOK)),
            "channel" => TopologyTable::Other(Some(FLUSH_CHANNELS_HOOK)),
            "transform_table" | "transform_column" => TopologyTable::Other(Some(FLUSH_TRANSFORMS_HOOK)),
            _ => TopologyTable::Other(None),
        })
    }

    fn register_hook(&self, ctx: &mut RouterContext, key: &'static str) {
        let listener = self.listener.clone();
        let hook: Box<dyn FnOnce() + Send> = match key {
            SYNC_TRIGGERS_HOOK => Box::new(move || listener.sync_triggers()),
            FLUSH_CHANNELS_HOOK => Box::new(move || listener.flush_channels()),
            _ => Box::new(move || listener.flush_transforms()),
        };
        if ctx.register_post_commit(key, hook) {
            tracing::debug!("Registered post-commit hook {} on channel {}", key, ctx.channel_id());
        }
    }

    fn route_node_row(
        ctx: &mut RouterContext,
        conn: &Connection,
        subject: Option<&str>,
        nodes: &[Node],
    ) -> Result<BTreeSet<String>> {
        let subject = match subject {
            Some(id) => id,
            None => return Ok(all_nodes(nodes)),
        };

        let tree = ctx.get_or_try_insert_with(TREE_CACHE_KEY, || {
            Ok(NodeTree::new(&node_store::all(conn)?))
        })?;
        let my_depth = tree.depth(ctx.node_id());
        let ancestors = tree.ancestors(subject);

        Ok(nodes
            .iter()
            .filter(|n| {
                n.node_id == subject
                    || ancestors.contains(&n.node_id.as_str())
                    || (tree.is_descendant(&n.node_id, subject) && tree.depth(&n.node_id) != my_depth)
            })
            .map(|n| n.node_id.clone())
            .collect())
    }
}

impl DataRouter for ConfigChangedRouter {
    fn router_type(&self) -> &'static str {
        "configurationChanged"
    }

    fn route(
        &self,
        ctx: &mut RouterContext,
        conn: &Connection,
        input: &RouteInput<'_>,
        nodes: &[Node],
        _initial_load: bool,
    ) -> Result<BTreeSet<String>> {
        match self.classify(&input.change.table_name) {
            None => Ok(BTreeSet::new()),
            Some(TopologyTable::Node) => Self::route_node_row(ctx, conn, input.values.get("NODE_ID"), nodes),
            Some(TopologyTable::Other(hook)) => {
                if let Some(key) = hook {
                    self.register_hook(ctx, key);
                }
                Ok(all_nodes(nodes))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterDef;
    use crate::test_support::RouterFixture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingListener {
        triggers: AtomicUsize,
        channels: AtomicUsize,
        transforms: AtomicUsize,
    }

    impl ConfigurationListener for CountingListener {
        fn sync_triggers(&self) {
            self.triggers.fetch_add(1, Ordering::SeqCst);
        }

        fn flush_channels(&self) {
            self.channels.fetch_add(1, Ordering::SeqCst);
        }

        fn flush_transforms(&self) {
            self.transforms.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn def() -> RouterDef {
        RouterDef::new("config", "configurationChanged", "corp", "store")
    }

    #[test]
    fn test_tree_walk_tolerates_cycles() {
        let nodes = vec![
            Node::new("a", "g", "a").created_by("b"),
            Node::new("b", "g", "b").created_by("a"),
            Node::new("c", "g", "c").created_by("a"),
        ];
        let tree = NodeTree::new(&nodes);
        assert_eq!(tree.ancestors("c"), vec!["a", "b"]);
        assert_eq!(tree.depth("a"), 1);
        assert!(tree.is_descendant("c", "b"));
    }

    #[tokio::test]
    async fn test_node_rows_follow_the_tree() {
        let fixture = RouterFixture::new().await;
        let router = ConfigChangedRouter::new("sym", Arc::new(LoggingListener));
        let mut ctx = fixture.context();

        // A store's own row goes back to that store only
        let routed = fixture
            .route_table(&mut ctx, &router, &def(), "sym_node", &[("NODE_ID", Some("00001"))])
            .await
            .unwrap();
        assert_eq!(routed, ["00001".to_string()].into_iter().collect());

        // The root's row reaches every store below it
        let routed = fixture
            .route_table(&mut ctx, &router, &def(), "SYM_NODE_SECURITY", &[("NODE_ID", Some("00000"))])
            .await
            .unwrap();
        assert_eq!(routed.len(), 2);
    }

    #[tokio::test]
    async fn test_same_tier_descendants_are_skipped() {
        let fixture = RouterFixture::new().await;
        fixture.add_node(Node::new("00003", "store", "s3").created_by("00001")).await;
        let router = ConfigChangedRouter::new("sym", Arc::new(LoggingListener));
        // Store 00002 routes a change to the root's row
        let mut ctx = fixture.context_for("00002", "store");

        let routed = fixture
            .route_table(&mut ctx, &router, &def(), "sym_node", &[("NODE_ID", Some("00000"))])
            .await
            .unwrap();
        // 00001 shares the routing node's tier and already has the change
        assert_eq!(routed, ["00003".to_string()].into_iter().collect());
    }

    #[tokio::test]
    async fn test_topology_tables_register_hooks() {
        let fixture = RouterFixture::new().await;
        let listener = Arc::new(CountingListener::default());
        let router = ConfigChangedRouter::new("sym", listener.clone());
        let mut ctx = fixture.context();

        for table in ["sym_trigger", "sym_router", "sym_channel", "sym_transform_column"] {
            let routed = fixture
                .route_table(&mut ctx, &router, &def(), table, &[("ID", Some("1"))])
                .await
                .unwrap();
            assert_eq!(routed.len(), 2);
        }
        assert_eq!(
            ctx.post_commit_hooks().keys(),
            vec![SYNC_TRIGGERS_HOOK, FLUSH_CHANNELS_HOOK, FLUSH_TRANSFORMS_HOOK]
        );
        // Nothing runs before commit
        assert_eq!(listener.triggers.load(Ordering::SeqCst), 0);

        assert_eq!(ctx.take_post_commit_hooks().run(), 3);
        assert_eq!(listener.triggers.load(Ordering::SeqCst), 1);
        assert_eq!(listener.channels.load(Ordering::SeqCst), 1);
        assert_eq!(listener.transforms.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ordinary_tables_are_not_routed() {
        let fixture = RouterFixture::new().await;
        let router = ConfigChangedRouter::new("sym", Arc::new(LoggingListener));
        let mut ctx = fixture.context();
        let routed = fixture
            .route_table(&mut ctx, &router, &def(), "T1", &[("ID", Some("1"))])
            .await
            .unwrap();
        assert!(routed.is_empty());
        assert!(ctx.post_commit_hooks().is_empty());
    }
}
