//! Shared test fixtures

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use tempfile::{tempdir, TempDir};

use crate::config::{NodeConfig, RouterDef, RouterServiceConfig};
use crate::error::{Error, Result};
use crate::model::{ChangeRecord, DataId, EventType, Node, TriggerHistory};
use crate::platform::TransactionVisibility;
use crate::router::{DataRouter, RouteInput};
use crate::routing::RouterContext;
use crate::store::{changes, nodes, Store};

pub const CHANNEL: &str = "testChannel";
pub const T1_HIST_ID: i64 = 1;

/// Store in a temp dir, seeded with the T1 schema snapshot and three nodes:
/// root `00000` (corp) and stores `00001`, `00002` registered by it
pub async fn open_store() -> (TempDir, Arc<Store>) {
    let dir = tempdir().unwrap();
    let store = Store::open(&dir.path().join("routing.db"), Duration::from_secs(5)).unwrap();
    {
        let conn = store.lock().await;
        changes::insert_trigger_history(&conn, &t1_history()).unwrap();
        nodes::upsert(&conn, &Node::new("00000", "corp", "corp")).unwrap();
        nodes::upsert(&conn, &Node::new("00001", "store", "s1").created_by("00000")).unwrap();
        nodes::upsert(&conn, &Node::new("00002", "store", "s2").created_by("00000")).unwrap();
    }
    (dir, Arc::new(store))
}

pub fn t1_history() -> TriggerHistory {
    TriggerHistory {
        id: T1_HIST_ID,
        trigger_id: "t1".to_string(),
        table_name: "T1".to_string(),
        columns: vec!["ID".to_string(), "ROUTING_VARCHAR".to_string()],
        pk_columns: vec!["ID".to_string()],
    }
}

/// A T1 insert routed by `ROUTING_VARCHAR`
pub fn change_record(id: DataId, txn: Option<&str>) -> ChangeRecord {
    t1_change(id, CHANNEL, txn, "00001")
}

fn t1_change(id: DataId, channel: &str, txn: Option<&str>, routing_varchar: &str) -> ChangeRecord {
    let id_text = id.to_string();
    ChangeRecord {
        id,
        table_name: "T1".to_string(),
        event_type: EventType::Insert,
        row_data: Some(ChangeRecord::encode_values(&[Some(id_text.as_str()), Some(routing_varchar)])),
        pk_data: Some(ChangeRecord::encode_values(&[Some(id_text.as_str())])),
        old_data: None,
        trigger_hist_id: T1_HIST_ID,
        channel_id: channel.to_string(),
        transaction_id: txn.map(str::to_string),
        source_node_id: None,
        create_time: Utc::now(),
        stored_size: None,
    }
}

pub fn insert_change(conn: &Connection, id: DataId, channel: &str, txn: Option<&str>, routing_varchar: &str) {
    changes::insert(conn, &t1_change(id, channel, txn, routing_varchar)).unwrap();
}

pub fn insert_change_at(conn: &Connection, id: DataId, create_time: DateTime<Utc>) {
    let mut change = t1_change(id, CHANNEL, None, "00001");
    change.create_time = create_time;
    changes::insert(conn, &change).unwrap();
}

/// Service configuration for the store at `db_path`, with `body` holding
/// the channel, router and trigger tables
pub fn service_config(db_path: &Path, body: &str) -> RouterServiceConfig {
    let toml = format!(
        r#"
[node]
id = "00000"
group_id = "corp"

[database]
path = "{}"

[routing]
take_timeout_ms = 5000
queue_retry_ms = 1
gap_retention_hours = 0

{}
"#,
        db_path.display(),
        body
    );
    RouterServiceConfig::from_str(&toml).unwrap()
}

/// Visibility platform with a scripted answer
pub struct FixedVisibility {
    pub earliest_open: Option<DateTime<Utc>>,
    pub fail: bool,
}

#[async_trait]
impl TransactionVisibility for FixedVisibility {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn supports_visibility(&self) -> bool {
        true
    }

    async fn earliest_open_transaction(&self) -> Result<Option<DateTime<Utc>>> {
        if self.fail {
            return Err(Error::Internal("visibility unavailable".to_string()));
        }
        Ok(self.earliest_open)
    }
}

/// Runs single changes through a router against a seeded store
pub struct RouterFixture {
    _dir: TempDir,
    pub store: Arc<Store>,
}

impl RouterFixture {
    pub async fn new() -> Self {
        let (dir, store) = open_store().await;
        Self { _dir: dir, store }
    }

    /// Context of the root node
    pub fn context(&self) -> RouterContext {
        self.context_for("00000", "corp")
    }

    pub fn context_for(&self, node_id: &str, group_id: &str) -> RouterContext {
        let node = NodeConfig {
            id: node_id.to_string(),
            group_id: group_id.to_string(),
        };
        RouterContext::new(CHANNEL, &node)
    }

    pub async fn add_node(&self, node: Node) {
        let conn = self.store.lock().await;
        nodes::upsert(&conn, &node).unwrap();
    }

    pub async fn redirect(&self, external_id: &str, node_id: &str) {
        let conn = self.store.lock().await;
        nodes::set_redirect(&conn, external_id, node_id).unwrap();
    }

    /// Enabled nodes of `target_group` other than the routing node
    pub async fn candidates(&self, ctx: &RouterContext, target_group: &str) -> Vec<Node> {
        let conn = self.store.lock().await;
        nodes::all(&conn)
            .unwrap()
            .into_iter()
            .filter(|n| n.sync_enabled && n.node_group_id == target_group && n.node_id != ctx.node_id())
            .collect()
    }

    /// Route a T1 insert with a fresh context through a `corp` to `store` router
    pub async fn route(
        &self,
        router: &dyn DataRouter,
        router_type: &str,
        expression: &str,
        values: &[(&str, Option<&str>)],
    ) -> BTreeSet<String> {
        let def = RouterDef::new("r1", router_type, "corp", "store").with_expression(expression);
        let mut ctx = self.context();
        self.route_insert(&mut ctx, router, &def, values).await.unwrap()
    }

    pub async fn route_insert(
        &self,
        ctx: &mut RouterContext,
        router: &dyn DataRouter,
        def: &RouterDef,
        values: &[(&str, Option<&str>)],
    ) -> Result<BTreeSet<String>> {
        self.route_table(ctx, router, def, "T1", values).await
    }

    /// Route an insert into `table`
    pub async fn route_table(
        &self,
        ctx: &mut RouterContext,
        router: &dyn DataRouter,
        def: &RouterDef,
        table: &str,
        values: &[(&str, Option<&str>)],
    ) -> Result<BTreeSet<String>> {
        let columns: Vec<&str> = values.iter().map(|(c, _)| *c).collect();
        let row: Vec<Option<&str>> = values.iter().map(|(_, v)| *v).collect();
        self.route_change(ctx, router, def, table, EventType::Insert, &columns, &row, None)
            .await
    }

    /// Route a T1 update given `(column, new, old)` triples
    pub async fn route_update(
        &self,
        ctx: &mut RouterContext,
        router: &dyn DataRouter,
        def: &RouterDef,
        values: &[(&str, Option<&str>, Option<&str>)],
    ) -> Result<BTreeSet<String>> {
        let columns: Vec<&str> = values.iter().map(|(c, _, _)| *c).collect();
        let row: Vec<Option<&str>> = values.iter().map(|(_, v, _)| *v).collect();
        let old: Vec<Option<&str>> = values.iter().map(|(_, _, o)| *o).collect();
        self.route_change(ctx, router, def, "T1", EventType::Update, &columns, &row, Some(&old))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn route_change(
        &self,
        ctx: &mut RouterContext,
        router: &dyn DataRouter,
        def: &RouterDef,
        table: &str,
        event_type: EventType,
        columns: &[&str],
        row: &[Option<&str>],
        old: Option<&[Option<&str>]>,
    ) -> Result<BTreeSet<String>> {
        let history = TriggerHistory {
            id: 99,
            trigger_id: "fixture".to_string(),
            table_name: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            pk_columns: columns.iter().take(1).map(|c| c.to_string()).collect(),
        };
        let change = ChangeRecord {
            id: 1,
            table_name: table.to_string(),
            event_type,
            row_data: Some(ChangeRecord::encode_values(row)),
            pk_data: None,
            old_data: old.map(|o| ChangeRecord::encode_values(o)),
            trigger_hist_id: history.id,
            channel_id: CHANNEL.to_string(),
            transaction_id: Some("tx1".to_string()),
            source_node_id: None,
            create_time: Utc::now(),
            stored_size: None,
        };
        let values = change.row_values(&history)?;
        let candidates = self.candidates(ctx, &def.target_group).await;

        let input = RouteInput {
            change: &change,
            history: &history,
            values: &values,
            router: def,
        };
        let conn = self.store.lock().await;
        router.route(ctx, &conn, &input, &candidates, false)
    }
}
