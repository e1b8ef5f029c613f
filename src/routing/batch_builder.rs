//! Batch Builder
//!
//! Turns the ascending stream of routed changes for one channel into
//! outgoing batches, one open batch per target node. The channel's batch
//! algorithm decides where a batch is cut:
//!
//! - `default`: at the max size, but only between transactions
//! - `transactional`: at every transaction change
//! - `nontransactional`: at the max size
//!
//! Rows without a transaction id are cut as `nontransactional`.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::Connection;

use crate::config::{BatchAlgorithm, ChannelConfig};
use crate::error::Result;
use crate::model::{
    ChangeRecord, DataId, OutgoingBatch, RouteDecision, UNKNOWN_ROUTER_ID, UNROUTED_NODE_ID,
};
use crate::store::batches;

/// A batch still accepting events
struct OpenBatch {
    batch: OutgoingBatch,
    /// (change id, router id) in append order
    events: Vec<(DataId, String)>,
    last_transaction_id: Option<String>,
}

impl OpenBatch {
    fn new(node_id: &str, channel_id: &str) -> Self {
        Self {
            batch: OutgoingBatch::new(node_id, channel_id),
            events: Vec::new(),
            last_transaction_id: None,
        }
    }
}

/// Decide whether `open` must be cut before appending a row of `transaction_id`
pub fn should_cut(
    algorithm: BatchAlgorithm,
    max_batch_size: usize,
    event_count: usize,
    last_transaction_id: Option<&str>,
    transaction_id: Option<&str>,
) -> bool {
    match (algorithm, transaction_id) {
        (BatchAlgorithm::Nontransactional, _) | (_, None) => event_count >= max_batch_size,
        (BatchAlgorithm::Default, Some(txn)) => {
            event_count >= max_batch_size && last_transaction_id != Some(txn)
        }
        (BatchAlgorithm::Transactional, Some(txn)) => {
            event_count > 0 && last_transaction_id != Some(txn)
        }
    }
}

/// Totals for one channel pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSummary {
    pub batches: u64,
    pub data_events: u64,
    pub unrouted_events: u64,
    /// Highest change id written to a batch
    pub last_data_id: Option<DataId>,
}

/// Builds and persists batches for one channel pass
pub struct BatchBuilder {
    channel_id: String,
    algorithm: BatchAlgorithm,
    max_batch_size: usize,
    open: BTreeMap<String, OpenBatch>,
    /// Batches per node, flushed and open
    batch_counts: BTreeMap<String, usize>,
    summary: BuildSummary,
}

impl BatchBuilder {
    pub fn new(channel: &ChannelConfig) -> Self {
        Self {
            channel_id: channel.id.clone(),
            algorithm: channel.batch_algorithm,
            max_batch_size: channel.max_batch_size.max(1),
            open: BTreeMap::new(),
            batch_counts: BTreeMap::new(),
            summary: BuildSummary::default(),
        }
    }

    /// Append one change to the batches of the nodes its routers selected
    ///
    /// Each node receives the change once, attributed to the first router
    /// that selected it. A change nobody selected is recorded once against
    /// the unrouted node. Returns the number of events appended.
    pub fn add(&mut self, conn: &Connection, change: &ChangeRecord, decisions: &[RouteDecision]) -> Result<usize> {
        let mut targets: Vec<(&str, &str)> = Vec::new();
        let mut seen = BTreeSet::new();
        for decision in decisions {
            for node_id in &decision.node_ids {
                if seen.insert(node_id.as_str()) {
                    targets.push((node_id.as_str(), decision.router_id.as_str()));
                }
            }
        }

        if targets.is_empty() {
            let router_id = decisions
                .first()
                .map(|d| d.router_id.as_str())
                .unwrap_or(UNKNOWN_ROUTER_ID);
            targets.push((UNROUTED_NODE_ID, router_id));
            self.summary.unrouted_events += 1;
        }

        for (node_id, router_id) in &targets {
            self.append(conn, node_id, router_id, change)?;
        }
        Ok(targets.len())
    }

    fn append(&mut self, conn: &Connection, node_id: &str, router_id: &str, change: &ChangeRecord) -> Result<()> {
        let cut = self.open.get(node_id).map(|open| {
            should_cut(
                self.algorithm,
                self.max_batch_size,
                open.events.len(),
                open.last_transaction_id.as_deref(),
                change.transaction_id.as_deref(),
            )
        });

        match cut {
            Some(true) => {
                if let Some(full) = self.open.remove(node_id) {
                    self.flush(conn, full)?;
                }
                self.open_batch(node_id);
            }
            Some(false) => {}
            None => self.open_batch(node_id),
        }

        if let Some(open) = self.open.get_mut(node_id) {
            open.batch.increment(change.event_type, change.payload_size());
            open.events.push((change.id, router_id.to_string()));
            open.last_transaction_id = change.transaction_id.clone();
        }
        self.summary.data_events += 1;
        Ok(())
    }

    fn open_batch(&mut self, node_id: &str) {
        self.open.insert(node_id.to_string(), OpenBatch::new(node_id, &self.channel_id));
        *self.batch_counts.entry(node_id.to_string()).or_insert(0) += 1;
    }

    fn flush(&mut self, conn: &Connection, mut open: OpenBatch) -> Result<()> {
        if open.events.is_empty() {
            return Ok(());
        }

        let batch_id = batches::insert_batch(conn, &mut open.batch)?;
        batches::insert_data_events(conn, batch_id, &open.events)?;

        let last_id = open.events.iter().map(|(id, _)| *id).max();
        if let Some(last_id) = last_id {
            batches::advance_last_routed_id(conn, &self.channel_id, last_id)?;
            self.summary.last_data_id = self.summary.last_data_id.max(Some(last_id));
        }
        self.summary.batches += 1;

        tracing::debug!(
            "Flushed batch {} for node {} on channel {}: {} events, {} bytes, status {}",
            batch_id,
            open.batch.node_id,
            self.channel_id,
            open.batch.data_event_count,
            open.batch.byte_count,
            open.batch.status
        );
        Ok(())
    }

    /// Most batches any single delivering node has in this pass
    pub fn max_batches_per_node(&self) -> usize {
        self.batch_counts
            .iter()
            .filter(|(node_id, _)| node_id.as_str() != UNROUTED_NODE_ID)
            .map(|(_, count)| *count)
            .max()
            .unwrap_or(0)
    }

    /// Flush every open batch
    pub fn finish(mut self, conn: &Connection) -> Result<BuildSummary> {
        let open = std::mem::take(&mut self.open);
        for (_, batch) in open {
            self.flush(conn, batch)?;
        }
        Ok(self.summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BatchStatus;
    use crate::store::batches as batch_store;
    use crate::test_support::{change_record, open_store};

    fn channel(algorithm: BatchAlgorithm, max: usize) -> ChannelConfig {
        let mut channel = ChannelConfig::new("testChannel");
        channel.batch_algorithm = algorithm;
        channel.max_batch_size = max;
        channel
    }

    fn to(node: &str) -> Vec<RouteDecision> {
        vec![RouteDecision::new("r1", [node.to_string()].into_iter().collect())]
    }

    #[test]
    fn test_cut_rules() {
        use BatchAlgorithm::*;
        // default never cuts inside a transaction
        assert!(!should_cut(Default, 2, 5, Some("a"), Some("a")));
        assert!(should_cut(Default, 2, 2, Some("a"), Some("b")));
        assert!(!should_cut(Default, 2, 1, Some("a"), Some("b")));
        // transactional cuts at every transaction change
        assert!(should_cut(Transactional, 100, 1, Some("a"), Some("b")));
        assert!(!should_cut(Transactional, 1, 50, Some("a"), Some("a")));
        // nontransactional only looks at size
        assert!(should_cut(Nontransactional, 5, 5, Some("a"), Some("a")));
        // no transaction id behaves as nontransactional
        assert!(should_cut(Transactional, 3, 3, None, None));
        assert!(!should_cut(Transactional, 3, 2, Some("a"), None));
    }

    #[tokio::test]
    async fn test_default_keeps_transaction_together() {
        let (_dir, store) = open_store().await;
        let conn = store.lock().await;
        let mut builder = BatchBuilder::new(&channel(BatchAlgorithm::Default, 5));
        for id in 1..=12 {
            builder.add(&conn, &change_record(id, Some("tx1")), &to("00001")).unwrap();
        }
        for id in 13..=14 {
            builder.add(&conn, &change_record(id, Some("tx2")), &to("00001")).unwrap();
        }
        let summary = builder.finish(&conn).unwrap();
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.data_events, 14);

        let batches = batch_store::for_node(&conn, "00001", "testChannel").unwrap();
        assert_eq!(batches[0].data_event_count, 12);
        assert_eq!(batches[1].data_event_count, 2);
        assert_eq!(batch_store::last_routed_id(&conn, "testChannel").unwrap(), Some(14));
    }

    #[tokio::test]
    async fn test_nontransactional_splits_transaction() {
        let (_dir, store) = open_store().await;
        let conn = store.lock().await;
        let mut builder = BatchBuilder::new(&channel(BatchAlgorithm::Nontransactional, 5));
        for id in 1..=12 {
            builder.add(&conn, &change_record(id, Some("tx1")), &to("00001")).unwrap();
        }
        assert_eq!(builder.max_batches_per_node(), 3);
        assert_eq!(builder.finish(&conn).unwrap().batches, 3);
    }

    #[tokio::test]
    async fn test_transactional_interleaved_transactions() {
        let (_dir, store) = open_store().await;
        let conn = store.lock().await;
        let mut builder = BatchBuilder::new(&channel(BatchAlgorithm::Transactional, 1000));
        for (id, txn) in [(1, "a"), (2, "a"), (3, "b"), (4, "a")] {
            builder.add(&conn, &change_record(id, Some(txn)), &to("00001")).unwrap();
        }
        builder.finish(&conn).unwrap();

        let batches = batch_store::for_node(&conn, "00001", "testChannel").unwrap();
        let counts: Vec<u64> = batches.iter().map(|b| b.data_event_count).collect();
        assert_eq!(counts, vec![2, 1, 1]);
        let events = batch_store::data_events(&conn, batches[0].batch_id).unwrap();
        assert_eq!(events.iter().map(|e| e.data_id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_first_router_wins_and_unrouted() {
        let (_dir, store) = open_store().await;
        let conn = store.lock().await;
        let mut builder = BatchBuilder::new(&channel(BatchAlgorithm::Default, 100));

        let decisions = vec![
            RouteDecision::new("r1", ["00001".to_string()].into_iter().collect()),
            RouteDecision::new("r2", ["00001".to_string(), "00002".to_string()].into_iter().collect()),
        ];
        assert_eq!(builder.add(&conn, &change_record(1, Some("tx")), &decisions).unwrap(), 2);
        assert_eq!(
            builder
                .add(&conn, &change_record(2, Some("tx")), &[RouteDecision::unrouted("r3")])
                .unwrap(),
            1
        );
        assert_eq!(builder.add(&conn, &change_record(3, Some("tx")), &[]).unwrap(), 1);
        let summary = builder.finish(&conn).unwrap();
        assert_eq!(summary.unrouted_events, 2);

        let first = batch_store::for_node(&conn, "00001", "testChannel").unwrap();
        let events = batch_store::data_events(&conn, first[0].batch_id).unwrap();
        assert_eq!(events[0].router_id, "r1");

        let second = batch_store::for_node(&conn, "00002", "testChannel").unwrap();
        let events = batch_store::data_events(&conn, second[0].batch_id).unwrap();
        assert_eq!(events[0].router_id, "r2");

        let unrouted = batch_store::for_node(&conn, UNROUTED_NODE_ID, "testChannel").unwrap();
        assert_eq!(unrouted.len(), 1);
        assert_eq!(unrouted[0].status, BatchStatus::Ok);
        let events = batch_store::data_events(&conn, unrouted[0].batch_id).unwrap();
        let routers: Vec<&str> = events.iter().map(|e| e.router_id.as_str()).collect();
        assert_eq!(routers, vec!["r3", UNKNOWN_ROUTER_ID]);
    }
}
