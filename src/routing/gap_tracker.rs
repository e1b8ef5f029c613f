//! Gap Tracker
//!
//! Change ids are minted in order but commit out of order, so a lower id
//! can land in the change log after a higher one has been routed. The gap
//! table records every id range not yet confirmed examined. Readers only
//! look inside active gaps, and a gap is only retired on positive
//! evidence: ids were found in it, or no transaction that could still
//! write into it is open.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::error::Result;
use crate::model::{now_millis, DataGap, DataId, GapStatus, OPEN_END};
use crate::platform::TransactionVisibility;
use crate::store::{changes, gaps};

/// Slack added to the lower edge time when asking about open transactions
const EDGE_GRACE_MS: i64 = 1000;

/// What the platform said about open transactions for this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilitySnapshot {
    /// The platform cannot list transactions; fall back to gap age
    Unsupported,
    /// The platform answered; `None` means no transaction is open
    Known(Option<DateTime<Utc>>),
    /// The platform failed to answer; no gap is skipped this cycle
    Unavailable,
}

/// How far one channel pass got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCoverage {
    /// Every gap id of the channel at or below this was examined
    Through(DataId),
    /// The pass was rolled back; none of the channel's rows count
    Failed,
}

/// What the cycle's channel passes confirmed, per channel
#[derive(Debug, Clone, Default)]
pub struct CoverageEvidence {
    channels: HashMap<String, ChannelCoverage>,
}

impl CoverageEvidence {
    pub fn new() -> Self {
        Self::default()
    }

    /// The pass on `channel_id` saw every gap id of its channel at or below `through`
    pub fn record(&mut self, channel_id: &str, through: DataId) {
        self.channels.insert(channel_id.to_string(), ChannelCoverage::Through(through));
    }

    /// The pass on `channel_id` failed; its rows stay in active gaps
    pub fn record_failure(&mut self, channel_id: &str) {
        self.channels.insert(channel_id.to_string(), ChannelCoverage::Failed);
    }

    /// `None` when no pass ran for the channel this cycle
    pub fn coverage(&self, channel_id: &str) -> Option<ChannelCoverage> {
        self.channels.get(channel_id).copied()
    }

    /// Whether a change log row no longer needs a gap around it
    ///
    /// Rows of channels no pass ran for are not routed by this node and
    /// count as consumed.
    pub fn confirms(&self, channel_id: &str, id: DataId) -> bool {
        match self.coverage(channel_id) {
            None => true,
            Some(ChannelCoverage::Through(through)) => id <= through,
            Some(ChannelCoverage::Failed) => false,
        }
    }
}

/// Gap table changes made by one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub filled: usize,
    pub skipped: usize,
    pub created: usize,
    pub purged: usize,
    /// Rows consumed on channels this node does not route
    pub ignored: usize,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Maintains the gap table
pub struct GapTracker {
    visibility: Arc<dyn TransactionVisibility>,
    stale_gap_threshold: Duration,
    /// Filled and skipped gaps older than this are purged; zero keeps them
    retention: Duration,
}

impl GapTracker {
    pub fn new(visibility: Arc<dyn TransactionVisibility>, stale_gap_threshold: Duration, retention: Duration) -> Self {
        Self {
            visibility,
            stale_gap_threshold,
            retention,
        }
    }

    /// Name of the platform answering visibility queries
    pub fn platform_name(&self) -> &'static str {
        self.visibility.name()
    }

    /// Ask the platform about open transactions
    pub async fn snapshot(&self) -> VisibilitySnapshot {
        if !self.visibility.supports_visibility() {
            return VisibilitySnapshot::Unsupported;
        }
        match self.visibility.earliest_open_transaction().await {
            Ok(earliest) => VisibilitySnapshot::Known(earliest),
            Err(e) => {
                tracing::warn!(
                    "Transaction visibility query on {} failed, not skipping gaps this cycle: {}",
                    self.visibility.name(),
                    e
                );
                VisibilitySnapshot::Unavailable
            }
        }
    }

    /// Active gaps in ascending order, creating the open gap if none exists
    pub fn load(&self, conn: &Connection) -> Result<Vec<DataGap>> {
        let active = gaps::active(conn)?;
        if active.iter().any(|g| g.is_open_ended()) {
            return Ok(active);
        }

        let start = gaps::all(conn)?
            .iter()
            .map(|g| if g.is_open_ended() { g.start_id } else { g.end_id.saturating_add(1) })
            .max()
            .unwrap_or(1);
        let gap = DataGap::open(start);
        tracing::info!("Creating open gap {}", gap);
        gaps::insert(conn, &gap)?;
        gaps::active(conn)
    }

    /// Retire, split and skip gaps using the evidence of a routing cycle
    ///
    /// `active` is the gap list the cycle's readers were given. Runs inside
    /// the cycle's write transaction, so the change log holds exactly the
    /// rows the readers saw. A row is consumed when its channel's pass
    /// confirmed it; rows of failed or unfinished passes stay inside gaps.
    pub fn reconcile(
        &self,
        conn: &Connection,
        active: &[DataGap],
        evidence: &CoverageEvidence,
        visibility: VisibilitySnapshot,
        now: DateTime<Utc>,
    ) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        let mut open_gap_remains = false;
        let mut max_done: Option<DataId> = None;
        let mut ignored: BTreeMap<String, usize> = BTreeMap::new();

        for gap in active {
            let rows = changes::ids_in_range(conn, gap.start_id, gap.end_id)?;
            let mut done = Vec::with_capacity(rows.len());
            for (id, channel_id) in &rows {
                if !evidence.confirms(channel_id, *id) {
                    continue;
                }
                if evidence.coverage(channel_id).is_none() {
                    *ignored.entry(channel_id.clone()).or_default() += 1;
                }
                done.push(*id);
            }

            if done.is_empty() {
                if gap.is_open_ended() {
                    open_gap_remains = true;
                } else if rows.is_empty() && self.may_skip(conn, gap, visibility, now)? {
                    tracing::info!("Skipping gap {} with no changes", gap);
                    gaps::set_status(conn, gap.start_id, gap.end_id, GapStatus::Skip)?;
                    summary.skipped += 1;
                }
                continue;
            }

            gaps::set_status(conn, gap.start_id, gap.end_id, GapStatus::Filled)?;
            summary.filled += 1;

            // Holes between consumed rows; rows still pending sit inside them
            let mut next = gap.start_id;
            for id in &done {
                if *id > next {
                    gaps::insert(conn, &DataGap::new(next, id - 1))?;
                    summary.created += 1;
                }
                next = id + 1;
            }
            max_done = max_done.max(done.last().copied());

            // An open gap's tail is replaced by the new open gap below
            if !gap.is_open_ended() && next <= gap.end_id {
                gaps::insert(conn, &DataGap::new(next, gap.end_id))?;
                summary.created += 1;
            }
        }

        for (channel_id, count) in &ignored {
            tracing::info!("Consumed {} changes on channel {}, which this node does not route", count, channel_id);
            summary.ignored += count;
        }

        if !open_gap_remains {
            if let Some(max) = max_done {
                gaps::insert(conn, &DataGap::open(max + 1))?;
                summary.created += 1;
            }
        }

        if !self.retention.is_zero() {
            let cutoff = now_millis() - self.retention.as_millis() as i64;
            summary.purged = gaps::purge(conn, cutoff)?;
        }

        if !summary.is_empty() {
            tracing::debug!(
                "Gap reconcile: {} filled, {} skipped, {} created, {} purged",
                summary.filled,
                summary.skipped,
                summary.created,
                summary.purged
            );
        }
        Ok(summary)
    }

    /// Whether an examined, empty, closed gap can be skipped
    fn may_skip(
        &self,
        conn: &Connection,
        gap: &DataGap,
        visibility: VisibilitySnapshot,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match visibility {
            VisibilitySnapshot::Unavailable => Ok(false),
            VisibilitySnapshot::Unsupported => {
                let age = gap.age(now).to_std().unwrap_or(Duration::ZERO);
                Ok(age >= self.stale_gap_threshold)
            }
            VisibilitySnapshot::Known(None) => Ok(true),
            VisibilitySnapshot::Known(Some(earliest_open)) => {
                let edge = if gap.start_id > 0 {
                    changes::create_time_of(conn, gap.start_id - 1)?
                } else {
                    None
                };
                let edge = edge.unwrap_or(gap.create_time);
                Ok(earliest_open >= edge + chrono::Duration::milliseconds(EDGE_GRACE_MS))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NoVisibility;
    use crate::test_support::{insert_change, insert_change_at, open_store, CHANNEL};

    fn tracker(stale: Duration) -> GapTracker {
        GapTracker::new(Arc::new(NoVisibility), stale, Duration::ZERO)
    }

    fn ranges(gaps: &[DataGap]) -> Vec<(DataId, DataId)> {
        gaps.iter().map(|g| (g.start_id, g.end_id)).collect()
    }

    #[tokio::test]
    async fn test_load_creates_initial_open_gap() {
        let (_dir, store) = open_store().await;
        let conn = store.lock().await;
        let active = tracker(Duration::from_secs(60)).load(&conn).unwrap();
        assert_eq!(ranges(&active), vec![(1, OPEN_END)]);
        // Loading again does not add a second one
        assert_eq!(tracker(Duration::from_secs(60)).load(&conn).unwrap().len(), 1);
    }

    fn seed(conn: &Connection, channel: &str, ids: impl IntoIterator<Item = DataId>) {
        for id in ids {
            insert_change(conn, id, channel, None, "00001");
        }
    }

    #[tokio::test]
    async fn test_found_ids_split_holes() {
        let (_dir, store) = open_store().await;
        let conn = store.lock().await;
        let t = tracker(Duration::from_secs(60));
        gaps::insert(&conn, &DataGap::open(10)).unwrap();
        let active = t.load(&conn).unwrap();
        seed(&conn, CHANNEL, [10, 11, 15]);

        let mut evidence = CoverageEvidence::new();
        evidence.record(CHANNEL, OPEN_END);
        let summary = t
            .reconcile(&conn, &active, &evidence, VisibilitySnapshot::Unsupported, Utc::now())
            .unwrap();

        assert_eq!(summary.filled, 1);
        assert_eq!(ranges(&gaps::active(&conn).unwrap()), vec![(12, 14), (16, OPEN_END)]);
    }

    #[tokio::test]
    async fn test_closed_gap_tail_becomes_hole() {
        let (_dir, store) = open_store().await;
        let conn = store.lock().await;
        let t = tracker(Duration::from_secs(60));
        gaps::insert(&conn, &DataGap::new(5, 9)).unwrap();
        gaps::insert(&conn, &DataGap::open(20)).unwrap();
        let active = t.load(&conn).unwrap();
        seed(&conn, CHANNEL, [6]);

        let mut evidence = CoverageEvidence::new();
        evidence.record(CHANNEL, OPEN_END);
        t.reconcile(&conn, &active, &evidence, VisibilitySnapshot::Unsupported, Utc::now())
            .unwrap();

        assert_eq!(ranges(&gaps::active(&conn).unwrap()), vec![(5, 5), (7, 9), (20, OPEN_END)]);
    }

    #[tokio::test]
    async fn test_unfinished_pass_keeps_its_remainder() {
        let (_dir, store) = open_store().await;
        let conn = store.lock().await;
        let t = tracker(Duration::from_secs(60));
        let active = t.load(&conn).unwrap();
        seed(&conn, CHANNEL, 1..=50);

        let mut evidence = CoverageEvidence::new();
        evidence.record(CHANNEL, 30);
        t.reconcile(&conn, &active, &evidence, VisibilitySnapshot::Unsupported, Utc::now())
            .unwrap();
        assert_eq!(ranges(&gaps::active(&conn).unwrap()), vec![(31, OPEN_END)]);

        // A finished channel past the remainder retires its own rows only
        seed(&conn, "config", [51]);
        evidence.record("config", OPEN_END);
        let active = t.load(&conn).unwrap();
        t.reconcile(&conn, &active, &evidence, VisibilitySnapshot::Unsupported, Utc::now())
            .unwrap();
        assert_eq!(ranges(&gaps::active(&conn).unwrap()), vec![(31, 50), (52, OPEN_END)]);
    }

    #[tokio::test]
    async fn test_failed_channel_withholds_only_its_rows() {
        let (_dir, store) = open_store().await;
        let conn = store.lock().await;
        let t = tracker(Duration::ZERO);
        gaps::insert(&conn, &DataGap::new(1, 3)).unwrap();
        let active = t.load(&conn).unwrap();
        assert_eq!(ranges(&active), vec![(1, 3), (4, OPEN_END)]);
        seed(&conn, CHANNEL, [1, 3, 6]);
        seed(&conn, "config", [2, 5]);

        let mut evidence = CoverageEvidence::new();
        evidence.record(CHANNEL, OPEN_END);
        evidence.record_failure("config");
        assert!(!evidence.confirms("config", 2));
        t.reconcile(&conn, &active, &evidence, VisibilitySnapshot::Unsupported, Utc::now())
            .unwrap();
        assert_eq!(ranges(&gaps::active(&conn).unwrap()), vec![(2, 2), (4, 5), (7, OPEN_END)]);

        // Holes holding withheld rows are never skipped, however old
        let active = t.load(&conn).unwrap();
        let summary = t
            .reconcile(&conn, &active, &evidence, VisibilitySnapshot::Known(None), Utc::now())
            .unwrap();
        assert_eq!(summary.skipped, 0);
        assert_eq!(ranges(&gaps::active(&conn).unwrap()), vec![(2, 2), (4, 5), (7, OPEN_END)]);
    }

    #[tokio::test]
    async fn test_rows_on_unrouted_channels_are_consumed() {
        let (_dir, store) = open_store().await;
        let conn = store.lock().await;
        let t = tracker(Duration::ZERO);
        let active = t.load(&conn).unwrap();
        seed(&conn, CHANNEL, [1, 3, 5]);
        seed(&conn, "other", [2, 4, 6]);

        let mut evidence = CoverageEvidence::new();
        evidence.record(CHANNEL, OPEN_END);
        let summary = t
            .reconcile(&conn, &active, &evidence, VisibilitySnapshot::Unsupported, Utc::now())
            .unwrap();

        assert_eq!(summary.ignored, 3);
        assert_eq!(summary.created, 1);
        assert_eq!(ranges(&gaps::active(&conn).unwrap()), vec![(7, OPEN_END)]);
    }

    #[tokio::test]
    async fn test_stale_gap_skipped_without_visibility() {
        let (_dir, store) = open_store().await;
        let conn = store.lock().await;
        let mut old = DataGap::new(3, 4);
        old.create_time = Utc::now() - chrono::Duration::minutes(30);
        gaps::insert(&conn, &old).unwrap();
        gaps::insert(&conn, &DataGap::new(7, 8)).unwrap();
        gaps::insert(&conn, &DataGap::open(10)).unwrap();

        let t = tracker(Duration::from_secs(600));
        let active = t.load(&conn).unwrap();
        let evidence = CoverageEvidence::new();
        let summary = t
            .reconcile(&conn, &active, &evidence, VisibilitySnapshot::Unsupported, Utc::now())
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(ranges(&gaps::active(&conn).unwrap()), vec![(7, 8), (10, OPEN_END)]);
    }

    #[tokio::test]
    async fn test_visibility_decides_skip() {
        let (_dir, store) = open_store().await;
        let conn = store.lock().await;
        let edge_time = Utc::now() - chrono::Duration::minutes(5);
        insert_change_at(&conn, 4, edge_time);
        gaps::insert(&conn, &DataGap::new(5, 6)).unwrap();
        gaps::insert(&conn, &DataGap::open(10)).unwrap();

        let t = tracker(Duration::from_secs(3600));
        let active = t.load(&conn).unwrap();
        let evidence = CoverageEvidence::new();

        // A transaction open since before the edge may still write into the gap
        let older = VisibilitySnapshot::Known(Some(edge_time - chrono::Duration::minutes(1)));
        let summary = t.reconcile(&conn, &active, &evidence, older, Utc::now()).unwrap();
        assert_eq!(summary.skipped, 0);

        let unavailable = t
            .reconcile(&conn, &active, &evidence, VisibilitySnapshot::Unavailable, Utc::now())
            .unwrap();
        assert_eq!(unavailable.skipped, 0);

        let newer = VisibilitySnapshot::Known(Some(Utc::now()));
        let summary = t.reconcile(&conn, &active, &evidence, newer, Utc::now()).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(ranges(&gaps::active(&conn).unwrap()), vec![(10, OPEN_END)]);
    }

    #[tokio::test]
    async fn test_open_gap_never_skipped() {
        let (_dir, store) = open_store().await;
        let conn = store.lock().await;
        let mut open = DataGap::open(1);
        open.create_time = Utc::now() - chrono::Duration::days(2);
        gaps::insert(&conn, &open).unwrap();

        let t = tracker(Duration::ZERO);
        let active = t.load(&conn).unwrap();
        let summary = t
            .reconcile(&conn, &active, &CoverageEvidence::new(), VisibilitySnapshot::Known(None), Utc::now())
            .unwrap();
        assert!(summary.is_empty());
        assert_eq!(ranges(&gaps::active(&conn).unwrap()), vec![(1, OPEN_END)]);
    }
}
