//! Routing Service
//!
//! Runs routing cycles. One cycle routes every enabled channel inside a
//! single store transaction:
//!
//! 1. snapshot transaction visibility (before any lock is taken)
//! 2. load the active gaps, schema snapshots and nodes
//! 3. per channel, inside a savepoint: stream the gap ranges, route each
//!    change, and build batches
//! 4. reconcile the gap table against the change log and what each channel confirmed
//! 5. commit, then run the post-commit hooks the routers registered
//!
//! A failed channel is rolled back to its savepoint and confirms none of
//! its rows, which stay inside active gaps while the rows of the other
//! channels are retired. A failure outside a channel pass rolls back the
//! whole cycle.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::Connection;
use serde::Serialize;
use tokio::sync::Mutex;

use super::batch_builder::BatchBuilder;
use super::context::{PassStats, PostCommitHooks, RouterContext};
use super::gap_tracker::{ChannelCoverage, CoverageEvidence, GapTracker, ReconcileSummary, VisibilitySnapshot};
use super::reader::{ReaderOptions, StreamingReader};
use crate::config::{ChannelConfig, RouterDef, RouterServiceConfig};
use crate::error::Result;
use crate::model::{
    ChangeRecord, DataGap, DataId, EventType, Node, RouteDecision, TriggerHistory, OPEN_END,
};
use crate::platform::TransactionVisibility;
use crate::router::{DataRouter, LoggingListener, RouteInput, RouterRegistry};
use crate::store::changes::{self, PayloadColumns};
use crate::store::{self, nodes as node_store, Store};

const CHANNEL_SAVEPOINT: &str = "channel_pass";

/// Outcome of one routing cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// Stats of every channel pass that committed
    pub channels: Vec<PassStats>,
    /// Channels whose pass failed and was rolled back
    pub failed_channels: Vec<String>,
    pub gaps: ReconcileSummary,
    pub hooks_run: usize,
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn rows_read(&self) -> u64 {
        self.channels.iter().map(|c| c.rows_read).sum()
    }

    pub fn batches(&self) -> u64 {
        self.channels.iter().map(|c| c.batches).sum()
    }
}

/// A router definition with its resolved strategy
#[derive(Clone)]
struct ResolvedRouter {
    def: RouterDef,
    strategy: Arc<dyn DataRouter>,
}

/// What a committed channel pass leaves behind
struct PassOutcome {
    ctx: RouterContext,
    /// Last routed id per transaction
    routed: HashMap<String, DataId>,
}

/// Per-cycle lookups shared by every channel pass
struct CycleData {
    histories: HashMap<i64, TriggerHistory>,
    nodes: Vec<Node>,
}

/// Routes captured changes into outgoing batches
pub struct RouterService {
    config: RouterServiceConfig,
    store: Arc<Store>,
    gap_tracker: GapTracker,
    registry: RouterRegistry,
    /// Trigger id to the routers that apply on this node
    table_routers: HashMap<String, Vec<ResolvedRouter>>,
    /// Channel to transaction to the last id routed for it but still inside a gap
    high_water: Mutex<HashMap<String, HashMap<String, DataId>>>,
}

impl RouterService {
    /// Build a service with the built-in routers
    pub fn new(
        config: RouterServiceConfig,
        store: Arc<Store>,
        visibility: Arc<dyn TransactionVisibility>,
    ) -> Result<Self> {
        let registry =
            RouterRegistry::with_builtins(&config.routing.topology_table_prefix, Arc::new(LoggingListener));
        Self::with_registry(config, store, visibility, registry)
    }

    /// Build a service with a custom registry
    ///
    /// Every configured router is resolved and validated here; an unknown
    /// type or an unparseable expression fails the build.
    pub fn with_registry(
        config: RouterServiceConfig,
        store: Arc<Store>,
        visibility: Arc<dyn TransactionVisibility>,
        registry: RouterRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let mut resolved = HashMap::new();
        for def in &config.routers {
            let strategy = registry.resolve(def)?;
            resolved.insert(def.id.clone(), ResolvedRouter { def: def.clone(), strategy });
        }

        let mut table_routers = HashMap::new();
        for trigger in &config.triggers {
            let routers: Vec<ResolvedRouter> = trigger
                .routers
                .iter()
                .filter_map(|id| resolved.get(id))
                .filter(|r| r.def.source_group == config.node.group_id)
                .cloned()
                .collect();
            tracing::debug!(
                "Trigger {} on {} routes with {} router(s)",
                trigger.id,
                trigger.table,
                routers.len()
            );
            table_routers.insert(trigger.id.clone(), routers);
        }

        let retention = Duration::from_secs(config.routing.gap_retention_hours * 3600);
        let gap_tracker = GapTracker::new(visibility, config.stale_gap_threshold(), retention);

        tracing::info!(
            "Routing service for node {} ({}): {} channels, {} routers, visibility via {}",
            config.node.id,
            config.node.group_id,
            config.channels.len(),
            config.routers.len(),
            gap_tracker.platform_name()
        );

        Ok(Self {
            config,
            store,
            gap_tracker,
            registry,
            table_routers,
            high_water: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RouterServiceConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn registry(&self) -> &RouterRegistry {
        &self.registry
    }

    /// Run one routing cycle over every enabled channel
    pub async fn route_cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let visibility = self.gap_tracker.snapshot().await;

        let mut conn = self.store.lock().await;
        store::begin(&conn)?;

        let result = self.route_in_transaction(&mut conn, visibility).await;
        let (mut report, evidence, outcomes, hooks) = match result {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(rollback_err) = store::rollback(&conn) {
                    tracing::error!("Rollback after failed routing cycle failed: {}", rollback_err);
                }
                tracing::error!("Routing cycle aborted: {}", e);
                return Err(e);
            }
        };

        if let Err(e) = store::commit(&conn) {
            if let Err(rollback_err) = store::rollback(&conn) {
                tracing::error!("Rollback after failed commit failed: {}", rollback_err);
            }
            hooks.discard();
            tracing::error!("Routing cycle commit failed: {}", e);
            return Err(e);
        }
        drop(conn);

        let mut routed = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            routed.push((outcome.ctx.stats.channel_id.clone(), outcome.routed));
            report.channels.push(outcome.ctx.stats);
        }
        self.remember_routed(&evidence, routed).await;

        report.hooks_run = hooks.run();
        report.elapsed = started.elapsed();

        for stats in &report.channels {
            if stats.rows_read > 0 || stats.rows_skipped > 0 {
                tracing::info!(
                    "Routed {} changes on channel {}: {} events in {} batches ({} unrouted, {} router errors{}), \
                     query {:?} read {:?} route {:?} enqueue {:?}",
                    stats.rows_read,
                    stats.channel_id,
                    stats.data_events,
                    stats.batches,
                    stats.unrouted_events,
                    stats.router_errors,
                    if stats.stopped_early { ", stopped early" } else { "" },
                    stats.query_time,
                    stats.read_time,
                    stats.route_time,
                    stats.enqueue_time
                );
            }
        }
        Ok(report)
    }

    #[allow(clippy::type_complexity)]
    async fn route_in_transaction(
        &self,
        conn: &mut Connection,
        visibility: VisibilitySnapshot,
    ) -> Result<(CycleReport, CoverageEvidence, Vec<PassOutcome>, PostCommitHooks)> {
        let active = self.gap_tracker.load(conn)?;
        let data = CycleData {
            histories: changes::trigger_histories(conn)?,
            nodes: node_store::all(conn)?,
        };

        let mut report = CycleReport::default();
        let mut evidence = CoverageEvidence::new();
        let mut outcomes = Vec::new();
        let mut hooks = PostCommitHooks::default();

        for channel in self.config.channels.iter().filter(|c| c.enabled) {
            store::savepoint(conn, CHANNEL_SAVEPOINT)?;
            match self.route_channel(conn, channel, &active, &data, &mut evidence).await {
                Ok(mut outcome) => {
                    store::release(conn, CHANNEL_SAVEPOINT)?;
                    hooks.absorb(outcome.ctx.take_post_commit_hooks());
                    outcomes.push(outcome);
                }
                Err(e) => {
                    store::rollback_to(conn, CHANNEL_SAVEPOINT)?;
                    evidence.record_failure(&channel.id);
                    tracing::warn!("Routing pass on channel {} failed and was rolled back: {}", channel.id, e);
                    report.failed_channels.push(channel.id.clone());
                }
            }
        }

        report.gaps = self
            .gap_tracker
            .reconcile(conn, &active, &evidence, visibility, Utc::now())?;
        Ok((report, evidence, outcomes, hooks))
    }

    /// One channel pass
    async fn route_channel(
        &self,
        conn: &mut Connection,
        channel: &ChannelConfig,
        gaps: &[DataGap],
        data: &CycleData,
        evidence: &mut CoverageEvidence,
    ) -> Result<PassOutcome> {
        let mut ctx = RouterContext::new(&channel.id, &self.config.node);
        let options = ReaderOptions {
            channel_id: channel.id.clone(),
            payload: PayloadColumns {
                row_data: channel.use_row_data_to_route,
                pk_data: channel.use_pk_data_to_route,
                old_data: channel.use_old_data_to_route,
            },
            peek_ahead_window: self.config.peek_ahead_window(channel),
            take_timeout: self.config.take_timeout(),
            queue_retry: self.config.queue_retry_interval(),
            max_gaps_before_greater_than_query: self.config.routing.max_gaps_before_greater_than_query,
        };
        let high_water = self.high_water.lock().await.get(&channel.id).cloned().unwrap_or_default();
        let mut reader = StreamingReader::start(self.store.open_reader()?, gaps.to_vec(), high_water, options);
        let mut builder = BatchBuilder::new(channel);

        let mut routed: HashMap<String, DataId> = HashMap::new();
        let mut last_id: Option<DataId> = None;
        let mut last_txn: Option<String> = None;

        loop {
            let read_started = Instant::now();
            let change = match reader.take().await? {
                Some(change) => change,
                None => break,
            };
            ctx.stats.read_time += read_started.elapsed();

            let at_boundary = change.transaction_id.is_none()
                || last_txn.is_none()
                || change.transaction_id != last_txn;
            if at_boundary && self.limit_reached(channel, &ctx.stats, &builder) {
                tracing::debug!(
                    "Channel {} reached its pass limit at change {}, stopping",
                    channel.id,
                    change.id
                );
                ctx.stats.stopped_early = true;
                reader.stop();
                break;
            }

            let route_started = Instant::now();
            let decisions = self.route_change(&mut ctx, conn, &change, data);
            ctx.stats.route_time += route_started.elapsed();

            let enqueue_started = Instant::now();
            builder.add(conn, &change, &decisions)?;
            ctx.stats.enqueue_time += enqueue_started.elapsed();

            ctx.stats.rows_read += 1;
            last_id = Some(change.id);
            if let Some(txn) = &change.transaction_id {
                routed.insert(txn.clone(), change.id);
            }
            last_txn = change.transaction_id;
        }

        let built = builder.finish(conn)?;
        ctx.stats.batches = built.batches;
        ctx.stats.data_events = built.data_events;
        ctx.stats.unrouted_events = built.unrouted_events;

        let read = reader.finish().await?;
        ctx.stats.query_time = read.query_time;
        ctx.stats.rows_skipped = read.skipped_ids.len() as u64;
        if read.used_greater_than_query {
            tracing::debug!("Channel {} read {} gaps with one range query", channel.id, gaps.len());
        }

        let through = if ctx.stats.stopped_early {
            last_id.unwrap_or(0)
        } else {
            OPEN_END
        };
        evidence.record(&channel.id, through);

        Ok(PassOutcome { ctx, routed })
    }

    /// Whether the pass has routed as much as one pass may
    fn limit_reached(&self, channel: &ChannelConfig, stats: &PassStats, builder: &BatchBuilder) -> bool {
        let rows = channel.max_data_to_route > 0 && stats.rows_read as usize >= channel.max_data_to_route;
        let batches =
            channel.max_batches_per_pass > 0 && builder.max_batches_per_node() >= channel.max_batches_per_pass;
        rows || batches
    }

    /// Route one change through every router attached to its table
    fn route_change(
        &self,
        ctx: &mut RouterContext,
        conn: &Connection,
        change: &ChangeRecord,
        data: &CycleData,
    ) -> Vec<RouteDecision> {
        let history = match data.histories.get(&change.trigger_hist_id) {
            Some(history) => history,
            None => {
                tracing::warn!(
                    "Change {} references unknown schema snapshot {}, leaving it unrouted",
                    change.id,
                    change.trigger_hist_id
                );
                return Vec::new();
            }
        };

        let routers = match self.table_routers.get(&history.trigger_id) {
            Some(routers) if !routers.is_empty() => routers,
            _ => return Vec::new(),
        };

        let values = match change.row_values(history) {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!("Change {} has an unreadable payload, leaving it unrouted: {}", change.id, e);
                ctx.stats.router_errors += 1;
                return routers.iter().take(1).map(|r| RouteDecision::unrouted(&r.def.id)).collect();
            }
        };

        let initial_load = change.event_type == EventType::Reload;
        let mut decisions = Vec::with_capacity(routers.len());
        for router in routers.iter().filter(|r| r.def.applies_to(change.event_type)) {
            let candidates = self.candidates(&router.def, change, &data.nodes);
            let input = RouteInput {
                change,
                history,
                values: &values,
                router: &router.def,
            };
            let node_ids = match router.strategy.route(ctx, conn, &input, &candidates, initial_load) {
                Ok(node_ids) => node_ids,
                Err(e) => {
                    tracing::warn!(
                        "Router {} failed on change {} of {}, treating it as unrouted: {}",
                        router.def.id,
                        change.id,
                        change.table_name,
                        e
                    );
                    ctx.stats.router_errors += 1;
                    BTreeSet::new()
                }
            };
            decisions.push(RouteDecision::new(&router.def.id, node_ids));
        }
        decisions
    }

    /// Enabled nodes of the router's target group, minus this node and the change's source
    fn candidates(&self, router: &RouterDef, change: &ChangeRecord, nodes: &[Node]) -> Vec<Node> {
        nodes
            .iter()
            .filter(|n| {
                n.sync_enabled
                    && n.node_group_id == router.target_group
                    && n.node_id != self.config.node.id
                    && change.source_node_id.as_deref() != Some(n.node_id.as_str())
            })
            .cloned()
            .collect()
    }

    /// Remember what committed passes routed beyond their confirmed reach
    ///
    /// Marks at or below a channel's reach are dropped: those rows were
    /// retired from the gaps. A failed channel keeps the marks it had.
    async fn remember_routed(&self, evidence: &CoverageEvidence, passes: Vec<(String, HashMap<String, DataId>)>) {
        let mut high_water = self.high_water.lock().await;
        for (channel_id, routed) in passes {
            let through = match evidence.coverage(&channel_id) {
                Some(ChannelCoverage::Through(through)) => through,
                _ => continue,
            };
            if through == OPEN_END {
                high_water.remove(&channel_id);
                continue;
            }

            let marks = high_water.entry(channel_id).or_default();
            marks.retain(|_, id| *id > through);
            for (txn, id) in routed.into_iter().filter(|(_, id)| *id > through) {
                let mark = marks.entry(txn).or_insert(id);
                *mark = (*mark).max(id);
            }
        }
        high_water.retain(|_, marks| !marks.is_empty());
    }

    /// Active gaps, for operational tooling
    pub async fn active_gaps(&self) -> Result<Vec<DataGap>> {
        self.store.active_gaps().await
    }

    /// Run routing cycles every `interval` until `shutdown` resolves
    pub async fn run_until<F>(&self, interval: Duration, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.route_cycle().await {
                        Ok(report) => {
                            if !report.failed_channels.is_empty() {
                                tracing::warn!("Channels failed this cycle: {:?}", report.failed_channels);
                            }
                        }
                        Err(e) if e.is_retryable() => {
                            tracing::warn!("Routing cycle failed, retrying next interval: {}", e);
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("Routing service stopping");
                    return Ok(());
                }
            }
        }
    }
}

impl std::fmt::Debug for RouterService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterService")
            .field("node", &self.config.node.id)
            .field("routers", &self.registry.types())
            .finish()
    }
}
