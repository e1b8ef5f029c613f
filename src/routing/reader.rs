//! Streaming Reader
//!
//! Tails the change log for one channel over the active gap ranges. A
//! blocking producer task runs the query on its own connection and feeds a
//! bounded queue; the routing pass takes rows from the other end. The
//! producer always finishes by queueing an end marker, whether the query
//! was exhausted, failed, or the reader was stopped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::model::{ChangeRecord, DataGap, DataId};
use crate::store::changes::{self, PayloadColumns};

/// Reader settings for one pass
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    pub channel_id: String,
    /// Payload columns routers need
    pub payload: PayloadColumns,
    /// Queue capacity
    pub peek_ahead_window: usize,
    /// How long `take` waits before declaring the producer stalled
    pub take_timeout: Duration,
    /// Producer sleep between attempts while the queue is full
    pub queue_retry: Duration,
    /// Above this many gaps, query `id >=` the lowest gap and filter here
    pub max_gaps_before_greater_than_query: usize,
}

/// What the producer did, delivered with the end marker
#[derive(Debug, Clone, Default)]
pub struct ReadSummary {
    /// Rows queued for the consumer
    pub rows_queued: u64,
    /// Rows skipped because their transaction was already routed up to them
    pub skipped_ids: Vec<DataId>,
    /// The query ran to completion
    pub exhausted: bool,
    /// Query failure, if any
    pub error: Option<String>,
    /// Time to prepare and start the query
    pub query_time: Duration,
    pub used_greater_than_query: bool,
}

enum ReaderItem {
    Change(ChangeRecord),
    End(ReadSummary),
}

/// Consumer handle of a streaming read
pub struct StreamingReader {
    channel_id: String,
    rx: mpsc::Receiver<ReaderItem>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    take_timeout: Duration,
    summary: Option<ReadSummary>,
}

impl StreamingReader {
    /// Start reading `gaps` (ascending) on `conn`
    ///
    /// `high_water` maps a transaction id to the last id of that
    /// transaction already routed on this channel; rows at or below it are
    /// skipped.
    pub fn start(
        conn: Connection,
        gaps: Vec<DataGap>,
        high_water: HashMap<String, DataId>,
        options: ReaderOptions,
    ) -> Self {
        let (tx, rx) = mpsc::channel(options.peek_ahead_window.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let channel_id = options.channel_id.clone();
        let take_timeout = options.take_timeout;

        let producer_stop = stop.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let producer = Producer {
                tx,
                stop: producer_stop,
                retry: options.queue_retry,
            };
            producer.run(&conn, &gaps, &high_water, &options);
        });

        Self {
            channel_id,
            rx,
            stop,
            handle: Some(handle),
            take_timeout,
            summary: None,
        }
    }

    /// Next change, or `None` at end of stream
    pub async fn take(&mut self) -> Result<Option<ChangeRecord>> {
        if self.summary.is_some() {
            return Ok(None);
        }

        match tokio::time::timeout(self.take_timeout, self.rx.recv()).await {
            Err(_) => {
                tracing::warn!(
                    "Reader for channel {} stalled: no row within {:?}",
                    self.channel_id,
                    self.take_timeout
                );
                Err(Error::ReaderStalled {
                    channel_id: self.channel_id.clone(),
                    waited_ms: self.take_timeout.as_millis() as u64,
                })
            }
            Ok(None) => Err(Error::Reader(format!(
                "reader for channel {} exited without an end marker",
                self.channel_id
            ))),
            Ok(Some(ReaderItem::Change(change))) => Ok(Some(change)),
            Ok(Some(ReaderItem::End(summary))) => {
                let error = summary.error.clone();
                self.summary = Some(summary);
                match error {
                    Some(e) => Err(Error::Reader(e)),
                    None => Ok(None),
                }
            }
        }
    }

    /// Ask the producer to stop; it queues the end marker on its way out
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Summary, once the end marker has been taken
    pub fn summary(&self) -> Option<&ReadSummary> {
        self.summary.as_ref()
    }

    /// Stop, drain to the end marker, and wait for the producer
    pub async fn finish(mut self) -> Result<ReadSummary> {
        if self.summary.is_none() {
            self.stop();
            loop {
                match self.take().await {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(Error::Reader(_)) if self.summary.is_some() => break,
                    Err(e) => return Err(e),
                }
            }
        }

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("Reader task for channel {} ended abnormally: {}", self.channel_id, e);
            }
        }

        Ok(self.summary.take().unwrap_or_default())
    }
}

impl Drop for StreamingReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

struct Producer {
    tx: mpsc::Sender<ReaderItem>,
    stop: Arc<AtomicBool>,
    retry: Duration,
}

impl Producer {
    fn run(
        &self,
        conn: &Connection,
        gaps: &[DataGap],
        high_water: &HashMap<String, DataId>,
        options: &ReaderOptions,
    ) {
        let mut summary = ReadSummary::default();
        match self.stream(conn, gaps, high_water, options, &mut summary) {
            Ok(exhausted) => summary.exhausted = exhausted,
            Err(e) => {
                tracing::warn!("Reader query for channel {} failed: {}", options.channel_id, e);
                summary.error = Some(e.to_string());
            }
        }
        self.push_end(summary);
    }

    /// Stream rows into the queue; returns whether the query was exhausted
    fn stream(
        &self,
        conn: &Connection,
        gaps: &[DataGap],
        high_water: &HashMap<String, DataId>,
        options: &ReaderOptions,
        summary: &mut ReadSummary,
    ) -> Result<bool> {
        if gaps.is_empty() {
            return Ok(true);
        }

        let greater_than = gaps.len() > options.max_gaps_before_greater_than_query;
        summary.used_greater_than_query = greater_than;
        let (sql, params) = build_query(&options.channel_id, options.payload, gaps, greater_than);

        let started = Instant::now();
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        summary.query_time = started.elapsed();

        let mut gap_index = 0;
        while let Some(row) = rows.next()? {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(false);
            }

            let change = changes::from_row(row)?;

            if greater_than {
                while gap_index < gaps.len() && gaps[gap_index].end_id < change.id {
                    gap_index += 1;
                }
                if gap_index >= gaps.len() {
                    break;
                }
                if !gaps[gap_index].contains(change.id) {
                    continue;
                }
            }

            let already_routed = change
                .transaction_id
                .as_ref()
                .and_then(|txn| high_water.get(txn))
                .map(|mark| change.id <= *mark)
                .unwrap_or(false);
            if already_routed {
                summary.skipped_ids.push(change.id);
                continue;
            }

            if !self.push(ReaderItem::Change(change)) {
                return Ok(false);
            }
            summary.rows_queued += 1;
        }

        Ok(true)
    }

    /// Queue an item, retrying while full; false if stopped or closed
    fn push(&self, item: ReaderItem) -> bool {
        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return true,
                Err(TrySendError::Closed(_)) => return false,
                Err(TrySendError::Full(returned)) => {
                    if self.stop.load(Ordering::SeqCst) {
                        return false;
                    }
                    item = returned;
                    std::thread::sleep(self.retry);
                }
            }
        }
    }

    /// Queue the end marker; retries until it lands or the consumer is gone
    fn push_end(&self, summary: ReadSummary) {
        let mut item = ReaderItem::End(summary);
        loop {
            match self.tx.try_send(item) {
                Ok(()) | Err(TrySendError::Closed(_)) => return,
                Err(TrySendError::Full(returned)) => {
                    item = returned;
                    std::thread::sleep(self.retry);
                }
            }
        }
    }
}

/// Build the channel query over the gap ranges
fn build_query(
    channel_id: &str,
    payload: PayloadColumns,
    gaps: &[DataGap],
    greater_than: bool,
) -> (String, Vec<Value>) {
    let mut params = vec![Value::Text(channel_id.to_string())];
    let predicate = if greater_than {
        params.push(Value::Integer(gaps[0].start_id));
        "data_id >= ?2".to_string()
    } else {
        let ranges: Vec<String> = gaps
            .iter()
            .map(|gap| {
                params.push(Value::Integer(gap.start_id));
                params.push(Value::Integer(gap.end_id));
                format!("(data_id BETWEEN ?{} AND ?{})", params.len() - 1, params.len())
            })
            .collect();
        ranges.join(" OR ")
    };

    let sql = format!(
        "SELECT {} FROM change_log WHERE channel_id = ?1 AND ({}) ORDER BY data_id",
        changes::select_list(payload),
        predicate
    );
    (sql, params)
}
