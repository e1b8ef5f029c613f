//! Outgoing Batches and Data Events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::change::{DataId, EventType};
use crate::error::{Error, Result};

/// Pseudo-node that unrouted changes are recorded against
pub const UNROUTED_NODE_ID: &str = "-1";

/// Router id recorded when no router applied to a change
pub const UNKNOWN_ROUTER_ID: &str = "?";

/// Batch status. Routing only creates batches; later states belong to
/// extraction, transport and load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BatchStatus {
    New,
    RoutingComplete,
    Querying,
    Sending,
    Loading,
    Ok,
    Error,
    Ignored,
}

impl BatchStatus {
    pub fn code(&self) -> &'static str {
        match self {
            BatchStatus::New => "NE",
            BatchStatus::RoutingComplete => "RC",
            BatchStatus::Querying => "QY",
            BatchStatus::Sending => "SE",
            BatchStatus::Loading => "LD",
            BatchStatus::Ok => "OK",
            BatchStatus::Error => "ER",
            BatchStatus::Ignored => "IG",
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "NE" => Ok(BatchStatus::New),
            "RC" => Ok(BatchStatus::RoutingComplete),
            "QY" => Ok(BatchStatus::Querying),
            "SE" => Ok(BatchStatus::Sending),
            "LD" => Ok(BatchStatus::Loading),
            "OK" => Ok(BatchStatus::Ok),
            "ER" => Ok(BatchStatus::Error),
            "IG" => Ok(BatchStatus::Ignored),
            other => Err(Error::Store(format!("Unknown batch status '{}'", other))),
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// A unit of delivery for one node on one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    /// Assigned by the store on insert
    pub batch_id: i64,
    pub node_id: String,
    pub channel_id: String,
    pub status: BatchStatus,
    pub data_event_count: u64,
    pub byte_count: u64,
    pub insert_event_count: u64,
    pub update_event_count: u64,
    pub delete_event_count: u64,
    pub other_event_count: u64,
    pub create_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

impl OutgoingBatch {
    /// Create an empty batch; unrouted batches are complete on creation
    pub fn new(node_id: &str, channel_id: &str) -> Self {
        let now = Utc::now();
        let status = if node_id == UNROUTED_NODE_ID {
            BatchStatus::Ok
        } else {
            BatchStatus::New
        };
        Self {
            batch_id: 0,
            node_id: node_id.to_string(),
            channel_id: channel_id.to_string(),
            status,
            data_event_count: 0,
            byte_count: 0,
            insert_event_count: 0,
            update_event_count: 0,
            delete_event_count: 0,
            other_event_count: 0,
            create_time: now,
            last_update_time: now,
        }
    }

    /// Account for one event
    pub fn increment(&mut self, event_type: EventType, bytes: u64) {
        self.data_event_count += 1;
        self.byte_count += bytes;
        match event_type {
            EventType::Insert => self.insert_event_count += 1,
            EventType::Update => self.update_event_count += 1,
            EventType::Delete => self.delete_event_count += 1,
            _ => self.other_event_count += 1,
        }
    }

    pub fn is_unrouted(&self) -> bool {
        self.node_id == UNROUTED_NODE_ID
    }
}

/// Membership of a change in a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataEvent {
    pub data_id: DataId,
    pub batch_id: i64,
    pub router_id: String,
}
