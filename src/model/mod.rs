//! Data Model
//!
//! Records read from and written to the routing store: captured changes,
//! gaps in the change id space, outgoing batches and their data events,
//! and the nodes changes are routed to.

pub mod change;
pub mod gap;
pub mod batch;
pub mod node;
pub mod route;

pub use change::{ChangeRecord, DataId, EventType, RowValues, TriggerHistory};
pub use gap::{DataGap, GapStatus, OPEN_END};
pub use batch::{BatchStatus, DataEvent, OutgoingBatch, UNKNOWN_ROUTER_ID, UNROUTED_NODE_ID};
pub use node::Node;
pub use route::RouteDecision;

/// Current time in epoch milliseconds, the unit the store persists
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Convert stored epoch milliseconds back to a timestamp
pub fn from_millis(millis: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
