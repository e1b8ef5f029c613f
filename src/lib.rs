//! WolfRoute - Change Routing Engine for Multi-Node Database Sync
//!
//! Captured row changes are read from the local change log, routed to the
//! nodes that need them, and grouped into outgoing batches ready for
//! transport. The engine never loses a committed change, even when
//! transactions commit out of id order.
//!
//! # Architecture
//!
//! A routing cycle runs inside one store transaction. The gap tracker
//! knows which id ranges of the change log have not been examined yet,
//! a streaming reader pages those ranges through a bounded queue, the
//! configured routers pick target nodes for each change, and the batch
//! builder cuts the result into per-node batches.
//!
//! # Features
//!
//! - Gap tracking with stale hole detection backed by the source platform
//! - Column match, lookup table, subselect and scripted routers
//! - Topology change routing with post-commit configuration hooks
//! - Default, transactional and nontransactional batch boundaries
//! - Embedded SQLite store with per-channel savepoints

pub mod config;
pub mod error;
pub mod model;
pub mod store;
pub mod platform;
pub mod router;
pub mod routing;

#[cfg(test)]
mod test_support;

pub use config::RouterServiceConfig;
pub use error::{Error, Result};
pub use routing::RouterService;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ChannelConfig, RouterDef, RouterServiceConfig};
    pub use crate::error::{Error, Result};
    pub use crate::model::{ChangeRecord, DataGap, DataId, OutgoingBatch};
    pub use crate::router::{DataRouter, RouterRegistry};
    pub use crate::routing::{CycleReport, RouterService};
    pub use crate::store::Store;
}
