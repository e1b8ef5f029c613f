//! Routing Pipeline
//!
//! Each routing cycle reads captured changes out of the active gaps of the
//! change log, asks the configured routers which nodes need each change,
//! and persists the result as outgoing batches:
//!
//! ```text
//! change log ─> StreamingReader ─> routers ─> BatchBuilder ─> outgoing batches
//!                    ^                                              │
//!                    └──────────── GapTracker <─────────────────────┘
//! ```
//!
//! The [`RouterService`] drives the cycle and owns its transaction.

pub mod gap_tracker;
pub mod reader;
pub mod context;
pub mod batch_builder;
pub mod service;


pub use batch_builder::{should_cut, BatchBuilder, BuildSummary};
pub use context::{PassStats, PostCommitHook, PostCommitHooks, RouterContext};
pub use gap_tracker::{ChannelCoverage, CoverageEvidence, GapTracker, ReconcileSummary, VisibilitySnapshot};
pub use reader::{ReadSummary, ReaderOptions, StreamingReader};
pub use service::{CycleReport, RouterService};
