//! Data Gaps
//!
//! A gap is an inclusive id range of the change log that routing has not
//! yet confirmed as fully examined.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::change::DataId;
use crate::error::{Error, Result};

/// End id of the unbounded tail gap
pub const OPEN_END: DataId = DataId::MAX;

/// Gap status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GapStatus {
    /// Still to be examined by routing
    Active,
    /// Confirmed empty and excluded from reads
    Skip,
    /// Consumed by routing
    Filled,
}

impl GapStatus {
    pub fn code(&self) -> &'static str {
        match self {
            GapStatus::Active => "GP",
            GapStatus::Skip => "SK",
            GapStatus::Filled => "OK",
        }
    }

    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "GP" => Ok(GapStatus::Active),
            "SK" => Ok(GapStatus::Skip),
            "OK" => Ok(GapStatus::Filled),
            other => Err(Error::Store(format!("Unknown gap status '{}'", other))),
        }
    }
}

impl std::fmt::Display for GapStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GapStatus::Active => write!(f, "ACTIVE"),
            GapStatus::Skip => write!(f, "SKIP"),
            GapStatus::Filled => write!(f, "FILLED"),
        }
    }
}

/// An inclusive range of change ids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataGap {
    pub start_id: DataId,
    pub end_id: DataId,
    pub status: GapStatus,
    pub create_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

impl DataGap {
    /// Create a new active gap
    pub fn new(start_id: DataId, end_id: DataId) -> Self {
        let now = Utc::now();
        Self {
            start_id,
            end_id,
            status: GapStatus::Active,
            create_time: now,
            last_update_time: now,
        }
    }

    /// Create the unbounded tail gap starting at `start_id`
    pub fn open(start_id: DataId) -> Self {
        Self::new(start_id, OPEN_END)
    }

    pub fn is_open_ended(&self) -> bool {
        self.end_id == OPEN_END
    }

    pub fn is_active(&self) -> bool {
        self.status == GapStatus::Active
    }

    pub fn contains(&self, id: DataId) -> bool {
        id >= self.start_id && id <= self.end_id
    }

    /// How long the gap has existed
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.create_time
    }
}

impl std::fmt::Display for DataGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_open_ended() {
            write!(f, "[{}, ∞)", self.start_id)
        } else {
            write!(f, "[{}, {}]", self.start_id, self.end_id)
        }
    }
}
