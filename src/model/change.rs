//! Captured Change Records
//!
//! A change record is one row mutation appended to the change log by the
//! capture triggers. Row payloads are JSON arrays of nullable strings whose
//! positions line up with the columns of the schema snapshot the record
//! references.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Change log id, minted in increasing order by the capture side
pub type DataId = i64;

/// Prefix used to expose previous column values to routers
pub const OLD_PREFIX: &str = "OLD_";

/// Type of captured event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Insert,
    Update,
    Delete,
    /// Out-of-band SQL statement
    Sql,
    /// Table reload request
    Reload,
    /// Table creation
    Create,
    /// Script to run on the target
    Script,
}

impl EventType {
    /// Single character code persisted in the change log
    pub fn code(&self) -> &'static str {
        match self {
            EventType::Insert => "I",
            EventType::Update => "U",
            EventType::Delete => "D",
            EventType::Sql => "S",
            EventType::Reload => "R",
            EventType::Create => "C",
            EventType::Script => "B",
        }
    }

    /// Parse a persisted event code
    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "I" => Ok(EventType::Insert),
            "U" => Ok(EventType::Update),
            "D" => Ok(EventType::Delete),
            "S" => Ok(EventType::Sql),
            "R" => Ok(EventType::Reload),
            "C" => Ok(EventType::Create),
            "B" => Ok(EventType::Script),
            other => Err(Error::Store(format!("Unknown event type code '{}'", other))),
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Insert => write!(f, "INSERT"),
            EventType::Update => write!(f, "UPDATE"),
            EventType::Delete => write!(f, "DELETE"),
            EventType::Sql => write!(f, "SQL"),
            EventType::Reload => write!(f, "RELOAD"),
            EventType::Create => write!(f, "CREATE"),
            EventType::Script => write!(f, "SCRIPT"),
        }
    }
}

/// Schema snapshot: the column layout of a table at capture time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerHistory {
    /// Snapshot id referenced by change records
    pub id: i64,
    /// Trigger (captured table definition) this snapshot belongs to
    pub trigger_id: String,
    /// Source table name
    pub table_name: String,
    /// Column names in payload order
    pub columns: Vec<String>,
    /// Primary key column names in pk payload order
    pub pk_columns: Vec<String>,
}

/// One captured row mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: DataId,
    pub table_name: String,
    pub event_type: EventType,
    /// Current row values, JSON array
    pub row_data: Option<String>,
    /// Primary key values, JSON array
    pub pk_data: Option<String>,
    /// Previous row values, JSON array
    pub old_data: Option<String>,
    /// Schema snapshot the payloads line up with
    pub trigger_hist_id: i64,
    pub channel_id: String,
    /// None when the platform cannot expose a transaction id
    pub transaction_id: Option<String>,
    /// Node the change originally came from, if it was itself synchronized
    pub source_node_id: Option<String>,
    pub create_time: DateTime<Utc>,
    /// Stored payload size in bytes, when read from the change log
    #[serde(default)]
    pub stored_size: Option<u64>,
}

impl ChangeRecord {
    /// Decode a JSON array payload
    pub fn parse_values(payload: &str) -> Result<Vec<Option<String>>> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Encode values as a JSON array payload
    pub fn encode_values(values: &[Option<&str>]) -> String {
        serde_json::Value::Array(
            values
                .iter()
                .map(|v| match v {
                    Some(s) => serde_json::Value::String((*s).to_string()),
                    None => serde_json::Value::Null,
                })
                .collect(),
        )
        .to_string()
    }

    /// Build the column map routers evaluate against
    ///
    /// DELETE events expose their old values (or primary key values when
    /// old values were not captured) as the current values.
    pub fn row_values(&self, history: &TriggerHistory) -> Result<RowValues> {
        let mut values = RowValues::default();

        let current = match self.event_type {
            EventType::Delete => match (&self.old_data, &self.pk_data) {
                (Some(old), _) => Some((old, &history.columns)),
                (None, Some(pk)) => Some((pk, &history.pk_columns)),
                (None, None) => None,
            },
            _ => self.row_data.as_ref().map(|row| (row, &history.columns)),
        };

        if let Some((payload, columns)) = current {
            let parsed = Self::parse_values(payload)?;
            for (column, value) in columns.iter().zip(parsed) {
                values.insert(column, value);
            }
        }

        if let Some(old) = &self.old_data {
            let parsed = Self::parse_values(old)?;
            for (column, value) in history.columns.iter().zip(parsed) {
                values.insert(&format!("{}{}", OLD_PREFIX, column), value);
            }
        }

        Ok(values)
    }

    /// Payload size used for batch byte counters
    ///
    /// Prefers the stored size, which still counts payload columns a
    /// reader left out.
    pub fn payload_size(&self) -> u64 {
        if let Some(size) = self.stored_size {
            return size;
        }
        [&self.row_data, &self.pk_data, &self.old_data]
            .iter()
            .map(|p| p.as_ref().map(|s| s.len() as u64).unwrap_or(0))
            .sum()
    }
}

/// Column values of a change keyed by upper-cased column name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowValues {
    values: HashMap<String, Option<String>>,
}

impl RowValues {
    /// Insert a column value
    pub fn insert(&mut self, column: &str, value: Option<String>) {
        self.values.insert(column.to_uppercase(), value);
    }

    /// Value of a column; None when the column is null or absent
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values
            .get(&column.to_uppercase())
            .and_then(|v| v.as_deref())
    }

    /// Whether the column is present (possibly null)
    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(&column.to_uppercase())
    }

    /// All values, keyed by upper-cased column name
    pub fn as_map(&self) -> &HashMap<String, Option<String>> {
        &self.values
    }
}
