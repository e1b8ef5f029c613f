//! Routing Store
//!
//! Durable storage for the routing pipeline, backed by SQLite: the change
//! log and its schema snapshots, data gaps, outgoing batches and data
//! events, per-channel watermarks, and the node directory tables routers
//! query.
//!
//! The submodules expose plain functions over a [`Connection`] so the
//! routing cycle can run them all inside one transaction on the connection
//! it holds.

pub mod changes;
pub mod gaps;
pub mod batches;
pub mod nodes;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::Result;
use crate::model::{DataGap, DataId, OutgoingBatch};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS trigger_hist (
    trigger_hist_id INTEGER PRIMARY KEY,
    trigger_id TEXT NOT NULL,
    source_table_name TEXT NOT NULL,
    column_names TEXT NOT NULL,
    pk_column_names TEXT NOT NULL,
    create_time INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS change_log (
    data_id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    event_type TEXT NOT NULL,
    row_data TEXT,
    pk_data TEXT,
    old_data TEXT,
    trigger_hist_id INTEGER NOT NULL,
    channel_id TEXT NOT NULL,
    transaction_id TEXT,
    source_node_id TEXT,
    create_time INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_change_log_channel
    ON change_log(channel_id, data_id);

CREATE TABLE IF NOT EXISTS data_gap (
    start_id INTEGER NOT NULL,
    end_id INTEGER NOT NULL,
    status TEXT NOT NULL,
    create_time INTEGER NOT NULL,
    last_update_time INTEGER NOT NULL,
    PRIMARY KEY (start_id, end_id)
);

CREATE INDEX IF NOT EXISTS idx_data_gap_status ON data_gap(status);

CREATE TABLE IF NOT EXISTS outgoing_batch (
    batch_id INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id TEXT NOT NULL,
    channel_id TEXT NOT NULL,
    status TEXT NOT NULL,
    data_event_count INTEGER NOT NULL DEFAULT 0,
    byte_count INTEGER NOT NULL DEFAULT 0,
    insert_event_count INTEGER NOT NULL DEFAULT 0,
    update_event_count INTEGER NOT NULL DEFAULT 0,
    delete_event_count INTEGER NOT NULL DEFAULT 0,
    other_event_count INTEGER NOT NULL DEFAULT 0,
    create_time INTEGER NOT NULL,
    last_update_time INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_outgoing_batch_node
    ON outgoing_batch(node_id, channel_id, status);

CREATE TABLE IF NOT EXISTS data_event (
    data_id INTEGER NOT NULL,
    batch_id INTEGER NOT NULL,
    router_id TEXT NOT NULL,
    PRIMARY KEY (data_id, batch_id)
);

CREATE TABLE IF NOT EXISTS channel_state (
    channel_id TEXT PRIMARY KEY,
    last_routed_id INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS node (
    node_id TEXT PRIMARY KEY,
    node_group_id TEXT NOT NULL,
    external_id TEXT NOT NULL,
    sync_enabled INTEGER NOT NULL DEFAULT 1,
    created_at_node_id TEXT
);

CREATE TABLE IF NOT EXISTS registration_redirect (
    external_id TEXT PRIMARY KEY,
    registration_node_id TEXT NOT NULL
);
"#;

/// SQLite-backed routing store
pub struct Store {
    /// Database file
    path: PathBuf,
    /// Busy timeout applied to every connection
    busy_timeout: Duration,
    /// Connection used by the routing cycle
    conn: Mutex<Connection>,
}

impl Store {
    /// Create or open the routing store
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        // WAL lets the streaming reader see committed changes while the
        // routing cycle holds its write transaction.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            path: path.to_path_buf(),
            busy_timeout,
            conn: Mutex::new(conn),
        })
    }

    /// Open a separate read-only connection for a streaming reader
    pub fn open_reader(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.busy_timeout)?;
        Ok(conn)
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock the routing connection
    pub async fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    /// All gaps, for operational tooling
    pub async fn gaps(&self) -> Result<Vec<DataGap>> {
        let conn = self.lock().await;
        gaps::all(&conn)
    }

    /// Active gaps in ascending order
    pub async fn active_gaps(&self) -> Result<Vec<DataGap>> {
        let conn = self.lock().await;
        gaps::active(&conn)
    }

    /// All outgoing batches
    pub async fn batches(&self) -> Result<Vec<OutgoingBatch>> {
        let conn = self.lock().await;
        batches::all(&conn)
    }

    /// Highest change id routed on a channel
    pub async fn last_routed_id(&self, channel_id: &str) -> Result<Option<DataId>> {
        let conn = self.lock().await;
        batches::last_routed_id(&conn, channel_id)
    }
}

/// Start the routing cycle's write transaction
pub(crate) fn begin(conn: &Connection) -> Result<()> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    Ok(())
}

pub(crate) fn commit(conn: &Connection) -> Result<()> {
    conn.execute_batch("COMMIT")?;
    Ok(())
}

pub(crate) fn rollback(conn: &Connection) -> Result<()> {
    conn.execute_batch("ROLLBACK")?;
    Ok(())
}

/// Open a named savepoint inside the current transaction
pub(crate) fn savepoint(conn: &Connection, name: &str) -> Result<()> {
    conn.execute_batch(&format!("SAVEPOINT {}", name))?;
    Ok(())
}

pub(crate) fn release(conn: &Connection, name: &str) -> Result<()> {
    conn.execute_batch(&format!("RELEASE {}", name))?;
    Ok(())
}

/// Undo everything since the savepoint and drop it
pub(crate) fn rollback_to(conn: &Connection, name: &str) -> Result<()> {
    conn.execute_batch(&format!("ROLLBACK TO {}; RELEASE {}", name, name))?;
    Ok(())
}
