//! Outgoing Batches, Data Events and Channel Watermarks

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::model::{from_millis, now_millis, BatchStatus, DataEvent, DataId, OutgoingBatch};

const BATCH_COLUMNS: &str = "batch_id, node_id, channel_id, status, data_event_count, byte_count, \
    insert_event_count, update_event_count, delete_event_count, other_event_count, create_time, last_update_time";

fn from_row(row: &Row<'_>) -> rusqlite::Result<OutgoingBatch> {
    let code: String = row.get(3)?;
    let status = BatchStatus::from_code(&code).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(OutgoingBatch {
        batch_id: row.get(0)?,
        node_id: row.get(1)?,
        channel_id: row.get(2)?,
        status,
        data_event_count: row.get::<_, i64>(4)? as u64,
        byte_count: row.get::<_, i64>(5)? as u64,
        insert_event_count: row.get::<_, i64>(6)? as u64,
        update_event_count: row.get::<_, i64>(7)? as u64,
        delete_event_count: row.get::<_, i64>(8)? as u64,
        other_event_count: row.get::<_, i64>(9)? as u64,
        create_time: from_millis(row.get(10)?),
        last_update_time: from_millis(row.get(11)?),
    })
}

/// Insert a batch and assign its id
pub fn insert_batch(conn: &Connection, batch: &mut OutgoingBatch) -> Result<i64> {
    conn.execute(
        r#"
        INSERT INTO outgoing_batch (
            node_id, channel_id, status, data_event_count, byte_count, insert_event_count,
            update_event_count, delete_event_count, other_event_count, create_time, last_update_time
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            batch.node_id,
            batch.channel_id,
            batch.status.code(),
            batch.data_event_count as i64,
            batch.byte_count as i64,
            batch.insert_event_count as i64,
            batch.update_event_count as i64,
            batch.delete_event_count as i64,
            batch.other_event_count as i64,
            batch.create_time.timestamp_millis(),
            batch.last_update_time.timestamp_millis(),
        ],
    )?;
    batch.batch_id = conn.last_insert_rowid();
    Ok(batch.batch_id)
}

/// Insert the events of one batch
pub fn insert_data_events(conn: &Connection, batch_id: i64, events: &[(DataId, String)]) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO data_event (data_id, batch_id, router_id) VALUES (?1, ?2, ?3)",
    )?;
    for (data_id, router_id) in events {
        stmt.execute(params![data_id, batch_id, router_id])?;
    }
    Ok(())
}

/// Every batch in id order
pub fn all(conn: &Connection) -> Result<Vec<OutgoingBatch>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM outgoing_batch ORDER BY batch_id", BATCH_COLUMNS))?;
    let rows = stmt.query_map([], from_row)?;
    let mut batches = Vec::new();
    for result in rows {
        batches.push(result?);
    }
    Ok(batches)
}

/// Batches for one node on one channel in id order
pub fn for_node(conn: &Connection, node_id: &str, channel_id: &str) -> Result<Vec<OutgoingBatch>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM outgoing_batch WHERE node_id = ?1 AND channel_id = ?2 ORDER BY batch_id",
        BATCH_COLUMNS
    ))?;
    let rows = stmt.query_map(params![node_id, channel_id], from_row)?;
    let mut batches = Vec::new();
    for result in rows {
        batches.push(result?);
    }
    Ok(batches)
}

/// Events of a batch in ascending change id order
pub fn data_events(conn: &Connection, batch_id: i64) -> Result<Vec<DataEvent>> {
    let mut stmt = conn.prepare(
        "SELECT data_id, batch_id, router_id FROM data_event WHERE batch_id = ?1 ORDER BY data_id",
    )?;
    let rows = stmt.query_map(params![batch_id], |row| {
        Ok(DataEvent {
            data_id: row.get(0)?,
            batch_id: row.get(1)?,
            router_id: row.get(2)?,
        })
    })?;
    let mut events = Vec::new();
    for result in rows {
        events.push(result?);
    }
    Ok(events)
}

/// Highest change id routed on a channel
pub fn last_routed_id(conn: &Connection, channel_id: &str) -> Result<Option<DataId>> {
    let id = conn
        .query_row(
            "SELECT last_routed_id FROM channel_state WHERE channel_id = ?1",
            params![channel_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Move a channel's watermark forward; never moves it back
pub fn advance_last_routed_id(conn: &Connection, channel_id: &str, id: DataId) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO channel_state (channel_id, last_routed_id, updated_at) VALUES (?1, ?2, ?3)
        ON CONFLICT(channel_id) DO UPDATE SET
            last_routed_id = MAX(last_routed_id, ?2),
            updated_at = ?3
        "#,
        params![channel_id, id, now_millis()],
    )?;
    Ok(())
}
