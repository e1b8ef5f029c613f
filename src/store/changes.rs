//! Change Log Access
//!
//! The change log is written by the capture side; routing only reads it.
//! Insert functions exist for capture adapters and fixtures.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::model::{from_millis, now_millis, ChangeRecord, DataId, EventType, TriggerHistory};

/// Which payload columns a reader selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadColumns {
    pub row_data: bool,
    pub pk_data: bool,
    pub old_data: bool,
}

impl PayloadColumns {
    pub fn all() -> Self {
        Self {
            row_data: true,
            pk_data: true,
            old_data: true,
        }
    }
}

/// SELECT list for change rows; omitted payloads are selected as NULL but
/// still counted in the stored size
pub fn select_list(payload: PayloadColumns) -> String {
    let column = |wanted: bool, name: &str| {
        if wanted {
            name.to_string()
        } else {
            format!("NULL AS {}", name)
        }
    };
    format!(
        "data_id, table_name, event_type, {}, {}, {}, trigger_hist_id, channel_id, \
         transaction_id, source_node_id, create_time, \
         COALESCE(LENGTH(CAST(row_data AS BLOB)), 0) + COALESCE(LENGTH(CAST(pk_data AS BLOB)), 0) \
         + COALESCE(LENGTH(CAST(old_data AS BLOB)), 0)",
        column(payload.row_data, "row_data"),
        column(payload.pk_data, "pk_data"),
        column(payload.old_data, "old_data"),
    )
}

/// Map a row selected with [`select_list`]
pub fn from_row(row: &Row<'_>) -> rusqlite::Result<ChangeRecord> {
    let code: String = row.get(2)?;
    let event_type = EventType::from_code(&code).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(ChangeRecord {
        id: row.get(0)?,
        table_name: row.get(1)?,
        event_type,
        row_data: row.get(3)?,
        pk_data: row.get(4)?,
        old_data: row.get(5)?,
        trigger_hist_id: row.get(6)?,
        channel_id: row.get(7)?,
        transaction_id: row.get(8)?,
        source_node_id: row.get(9)?,
        create_time: from_millis(row.get(10)?),
        stored_size: Some(row.get::<_, i64>(11)?.max(0) as u64),
    })
}

/// Append a change; an id of 0 lets the store assign the next id
pub fn insert(conn: &Connection, change: &ChangeRecord) -> Result<DataId> {
    let id = if change.id > 0 { Some(change.id) } else { None };
    conn.execute(
        r#"
        INSERT INTO change_log (
            data_id, table_name, event_type, row_data, pk_data, old_data,
            trigger_hist_id, channel_id, transaction_id, source_node_id, create_time
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            id,
            change.table_name,
            change.event_type.code(),
            change.row_data,
            change.pk_data,
            change.old_data,
            change.trigger_hist_id,
            change.channel_id,
            change.transaction_id,
            change.source_node_id,
            change.create_time.timestamp_millis(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Record a schema snapshot
pub fn insert_trigger_history(conn: &Connection, history: &TriggerHistory) -> Result<()> {
    conn.execute(
        r#"
        INSERT OR REPLACE INTO trigger_hist (
            trigger_hist_id, trigger_id, source_table_name, column_names, pk_column_names, create_time
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            history.id,
            history.trigger_id,
            history.table_name,
            history.columns.join(","),
            history.pk_columns.join(","),
            now_millis(),
        ],
    )?;
    Ok(())
}

/// All schema snapshots keyed by id
pub fn trigger_histories(conn: &Connection) -> Result<HashMap<i64, TriggerHistory>> {
    let mut stmt = conn.prepare(
        "SELECT trigger_hist_id, trigger_id, source_table_name, column_names, pk_column_names FROM trigger_hist",
    )?;
    let rows = stmt.query_map([], |row| {
        let columns: String = row.get(3)?;
        let pk_columns: String = row.get(4)?;
        Ok(TriggerHistory {
            id: row.get(0)?,
            trigger_id: row.get(1)?,
            table_name: row.get(2)?,
            columns: split_names(&columns),
            pk_columns: split_names(&pk_columns),
        })
    })?;

    let mut histories = HashMap::new();
    for result in rows {
        let history = result?;
        histories.insert(history.id, history);
    }
    Ok(histories)
}

fn split_names(names: &str) -> Vec<String> {
    names
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// When the change with this id was captured
pub fn create_time_of(conn: &Connection, id: DataId) -> Result<Option<DateTime<Utc>>> {
    let millis: Option<i64> = conn
        .query_row(
            "SELECT create_time FROM change_log WHERE data_id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(millis.map(from_millis))
}

/// Ids in `[start_id, end_id]` with their channel, in id order
pub fn ids_in_range(conn: &Connection, start_id: DataId, end_id: DataId) -> Result<Vec<(DataId, String)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT data_id, channel_id FROM change_log WHERE data_id BETWEEN ?1 AND ?2 ORDER BY data_id",
    )?;
    let rows: Vec<(DataId, String)> = stmt
        .query_map(params![start_id, end_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OPEN_END;
    use crate::store::Store;
    use std::time::Duration;
    use tempfile::tempdir;

    fn change(id: DataId) -> ChangeRecord {
        ChangeRecord {
            id,
            table_name: "T1".to_string(),
            event_type: EventType::Insert,
            row_data: Some(ChangeRecord::encode_values(&[Some("1")])),
            pk_data: None,
            old_data: None,
            trigger_hist_id: 1,
            channel_id: "default".to_string(),
            transaction_id: Some("tx1".to_string()),
            source_node_id: None,
            create_time: Utc::now(),
            stored_size: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("routing.db"), Duration::from_secs(1)).unwrap();
        let conn = store.lock().await;

        assert_eq!(insert(&conn, &change(0)).unwrap(), 1);
        assert_eq!(insert(&conn, &change(10)).unwrap(), 10);
        assert_eq!(insert(&conn, &change(0)).unwrap(), 11);
        let mut other = change(12);
        other.channel_id = "config".to_string();
        insert(&conn, &other).unwrap();
        assert_eq!(
            ids_in_range(&conn, 10, OPEN_END).unwrap(),
            vec![(10, "default".to_string()), (11, "default".to_string()), (12, "config".to_string())]
        );
        assert!(ids_in_range(&conn, 2, 9).unwrap().is_empty());
        assert!(create_time_of(&conn, 10).unwrap().is_some());
        assert!(create_time_of(&conn, 5).unwrap().is_none());

        let sql = format!(
            "SELECT {} FROM change_log WHERE data_id = 10",
            select_list(PayloadColumns { row_data: false, pk_data: true, old_data: true })
        );
        let record = conn.query_row(&sql, [], from_row).unwrap();
        assert_eq!(record.id, 10);
        assert_eq!(record.row_data, None);
        assert_eq!(record.transaction_id.as_deref(), Some("tx1"));
        // The omitted payload still counts toward the size
        assert_eq!(record.payload_size(), change(10).payload_size());
        assert!(record.payload_size() > 0);
    }

    #[tokio::test]
    async fn test_trigger_history_round_trip() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("routing.db"), Duration::from_secs(1)).unwrap();
        let conn = store.lock().await;

        let history = TriggerHistory {
            id: 7,
            trigger_id: "t1".to_string(),
            table_name: "T1".to_string(),
            columns: vec!["ID".to_string(), "NAME".to_string()],
            pk_columns: vec!["ID".to_string()],
        };
        insert_trigger_history(&conn, &history).unwrap();
        let loaded = trigger_histories(&conn).unwrap();
        assert_eq!(loaded.get(&7), Some(&history));
    }
}
