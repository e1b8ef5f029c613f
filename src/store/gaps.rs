//! Data Gap Table

use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::model::{from_millis, now_millis, DataGap, DataId, GapStatus};

fn from_row(row: &Row<'_>) -> rusqlite::Result<DataGap> {
    let code: String = row.get(2)?;
    let status = GapStatus::from_code(&code).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(DataGap {
        start_id: row.get(0)?,
        end_id: row.get(1)?,
        status,
        create_time: from_millis(row.get(3)?),
        last_update_time: from_millis(row.get(4)?),
    })
}

fn query(conn: &Connection, sql: &str) -> Result<Vec<DataGap>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], from_row)?;
    let mut gaps = Vec::new();
    for result in rows {
        gaps.push(result?);
    }
    Ok(gaps)
}

/// Active gaps in ascending order
pub fn active(conn: &Connection) -> Result<Vec<DataGap>> {
    query(
        conn,
        "SELECT start_id, end_id, status, create_time, last_update_time FROM data_gap \
         WHERE status = 'GP' ORDER BY start_id",
    )
}

/// Every gap regardless of status
pub fn all(conn: &Connection) -> Result<Vec<DataGap>> {
    query(
        conn,
        "SELECT start_id, end_id, status, create_time, last_update_time FROM data_gap ORDER BY start_id, end_id",
    )
}

/// Insert a gap; an existing gap with the same range takes the new status
pub fn insert(conn: &Connection, gap: &DataGap) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO data_gap (start_id, end_id, status, create_time, last_update_time)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(start_id, end_id) DO UPDATE SET
            status = excluded.status,
            last_update_time = excluded.last_update_time
        "#,
        params![
            gap.start_id,
            gap.end_id,
            gap.status.code(),
            gap.create_time.timestamp_millis(),
            gap.last_update_time.timestamp_millis(),
        ],
    )?;
    Ok(())
}

/// Change a gap's status
pub fn set_status(conn: &Connection, start_id: DataId, end_id: DataId, status: GapStatus) -> Result<()> {
    conn.execute(
        "UPDATE data_gap SET status = ?1, last_update_time = ?2 WHERE start_id = ?3 AND end_id = ?4",
        params![status.code(), now_millis(), start_id, end_id],
    )?;
    Ok(())
}

/// Delete filled and skipped gaps last touched before the cutoff
pub fn purge(conn: &Connection, older_than_millis: i64) -> Result<usize> {
    let deleted = conn.execute(
        "DELETE FROM data_gap WHERE status IN ('OK', 'SK') AND last_update_time < ?1",
        params![older_than_millis],
    )?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_gap_lifecycle() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("routing.db"), Duration::from_secs(1)).unwrap();
        let conn = store.lock().await;

        insert(&conn, &DataGap::open(20)).unwrap();
        insert(&conn, &DataGap::new(5, 9)).unwrap();
        insert(&conn, &DataGap::new(12, 14)).unwrap();

        let gaps = active(&conn).unwrap();
        assert_eq!(gaps.iter().map(|g| g.start_id).collect::<Vec<_>>(), vec![5, 12, 20]);
        assert!(gaps[2].is_open_ended());

        set_status(&conn, 5, 9, GapStatus::Skip).unwrap();
        set_status(&conn, 12, 14, GapStatus::Filled).unwrap();
        assert_eq!(active(&conn).unwrap().len(), 1);
        assert_eq!(all(&conn).unwrap().len(), 3);

        assert_eq!(purge(&conn, now_millis() + 1000).unwrap(), 2);
        assert_eq!(all(&conn).unwrap().len(), 1);
    }
}
