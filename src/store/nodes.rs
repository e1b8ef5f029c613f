//! Node Directory Tables
//!
//! Maintained by registration; routers read nodes and the redirect map.

use std::collections::HashMap;

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::model::Node;

/// Insert or replace a node
pub fn upsert(conn: &Connection, node: &Node) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO node (node_id, node_group_id, external_id, sync_enabled, created_at_node_id)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(node_id) DO UPDATE SET
            node_group_id = excluded.node_group_id,
            external_id = excluded.external_id,
            sync_enabled = excluded.sync_enabled,
            created_at_node_id = excluded.created_at_node_id
        "#,
        params![
            node.node_id,
            node.node_group_id,
            node.external_id,
            node.sync_enabled,
            node.created_at_node_id,
        ],
    )?;
    Ok(())
}

/// Every known node
pub fn all(conn: &Connection) -> Result<Vec<Node>> {
    let mut stmt = conn.prepare(
        "SELECT node_id, node_group_id, external_id, sync_enabled, created_at_node_id FROM node ORDER BY node_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(Node {
            node_id: row.get(0)?,
            node_group_id: row.get(1)?,
            external_id: row.get(2)?,
            sync_enabled: row.get(3)?,
            created_at_node_id: row.get(4)?,
        })
    })?;
    let mut nodes = Vec::new();
    for result in rows {
        nodes.push(result?);
    }
    Ok(nodes)
}

/// Point an external id at the node that should receive its changes
pub fn set_redirect(conn: &Connection, external_id: &str, node_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO registration_redirect (external_id, registration_node_id) VALUES (?1, ?2)",
        params![external_id, node_id],
    )?;
    Ok(())
}

/// External id to node id remap table
pub fn redirects(conn: &Connection) -> Result<HashMap<String, String>> {
    let mut stmt = conn.prepare("SELECT external_id, registration_node_id FROM registration_redirect")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    let mut map = HashMap::new();
    for result in rows {
        let (external_id, node_id) = result?;
        map.insert(external_id, node_id);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_nodes_and_redirects() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("routing.db"), Duration::from_secs(1)).unwrap();
        let conn = store.lock().await;

        upsert(&conn, &Node::new("00000", "corp", "corp")).unwrap();
        let mut store_node = Node::new("00001", "store", "s1").created_by("00000");
        upsert(&conn, &store_node).unwrap();
        store_node.sync_enabled = false;
        upsert(&conn, &store_node).unwrap();

        let nodes = all(&conn).unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(!nodes[1].sync_enabled);
        assert_eq!(nodes[1].created_at_node_id.as_deref(), Some("00000"));

        set_redirect(&conn, "s9", "00001").unwrap();
        assert_eq!(redirects(&conn).unwrap().get("s9").map(String::as_str), Some("00001"));
    }
}
