//! Lookup-Table Router
//!
//! Resolves target nodes through an auxiliary table mapping a key to
//! external ids. The expression names the table and columns:
//!
//! ```text
//! LOOKUP_TABLE=STORE_ROUTING
//! KEY_COLUMN=STORE_ID
//! LOOKUP_KEY_COLUMN=STORE_ID
//! EXTERNAL_ID_COLUMN=EXTERNAL_ID
//! ```
//!
//! A key may map to several rows, fanning out to several nodes. The table
//! is read once per pass.

use std::collections::{BTreeSet, HashMap};

use rusqlite::Connection;

use super::{DataRouter, RouteInput};
use crate::config::RouterDef;
use crate::error::{Error, Result};
use crate::model::Node;
use crate::routing::RouterContext;

/// Parsed lookup router expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupSpec {
    pub lookup_table: String,
    /// Column of the routed row holding the key
    pub key_column: String,
    /// Column of the lookup table holding the key
    pub lookup_key_column: String,
    /// Column of the lookup table holding the node's external id
    pub external_id_column: String,
}

impl LookupSpec {
    pub fn parse(expression: &str) -> Result<Self> {
        let mut settings = HashMap::new();
        for line in expression.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::Expression(format!("lookup table setting '{}' has no '='", line))
            })?;
            settings.insert(key.trim().to_uppercase(), value.trim().to_string());
        }

        let setting = |name: &str| -> Result<String> {
            let value = settings
                .get(name)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Expression(format!("lookup table router needs {}", name)))?;
            if !is_identifier(value) {
                return Err(Error::Expression(format!("{} '{}' is not a valid identifier", name, value)));
            }
            Ok(value.clone())
        };

        Ok(Self {
            lookup_table: setting("LOOKUP_TABLE")?,
            key_column: setting("KEY_COLUMN")?,
            lookup_key_column: setting("LOOKUP_KEY_COLUMN")?,
            external_id_column: setting("EXTERNAL_ID_COLUMN")?,
        })
    }
}

/// Letters, digits and underscores, optionally schema-qualified
fn is_identifier(name: &str) -> bool {
    name.split('.').all(|part| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// Lookup table contents: key to external ids
struct LookupTable {
    spec: LookupSpec,
    rows: HashMap<String, BTreeSet<String>>,
}

impl LookupTable {
    fn load(conn: &Connection, spec: LookupSpec) -> Result<Self> {
        let sql = format!(
            "SELECT {}, {} FROM {}",
            spec.lookup_key_column, spec.external_id_column, spec.lookup_table
        );
        let mut stmt = conn.prepare(&sql)?;
        let mapped = stmt.query_map([], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?))
        })?;

        let mut rows: HashMap<String, BTreeSet<String>> = HashMap::new();
        for result in mapped {
            if let (Some(key), Some(external_id)) = result? {
                rows.entry(key).or_default().insert(external_id);
            }
        }
        tracing::debug!("Loaded {} keys from lookup table {}", rows.len(), spec.lookup_table);
        Ok(Self { spec, rows })
    }
}

pub struct LookupTableRouter;

impl DataRouter for LookupTableRouter {
    fn router_type(&self) -> &'static str {
        "lookuptable"
    }

    fn validate(&self, router: &RouterDef) -> Result<()> {
        LookupSpec::parse(router.expression())
            .map(|_| ())
            .map_err(|e| Error::Config(format!("Router '{}': {}", router.id, e)))
    }

    fn route(
        &self,
        ctx: &mut RouterContext,
        conn: &Connection,
        input: &RouteInput<'_>,
        nodes: &[Node],
        _initial_load: bool,
    ) -> Result<BTreeSet<String>> {
        let key = format!("lookuptable.{}", input.router.id);
        let table = ctx.get_or_try_insert_with(&key, || {
            let spec = LookupSpec::parse(input.router.expression())?;
            LookupTable::load(conn, spec)
        })?;

        let external_ids = match input.values.get(&table.spec.key_column).and_then(|k| table.rows.get(k)) {
            Some(ids) => ids,
            None => return Ok(BTreeSet::new()),
        };

        Ok(nodes
            .iter()
            .filter(|n| external_ids.contains(&n.external_id))
            .map(|n| n.node_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RouterFixture;

    const EXPRESSION: &str = "LOOKUP_TABLE=STORE_ROUTING\nKEY_COLUMN=REGION\nLOOKUP_KEY_COLUMN=REGION_ID\nEXTERNAL_ID_COLUMN=STORE_EXTERNAL_ID";

    async fn fixture() -> RouterFixture {
        let fixture = RouterFixture::new().await;
        let conn = fixture.store.lock().await;
        conn.execute_batch(
            "CREATE TABLE STORE_ROUTING (REGION_ID TEXT, STORE_EXTERNAL_ID TEXT);
             INSERT INTO STORE_ROUTING VALUES ('east', 's1'), ('east', 's2'), ('west', 's2');",
        )
        .unwrap();
        drop(conn);
        fixture
    }

    #[test]
    fn test_parse_spec() {
        let spec = LookupSpec::parse(EXPRESSION).unwrap();
        assert_eq!(spec.lookup_table, "STORE_ROUTING");
        assert_eq!(spec.external_id_column, "STORE_EXTERNAL_ID");

        assert!(LookupSpec::parse("LOOKUP_TABLE=T").is_err());
        assert!(LookupSpec::parse(&EXPRESSION.replace("STORE_ROUTING", "T; DROP TABLE node")).is_err());
    }

    #[tokio::test]
    async fn test_key_fans_out() {
        let fixture = fixture().await;
        let east = fixture.route(&LookupTableRouter, "lookuptable", EXPRESSION, &[("REGION", Some("east"))]).await;
        assert_eq!(east.len(), 2);

        let west = fixture.route(&LookupTableRouter, "lookuptable", EXPRESSION, &[("REGION", Some("west"))]).await;
        assert_eq!(west, ["00002".to_string()].into_iter().collect());
    }

    #[tokio::test]
    async fn test_unmatched_key_routes_nowhere() {
        let fixture = fixture().await;
        assert!(fixture
            .route(&LookupTableRouter, "lookuptable", EXPRESSION, &[("REGION", Some("north"))])
            .await
            .is_empty());
        assert!(fixture
            .route(&LookupTableRouter, "lookuptable", EXPRESSION, &[("REGION", None)])
            .await
            .is_empty());
    }
}
