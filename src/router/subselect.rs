//! Subselect Router
//!
//! The expression is a SQL predicate over the node table (aliased `c`),
//! with `:COLUMN` parameters bound from the change's values:
//!
//! ```text
//! c.external_id = :STORE_ID
//! ```
//!
//! `:NODE_GROUP_ID` binds the router's target group. Parameters naming a
//! column the row does not have are bound as NULL.

use std::collections::BTreeSet;

use rusqlite::Connection;

use super::{DataRouter, RouteInput};
use crate::config::RouterDef;
use crate::error::{Error, Result};
use crate::model::Node;
use crate::routing::RouterContext;

const NODE_GROUP_PARAM: &str = ":NODE_GROUP_ID";

/// Full query for a subselect expression
pub fn build_sql(expression: &str) -> String {
    format!(
        "SELECT c.node_id FROM node c WHERE c.node_group_id = {} AND c.sync_enabled = 1 AND ({})",
        NODE_GROUP_PARAM, expression
    )
}

pub struct SubselectRouter;

impl DataRouter for SubselectRouter {
    fn router_type(&self) -> &'static str {
        "subselect"
    }

    fn validate(&self, router: &RouterDef) -> Result<()> {
        if router.expression().trim().is_empty() {
            return Err(Error::Config(format!(
                "Router '{}': subselect router needs an expression",
                router.id
            )));
        }
        Ok(())
    }

    fn route(
        &self,
        _ctx: &mut RouterContext,
        conn: &Connection,
        input: &RouteInput<'_>,
        nodes: &[Node],
        _initial_load: bool,
    ) -> Result<BTreeSet<String>> {
        let sql = build_sql(input.router.expression());
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|e| Error::router(&input.router.id, e))?;

        for index in 1..=stmt.parameter_count() {
            let value = match stmt.parameter_name(index) {
                Some(NODE_GROUP_PARAM) => Some(input.router.target_group.clone()),
                Some(name) => {
                    let column = name.trim_start_matches([':', '@', '$']);
                    input.values.get(column).map(str::to_string)
                }
                None => None,
            };
            stmt.raw_bind_parameter(index, value)
                .map_err(|e| Error::router(&input.router.id, e))?;
        }

        let mut rows = stmt.raw_query();
        let mut selected = BTreeSet::new();
        while let Some(row) = rows.next().map_err(|e| Error::router(&input.router.id, e))? {
            let node_id: String = row.get(0).map_err(|e| Error::router(&input.router.id, e))?;
            if nodes.iter().any(|n| n.node_id == node_id) {
                selected.insert(node_id);
            }
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RouterFixture;

    #[tokio::test]
    async fn test_predicate_binds_row_values() {
        let fixture = RouterFixture::new().await;
        let routed = fixture
            .route(&SubselectRouter, "subselect", "c.external_id = :STORE_ID", &[("STORE_ID", Some("s2"))])
            .await;
        assert_eq!(routed, ["00002".to_string()].into_iter().collect());
    }

    #[tokio::test]
    async fn test_missing_column_binds_null() {
        let fixture = RouterFixture::new().await;
        let routed = fixture
            .route(&SubselectRouter, "subselect", "c.external_id = :UNKNOWN OR :UNKNOWN IS NULL", &[("ID", Some("1"))])
            .await;
        assert_eq!(routed.len(), 2);
    }

    #[tokio::test]
    async fn test_bad_sql_is_a_router_error() {
        let fixture = RouterFixture::new().await;
        let mut ctx = fixture.context();
        let def = RouterDef::new("broken", "subselect", "corp", "store").with_expression("c.no_such_column = 1");
        let result = fixture.route_insert(&mut ctx, &SubselectRouter, &def, &[("ID", Some("1"))]).await;
        assert!(matches!(result, Err(Error::Router { .. })));
    }

    #[test]
    fn test_empty_expression_rejected() {
        let def = RouterDef::new("r", "subselect", "corp", "store");
        assert!(SubselectRouter.validate(&def).is_err());
    }
}
