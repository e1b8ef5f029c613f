//! Default Router
//!
//! Sends every change to every candidate node of the target group.

use std::collections::BTreeSet;

use rusqlite::Connection;

use super::{all_nodes, DataRouter, RouteInput};
use crate::error::Result;
use crate::model::Node;
use crate::routing::RouterContext;

pub struct DefaultRouter;

impl DataRouter for DefaultRouter {
    fn router_type(&self) -> &'static str {
        "default"
    }

    fn route(
        &self,
        _ctx: &mut RouterContext,
        _conn: &Connection,
        _input: &RouteInput<'_>,
        nodes: &[Node],
        _initial_load: bool,
    ) -> Result<BTreeSet<String>> {
        Ok(all_nodes(nodes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RouterFixture;

    #[tokio::test]
    async fn test_routes_to_all_candidates() {
        let fixture = RouterFixture::new().await;
        let routed = fixture.route(&DefaultRouter, "default", "", &[("ID", Some("1"))]).await;
        assert_eq!(routed, ["00001", "00002"].iter().map(|s| s.to_string()).collect());
    }
}
