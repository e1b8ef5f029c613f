//! Transaction Visibility
//!
//! Gap reconciliation needs to know whether a change id that has not shown
//! up yet could still be committed. Platforms that can list open
//! transactions answer that directly; others fall back to gap age.

pub mod mariadb;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{PlatformKind, RouterServiceConfig};
use crate::error::Result;

pub use mariadb::MariaDbVisibility;

/// Answers whether transactions are still open on the source database
#[async_trait]
pub trait TransactionVisibility: Send + Sync {
    /// Platform name for logging
    fn name(&self) -> &'static str;

    /// Whether [`earliest_open_transaction`](Self::earliest_open_transaction) is meaningful
    fn supports_visibility(&self) -> bool;

    /// Start time of the oldest open transaction, or `None` if none are open
    async fn earliest_open_transaction(&self) -> Result<Option<DateTime<Utc>>>;
}

/// Platform without transaction visibility
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVisibility;

#[async_trait]
impl TransactionVisibility for NoVisibility {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn supports_visibility(&self) -> bool {
        false
    }

    async fn earliest_open_transaction(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(None)
    }
}

/// Build the visibility platform named by the configuration
pub async fn connect(config: &RouterServiceConfig) -> Result<Arc<dyn TransactionVisibility>> {
    match config.platform.kind {
        PlatformKind::Sqlite => Ok(Arc::new(NoVisibility)),
        PlatformKind::Mariadb => {
            let platform = MariaDbVisibility::new(config).await?;
            tracing::info!(
                "Connected to MariaDB at {}:{} for transaction visibility",
                config.platform.host,
                config.platform.port
            );
            Ok(Arc::new(platform))
        }
    }
}
