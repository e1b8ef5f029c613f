//! WolfRoute Configuration
//!
//! This module provides configuration structures for the routing service:
//! node identity, the routing store, transaction visibility, routing
//! tunables, and the channel / router / trigger definitions the routing
//! pipeline runs against.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::model::EventType;

/// Main WolfRoute configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterServiceConfig {
    /// Identity of the node doing the routing
    pub node: NodeConfig,

    /// Routing store configuration
    pub database: DatabaseConfig,

    /// Transaction visibility platform
    #[serde(default)]
    pub platform: PlatformConfig,

    /// Routing tunables
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Channel definitions
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,

    /// Router definitions
    #[serde(default)]
    pub routers: Vec<RouterDef>,

    /// Captured tables and the routers attached to them
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
}

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Node group this node belongs to
    pub group_id: String,
}

/// Routing store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding the change log, gaps and batches
    pub path: PathBuf,

    /// How long to wait on a locked database, in milliseconds
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

/// Which platform answers "are there open transactions?"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// No transaction visibility; gaps are skipped on staleness
    #[default]
    Sqlite,
    /// Query InnoDB's open transaction list
    Mariadb,
}

/// Transaction visibility platform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub kind: PlatformKind,

    /// MariaDB host
    #[serde(default)]
    pub host: String,

    /// MariaDB port
    #[serde(default = "default_db_port")]
    pub port: u16,

    /// Database user
    #[serde(default)]
    pub user: String,

    /// Database password
    #[serde(default)]
    pub password: String,

    /// Database name
    #[serde(default)]
    pub database: Option<String>,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// Routing tunables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Interval between routing cycles in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Default reader queue capacity
    #[serde(default = "default_peek_ahead_window")]
    pub peek_ahead_window: usize,

    /// How long the consumer waits on the reader before declaring it stalled
    #[serde(default = "default_take_timeout_ms")]
    pub take_timeout_ms: u64,

    /// Producer retry interval while the reader queue is full
    #[serde(default = "default_queue_retry_ms")]
    pub queue_retry_ms: u64,

    /// Age after which an empty gap is skipped when transactions are not visible
    #[serde(default = "default_stale_gap_ms")]
    pub stale_gap_ms: u64,

    /// Above this many active gaps the reader uses one `id >=` query
    #[serde(default = "default_max_gaps_before_greater_than_query")]
    pub max_gaps_before_greater_than_query: usize,

    /// Retention for filled and skipped gaps in hours (0 = keep forever)
    #[serde(default = "default_gap_retention_hours")]
    pub gap_retention_hours: u64,

    /// Prefix of the topology tables the configuration router watches
    #[serde(default = "default_topology_table_prefix")]
    pub topology_table_prefix: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Batch boundary policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BatchAlgorithm {
    /// Cut at max size, but never inside a transaction
    #[default]
    Default,
    /// Cut at every transaction boundary
    Transactional,
    /// Cut at max size regardless of transactions
    Nontransactional,
}

impl std::fmt::Display for BatchAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchAlgorithm::Default => write!(f, "default"),
            BatchAlgorithm::Transactional => write!(f, "transactional"),
            BatchAlgorithm::Nontransactional => write!(f, "nontransactional"),
        }
    }
}

/// Channel definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel id
    pub id: String,

    /// Batch boundary policy
    #[serde(default)]
    pub batch_algorithm: BatchAlgorithm,

    /// Nominal events per batch
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Batches one node may receive per pass (0 = unlimited)
    #[serde(default)]
    pub max_batches_per_pass: usize,

    /// Changes one pass may route before ending at a transaction boundary
    #[serde(default = "default_max_data_to_route")]
    pub max_data_to_route: usize,

    /// Reader queue capacity override
    #[serde(default)]
    pub peek_ahead_window: Option<usize>,

    /// Whether routers need previous row values
    #[serde(default = "default_true")]
    pub use_old_data_to_route: bool,

    /// Whether routers need current row values
    #[serde(default = "default_true")]
    pub use_row_data_to_route: bool,

    /// Whether routers need primary key values
    #[serde(default = "default_true")]
    pub use_pk_data_to_route: bool,

    /// Disabled channels are not routed
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ChannelConfig {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            batch_algorithm: BatchAlgorithm::Default,
            max_batch_size: default_max_batch_size(),
            max_batches_per_pass: 0,
            max_data_to_route: default_max_data_to_route(),
            peek_ahead_window: None,
            use_old_data_to_route: true,
            use_row_data_to_route: true,
            use_pk_data_to_route: true,
            enabled: true,
        }
    }
}

/// Router definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterDef {
    /// Router id
    pub id: String,

    /// Router type name, resolved against the router registry
    #[serde(rename = "type", default = "default_router_type")]
    pub router_type: String,

    /// Group whose changes this router handles
    pub source_group: String,

    /// Group whose nodes are candidates
    pub target_group: String,

    /// Type-specific expression
    #[serde(default)]
    pub expression: Option<String>,

    #[serde(default = "default_true")]
    pub sync_on_insert: bool,

    #[serde(default = "default_true")]
    pub sync_on_update: bool,

    #[serde(default = "default_true")]
    pub sync_on_delete: bool,
}

impl RouterDef {
    pub fn new(id: &str, router_type: &str, source_group: &str, target_group: &str) -> Self {
        Self {
            id: id.to_string(),
            router_type: router_type.to_string(),
            source_group: source_group.to_string(),
            target_group: target_group.to_string(),
            expression: None,
            sync_on_insert: true,
            sync_on_update: true,
            sync_on_delete: true,
        }
    }

    pub fn with_expression(mut self, expression: &str) -> Self {
        self.expression = Some(expression.to_string());
        self
    }

    /// Expression text, empty when not configured
    pub fn expression(&self) -> &str {
        self.expression.as_deref().unwrap_or("")
    }

    /// Whether this router handles the given event type
    pub fn applies_to(&self, event_type: EventType) -> bool {
        match event_type {
            EventType::Insert => self.sync_on_insert,
            EventType::Update => self.sync_on_update,
            EventType::Delete => self.sync_on_delete,
            _ => true,
        }
    }
}

/// Captured table definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDef {
    /// Trigger id, referenced by schema snapshots
    pub id: String,

    /// Captured table
    pub table: String,

    /// Channel the table's changes are captured into
    pub channel: String,

    /// Routers applied to the table's changes
    #[serde(default)]
    pub routers: Vec<String>,
}

// Default value functions
fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_db_port() -> u16 {
    3306
}

fn default_pool_size() -> u32 {
    2
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_peek_ahead_window() -> usize {
    100
}

fn default_take_timeout_ms() -> u64 {
    300_000
}

fn default_queue_retry_ms() -> u64 {
    50
}

fn default_stale_gap_ms() -> u64 {
    1_200_000
}

fn default_max_gaps_before_greater_than_query() -> usize {
    100
}

fn default_gap_retention_hours() -> u64 {
    24
}

fn default_topology_table_prefix() -> String {
    "sym".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_max_data_to_route() -> usize {
    100_000
}

fn default_router_type() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            kind: PlatformKind::Sqlite,
            host: String::new(),
            port: default_db_port(),
            user: String::new(),
            password: String::new(),
            database: None,
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            peek_ahead_window: default_peek_ahead_window(),
            take_timeout_ms: default_take_timeout_ms(),
            queue_retry_ms: default_queue_retry_ms(),
            stale_gap_ms: default_stale_gap_ms(),
            max_gaps_before_greater_than_query: default_max_gaps_before_greater_than_query(),
            gap_retention_hours: default_gap_retention_hours(),
            topology_table_prefix: default_topology_table_prefix(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl RouterServiceConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: RouterServiceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.group_id.is_empty() {
            return Err(crate::Error::Config("node.group_id cannot be empty".into()));
        }

        if self.database.path.as_os_str().is_empty() {
            return Err(crate::Error::Config("database.path cannot be empty".into()));
        }

        if self.platform.kind == PlatformKind::Mariadb && self.platform.host.is_empty() {
            return Err(crate::Error::Config(
                "platform.host is required for the mariadb platform".into(),
            ));
        }

        if self.routing.peek_ahead_window == 0 {
            return Err(crate::Error::Config("routing.peek_ahead_window must be > 0".into()));
        }

        let mut channel_ids = HashSet::new();
        for channel in &self.channels {
            if channel.id.is_empty() {
                return Err(crate::Error::Config("channel id cannot be empty".into()));
            }
            if !channel_ids.insert(channel.id.as_str()) {
                return Err(crate::Error::Config(format!("duplicate channel '{}'", channel.id)));
            }
            if channel.max_batch_size == 0 {
                return Err(crate::Error::Config(format!(
                    "channel '{}': max_batch_size must be > 0",
                    channel.id
                )));
            }
            if channel.peek_ahead_window == Some(0) {
                return Err(crate::Error::Config(format!(
                    "channel '{}': peek_ahead_window must be > 0",
                    channel.id
                )));
            }
        }

        let mut router_ids = HashSet::new();
        for router in &self.routers {
            if router.id.is_empty() {
                return Err(crate::Error::Config("router id cannot be empty".into()));
            }
            if !router_ids.insert(router.id.as_str()) {
                return Err(crate::Error::Config(format!("duplicate router '{}'", router.id)));
            }
        }

        for trigger in &self.triggers {
            if !channel_ids.contains(trigger.channel.as_str()) {
                return Err(crate::Error::Config(format!(
                    "trigger '{}' references unknown channel '{}'",
                    trigger.id, trigger.channel
                )));
            }
            for router_id in &trigger.routers {
                if !router_ids.contains(router_id.as_str()) {
                    return Err(crate::Error::Config(format!(
                        "trigger '{}' references unknown router '{}'",
                        trigger.id, router_id
                    )));
                }
            }
        }

        Ok(())
    }

    /// Find a channel by id
    pub fn channel(&self, id: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// Find a router by id
    pub fn router(&self, id: &str) -> Option<&RouterDef> {
        self.routers.iter().find(|r| r.id == id)
    }

    /// Find a trigger by id
    pub fn trigger(&self, id: &str) -> Option<&TriggerDef> {
        self.triggers.iter().find(|t| t.id == id)
    }

    /// Reader queue capacity for a channel
    pub fn peek_ahead_window(&self, channel: &ChannelConfig) -> usize {
        channel
            .peek_ahead_window
            .unwrap_or(self.routing.peek_ahead_window)
    }

    /// Get routing interval as Duration
    pub fn routing_interval(&self) -> Duration {
        Duration::from_millis(self.routing.interval_ms)
    }

    /// Get reader take timeout as Duration
    pub fn take_timeout(&self) -> Duration {
        Duration::from_millis(self.routing.take_timeout_ms)
    }

    /// Get producer retry interval as Duration
    pub fn queue_retry_interval(&self) -> Duration {
        Duration::from_millis(self.routing.queue_retry_ms)
    }

    /// Get the gap staleness threshold as Duration
    pub fn stale_gap_threshold(&self) -> Duration {
        Duration::from_millis(self.routing.stale_gap_ms)
    }

    /// Get MariaDB connection URL for the visibility platform
    pub fn platform_url(&self) -> String {
        let p = &self.platform;
        match &p.database {
            Some(db) => format!("mysql://{}:{}@{}:{}/{}", p.user, p.password, p.host, p.port, db),
            None => format!("mysql://{}:{}@{}:{}", p.user, p.password, p.host, p.port),
        }
    }
}
