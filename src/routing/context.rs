//! Router Context
//!
//! Scratch state for one routing pass on one channel: a string-keyed cache
//! routers use to memoize parsed expressions and lookups, pass statistics,
//! and the hooks to run once the pass's batches are committed.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::NodeConfig;
use crate::error::Result;

/// Deferred action run after the routing transaction commits
pub type PostCommitHook = Box<dyn FnOnce() + Send>;

/// Counters and timings for one channel pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct PassStats {
    pub channel_id: String,
    /// Rows taken from the reader and routed
    pub rows_read: u64,
    /// Rows the reader skipped as already routed
    pub rows_skipped: u64,
    pub data_events: u64,
    pub batches: u64,
    /// Changes recorded against the unrouted node
    pub unrouted_events: u64,
    /// Router evaluations that failed
    pub router_errors: u64,
    /// Pass ended at a limit before the reader was exhausted
    pub stopped_early: bool,
    pub query_time: Duration,
    pub read_time: Duration,
    pub route_time: Duration,
    pub enqueue_time: Duration,
}

/// Post-commit hooks keyed so each action is registered once per cycle
#[derive(Default)]
pub struct PostCommitHooks {
    hooks: Vec<(String, PostCommitHook)>,
}

impl PostCommitHooks {
    /// Register a hook; returns false if one with the same key is pending
    pub fn register(&mut self, key: &str, hook: PostCommitHook) -> bool {
        if self.hooks.iter().any(|(k, _)| k == key) {
            return false;
        }
        self.hooks.push((key.to_string(), hook));
        true
    }

    /// Move another set of hooks into this one, keeping the first of each key
    pub fn absorb(&mut self, other: PostCommitHooks) {
        for (key, hook) in other.hooks {
            self.register(&key, hook);
        }
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Keys of the pending hooks in registration order
    pub fn keys(&self) -> Vec<&str> {
        self.hooks.iter().map(|(k, _)| k.as_str()).collect()
    }

    /// Run every hook once in registration order
    pub fn run(self) -> usize {
        let count = self.hooks.len();
        for (key, hook) in self.hooks {
            tracing::debug!("Running post-commit hook {}", key);
            hook();
        }
        count
    }

    /// Drop every hook without running it
    pub fn discard(self) -> usize {
        let count = self.hooks.len();
        if count > 0 {
            tracing::debug!("Discarding {} post-commit hooks", count);
        }
        count
    }
}

impl std::fmt::Debug for PostCommitHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostCommitHooks").field("keys", &self.keys()).finish()
    }
}

/// Per-pass router scratch state
pub struct RouterContext {
    /// Node doing the routing
    node_id: String,
    node_group_id: String,
    /// Pass-scoped cache
    cache: HashMap<String, Arc<dyn Any + Send + Sync>>,
    hooks: PostCommitHooks,
    pub stats: PassStats,
}

impl RouterContext {
    pub fn new(channel_id: &str, node: &NodeConfig) -> Self {
        Self {
            node_id: node.id.clone(),
            node_group_id: node.group_id.clone(),
            cache: HashMap::new(),
            hooks: PostCommitHooks::default(),
            stats: PassStats {
                channel_id: channel_id.to_string(),
                ..Default::default()
            },
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.stats.channel_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn node_group_id(&self) -> &str {
        &self.node_group_id
    }

    /// Cached value, if present and of type `T`
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.cache.get(key).cloned().and_then(|v| v.downcast::<T>().ok())
    }

    /// Cache a value for the rest of the pass
    pub fn insert<T: Any + Send + Sync>(&mut self, key: &str, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.cache.insert(key.to_string(), value.clone());
        value
    }

    /// Cached value, computing and caching it on first use
    pub fn get_or_try_insert_with<T, F>(&mut self, key: &str, init: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.get::<T>(key) {
            return Ok(value);
        }
        let value = init()?;
        Ok(self.insert(key, value))
    }

    /// Number of cached entries
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Register an action to run once the pass commits
    pub fn register_post_commit(&mut self, key: &str, hook: PostCommitHook) -> bool {
        self.hooks.register(key, hook)
    }

    pub fn post_commit_hooks(&self) -> &PostCommitHooks {
        &self.hooks
    }

    /// Hand the pending hooks to the caller that owns the commit
    pub fn take_post_commit_hooks(&mut self) -> PostCommitHooks {
        std::mem::take(&mut self.hooks)
    }
}
