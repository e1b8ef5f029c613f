//! WolfRoute Error Types

use thiserror::Error;

/// Result type alias for WolfRoute operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfRoute error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Router errors
    #[error("Invalid router expression: {0}")]
    Expression(String),

    #[error("Router {router_id} failed: {reason}")]
    Router { router_id: String, reason: String },

    #[error("Script evaluation failed: {0}")]
    Script(String),

    // Reader errors
    #[error("Reader for channel {channel_id} stalled: no data within {waited_ms} ms")]
    ReaderStalled { channel_id: String, waited_ms: u64 },

    #[error("Reader error: {0}")]
    Reader(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable on the next routing cycle
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_)
                | Error::Store(_)
                | Error::Reader(_)
                | Error::ReaderStalled { .. }
                | Error::Io(_)
        )
    }

    /// Check if this error is an operator-facing misconfiguration
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::ConfigParse(_) | Error::Expression(_)
        )
    }

    /// Wrap an error raised while evaluating a router
    pub fn router(router_id: &str, reason: impl std::fmt::Display) -> Self {
        Error::Router {
            router_id: router_id.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(format!("SQLite error: {}", e))
    }
}
