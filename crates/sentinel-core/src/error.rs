//! Error types for the Wallet Sentinel engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Backing store could not be reached. Transient; the caller owns retry.
    #[error("Store unavailable: {message}")]
    StoreUnavailable { message: String },

    /// Malformed or out-of-range event. Dropped and logged, never fatal.
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Lost a serialized update race.
    #[error("State conflict: {message}")]
    StateConflict { message: String },

    /// Invalid threshold or setting. Fatal at startup only.
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),
}

impl Error {
    pub fn store(message: impl Into<String>) -> Self {
        Error::StoreUnavailable {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Configuration {
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Error::StateConflict {
            message: message.into(),
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::StoreUnavailable { .. } => true,
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
