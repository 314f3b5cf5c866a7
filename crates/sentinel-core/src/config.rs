//! Configuration management for the Wallet Sentinel engine.
//!
//! Connection settings come from the environment (`.env` honoured).
//! Detection and risk thresholds are layered from an optional TOML file
//! plus `SENTINEL__`-prefixed environment overrides.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::env;
use std::path::Path;

/// Application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub alerts: AlertsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AlertsConfig {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub discord_webhook_url: Option<String>,
}

impl AlertsConfig {
    pub fn telegram(&self) -> Option<(&str, &str)> {
        match (&self.telegram_bot_token, &self.telegram_chat_id) {
            (Some(token), Some(chat)) => Some((token.as_str(), chat.as_str())),
            _ => None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    #[allow(clippy::result_large_err)]
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .map_err(|_| Error::config("DATABASE_URL environment variable not set"))?,
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            },
            alerts: AlertsConfig {
                telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").ok(),
                telegram_chat_id: env::var("TELEGRAM_CHAT_ID").ok(),
                discord_webhook_url: env::var("DISCORD_WEBHOOK_URL").ok(),
            },
        })
    }

    /// Load configuration for testing (with defaults).
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/sentinel_test".to_string(),
                max_connections: 2,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            alerts: AlertsConfig::default(),
        }
    }
}

/// Deserialize `T` from an optional TOML file overlaid with environment
/// variables under `prefix` (nested keys separated by `__`).
///
/// Missing keys fall back to `T`'s serde defaults.
pub fn load_layered<T: DeserializeOwned>(path: Option<&Path>, prefix: &str) -> Result<T> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
    }
    let settings = builder
        .add_source(
            config::Environment::with_prefix(prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    Ok(settings.try_deserialize()?)
}

/// Reject a threshold outside `[0, 1]`.
pub fn require_unit(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) || value.is_nan() {
        return Err(Error::config(format!(
            "{} must be within [0, 1], got {}",
            name, value
        )));
    }
    Ok(())
}

/// Reject a non-positive quantity.
pub fn require_positive(name: &str, value: f64) -> Result<()> {
    if value <= 0.0 || value.is_nan() {
        return Err(Error::config(format!("{} must be positive, got {}", name, value)));
    }
    Ok(())
}
