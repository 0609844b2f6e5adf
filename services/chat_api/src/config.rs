//! services/chat_api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use campus_chat_core::{BackoffPolicy, SessionSettings};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// `None` runs the service on the in-memory store.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub log_level: Level,
    pub cors_origin: String,
    pub store_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        // --- Server and Database Settings ---
        let bind_address: SocketAddr = parse_or(&lookup, "BIND_ADDRESS", "0.0.0.0:3000".parse().ok())?;
        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        let db_max_connections: u32 = parse_or(&lookup, "DB_MAX_CONNECTIONS", Some(5))?;

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let cors_origin = lookup("CORS_ORIGIN").unwrap_or_else(|| "http://localhost:3000".to_string());

        // --- Chat Session Settings ---
        let store_timeout = millis(&lookup, "STORE_TIMEOUT_MS", 10_000)?;
        let reconnect_base = millis(&lookup, "FEED_RECONNECT_BASE_MS", 500)?;
        let reconnect_max = millis(&lookup, "FEED_RECONNECT_MAX_MS", 30_000)?;
        if reconnect_max < reconnect_base {
            return Err(ConfigError::InvalidValue(
                "FEED_RECONNECT_MAX_MS".to_string(),
                "must not be smaller than FEED_RECONNECT_BASE_MS".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            database_url,
            db_max_connections,
            log_level,
            cors_origin,
            store_timeout,
            reconnect_base,
            reconnect_max,
        })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy { base: self.reconnect_base, max: self.reconnect_max }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings { store_timeout: self.store_timeout, reconnect: self.backoff() }
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: Option<T>,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => default.ok_or_else(|| ConfigError::MissingVar(name.to_string())),
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: u64) -> Result<Duration, ConfigError> {
    let value: u64 = parse_or(lookup, name, Some(default))?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(name.to_string(), "must be greater than zero".to_string()));
    }
    Ok(Duration::from_millis(value))
}
