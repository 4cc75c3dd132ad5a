//! Environment-backed configuration for both services.
//!
//! Both binaries call `dotenvy::dotenv().ok()` before loading one of these
//! structs. Required keys fail fast with a `KeyNotFound` error naming the
//! missing key so a misconfigured deployment dies at startup rather than on
//! the first session.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub const ENV_DB_PATH: &str = "DB_PATH";
pub const ENV_DB_ENCRYPTION_KEY: &str = "DB_ENCRYPTION_KEY";
pub const ENV_ZMQ_SOCKET_PATH: &str = "ZMQ_SOCKET_PATH";
pub const ENV_ZMQ_TIMEOUT_MS: &str = "ZMQ_TIMEOUT_MS";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_OPENAI_REALTIME_URL: &str = "OPENAI_REALTIME_URL";
pub const ENV_GEMINI_API_KEY: &str = "GEMINI_API_KEY";

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_UPSTREAM_URL: &str = "wss://api.openai.com/v1/realtime";

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Surfaced to logs as INTERNAL_ENV_KEY_NOT_FOUND.
    #[error("missing required environment key {0}")]
    KeyNotFound(String),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

fn require(key: &str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::KeyNotFound(key.to_string()))
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Configuration for the front-end gateway process.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Unix socket path the datastore listens on.
    pub socket_path: PathBuf,
    /// Per-request IPC timeout.
    pub request_timeout: Duration,
    /// Bearer credential for the upstream realtime provider.
    pub openai_api_key: String,
    /// Upstream WebSocket endpoint.
    pub upstream_url: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            socket_path: PathBuf::from(require(ENV_ZMQ_SOCKET_PATH)?),
            request_timeout: request_timeout_from_env()?,
            openai_api_key: require(ENV_OPENAI_API_KEY)?,
            upstream_url: optional(ENV_OPENAI_REALTIME_URL)
                .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string()),
        })
    }
}

/// Configuration for the back-end datastore process.
#[derive(Debug, Clone)]
pub struct DatastoreConfig {
    /// Path of the encrypted database file.
    pub db_path: PathBuf,
    /// SQLCipher key applied by pragma when a connection is acquired.
    pub encryption_key: String,
    /// Unix socket path to bind the IPC listener on.
    pub socket_path: PathBuf,
    /// Enables the background summarizer when present.
    pub gemini_api_key: Option<String>,
}

impl DatastoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            db_path: PathBuf::from(require(ENV_DB_PATH)?),
            encryption_key: require(ENV_DB_ENCRYPTION_KEY)?,
            socket_path: PathBuf::from(require(ENV_ZMQ_SOCKET_PATH)?),
            gemini_api_key: optional(ENV_GEMINI_API_KEY),
        })
    }
}

fn request_timeout_from_env() -> Result<Duration, ConfigError> {
    match optional(ENV_ZMQ_TIMEOUT_MS) {
        None => Ok(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)),
        Some(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ConfigError::InvalidValue {
                key: ENV_ZMQ_TIMEOUT_MS,
                value: raw,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global, so these tests use keys that only this
    // module touches and restore them before returning.

    #[test]
    fn test_require_missing_key() {
        env::remove_var("RSLIVE_TEST_MISSING_KEY");
        let err = require("RSLIVE_TEST_MISSING_KEY").unwrap_err();
        assert!(matches!(err, ConfigError::KeyNotFound(k) if k == "RSLIVE_TEST_MISSING_KEY"));
    }

    #[test]
    fn test_empty_value_counts_as_missing() {
        env::set_var("RSLIVE_TEST_EMPTY_KEY", "");
        assert!(require("RSLIVE_TEST_EMPTY_KEY").is_err());
        env::remove_var("RSLIVE_TEST_EMPTY_KEY");
    }

    #[test]
    fn test_timeout_default_and_parse() {
        env::remove_var(ENV_ZMQ_TIMEOUT_MS);
        assert_eq!(
            request_timeout_from_env().unwrap(),
            Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)
        );
    }
}
