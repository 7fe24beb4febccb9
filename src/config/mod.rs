/// Configuration management for the Duraflow engine
///
/// Handles admin server configuration, system database location, and runtime parameters.

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Admin server configuration
    pub server: ServerConfig,
    /// System database configuration
    pub database: DatabaseConfig,
    /// Runtime/executor configuration
    pub runtime: RuntimeConfig,
}

/// HTTP admin server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
}

/// System database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file path (default: "data/duraflow.db")
    /// Use ":memory:" for an ephemeral in-memory store.
    pub path: String,
}

/// Runtime parameters for the execution engine and background loops
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Stable identifier of this executor process. Recovery scopes
    /// "pending work owned by me" to this value.
    pub executor_id: String,
    /// Queue dispatch cadence in milliseconds
    pub dispatch_interval_ms: u64,
    /// Polling cadence for workflow result handles in milliseconds
    pub result_poll_interval_ms: u64,
    /// Claims beyond this count dead-letter the workflow as RETRIES_EXCEEDED
    pub max_recovery_attempts: u32,
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for k8s/container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("DURAFLOW_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: std::env::var("DURAFLOW_PORT")
                    .unwrap_or_else(|_| "3005".to_string())
                    .parse()
                    .unwrap_or(3005),
            },
            database: DatabaseConfig {
                path: std::env::var("DURAFLOW_DATABASE_PATH")
                    .unwrap_or_else(|_| "data/duraflow.db".to_string()),
            },
            runtime: RuntimeConfig {
                executor_id: std::env::var("DURAFLOW_EXECUTOR_ID")
                    .unwrap_or_else(|_| "local".to_string()),
                dispatch_interval_ms: std::env::var("DURAFLOW_DISPATCH_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1000),
                result_poll_interval_ms: std::env::var("DURAFLOW_RESULT_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(250),
                max_recovery_attempts: std::env::var("DURAFLOW_MAX_RECOVERY_ATTEMPTS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(50),
            },
        }
    }
}
