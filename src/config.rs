//! Configuration handling for the database layer.
//!
//! This module provides configuration management via CLI arguments and environment variables.

use crate::models::{ConnectionConfig, ConnectionConfigError};
use clap::{ArgAction, Parser};
use std::time::Duration;

pub const DEFAULT_DB_USER: &str = "postgres";
pub const DEFAULT_DB_PASSWORD: &str = "postgres";
pub const DEFAULT_DB_HOST: &str = "localhost:5432";
pub const DEFAULT_DB_NAME: &str = "postgres";
pub const DEFAULT_MAX_IDLE_CONNS: u32 = 2;
pub const DEFAULT_MAX_OPEN_CONNS: u32 = 0;
pub const DEFAULT_STATUS_TIMEOUT_MS: u64 = 1000;

// Pool configuration defaults
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

/// Configuration for the database layer and the readiness probe.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dbsql-status",
    about = "Check that the configured PostgreSQL database is ready to serve queries",
    version
)]
pub struct Config {
    /// Database user
    #[arg(long, default_value = DEFAULT_DB_USER, env = "DB_USER")]
    pub db_user: String,

    /// Database password (sensitive - not logged)
    #[arg(
        long,
        default_value = DEFAULT_DB_PASSWORD,
        env = "DB_PASSWORD",
        hide_env_values = true,
        hide_default_value = true
    )]
    pub db_password: String,

    /// Database host, optionally with port
    #[arg(long, default_value = DEFAULT_DB_HOST, env = "DB_HOST")]
    pub db_host: String,

    /// Database name
    #[arg(long, default_value = DEFAULT_DB_NAME, env = "DB_NAME")]
    pub db_name: String,

    /// Schema to put on the search path (empty for the server default)
    #[arg(long, default_value = "", env = "DB_SCHEMA")]
    pub db_schema: String,

    /// Idle connections kept in the pool
    #[arg(long, default_value_t = DEFAULT_MAX_IDLE_CONNS, env = "DB_MAX_IDLE_CONNS")]
    pub db_max_idle_conns: u32,

    /// Maximum open connections (0 for the pool default)
    #[arg(long, default_value_t = DEFAULT_MAX_OPEN_CONNS, env = "DB_MAX_OPEN_CONNS")]
    pub db_max_open_conns: u32,

    /// Connect without TLS
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "DB_DISABLE_TLS")]
    pub db_disable_tls: bool,

    /// Readiness probe timeout in milliseconds
    #[arg(long, default_value_t = DEFAULT_STATUS_TIMEOUT_MS, env = "DB_STATUS_TIMEOUT_MS")]
    pub status_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            db_user: DEFAULT_DB_USER.to_string(),
            db_password: DEFAULT_DB_PASSWORD.to_string(),
            db_host: DEFAULT_DB_HOST.to_string(),
            db_name: DEFAULT_DB_NAME.to_string(),
            db_schema: String::new(),
            db_max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            db_max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            db_disable_tls: true,
            status_timeout_ms: DEFAULT_STATUS_TIMEOUT_MS,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.db_max_open_conns > 0 && self.db_max_idle_conns > self.db_max_open_conns {
            return Err(format!(
                "db_max_idle_conns ({}) cannot exceed db_max_open_conns ({})",
                self.db_max_idle_conns, self.db_max_open_conns
            ));
        }
        if self.status_timeout_ms == 0 {
            return Err("status_timeout_ms must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Build the immutable connection settings.
    pub fn connection_config(&self) -> Result<ConnectionConfig, ConnectionConfigError> {
        Ok(ConnectionConfig::new(
            &self.db_user,
            &self.db_password,
            &self.db_host,
            &self.db_name,
        )?
        .with_schema(&self.db_schema)
        .with_pool_sizes(self.db_max_idle_conns, self.db_max_open_conns)
        .with_disable_tls(self.db_disable_tls))
    }

    /// Get the readiness probe timeout as a Duration.
    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
