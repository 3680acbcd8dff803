//! Data models for the database access layer.

pub mod connection;

pub use connection::{ConnectionConfig, ConnectionConfigError, DEFAULT_MAX_CONNECTIONS};
