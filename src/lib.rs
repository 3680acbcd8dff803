//! dbsql - PostgreSQL access layer.
//!
//! Named-parameter queries with `IN` expansion, generic row decoding, a
//! readiness probe with backoff, and driver errors classified into a small
//! stable taxonomy.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use context::Context;
pub use db::{Binding, Database, NamedArgs, NoParams, Param, Params};
pub use error::{DbError, DbResult, ErrorKind};
pub use models::ConnectionConfig;
