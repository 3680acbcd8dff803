//! Error types for the database access layer.
//!
//! Every failure surfaced by this crate is a [`DbError`]. Callers that only
//! care about the semantic category compare [`DbError::kind`] against an
//! [`ErrorKind`], which is a plain value and stable across module boundaries.

use std::borrow::Cow;
use thiserror::Error;

/// Closed set of semantic error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Zero rows where exactly one was expected.
    NotFound,
    /// Unique-constraint violation (SQLSTATE 23505).
    DuplicateEntry,
    /// Relation does not exist (SQLSTATE 42P01).
    UndefinedTable,
    /// The caller's context was cancelled.
    Cancelled,
    /// The caller's deadline elapsed.
    DeadlineExceeded,
    /// Anything unclassified: driver, binding, decode or configuration failures.
    Other,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NotFound => "not found",
            Self::DuplicateEntry => "duplicated entry",
            Self::UndefinedTable => "undefined table",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("not found")]
    NotFound,

    #[error("duplicated entry")]
    DuplicateEntry { source: sqlx::Error },

    #[error("undefined table")]
    UndefinedTable { source: sqlx::Error },

    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Named parameter binding failed: {message}")]
    Bind { message: String },

    #[error("Failed to decode row into {target}: {source}")]
    Decode {
        target: &'static str,
        source: sqlx::Error,
    },

    #[error("{operation}: {source}")]
    Database {
        operation: &'static str,
        /// e.g., "42601" for a syntax error
        sql_state: Option<String>,
        source: sqlx::Error,
    },
}

impl DbError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a named-parameter binding error.
    pub fn bind(message: impl Into<String>) -> Self {
        Self::Bind {
            message: message.into(),
        }
    }

    /// Wrap a row decode failure for the target type `T`.
    pub fn decode<T>(source: sqlx::Error) -> Self {
        Self::Decode {
            target: std::any::type_name::<T>(),
            source,
        }
    }

    /// Wrap an unclassified driver error, keeping its SQLSTATE if it has one.
    pub fn database(operation: &'static str, source: sqlx::Error) -> Self {
        let sql_state = crate::db::classify::sql_state(&source).map(Cow::into_owned);
        Self::Database {
            operation,
            sql_state,
            source,
        }
    }

    /// Project this error onto its semantic category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::DuplicateEntry { .. } => ErrorKind::DuplicateEntry,
            Self::UndefinedTable { .. } => ErrorKind::UndefinedTable,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::DeadlineExceeded => ErrorKind::DeadlineExceeded,
            Self::Config { .. } | Self::Bind { .. } | Self::Decode { .. } | Self::Database { .. } => {
                ErrorKind::Other
            }
        }
    }

    /// Check if this error is of the given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }

    /// SQLSTATE code reported by the server, if any.
    pub fn sql_state(&self) -> Option<Cow<'_, str>> {
        match self {
            Self::DuplicateEntry { source } | Self::UndefinedTable { source } => {
                crate::db::classify::sql_state(source)
            }
            Self::Database { sql_state, .. } => sql_state.as_deref().map(Cow::Borrowed),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Only transport-level failures qualify. Decode and binding failures
    /// indicate a shape mismatch and must never be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database { source, .. } => matches!(
                source,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
