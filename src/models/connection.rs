//! Connection-related data models.
//!
//! This module defines the immutable settings used to open a [`Database`].
//!
//! [`Database`]: crate::db::Database

use serde::{Deserialize, Serialize};
use url::Url;

/// Pool size used when `max_open_conns` is zero.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Configuration for a PostgreSQL connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub user: String,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub password: String,
    /// Host name, optionally with `:port`.
    pub host: String,
    pub name: String,
    /// Schema placed on the search path. Empty means the server default.
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub max_idle_conns: u32,
    /// Zero means the pool default.
    #[serde(default)]
    pub max_open_conns: u32,
    #[serde(default)]
    pub disable_tls: bool,
}

impl ConnectionConfig {
    /// Create a new connection configuration.
    pub fn new(
        user: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, ConnectionConfigError> {
        let user = user.into();
        let host = host.into();
        let name = name.into();

        if user.is_empty() {
            return Err(ConnectionConfigError::EmptyUser);
        }
        if host.is_empty() {
            return Err(ConnectionConfigError::EmptyHost);
        }
        if name.is_empty() {
            return Err(ConnectionConfigError::EmptyName);
        }

        Ok(Self {
            user,
            password: password.into(),
            host,
            name,
            schema: String::new(),
            max_idle_conns: 0,
            max_open_conns: 0,
            disable_tls: false,
        })
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_pool_sizes(mut self, max_idle_conns: u32, max_open_conns: u32) -> Self {
        self.max_idle_conns = max_idle_conns;
        self.max_open_conns = max_open_conns;
        self
    }

    pub fn with_disable_tls(mut self, disable_tls: bool) -> Self {
        self.disable_tls = disable_tls;
        self
    }

    /// `require` unless TLS is disabled.
    pub fn ssl_mode(&self) -> &'static str {
        if self.disable_tls { "disable" } else { "require" }
    }

    /// Upper bound on pooled connections.
    pub fn max_connections(&self) -> u32 {
        if self.max_open_conns == 0 {
            DEFAULT_MAX_CONNECTIONS
        } else {
            self.max_open_conns
        }
    }

    /// Idle connections kept warm, never above the pool size.
    pub fn min_connections(&self) -> u32 {
        self.max_idle_conns.min(self.max_connections())
    }

    /// Server-side session options: UTC timestamps and the schema search path.
    pub fn session_options(&self) -> String {
        let mut options = String::from("-c TimeZone=UTC");
        if !self.schema.is_empty() {
            options.push_str(" -c search_path=");
            options.push_str(&escape_option_value(&search_path(&self.schema)));
        }
        options
    }

    /// Build the driver connection URL.
    ///
    /// Contains the password; use [`Self::masked_connection_string`] for logs.
    pub fn connection_url(&self) -> Result<Url, ConnectionConfigError> {
        let mut url = Url::parse(&format!("postgres://{}/{}", self.host, self.name))
            .map_err(|e| ConnectionConfigError::InvalidUrl(e.to_string()))?;
        url.set_username(&self.user)
            .map_err(|()| ConnectionConfigError::InvalidUrl("cannot set user".into()))?;
        url.set_password(Some(&self.password))
            .map_err(|()| ConnectionConfigError::InvalidUrl("cannot set password".into()))?;
        url.query_pairs_mut()
            .append_pair("sslmode", self.ssl_mode())
            .append_pair("options", &self.session_options());
        Ok(url)
    }

    /// Get a display-safe version of the connection string (credentials masked).
    pub fn masked_connection_string(&self) -> String {
        match self.connection_url() {
            Ok(mut url) => {
                if !self.password.is_empty() {
                    let _ = url.set_password(Some("****"));
                }
                url.to_string()
            }
            Err(_) => format!("postgres://{}:****@{}/{}", self.user, self.host, self.name),
        }
    }
}

/// Render a comma-separated schema list as a `search_path` value. Plain
/// identifiers pass through (the server folds their case); anything else is
/// double-quoted.
fn search_path(schema: &str) -> String {
    schema
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            if is_plain_identifier(s) {
                s.to_string()
            } else {
                format!("\"{}\"", s.replace('"', "\"\""))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn is_plain_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// The startup `options` string splits on whitespace; a backslash escapes
/// the next character.
fn escape_option_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || c.is_whitespace() {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Errors that can occur when creating a connection configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionConfigError {
    #[error("Database user cannot be empty")]
    EmptyUser,

    #[error("Database host cannot be empty")]
    EmptyHost,

    #[error("Database name cannot be empty")]
    EmptyName,

    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),
}
