//! Connection pool management.
//!
//! [`Database`] owns a lazily-connected `PgPool`. [`status_check`] probes it
//! with backoff until the server answers or the context gives up.

use crate::config::{DEFAULT_ACQUIRE_TIMEOUT_SECS, DEFAULT_IDLE_TIMEOUT_SECS};
use crate::context::Context;
use crate::error::{DbError, DbResult};
use crate::models::ConnectionConfig;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, PgPool, Postgres, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Deadline applied by [`status_check`] when the caller's context has none.
pub const STATUS_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// Backoff grows by this much per failed ping.
pub const STATUS_CHECK_BACKOFF: Duration = Duration::from_millis(100);

/// Handle to a PostgreSQL connection pool.
///
/// Share it by reference or behind an `Arc`; [`Database::close`] consumes the
/// handle so the pool is closed at most once.
#[derive(Debug)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Build the pool for `config`. No connection is made until first use.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(config: &ConnectionConfig) -> DbResult<Self> {
        let url = config
            .connection_url()
            .map_err(|e| DbError::config(e.to_string()))?;
        let options = PgConnectOptions::from_str(url.as_str())
            .map_err(|e| DbError::config(format!("Invalid PostgreSQL connection string: {e}")))?;

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections())
            .max_connections(config.max_connections())
            .acquire_timeout(Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS))
            .idle_timeout(Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)))
            .test_before_acquire(true)
            .connect_lazy_with(options);

        info!(
            url = %config.masked_connection_string(),
            max_connections = config.max_connections(),
            min_connections = config.min_connections(),
            "Opened database pool"
        );

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, usable as a query executor.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Start a transaction. Queries run against `&mut *tx` join it.
    pub async fn begin(&self, ctx: &Context) -> DbResult<Transaction<'static, Postgres>> {
        ctx.run(self.pool.begin())
            .await?
            .map_err(|e| DbError::database("begin", e))
    }

    /// Acquire a connection and round-trip a ping on it.
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        conn.ping().await
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(self) {
        info!("Closing database pool");
        self.pool.close().await;
        info!("Database pool closed");
    }
}

/// Report whether the database is reachable and answering queries.
///
/// Pings with linear backoff until one succeeds, then forces a round trip
/// with `SELECT true`. A context without a deadline gets a one second limit.
pub async fn status_check(ctx: &Context, db: &Database) -> DbResult<()> {
    let ctx = match ctx.deadline() {
        Some(_) => ctx.clone(),
        None => ctx.with_timeout(STATUS_CHECK_TIMEOUT),
    };

    let mut attempt: u32 = 1;
    loop {
        match ctx.run(db.ping()).await? {
            Ok(()) => break,
            Err(e) => {
                debug!(attempt, error = %e, "Database ping failed");
                ctx.check()?;
                ctx.sleep(STATUS_CHECK_BACKOFF * attempt).await?;
                ctx.check()?;
                attempt = attempt.saturating_add(1);
            }
        }
    }

    ctx.run(sqlx::query_scalar::<_, bool>("SELECT true").fetch_one(db.pool()))
        .await?
        .map(|_| ())
        .map_err(|e| DbError::database("status_check", e))
}
