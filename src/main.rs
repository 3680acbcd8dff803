//! dbsql-status - database readiness probe.
//!
//! Opens the configured PostgreSQL pool, runs the readiness check and prints
//! `{"status":"ok"}` or `{"status":"db not ready"}`. Exits non-zero when the
//! database is not ready.

use dbsql::config::Config;
use dbsql::context::Context;
use dbsql::db::{Database, status_check};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Serialize)]
struct Status {
    status: &'static str,
}

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout carries only the status document.
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();
    init_tracing(&config);

    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }

    info!(
        host = %config.db_host,
        name = %config.db_name,
        "Starting dbsql-status v{}",
        env!("CARGO_PKG_VERSION")
    );

    let db = Database::open(&config.connection_config()?)?;
    let ctx = Context::background().with_timeout(config.status_timeout());

    let ready = match status_check(&ctx, &db).await {
        Ok(()) => true,
        Err(e) => {
            error!(error = %e, "Database not ready");
            false
        }
    };
    db.close().await;

    let status = Status {
        status: if ready { "ok" } else { "db not ready" },
    };
    println!("{}", serde_json::to_string(&status)?);

    if !ready {
        std::process::exit(1);
    }
    Ok(())
}
