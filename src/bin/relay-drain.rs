//! Queue drain: redeliver queued events with bounded retry.
//!
//! ## Environment Variables
//!
//! - `RELAY_BROKER_URL`: `redis://`, `postgres://` or `memory://` (required)
//! - `RELAY_DOWNSTREAM_URL`: processing API endpoint (required)
//! - `RELAY_MAX_RETRIES`: attempts per record before discard (default: 5)
//! - `RELAY_RETRY_BACKOFF_MS` / `RELAY_RETRY_BACKOFF_MAX_MS`: pause between attempts (default: 5000 / 20000)
//! - `RELAY_DRAIN_PARTITIONS`: comma-separated partitions to own (default: all)
//! - `RELAY_DEAD_LETTER`: park discarded records (default: false)

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use webhook_relay::{init_tracing, open_log, shutdown_signal, Config, Drain, HttpDownstream};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log_level, config.log_format);

    let log = open_log(&config).await.context("opening durable log")?;
    let downstream = Arc::new(HttpDownstream::new(config.downstream_url.clone()));
    let drain = Arc::new(Drain::new(log, downstream, config.drain_config()));

    let owned = drain.owned_partitions();
    info!(
        downstream = %config.downstream_url,
        partitions = ?owned,
        max_retries = config.max_retries,
        dead_letter = config.dead_letter,
        "starting relay drain"
    );

    let shutdown = CancellationToken::new();
    let workers = drain.spawn(shutdown.clone());

    shutdown_signal().await;
    shutdown.cancel();

    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "drain worker panicked");
        }
    }

    info!("relay drain shutdown complete");
    Ok(())
}
