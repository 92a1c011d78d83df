//! Webhook ingress: deliver directly, queue on failure.
//!
//! ## Environment Variables
//!
//! - `RELAY_LISTEN_ADDR`: bind address (default: "0.0.0.0:8080")
//! - `RELAY_BROKER_URL`: `redis://`, `postgres://` or `memory://` (required)
//! - `RELAY_DOWNSTREAM_URL`: processing API endpoint (required)
//! - `RELAY_INGRESS_TIMEOUT_MS`: direct delivery timeout (default: 5000)
//! - `RELAY_VERIFY_TOKEN`, `RELAY_APP_SECRET`: provider handshake and signatures

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use webhook_relay::{
    build_router, init_tracing, open_log, shutdown_signal, AppState, Config, HttpDownstream, IngressRouter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log_level, config.log_format);

    info!(
        listen_addr = %config.listen_addr,
        downstream = %config.downstream_url,
        partitions = config.partitions,
        timeout_ms = config.ingress_timeout.as_millis() as u64,
        "starting relay ingress"
    );

    let log = open_log(&config).await.context("opening durable log")?;
    let downstream = Arc::new(HttpDownstream::new(config.downstream_url.clone()));
    let router = IngressRouter::new(downstream, log, config.ingress_timeout);
    let state = AppState::new(router, config.verify_token.clone(), config.app_secret.clone());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "ingress listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("relay ingress shutdown complete");
    Ok(())
}
