use anyhow::Context;
use broker_framework::BrokerHub;
use order_pipeline::basket::connect_store;
use order_pipeline::config::AppConfig;
use order_pipeline::consumers::LogEmailService;
use order_pipeline::lifecycle::{cancel_on_signal, setup_tracing, OrderSystem};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let store = connect_store(&config)
        .await
        .context("basket store unavailable")?;
    // Only consulted when BROKER_CONNECTION_STRING is memory://.
    let hub = BrokerHub::default();

    let system = OrderSystem::start(&config, &hub, store, Arc::new(LogEmailService))
        .await
        .context("order system failed to start")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(%addr, "HTTP server listening");

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), shutdown.clone()));

    let served = axum::serve(listener, system.router())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await;

    system.shutdown().await?;
    served.context("HTTP server failed")
}
