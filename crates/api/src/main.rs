use std::net::SocketAddr;

use anyhow::Context;

use erpbus_events::{BusConfig, EventBus};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    erpbus_observability::init();

    let config = BusConfig::from_env().context("invalid ERPBUS_* configuration")?;
    let bind_addr: SocketAddr = std::env::var("ERPBUS_BIND_ADDR")
        .unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string())
        .parse()
        .context("invalid ERPBUS_BIND_ADDR")?;

    let bus = EventBus::new(config);
    bus.start().await;

    let app = erpbus_api::app::build_app(bus.clone());
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    bus.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
