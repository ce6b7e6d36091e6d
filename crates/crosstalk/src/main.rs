use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crosstalk::config::Config;
use crosstalk::gateway::Gateway;
use crosstalk::server::{AppState, build_app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path =
        std::env::var("CROSSTALK_CONFIG").unwrap_or_else(|_| "crosstalk.yaml".to_string());
    let config = Config::load(&config_path).await?;

    let gateway = Gateway::new(&config).await?;

    let state = AppState {
        gateway: Arc::clone(&gateway),
        keep_alive_interval_seconds: config.server.keep_alive_interval_seconds,
    };
    let app = build_app(state, config.server.request_timeout_seconds);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(gateway))
        .await?;
    Ok(())
}

async fn shutdown_signal(gateway: Arc<Gateway>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received interrupt, shutting down");
    }
    gateway.shutdown();
}
