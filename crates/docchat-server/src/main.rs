use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use docchat_server::config::Settings;
use docchat_server::services::LlmService;
use docchat_server::store::ConversationStore;
use docchat_server::telemetry::init_tracing;
use docchat_server::utils::cancel::CancelFlag;
use docchat_server::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load().context("Failed to load configuration")?;
    let _log_guard = init_tracing(&settings.logging);

    info!("Starting docchat server...");

    let store = Arc::new(
        ConversationStore::open(settings.storage.data_dir())
            .await
            .context("Failed to open conversation store")?,
    );

    let llm = LlmService::new(&settings.llm).context("Failed to create model client")?;
    info!("Model endpoint: {}", settings.llm.base_url);

    let state = AppState::new(settings.clone(), store.clone(), Arc::new(llm));

    let shutdown = CancelFlag::new();
    let retention_task = match settings.retention.sweep_interval_seconds {
        0 => None,
        secs => {
            info!("Retention sweep every {}s", secs);
            Some(
                state
                    .retention
                    .clone()
                    .spawn_periodic(Duration::from_secs(secs), shutdown.clone()),
            )
        }
    };

    let app = build_router(state);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down");
    shutdown.cancel();
    if let Some(task) = retention_task {
        task.abort();
    }
    if let Err(e) = store.flush().await {
        error!("Failed to flush conversation store: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
