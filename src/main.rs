use std::sync::Arc;

use order_relay::api;
use order_relay::config::Config;
use order_relay::engine::consumers::spawn_consumers;
use order_relay::error::AppError;
use order_relay::observability::init_tracing;
use order_relay::state::AppState;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;
    init_tracing(&config);

    let shared_state = Arc::new(AppState::new(&config));
    let subscriptions = spawn_consumers(&shared_state)?;
    tracing::info!(
        consumers = subscriptions.len(),
        candidate_providers = config.candidate_provider_ids.len(),
        "event consumers started"
    );

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(http_port = config.http_port, "http server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    shared_state.bus.close();
    for subscription in subscriptions {
        subscription.join().await;
    }
    tracing::info!("event consumers drained; shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
