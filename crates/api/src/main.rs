use std::net::SocketAddr;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use comfyrun_api::background;
use comfyrun_api::config::AppConfig;
use comfyrun_api::router::build_app_router;
use comfyrun_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "comfyrun_api=info,comfyrun_worker=info,comfyrun_pipeline=info,comfyui=info,tower_http=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = AppConfig::from_env();
    for warning in config.warnings() {
        tracing::warn!("{warning}");
    }
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        comfyui_url = %config.comfyui_url(),
        remote_configured = config.runpod.is_some(),
        "Loaded configuration",
    );

    // --- App state ---
    let state = AppState::from_config(config);
    let supervisor = state.supervisor.clone();

    // --- Engine warm-up ---
    // A failed start is retried by the first request.
    let warmup = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            match supervisor.start().await {
                Ok(()) => tracing::info!("ComfyUI ready"),
                Err(e) => tracing::error!(error = %e, "ComfyUI failed to start, will retry on first request"),
            }
        })
    };

    // --- Output sweep ---
    let sweep_cancel = tokio_util::sync::CancellationToken::new();
    let sweep_handle = tokio::spawn(background::run_output_sweep(
        state.config.paths.comfyui_output.clone(),
        Duration::from_secs(state.config.handler.cleanup_age_secs),
        sweep_cancel.clone(),
    ));

    // --- Router ---
    let addr = SocketAddr::new(
        state.config.server.host.parse().expect("Invalid HOST address"),
        state.config.server.port,
    );
    let app = build_app_router(state.clone(), &state.config.server);

    // --- Start server ---
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    warmup.abort();
    supervisor.shutdown().await;
    tracing::info!("ComfyUI stopped");

    sweep_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), sweep_handle).await;
    tracing::info!("Output sweep stopped");

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the engine
/// process is killed whether stopped interactively or by a container
/// runtime.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
