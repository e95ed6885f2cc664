use ragpipe::{api, config, logging, state::AppState};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Longest wait for in-flight uploads after shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    config::init_config();
    logging::init_tracing();

    let config = config::get_config();
    let state = Arc::new(AppState::build(config).await);
    let app = api::create_router(Arc::clone(&state));

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .expect("Failed to bind listener");
    tracing::info!(addr = %config.listen_addr, "Listening");

    let shutdown_state = Arc::clone(&state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_state.begin_shutdown();
        })
        .await
        .expect("Server error");

    state.drain(SHUTDOWN_GRACE).await;
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install ctrl-c handler");
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
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
