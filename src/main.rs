use std::sync::Arc;

use mediavault::{
    Error,
    api::{AppState, build_router},
    config::{Config, build_cors_layer},
    engine::YtDlp,
    expiry::{ExpiryScheduler, sweep_stale},
    store::ArtifactStore,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "mediavault=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let config = Config::from_env();

    let store = ArtifactStore::open(&config.store_dir).await?;
    info!("Files will be stored in: {:?}", store.root());

    let report = sweep_stale(&store, config.sweep_max_age).await;
    info!(
        "Startup sweep removed {} stale file(s), kept {}",
        report.removed.len(),
        report.kept
    );

    let engine = Arc::new(YtDlp::new(&config.yt_dlp_bin, config.yt_dlp_timeout));
    let scheduler = ExpiryScheduler::new();
    let state = AppState::new(&config, store, engine, scheduler.clone());

    let cors = build_cors_layer(&config.allowed_origins)?;
    let app = build_router(state).layer(cors);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("MediaVault listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown();
    info!("Server stopped; pending deletions are left to the next startup sweep");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl-C: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!("Could not listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
