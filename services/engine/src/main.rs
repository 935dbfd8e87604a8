//! hyde deployment engine
//!
//! Serves the deployment API: create deployments across cloud providers,
//! install products onto their infrastructures, and tear them down.

use anyhow::Result;
use hyde_engine::{api, config, db::Stores, state::AppState};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to HYDE_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hyde engine");
    info!(
        listen_addr = %config.listen_addr,
        dev_mode = config.dev_mode,
        port_range = ?config.provisioning.port_range,
        "Configuration loaded"
    );

    let stores = match Stores::open(&config.store, config.dev_mode).await {
        Ok(stores) => stores,
        Err(e) => {
            error!(error = %e, "Failed to open stores");
            return Err(e.into());
        }
    };

    let state = AppState::from_config(&config, stores)?;
    let app = api::create_router(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Engine shutdown complete");
    Ok(())
}
