//! HTTP server lifecycle
//!
//! Serves the signaling and health routes until SIGINT/SIGTERM or until the
//! media engine reports a dead worker, then stops the transcode bridge.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use stagecast_api::{create_router, AppState, Coordinator};
use stagecast_core::Config;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

const HTTP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct StagecastServer {
    config: Config,
    coordinator: Arc<Coordinator>,
}

impl StagecastServer {
    pub const fn new(config: Config, coordinator: Arc<Coordinator>) -> Self {
        Self {
            config,
            coordinator,
        }
    }

    /// Start the HTTP server and wait for shutdown
    pub async fn start(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut http_handle = self.start_http_server(shutdown_rx).await?;
        let fatal = self.coordinator.fatal_signal();
        let mut http_running = true;

        info!("All servers started successfully");

        let outcome = tokio::select! {
            _ = &mut http_handle => {
                http_running = false;
                error!("HTTP server stopped unexpectedly");
                Err(anyhow::anyhow!("HTTP server stopped unexpectedly"))
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                Ok(())
            }
            true = engine_died(fatal) => {
                let delay = Duration::from_millis(self.config.media.fatal_exit_delay_ms);
                error!(delay = ?delay, "Media engine worker died, exiting");
                tokio::time::sleep(delay).await;
                Err(anyhow::anyhow!("media engine worker died"))
            }
        };

        let _ = shutdown_tx.send(true);
        self.coordinator.shutdown().await;
        if http_running
            && tokio::time::timeout(HTTP_DRAIN_TIMEOUT, &mut http_handle)
                .await
                .is_err()
        {
            info!("Open signaling connections did not close in time");
            http_handle.abort();
        }

        info!("Stagecast server shut down complete");
        outcome
    }

    async fn start_http_server(
        &self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let router = create_router(AppState {
            coordinator: Arc::clone(&self.coordinator),
            max_message_size: self.config.signaling.max_message_size,
        });

        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .with_context(|| format!("Failed to bind HTTP address {http_address}"))?;
        info!("HTTP server listening on {}", http_address);

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Resolves to `true` once the engine worker died
async fn engine_died(mut fatal: watch::Receiver<bool>) -> bool {
    fatal.wait_for(|dead| *dead).await.is_ok()
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
