//! Server lifecycle management
//!
//! Serves the HTTP/WebSocket surface until a shutdown signal or a media
//! worker death, then tears down rooms, recordings and workers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use camcast_api::{
    http::{create_router, AppState},
    Gateway,
};
use camcast_core::Config;
use camcast_sfu::WorkerDeath;

/// Why the server stopped
#[derive(Debug)]
pub enum ShutdownReason {
    Signal,
    HttpStopped,
    WorkerDied(WorkerDeath),
}

pub struct CamcastServer {
    config: Config,
    gateway: Arc<Gateway>,
}

impl CamcastServer {
    pub const fn new(config: Config, gateway: Arc<Gateway>) -> Self {
        Self { config, gateway }
    }

    /// Start serving and wait for shutdown
    pub async fn start(self) -> anyhow::Result<ShutdownReason> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let http_address = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;
        info!("HTTP server listening on {}", http_address);

        let router = create_router(AppState::new(Arc::clone(&self.gateway), &self.config.server));
        let mut http_handle = tokio::spawn(async move {
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

        let mut deaths = self.gateway.registry().pool().subscribe_death();
        let worker_died = async move {
            if deaths.wait_for(Option::is_some).await.is_err() {
                // Pool dropped without a death
                std::future::pending::<()>().await;
            }
            let death = deaths.borrow().clone();
            death
        };

        let reason = tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
                ShutdownReason::HttpStopped
            }
            death = worker_died => {
                match death {
                    Some(death) => {
                        error!(
                            worker_id = %death.worker_id,
                            reason = %death.reason,
                            "Media worker died, shutting down"
                        );
                        ShutdownReason::WorkerDied(death)
                    }
                    None => ShutdownReason::Signal,
                }
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                ShutdownReason::Signal
            }
        };

        // Signal the HTTP server to stop accepting
        let _ = shutdown_tx.send(true);
        if tokio::time::timeout(Duration::from_secs(10), &mut http_handle)
            .await
            .is_err()
        {
            warn!("HTTP server did not stop in time");
            http_handle.abort();
        }

        self.shutdown().await;
        Ok(reason)
    }

    /// Close every room, let stopped recordings finalize, then close the pool
    async fn shutdown(&self) {
        info!("Shutting down camcast server...");
        let registry = self.gateway.registry();

        let recordings = registry.close_all().await;
        if !recordings.is_empty() {
            let recording = &self.config.recording;
            let attempts = u64::try_from(recording.upload.max_retries).unwrap_or(u64::MAX).saturating_add(1);
            let budget = Duration::from_secs(
                recording
                    .stop_grace_secs
                    .saturating_add(recording.upload.timeout_secs.saturating_mul(attempts)),
            );
            info!(
                "Waiting up to {}s for {} recording(s) to finalize...",
                budget.as_secs(),
                recordings.len()
            );
            let finalize = wait_finalized(&recordings);
            if tokio::time::timeout(budget, finalize).await.is_err() {
                warn!("Recordings still finalizing at shutdown, local files are kept");
            }
        }

        registry.pool().close().await;
        info!("Shutdown complete");
    }
}

async fn wait_finalized(recordings: &[Arc<camcast_sfu::RecordingSession>]) {
    for recording in recordings {
        let state = recording.wait_closed().await;
        info!(room_id = %recording.room_id(), state = ?state, "Recording finalized");
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
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
        () = ctrl_c => {}
        () = terminate => {}
    }
}
