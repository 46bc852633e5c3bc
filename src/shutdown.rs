//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM/SIGINT, then stops the forwarder and optionally lets
//! in-flight sessions drain.

use std::time::Duration;
use tokio::signal;
use tracing::info;

use crate::connection::Forwarder;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// How long sessions may keep draining after the listener closes
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        Ok(())
    }

    /// Close the forwarder, then give its sessions up to `timeout` to finish
    pub async fn shutdown_forwarder(&self, forwarder: &Forwarder) -> Result<()> {
        info!("Initiating graceful shutdown of forwarder");
        forwarder.close().await;
        forwarder.drain(self.timeout).await
    }
}
