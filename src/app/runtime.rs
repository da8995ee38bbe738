use super::{InspectionSystem, ShutdownReason};
use crate::error::{InspectionError, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info};

impl InspectionSystem {
    /// Keep the system up until a signal or a [`super::ShutdownHandle`] request,
    /// then shut down gracefully and return the exit code
    pub async fn run(&mut self) -> Result<i32> {
        info!("Inspection system is running");

        let shutdown_receiver = self
            .shutdown_receiver
            .take()
            .ok_or_else(|| InspectionError::system("Shutdown receiver already taken"))?;

        self.setup_signal_handlers(Arc::clone(&self.shutdown_sender));

        let shutdown_reason = shutdown_receiver
            .await
            .map_err(|_| InspectionError::system("Shutdown channel closed unexpectedly"))?;

        info!("Shutdown initiated: {:?}", shutdown_reason);

        let exit_code = self.shutdown().await?;

        info!("Inspection system shutdown complete");
        Ok(exit_code)
    }

    /// Forward SIGTERM and Ctrl+C into the shutdown channel
    fn setup_signal_handlers(
        &self,
        shutdown_sender: Arc<Mutex<Option<oneshot::Sender<ShutdownReason>>>>,
    ) {
        #[cfg(unix)]
        {
            let shutdown_sender_sigterm = Arc::clone(&shutdown_sender);
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                let mut sigterm =
                    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                        Ok(sigterm) => sigterm,
                        Err(e) => {
                            error!("Failed to register SIGTERM handler: {}", e);
                            return;
                        }
                    };
                tokio::select! {
                    _ = token.cancelled() => {}
                    Some(()) = sigterm.recv() => {
                        info!("Received SIGTERM signal");
                        if let Some(sender) = shutdown_sender_sigterm.lock().await.take() {
                            let _ = sender.send(ShutdownReason::Signal("SIGTERM".to_string()));
                        }
                    }
                }
            });
        }

        let shutdown_sender_sigint = Arc::clone(&shutdown_sender);
        let token = self.cancellation_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                Ok(()) = signal::ctrl_c() => {
                    info!("Received SIGINT signal (Ctrl+C)");
                    if let Some(sender) = shutdown_sender_sigint.lock().await.take() {
                        let _ = sender.send(ShutdownReason::Signal("SIGINT".to_string()));
                    }
                }
            }
        });
    }
}
