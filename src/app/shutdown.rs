use super::{ComponentState, InspectionSystem};
use crate::error::{CameraError, InspectionError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info};

const CAMERA_STOP_TIMEOUT: Duration = Duration::from_secs(10);
const ANALYSIS_STOP_TIMEOUT: Duration = Duration::from_secs(5);

impl InspectionSystem {
    /// Stop every component; returns 0 on a clean stop, 1 otherwise
    pub async fn shutdown(&mut self) -> Result<i32> {
        info!("Beginning graceful shutdown");

        self.cancellation_token.cancel();

        let mut exit_code = 0;

        if let Some(id) = self.routines.active_routine() {
            // The sweep holds the camera lease until it finishes
            error!("Shutting down while routine {} is in progress", id);
        }
        self.set_component_state("routine", ComponentState::Stopped)
            .await;

        let coordinator = self.coordinator();
        let analysis = async move {
            coordinator.release_engine().await;
            Ok(())
        };
        if let Err(e) = self
            .stop_component("analysis", ANALYSIS_STOP_TIMEOUT, analysis)
            .await
        {
            error!("Error stopping analysis: {}", e);
            exit_code = 1;
        }

        let camera = self.camera.clone();
        let camera_stop = async move {
            match camera.stop_preview().await {
                Ok(()) | Err(CameraError::PreviewInactive) => {}
                Err(e) => return Err(e.into()),
            }
            camera.release().await.map_err(InspectionError::from)
        };
        if let Err(e) = self
            .stop_component("camera", CAMERA_STOP_TIMEOUT, camera_stop)
            .await
        {
            error!("Error stopping camera: {}", e);
            exit_code = 1;
        }

        self.set_component_state("storage", ComponentState::Stopped)
            .await;

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }

    /// Run one component's stop routine under a deadline
    async fn stop_component<F>(&self, component: &str, limit: Duration, stop: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        info!("Stopping {} component", component);
        self.set_component_state(component, ComponentState::Stopping)
            .await;

        match timeout(limit, stop).await {
            Ok(Ok(())) => {
                self.set_component_state(component, ComponentState::Stopped)
                    .await;
                info!("{} component stopped", component);
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_component_state(component, ComponentState::Failed)
                    .await;
                error!("Error stopping {} component: {}", component, e);
                Err(e)
            }
            Err(_) => {
                self.set_component_state(component, ComponentState::Failed)
                    .await;
                error!("{} component stop timeout", component);
                Err(InspectionError::system(format!(
                    "{} component stop timeout",
                    component
                )))
            }
        }
    }
}
