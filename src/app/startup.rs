use super::{ComponentState, InspectionSystem};
use crate::camera::BackendKind;
use crate::error::Result;
use tracing::{error, info};

pub(super) const COMPONENTS: [&str; 4] = ["storage", "camera", "analysis", "routine"];

impl InspectionSystem {
    /// Register all components as stopped
    pub async fn initialize(&self) -> Result<()> {
        info!("Initializing inspection system components");

        let mut states = self.component_states.lock().await;
        for component in COMPONENTS {
            states.insert(component.to_string(), ComponentState::Stopped);
        }
        drop(states);

        info!("All components initialized successfully");
        Ok(())
    }

    /// Prepare output directories and bind the camera
    pub async fn start(&self) -> Result<BackendKind> {
        info!("Starting inspection system");

        self.set_component_state("storage", ComponentState::Starting)
            .await;
        for dir in [&self.config.output.path, &self.config.storage.path] {
            if let Err(e) = tokio::fs::create_dir_all(dir).await {
                error!("Failed to create directory {}: {}", dir, e);
                self.set_component_state("storage", ComponentState::Failed)
                    .await;
                return Err(e.into());
            }
        }
        self.set_component_state("storage", ComponentState::Running)
            .await;

        self.set_component_state("camera", ComponentState::Starting)
            .await;
        let kind = match self.camera.initialize(&self.config.camera.address).await {
            Ok(kind) => kind,
            Err(e) => {
                error!("Failed to initialize camera: {}", e);
                self.set_component_state("camera", ComponentState::Failed)
                    .await;
                return Err(e.into());
            }
        };
        self.set_component_state("camera", ComponentState::Running)
            .await;
        info!("Camera started on {} backend", kind);

        // Models load lazily on first use
        self.set_component_state("analysis", ComponentState::Running)
            .await;
        self.set_component_state("routine", ComponentState::Running)
            .await;

        info!("Inspection system started successfully");
        Ok(kind)
    }
}
