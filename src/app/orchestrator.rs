use super::types::{ComponentState, ShutdownReason};
use crate::analysis::AnalysisCoordinator;
use crate::camera::{BackendFactory, CameraLifecycle, CameraLifecycleBuilder};
use crate::config::InspectionConfig;
use crate::error::Result;
use crate::routine::InspectionRoutineOrchestrator;
use crate::segmentation::{CommandSegmenterFactory, MockSegmenterFactory, SegmenterFactory};
use crate::storage::{JsonRecordSink, RecordSink};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Long-lived components of the inspection station, built once per process
pub struct InspectionSystem {
    pub(super) config: InspectionConfig,
    pub(super) sink: Arc<dyn RecordSink>,
    pub(super) camera: CameraLifecycle,
    pub(super) coordinator: Arc<AnalysisCoordinator>,
    pub(super) routines: Arc<InspectionRoutineOrchestrator>,

    // Lifecycle management
    pub(super) component_states: Arc<Mutex<HashMap<String, ComponentState>>>,
    pub(super) shutdown_sender: Arc<Mutex<Option<oneshot::Sender<ShutdownReason>>>>,
    pub(super) shutdown_receiver: Option<oneshot::Receiver<ShutdownReason>>,
    pub(super) cancellation_token: CancellationToken,
}

impl InspectionSystem {
    /// Build every component from configuration: compiled-in camera backends,
    /// the configured inference command and JSON records under the storage path
    pub fn new(config: InspectionConfig) -> Result<Self> {
        let segmenter: Arc<dyn SegmenterFactory> = if config.segmentation.command.is_some() {
            Arc::new(CommandSegmenterFactory::new(config.segmentation.clone()))
        } else {
            warn!("No inference command configured, using mock implementation");
            Arc::new(MockSegmenterFactory::new(config.segmentation.clone()))
        };
        let sink: Arc<dyn RecordSink> = Arc::new(JsonRecordSink::new(&config.storage.path));

        Self::with_parts(config, None, segmenter, sink)
    }

    /// Build with explicit collaborators; `backends` defaults to the compiled-in ones
    pub fn with_parts(
        config: InspectionConfig,
        backends: Option<Arc<dyn BackendFactory>>,
        segmenter: Arc<dyn SegmenterFactory>,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self> {
        let mut builder = CameraLifecycleBuilder::new()
            .config(config.camera.clone())
            .sink(Arc::clone(&sink));
        if let Some(backends) = backends {
            builder = builder.factory(backends);
        }
        let camera = builder.build()?;

        let coordinator = Arc::new(
            AnalysisCoordinator::new(
                config.segmentation.clone(),
                config.output.clone(),
                segmenter,
                Arc::clone(&sink),
            )
            .with_camera(camera.clone()),
        );

        let routines = Arc::new(
            InspectionRoutineOrchestrator::new(
                config.routine.clone(),
                config.output.clone(),
                camera.clone(),
                Arc::clone(&coordinator),
                Arc::clone(&sink),
            )
            .with_conversion_factor(config.measurement.conversion_factor_mm_per_px),
        );

        let (shutdown_sender, shutdown_receiver) = oneshot::channel();
        info!("Inspection system assembled");

        Ok(Self {
            config,
            sink,
            camera,
            coordinator,
            routines,
            component_states: Arc::new(Mutex::new(HashMap::new())),
            shutdown_sender: Arc::new(Mutex::new(Some(shutdown_sender))),
            shutdown_receiver: Some(shutdown_receiver),
            cancellation_token: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &InspectionConfig {
        &self.config
    }

    pub fn camera(&self) -> &CameraLifecycle {
        &self.camera
    }

    pub fn coordinator(&self) -> Arc<AnalysisCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn routines(&self) -> Arc<InspectionRoutineOrchestrator> {
        Arc::clone(&self.routines)
    }

    pub fn sink(&self) -> Arc<dyn RecordSink> {
        Arc::clone(&self.sink)
    }

    /// Configured mm-per-pixel factor for analyses
    pub fn conversion_factor(&self) -> Option<f64> {
        self.config.measurement.conversion_factor_mm_per_px
    }

    /// Token cancelled when shutdown begins
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Handle for ending [`InspectionSystem::run`] from another task
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            sender: Arc::clone(&self.shutdown_sender),
        }
    }
}

/// Requests shutdown of a running system
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: Arc<Mutex<Option<oneshot::Sender<ShutdownReason>>>>,
}

impl ShutdownHandle {
    /// False if shutdown was already requested
    pub async fn request(&self, reason: ShutdownReason) -> bool {
        match self.sender.lock().await.take() {
            Some(sender) => sender.send(reason).is_ok(),
            None => false,
        }
    }
}
