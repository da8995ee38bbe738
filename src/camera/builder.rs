use super::backend::BackendFactory;
use super::default_backend_factory;
use super::lifecycle::CameraLifecycle;
use crate::config::CameraConfig;
use crate::error::{InspectionError, Result};
use crate::storage::RecordSink;
use std::sync::Arc;
use std::time::Duration;

/// Builder for the camera lifecycle
pub struct CameraLifecycleBuilder {
    config: Option<CameraConfig>,
    factory: Option<Arc<dyn BackendFactory>>,
    sink: Option<Arc<dyn RecordSink>>,
    hibernation_window: Option<Duration>,
}

impl CameraLifecycleBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            factory: None,
            sink: None,
            hibernation_window: None,
        }
    }

    pub fn config(mut self, config: CameraConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Device source; defaults to the compiled-in backends
    pub fn factory(mut self, factory: Arc<dyn BackendFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Where state snapshots are persisted
    pub fn sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Inactivity window before auto-hibernation; defaults to
    /// `hibernation_seconds` from the configuration
    pub fn hibernation_window(mut self, window: Duration) -> Self {
        self.hibernation_window = Some(window);
        self
    }

    pub fn build(self) -> Result<CameraLifecycle> {
        let config = self
            .config
            .ok_or_else(|| InspectionError::system("Camera configuration must be specified"))?;

        if config.preview_fps == 0 {
            return Err(InspectionError::system(
                "Camera preview_fps must be greater than 0",
            ));
        }

        let factory = self
            .factory
            .unwrap_or_else(|| default_backend_factory(&config));

        if self.hibernation_window == Some(Duration::ZERO) {
            return Err(InspectionError::system(
                "Camera hibernation window must be greater than 0",
            ));
        }
        let window = self
            .hibernation_window
            .unwrap_or_else(|| config.hibernation_window());

        Ok(CameraLifecycle::with_hibernation_window(
            config, factory, self.sink, window,
        ))
    }
}

impl Default for CameraLifecycleBuilder {
    fn default() -> Self {
        Self::new()
    }
}
