mod backend;
mod builder;
#[cfg(all(target_os = "linux", feature = "camera"))]
mod gst;
mod lifecycle;
pub mod mock;
mod state;
#[cfg(test)]
mod tests;

pub use backend::{BackendFactory, BackendKind, CameraBackend};
pub use builder::CameraLifecycleBuilder;
#[cfg(all(target_os = "linux", feature = "camera"))]
pub use gst::{GstBackend, GstBackendFactory};
pub use lifecycle::{CameraLifecycle, RoutineLease};
pub use mock::{MockBackend, MockBackendFactory, MockControl};
pub use state::{CameraState, CameraStatus};

use crate::config::CameraConfig;
use std::sync::Arc;

/// Backends compiled into this build: GStreamer GigE and V4L2 devices with
/// the `camera` feature on Linux, synthetic frames otherwise
pub fn default_backend_factory(config: &CameraConfig) -> Arc<dyn BackendFactory> {
    #[cfg(all(target_os = "linux", feature = "camera"))]
    {
        Arc::new(GstBackendFactory::new(config.clone()))
    }

    #[cfg(not(all(target_os = "linux", feature = "camera")))]
    {
        tracing::warn!(
            "Camera support is not compiled in (enable the `camera` feature), using mock implementation"
        );
        Arc::new(MockBackendFactory::new(config.resolution))
    }
}
