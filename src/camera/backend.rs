use crate::error::CameraError;
use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Which kind of device a camera session is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Primary industrial GigE camera
    GigE,
    /// Local fallback webcam
    Webcam,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::GigE => write!(f, "gige"),
            BackendKind::Webcam => write!(f, "webcam"),
        }
    }
}

/// A physical or virtual acquisition device.
///
/// Every method may block on hardware; the lifecycle only calls them from the
/// blocking thread pool.
pub trait CameraBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Human readable device identifier for logs
    fn describe(&self) -> String;

    fn open(&mut self) -> Result<(), CameraError>;

    fn close(&mut self);

    /// Grab one frame; `None` when the device produced nothing
    fn grab_frame(&mut self) -> Option<RgbImage>;

    /// Engage continuous acquisition. Only the GigE backend has a distinct
    /// streaming mode; webcams keep the default no-op.
    fn start_streaming(&mut self) -> Result<(), CameraError> {
        Ok(())
    }

    fn stop_streaming(&mut self) {}
}

/// Source of candidate backends, tried in order by `CameraLifecycle::initialize`
pub trait BackendFactory: Send + Sync {
    /// The primary GigE backend for `address`
    fn gige(&self, address: &str) -> Box<dyn CameraBackend>;

    /// Fallback webcams in order of preference
    fn webcams(&self) -> Vec<Box<dyn CameraBackend>>;
}
