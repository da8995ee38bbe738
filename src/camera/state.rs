use super::backend::BackendKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the single camera session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    Uninitialized,
    Active,
    Previewing,
    /// Preview paused with the device still bound
    Hibernated,
}

/// Point-in-time snapshot of the camera session, also what gets persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraStatus {
    pub state: CameraState,
    pub active: bool,
    pub previewing: bool,
    pub hibernated: bool,
    pub backend: Option<BackendKind>,
    /// Preview frame rate, 0 when not previewing
    pub frame_rate: u32,
    pub last_used: Option<DateTime<Utc>>,
    /// Segmentation model currently resident (advisory)
    pub loaded_model: Option<String>,
    pub has_frame: bool,
    pub routine_active: bool,
    pub timestamp: DateTime<Utc>,
}

impl CameraStatus {
    pub fn using_webcam(&self) -> bool {
        self.backend == Some(BackendKind::Webcam)
    }
}
