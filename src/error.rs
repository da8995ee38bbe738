use thiserror::Error;

#[derive(Error, Debug)]
pub enum InspectionError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Segmentation error: {0}")]
    Segmentation(#[from] SegmentationError),

    #[error("Routine error: {0}")]
    Routine(#[from] RoutineError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

impl InspectionError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }
}

/// Rejections and failures reported by the camera lifecycle
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("No camera could be opened (GigE at {address} and {webcams} webcam candidates failed)")]
    NoDevice { address: String, webcams: usize },

    #[error("Camera is already initialized")]
    AlreadyInitialized,

    #[error("No camera is initialized")]
    NotInitialized,

    #[error("Preview is already active")]
    PreviewActive,

    #[error("Preview is not active")]
    PreviewInactive,

    #[error("Invalid preview frame rate: {fps}")]
    InvalidFrameRate { fps: u32 },

    #[error("Failed to start continuous acquisition: {details}")]
    Streaming { details: String },

    #[error("Frame grab failed: {details}")]
    GrabFailed { details: String },

    #[error("Camera {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Camera is leased by an inspection routine in progress")]
    RoutineActive,

    #[error("Backend error: {details}")]
    Backend { details: String },
}

/// Failures of the external segmentation capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SegmentationError {
    #[error("Failed to load {model} model: {details}")]
    ModelLoad { model: String, details: String },

    #[error("Inference failed: {details}")]
    Inference { details: String },

    #[error("Malformed engine output: {details}")]
    Output { details: String },
}

/// Rejections raised by the inspection routine orchestrator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutineError {
    #[error("Routine not found: {id}")]
    NotFound { id: String },

    #[error("Routine {id} is already in progress")]
    AlreadyInProgress { id: String },

    #[error("Routine {id} is not in progress (state: {state})")]
    NotInProgress { id: String, state: String },

    #[error("Routine {id} failed: {message}")]
    Failed { id: String, message: String },
}

pub type Result<T, E = InspectionError> = std::result::Result<T, E>;
