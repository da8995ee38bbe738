pub mod analysis;
pub mod app;
pub mod camera;
pub mod config;
pub mod error;
pub mod frame;
pub mod measurement;
pub mod overlay;
pub mod routine;
pub mod segmentation;
pub mod storage;

pub use analysis::{
    AnalysisContext, AnalysisCoordinator, AnalysisKind, AnalysisRecord, AnalysisState,
};
pub use app::{ComponentState, InspectionSystem, ShutdownHandle, ShutdownReason};
pub use camera::{CameraLifecycle, CameraLifecycleBuilder, CameraState, CameraStatus};
pub use config::InspectionConfig;
pub use error::{CameraError, InspectionError, Result, RoutineError, SegmentationError};
pub use frame::{Frame, Resolution};
pub use measurement::{Mask, MeasurementSet};
pub use routine::{
    ConsolidatedReport, InspectionRoutine, InspectionRoutineOrchestrator, RoutineState,
};
pub use storage::{JsonRecordSink, MemoryRecordSink, RecordSink};
