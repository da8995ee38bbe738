//! Single-image analysis: capture, segment, measure, render and record.

mod coordinator;
mod record;
mod render;
#[cfg(test)]
mod tests;

pub use coordinator::{AnalysisContext, AnalysisCoordinator};
pub use record::{
    generate_analysis_id, AnalysisKind, AnalysisRecord, AnalysisState, InstanceMeasurement,
    PhaseTimings,
};
pub use render::{render_detections, OverlayStyle};
