//! Multi-angle inspection routines and their consolidated reports.

mod composite;
mod model;
mod orchestrator;
mod report;
#[cfg(test)]
mod tests;

pub use composite::{compose_grid, CompositeCell, GRID_COLUMNS, GRID_ROWS};
pub use model::{InspectionRoutine, RoutineState};
pub use orchestrator::InspectionRoutineOrchestrator;
pub use report::{AngleReport, ConsolidatedReport, ReportSummary};
