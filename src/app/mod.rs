//! Wiring of the camera, analysis and routine components into one process.

mod orchestrator;
mod runtime;
mod shutdown;
mod startup;
mod state;
mod types;


pub use orchestrator::{InspectionSystem, ShutdownHandle};
pub use types::{ComponentState, ShutdownReason};
