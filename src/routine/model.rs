use super::report::ConsolidatedReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineState {
    InProgress,
    Completed,
    Error,
}

impl std::fmt::Display for RoutineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutineState::InProgress => write!(f, "in_progress"),
            RoutineState::Completed => write!(f, "completed"),
            RoutineState::Error => write!(f, "error"),
        }
    }
}

/// One multi-angle inspection sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionRoutine {
    pub id: String,
    pub state: RoutineState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Angles the sweep was configured for
    pub planned_angles: u32,
    /// Angles that were captured and persisted successfully
    pub captured_count: u32,
    /// Child analyses, in angle order
    pub analysis_ids: Vec<String>,
    pub report: Option<ConsolidatedReport>,
    pub composite_image: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub error: Option<String>,
}

impl InspectionRoutine {
    pub fn new(planned_angles: u32) -> Self {
        let started_at = Utc::now();
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!(
                "routine_{}_{}",
                &uuid[..8],
                started_at.format("%Y%m%d_%H%M%S")
            ),
            state: RoutineState::InProgress,
            started_at,
            finished_at: None,
            planned_angles,
            captured_count: 0,
            analysis_ids: Vec::new(),
            report: None,
            composite_image: None,
            report_path: None,
            error: None,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.state == RoutineState::InProgress
    }

    pub(crate) fn complete(&mut self) {
        self.state = RoutineState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        self.state = RoutineState::Error;
        self.error = Some(message.into());
        self.finished_at = Some(Utc::now());
    }
}
