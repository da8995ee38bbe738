use crate::analysis::AnalysisRecord;
use crate::camera::CameraStatus;
use crate::error::{InspectionError, Result};
use crate::routine::InspectionRoutine;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, trace};

/// Destination for analysis, routine and camera snapshots.
///
/// Saving a record with an id that was saved before replaces it.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn save_analysis(&self, record: &AnalysisRecord) -> Result<()>;

    async fn save_routine(&self, routine: &InspectionRoutine) -> Result<()>;

    async fn save_camera_state(&self, status: &CameraStatus) -> Result<()>;
}

/// Keeps every record in memory
#[derive(Default)]
pub struct MemoryRecordSink {
    analyses: Mutex<HashMap<String, AnalysisRecord>>,
    routines: Mutex<HashMap<String, InspectionRoutine>>,
    camera_states: Mutex<Vec<CameraStatus>>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn analysis(&self, id: &str) -> Option<AnalysisRecord> {
        self.analyses.lock().get(id).cloned()
    }

    pub fn analysis_count(&self) -> usize {
        self.analyses.lock().len()
    }

    pub fn routine(&self, id: &str) -> Option<InspectionRoutine> {
        self.routines.lock().get(id).cloned()
    }

    /// Camera snapshots in the order they were saved
    pub fn camera_states(&self) -> Vec<CameraStatus> {
        self.camera_states.lock().clone()
    }

    pub fn last_camera_state(&self) -> Option<CameraStatus> {
        self.camera_states.lock().last().cloned()
    }
}

#[async_trait]
impl RecordSink for MemoryRecordSink {
    async fn save_analysis(&self, record: &AnalysisRecord) -> Result<()> {
        self.analyses
            .lock()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn save_routine(&self, routine: &InspectionRoutine) -> Result<()> {
        self.routines
            .lock()
            .insert(routine.id.clone(), routine.clone());
        Ok(())
    }

    async fn save_camera_state(&self, status: &CameraStatus) -> Result<()> {
        self.camera_states.lock().push(status.clone());
        Ok(())
    }
}

/// Writes one pretty-printed JSON file per record.
///
/// Layout under the root: `analyses/<id>.json`, `routines/<id>.json` and a
/// single `camera_state.json` holding the latest snapshot.
pub struct JsonRecordSink {
    root: PathBuf,
}

impl JsonRecordSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn analysis_path(&self, id: &str) -> PathBuf {
        self.root.join("analyses").join(format!("{}.json", id))
    }

    pub fn routine_path(&self, id: &str) -> PathBuf {
        self.root.join("routines").join(format!("{}.json", id))
    }

    pub fn camera_state_path(&self) -> PathBuf {
        self.root.join("camera_state.json")
    }

    /// Write through a temporary file so readers never see a partial record
    async fn write_json<T: Serialize + Sync>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                InspectionError::component(
                    "record_storage",
                    &format!("Failed to create directory {}: {}", parent.display(), e),
                )
            })?;
        }

        let content = serde_json::to_vec_pretty(value)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, content).await?;
        fs::rename(&tmp_path, path).await.map_err(|e| {
            InspectionError::component(
                "record_storage",
                &format!("Failed to move record into {}: {}", path.display(), e),
            )
        })?;

        trace!("Wrote record {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl RecordSink for JsonRecordSink {
    async fn save_analysis(&self, record: &AnalysisRecord) -> Result<()> {
        let path = self.analysis_path(&record.id);
        self.write_json(&path, record).await?;
        debug!("Saved analysis {} ({:?})", record.id, record.state);
        Ok(())
    }

    async fn save_routine(&self, routine: &InspectionRoutine) -> Result<()> {
        let path = self.routine_path(&routine.id);
        self.write_json(&path, routine).await?;
        debug!("Saved routine {} ({})", routine.id, routine.state);
        Ok(())
    }

    async fn save_camera_state(&self, status: &CameraStatus) -> Result<()> {
        self.write_json(&self.camera_state_path(), status).await
    }
}
