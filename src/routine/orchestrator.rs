use super::composite::{compose_grid, CompositeCell};
use super::model::{InspectionRoutine, RoutineState};
use super::report::ConsolidatedReport;
use crate::analysis::{
    AnalysisContext, AnalysisCoordinator, AnalysisKind, AnalysisRecord, AnalysisState,
};
use crate::camera::CameraLifecycle;
use crate::config::{OutputConfig, RoutineConfig, MAX_ROUTINE_ANGLES};
use crate::error::{InspectionError, Result, RoutineError};
use crate::frame::{encode_jpeg, read_rgb, write_png, Frame};
use crate::overlay::LabelFont;
use crate::storage::RecordSink;
use chrono::{DateTime, Utc};
use image::RgbImage;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const COMPOSITE_JPEG_QUALITY: u8 = 90;

/// Working state of one routine besides its public record
struct RoutineRun {
    routine: InspectionRoutine,
    config: RoutineConfig,
    swept: bool,
    analyses: Vec<(u32, AnalysisRecord)>,
}

/// An angle image persisted by the capture phase
struct CapturedAngle {
    angle: u32,
    path: PathBuf,
    captured_at: DateTime<Utc>,
}

/// Drives multi-angle inspection routines.
///
/// A sweep runs in two phases: every angle is captured and persisted first,
/// then each persisted image is analysed with the defects model. Both phases
/// are strictly sequential with pauses between angles, and only one routine
/// may be in progress at a time.
pub struct InspectionRoutineOrchestrator {
    defaults: RoutineConfig,
    output: OutputConfig,
    camera: CameraLifecycle,
    coordinator: Arc<AnalysisCoordinator>,
    sink: Arc<dyn RecordSink>,
    conversion_factor: Option<f64>,
    font: Option<Arc<LabelFont>>,
    runs: Mutex<HashMap<String, RoutineRun>>,
    active: Mutex<Option<String>>,
}

impl InspectionRoutineOrchestrator {
    pub fn new(
        defaults: RoutineConfig,
        output: OutputConfig,
        camera: CameraLifecycle,
        coordinator: Arc<AnalysisCoordinator>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let font = LabelFont::load_or_warn(Path::new(&output.font_path), output.font_size)
            .map(Arc::new);
        Self {
            defaults,
            output,
            camera,
            coordinator,
            sink,
            conversion_factor: None,
            font,
            runs: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
        }
    }

    /// mm per pixel applied to every analysis of every routine
    pub fn with_conversion_factor(mut self, factor: Option<f64>) -> Self {
        self.conversion_factor = factor;
        self
    }

    pub fn defaults(&self) -> &RoutineConfig {
        &self.defaults
    }

    pub fn routines_dir(&self) -> PathBuf {
        PathBuf::from(&self.output.path).join("routines")
    }

    /// Snapshot of a routine
    pub fn routine(&self, id: &str) -> std::result::Result<InspectionRoutine, RoutineError> {
        self.runs
            .lock()
            .get(id)
            .map(|run| run.routine.clone())
            .ok_or_else(|| RoutineError::NotFound { id: id.to_string() })
    }

    /// Every known routine, oldest first
    pub fn routines(&self) -> Vec<InspectionRoutine> {
        let mut routines: Vec<InspectionRoutine> = self
            .runs
            .lock()
            .values()
            .map(|run| run.routine.clone())
            .collect();
        routines.sort_by_key(|routine| routine.started_at);
        routines
    }

    /// The routine currently in progress, if any
    pub fn active_routine(&self) -> Option<String> {
        self.active.lock().clone()
    }

    /// Register a new in-progress routine
    pub async fn start_routine(&self, config: RoutineConfig) -> Result<InspectionRoutine> {
        if config.angles == 0 || config.angles > MAX_ROUTINE_ANGLES {
            return Err(InspectionError::component(
                "routine",
                &format!(
                    "Routine needs between 1 and {} angles, got {}",
                    MAX_ROUTINE_ANGLES, config.angles
                ),
            ));
        }

        let routine = {
            let mut active = self.active.lock();
            if let Some(id) = active.as_ref() {
                return Err(RoutineError::AlreadyInProgress { id: id.clone() }.into());
            }

            let routine = InspectionRoutine::new(config.angles);
            *active = Some(routine.id.clone());
            self.runs.lock().insert(
                routine.id.clone(),
                RoutineRun {
                    routine: routine.clone(),
                    config,
                    swept: false,
                    analyses: Vec::new(),
                },
            );
            routine
        };

        info!(
            "Started routine {} ({} angles)",
            routine.id, routine.planned_angles
        );
        self.persist(&routine).await;
        Ok(routine)
    }

    /// Capture every angle, then analyse every captured image.
    ///
    /// Individual angle failures are logged and skipped. The scratch directory
    /// is removed once the analysis phase ends.
    pub async fn execute_sweep(&self, id: &str) -> Result<InspectionRoutine> {
        let config = {
            let mut runs = self.runs.lock();
            let run = runs
                .get_mut(id)
                .ok_or_else(|| RoutineError::NotFound { id: id.to_string() })?;
            if !run.routine.is_in_progress() {
                return Err(RoutineError::NotInProgress {
                    id: id.to_string(),
                    state: run.routine.state.to_string(),
                }
                .into());
            }
            if run.swept {
                return Err(RoutineError::Failed {
                    id: id.to_string(),
                    message: "sweep was already executed".to_string(),
                }
                .into());
            }
            run.swept = true;
            run.config.clone()
        };

        let _lease = match self.camera.acquire_routine_lease() {
            Ok(lease) => lease,
            Err(e) => {
                let message = format!("Camera unavailable for sweep: {}", e);
                return Err(self.fail_routine(id, message).await);
            }
        };

        let scratch = config.scratch_path().join(id);
        let captured = self.capture_phase(id, &config, &scratch).await;

        self.analysis_phase(id, &config, &captured).await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Routine {}: failed to remove scratch directory {}: {}",
                    id,
                    scratch.display(),
                    e
                );
            }
        }

        let routine = self.routine(id)?;
        info!(
            "Routine {} sweep done: {}/{} angles captured, {} analyses",
            id,
            routine.captured_count,
            routine.planned_angles,
            routine.analysis_ids.len()
        );
        self.persist(&routine).await;
        Ok(routine)
    }

    /// Build the composite and consolidated report and close the routine.
    ///
    /// Any failure moves the routine to the error state with its message.
    pub async fn finalize(&self, id: &str) -> Result<InspectionRoutine> {
        let (analyses, cell_size) = {
            let runs = self.runs.lock();
            let run = runs
                .get(id)
                .ok_or_else(|| RoutineError::NotFound { id: id.to_string() })?;
            if !run.routine.is_in_progress() {
                return Err(RoutineError::NotInProgress {
                    id: id.to_string(),
                    state: run.routine.state.to_string(),
                }
                .into());
            }
            (run.analyses.clone(), run.config.composite_cell_size)
        };

        match self.write_artifacts(id, &analyses, cell_size).await {
            Ok((report, composite_path, report_path)) => {
                let routine = {
                    let mut runs = self.runs.lock();
                    let run = runs
                        .get_mut(id)
                        .ok_or_else(|| RoutineError::NotFound { id: id.to_string() })?;
                    run.routine.report = Some(report);
                    run.routine.composite_image = Some(composite_path);
                    run.routine.report_path = Some(report_path);
                    run.routine.complete();
                    run.routine.clone()
                };
                self.release_active(id);
                self.persist(&routine).await;

                info!(
                    "Routine {} completed: {} defects over {} angles",
                    id,
                    routine
                        .report
                        .as_ref()
                        .map(|r| r.summary.total_defects)
                        .unwrap_or(0),
                    routine.report.as_ref().map(|r| r.angle_count).unwrap_or(0)
                );
                Ok(routine)
            }
            Err(e) => Err(self.fail_routine(id, e.to_string()).await),
        }
    }

    /// Start, sweep and finalize in one call
    pub async fn run_routine(&self, config: RoutineConfig) -> Result<InspectionRoutine> {
        let routine = self.start_routine(config).await?;
        self.execute_sweep(&routine.id).await?;
        self.finalize(&routine.id).await
    }

    async fn capture_phase(
        &self,
        id: &str,
        config: &RoutineConfig,
        scratch: &Path,
    ) -> Vec<CapturedAngle> {
        let mut captured = Vec::new();

        if let Err(e) = tokio::fs::create_dir_all(scratch).await {
            error!(
                "Routine {}: cannot create scratch directory {}: {}",
                id,
                scratch.display(),
                e
            );
            return captured;
        }

        for angle in 1..=config.angles {
            match self.capture_angle(angle, scratch).await {
                Ok((path, captured_at)) => {
                    debug!("Routine {}: angle {} saved to {}", id, angle, path.display());
                    captured.push(CapturedAngle {
                        angle,
                        path,
                        captured_at,
                    });
                    if let Some(run) = self.runs.lock().get_mut(id) {
                        run.routine.captured_count += 1;
                    }
                }
                Err(e) => warn!("Routine {}: skipping angle {}: {}", id, angle, e),
            }

            if angle < config.angles {
                tokio::time::sleep(config.capture_delay()).await;
            }
        }

        captured
    }

    async fn capture_angle(
        &self,
        angle: u32,
        scratch: &Path,
    ) -> Result<(PathBuf, DateTime<Utc>)> {
        if !self.camera.is_active().await {
            return Err(InspectionError::component("routine", "Camera is not active"));
        }

        let frame = self.camera.capture().await?;
        let (width, height) = (frame.width(), frame.height());
        let path = scratch.join(format!("angle_{}.png", angle));

        let image = Arc::clone(&frame.image);
        let target = path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            write_png(&image, &target)?;
            let reloaded = read_rgb(&target)?;
            validate_image(&reloaded, Some((width, height)))
        })
        .await
        .map_err(|e| {
            InspectionError::component("routine", &format!("Persist task failed: {}", e))
        })??;

        Ok((path, frame.captured_at))
    }

    async fn analysis_phase(
        &self,
        id: &str,
        config: &RoutineConfig,
        captured: &[CapturedAngle],
    ) {
        for (index, shot) in captured.iter().enumerate() {
            let angle = shot.angle;
            match load_for_analysis(&shot.path, config.expected_resolution).await {
                Ok(image) => {
                    let record = self
                        .coordinator
                        .analyze_frame(
                            AnalysisKind::Defects,
                            Frame::new(angle as u64, image)
                                .with_captured_at(shot.captured_at),
                            self.conversion_factor,
                            AnalysisContext::routine(id, angle),
                        )
                        .await;

                    if record.state != AnalysisState::Completed {
                        warn!(
                            "Routine {}: analysis of angle {} ended in {:?}",
                            id, angle, record.state
                        );
                    }
                    if let Some(run) = self.runs.lock().get_mut(id) {
                        run.routine.analysis_ids.push(record.id.clone());
                        run.analyses.push((angle, record));
                    }
                }
                Err(e) => warn!("Routine {}: skipping analysis of angle {}: {}", id, angle, e),
            }

            self.coordinator.release_engine().await;

            if index + 1 < captured.len() {
                tokio::time::sleep(config.analysis_delay()).await;
            }
        }
    }

    async fn write_artifacts(
        &self,
        id: &str,
        analyses: &[(u32, AnalysisRecord)],
        cell_size: u32,
    ) -> Result<(ConsolidatedReport, PathBuf, PathBuf)> {
        let completed: Vec<(u32, &AnalysisRecord)> = analyses
            .iter()
            .filter(|(_, record)| record.state == AnalysisState::Completed)
            .map(|(angle, record)| (*angle, record))
            .collect();
        let report = ConsolidatedReport::build(id, &completed);

        let cells: Vec<CompositeCell> = analyses
            .iter()
            .map(|(angle, record)| CompositeCell {
                angle: *angle,
                image: record.rendered_image.clone(),
            })
            .collect();
        let font = self.font.clone();
        let composite = tokio::task::spawn_blocking(move || {
            let grid = compose_grid(&cells, cell_size, font.as_deref());
            encode_jpeg(&grid, COMPOSITE_JPEG_QUALITY)
        })
        .await
        .map_err(|e| {
            InspectionError::component("routine", &format!("Composite task failed: {}", e))
        })??;

        let dir = self.routines_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let composite_path = dir.join(format!("{}_composite.jpg", id));
        tokio::fs::write(&composite_path, composite).await?;

        let report_path = dir.join(format!("{}_report.json", id));
        tokio::fs::write(&report_path, serde_json::to_vec_pretty(&report)?).await?;

        debug!(
            "Routine {} artefacts: {} and {}",
            id,
            composite_path.display(),
            report_path.display()
        );
        Ok((report, composite_path, report_path))
    }

    async fn fail_routine(&self, id: &str, message: String) -> InspectionError {
        error!("Routine {} failed: {}", id, message);
        let routine = {
            let mut runs = self.runs.lock();
            runs.get_mut(id).map(|run| {
                if run.routine.state == RoutineState::InProgress {
                    run.routine.fail(message.clone());
                }
                run.routine.clone()
            })
        };
        self.release_active(id);
        if let Some(routine) = routine {
            self.persist(&routine).await;
        }
        RoutineError::Failed {
            id: id.to_string(),
            message,
        }
        .into()
    }

    fn release_active(&self, id: &str) {
        let mut active = self.active.lock();
        if active.as_deref() == Some(id) {
            *active = None;
        }
    }

    async fn persist(&self, routine: &InspectionRoutine) {
        if let Err(e) = self.sink.save_routine(routine).await {
            warn!("Failed to persist routine {}: {}", routine.id, e);
        }
    }
}

/// Persisted angles must decode to non-empty 8-bit RGB of the expected size
fn validate_image(image: &RgbImage, expected: Option<(u32, u32)>) -> Result<()> {
    let dimensions = image.dimensions();
    if dimensions.0 == 0 || dimensions.1 == 0 {
        return Err(InspectionError::component("routine", "Image is empty"));
    }
    if let Some(expected) = expected {
        if dimensions != expected {
            return Err(InspectionError::component(
                "routine",
                &format!(
                    "Image is {}x{}x3, expected {}x{}x3",
                    dimensions.0, dimensions.1, expected.0, expected.1
                ),
            ));
        }
    }
    Ok(())
}

async fn load_for_analysis(path: &Path, expected: Option<(u32, u32)>) -> Result<RgbImage> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<RgbImage> {
        let image = read_rgb(&path)?;
        validate_image(&image, expected)?;
        Ok(image)
    })
    .await
    .map_err(|e| InspectionError::component("routine", &format!("Load task failed: {}", e)))?
}
