use super::*;
use crate::analysis::{AnalysisCoordinator, AnalysisKind};
use crate::camera::{CameraLifecycle, MockBackendFactory, MockControl};
use crate::config::{InspectionConfig, RoutineConfig};
use crate::error::{InspectionError, RoutineError};
use crate::segmentation::{BoundingBox, Centroid, Detection, MockSegmenterFactory};
use crate::storage::{MemoryRecordSink, RecordSink};
use image::{Rgb, RgbImage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    camera: CameraLifecycle,
    control: Arc<MockControl>,
    segmenter: Arc<MockSegmenterFactory>,
    coordinator: Arc<AnalysisCoordinator>,
    sink: Arc<MemoryRecordSink>,
    orchestrator: InspectionRoutineOrchestrator,
}

impl Fixture {
    fn routine_config(&self, angles: u32) -> RoutineConfig {
        RoutineConfig {
            angles,
            capture_delay_ms: 0,
            analysis_delay_ms: 0,
            expected_resolution: Some((64, 64)),
            scratch_dir: self.dir.path().join("scratch").to_string_lossy().to_string(),
            composite_cell_size: 32,
        }
    }
}

async fn create_fixture(initialize: bool) -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config = InspectionConfig::default();
    config.camera.resolution = (64, 64);
    config.output.path = dir.path().join("output").to_string_lossy().to_string();
    config.output.font_path = dir.path().join("no-font.ttf").to_string_lossy().to_string();

    let factory = MockBackendFactory::new((64, 64));
    let control = factory.gige_control();
    let sink = Arc::new(MemoryRecordSink::new());
    let camera = CameraLifecycle::new(config.camera.clone(), Arc::new(factory), None);
    if initialize {
        camera.initialize("10.0.0.1").await.unwrap();
    }

    let segmenter = Arc::new(MockSegmenterFactory::new(config.segmentation.clone()));
    let coordinator = Arc::new(
        AnalysisCoordinator::new(
            config.segmentation.clone(),
            config.output.clone(),
            Arc::clone(&segmenter) as Arc<dyn crate::segmentation::SegmenterFactory>,
            Arc::clone(&sink) as Arc<dyn RecordSink>,
        )
        .with_camera(camera.clone()),
    );
    let orchestrator = InspectionRoutineOrchestrator::new(
        config.routine.clone(),
        config.output.clone(),
        camera.clone(),
        Arc::clone(&coordinator),
        Arc::clone(&sink) as Arc<dyn RecordSink>,
    );

    Fixture {
        dir,
        camera,
        control,
        segmenter,
        coordinator,
        sink,
        orchestrator,
    }
}

fn defect(x: f32, y: f32) -> Detection {
    Detection {
        class_name: "rayon".to_string(),
        confidence: 0.8,
        bbox: BoundingBox {
            x1: x,
            y1: y,
            x2: x + 8.0,
            y2: y + 4.0,
        },
        centroid: Centroid {
            x: x + 4.0,
            y: y + 2.0,
        },
        mask: None,
        mask_coefficients: Vec::new(),
    }
}

#[tokio::test]
async fn test_full_routine_completes() {
    let fixture = create_fixture(true).await;
    let config = fixture.routine_config(6);
    let scratch_root = config.scratch_path();

    let routine = fixture.orchestrator.run_routine(config).await.unwrap();

    assert_eq!(routine.state, RoutineState::Completed);
    assert!(routine.id.starts_with("routine_"));
    assert_eq!(routine.captured_count, 6);
    assert_eq!(routine.analysis_ids.len(), 6);
    assert!(routine.finished_at.is_some());

    let report = routine.report.as_ref().unwrap();
    assert_eq!(report.angle_count, 6);
    assert_eq!(
        report.angles.iter().map(|a| a.angle).collect::<Vec<_>>(),
        vec![1, 2, 3, 4, 5, 6]
    );

    let composite = image::open(routine.composite_image.as_ref().unwrap())
        .unwrap()
        .to_rgb8();
    assert_eq!(composite.dimensions(), (3 * 32, 2 * 32));

    let report_json = std::fs::read_to_string(routine.report_path.as_ref().unwrap()).unwrap();
    let parsed: ConsolidatedReport = serde_json::from_str(&report_json).unwrap();
    assert_eq!(parsed.routine_id, routine.id);

    assert!(!scratch_root.join(&routine.id).exists());
    assert_eq!(fixture.orchestrator.active_routine(), None);

    let saved = fixture.sink.routine(&routine.id).unwrap();
    assert_eq!(saved.state, RoutineState::Completed);

    for id in &routine.analysis_ids {
        let record = fixture.sink.analysis(id).unwrap();
        assert_eq!(record.kind, AnalysisKind::Defects);
        assert_eq!(record.routine_id.as_deref(), Some(routine.id.as_str()));
    }
}

#[tokio::test]
async fn test_failing_angle_is_skipped() {
    let fixture = create_fixture(true).await;
    fixture.control.fail_grab(3);

    let routine = fixture
        .orchestrator
        .run_routine(fixture.routine_config(6))
        .await
        .unwrap();

    assert_eq!(routine.state, RoutineState::Completed);
    assert_eq!(routine.captured_count, 5);
    assert_eq!(routine.analysis_ids.len(), 5);

    let report = routine.report.unwrap();
    assert!(report.angle_count <= 6);
    assert_eq!(report.angle_count, 5);
    assert!(report.angles.iter().all(|a| a.angle != 3));
}

#[tokio::test]
async fn test_report_counts_defects() {
    let fixture = create_fixture(true).await;
    fixture
        .segmenter
        .set_detections(AnalysisKind::Defects, vec![defect(2.0, 2.0), defect(30.0, 30.0)]);

    let routine = fixture
        .orchestrator
        .run_routine(fixture.routine_config(3))
        .await
        .unwrap();

    let summary = routine.report.unwrap().summary;
    assert_eq!(summary.total_defects, 6);
    assert_eq!(summary.defects_per_angle, vec![2, 2, 2]);
    assert!((summary.average_defects - 2.0).abs() < f64::EPSILON);
    assert!(summary.total_processing_ms >= 0.0);
}

#[tokio::test]
async fn test_engine_released_after_each_analysis() {
    let fixture = create_fixture(true).await;

    fixture
        .orchestrator
        .run_routine(fixture.routine_config(4))
        .await
        .unwrap();

    assert_eq!(fixture.segmenter.load_count(), 4);
    assert_eq!(fixture.coordinator.loaded_engine().await, None);
    assert_eq!(fixture.camera.status().await.loaded_model, None);
}

#[tokio::test]
async fn test_concurrent_start_is_rejected() {
    let fixture = create_fixture(true).await;

    let first = fixture
        .orchestrator
        .start_routine(fixture.routine_config(2))
        .await
        .unwrap();
    let second = fixture
        .orchestrator
        .start_routine(fixture.routine_config(2))
        .await;
    assert!(matches!(
        second,
        Err(InspectionError::Routine(RoutineError::AlreadyInProgress { ref id })) if *id == first.id
    ));

    fixture.orchestrator.execute_sweep(&first.id).await.unwrap();
    fixture.orchestrator.finalize(&first.id).await.unwrap();

    assert!(fixture
        .orchestrator
        .start_routine(fixture.routine_config(2))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_unknown_routine() {
    let fixture = create_fixture(true).await;

    assert!(matches!(
        fixture.orchestrator.routine("routine_missing"),
        Err(RoutineError::NotFound { .. })
    ));
    assert!(matches!(
        fixture.orchestrator.execute_sweep("routine_missing").await,
        Err(InspectionError::Routine(RoutineError::NotFound { .. }))
    ));
    assert!(matches!(
        fixture.orchestrator.finalize("routine_missing").await,
        Err(InspectionError::Routine(RoutineError::NotFound { .. }))
    ));
}

#[tokio::test]
async fn test_invalid_angle_count_is_rejected() {
    let fixture = create_fixture(true).await;

    assert!(fixture
        .orchestrator
        .start_routine(fixture.routine_config(0))
        .await
        .is_err());
    assert!(fixture
        .orchestrator
        .start_routine(fixture.routine_config(7))
        .await
        .is_err());
    assert_eq!(fixture.orchestrator.active_routine(), None);
}

#[tokio::test]
async fn test_sweep_runs_once() {
    let fixture = create_fixture(true).await;
    let routine = fixture
        .orchestrator
        .start_routine(fixture.routine_config(1))
        .await
        .unwrap();

    fixture.orchestrator.execute_sweep(&routine.id).await.unwrap();
    assert!(matches!(
        fixture.orchestrator.execute_sweep(&routine.id).await,
        Err(InspectionError::Routine(RoutineError::Failed { .. }))
    ));
}

#[tokio::test]
async fn test_routine_without_camera_completes_empty() {
    let fixture = create_fixture(false).await;

    let routine = fixture
        .orchestrator
        .run_routine(fixture.routine_config(3))
        .await
        .unwrap();

    assert_eq!(routine.state, RoutineState::Completed);
    assert_eq!(routine.captured_count, 0);
    assert!(routine.analysis_ids.is_empty());
    assert!(routine.error.is_none());
    assert_eq!(fixture.orchestrator.active_routine(), None);

    let report = routine.report.as_ref().unwrap();
    assert_eq!(report.angle_count, 0);
    assert_eq!(report.summary.total_defects, 0);
    assert_eq!(report.summary.average_defects, 0.0);

    // Blank grid is still written
    let composite = image::open(routine.composite_image.as_ref().unwrap())
        .unwrap()
        .to_rgb8();
    assert_eq!(composite.dimensions(), (96, 64));
    assert_eq!(composite.get_pixel(48, 32), &Rgb([240, 240, 240]));

    // A terminal routine cannot be finalized again
    assert!(matches!(
        fixture.orchestrator.finalize(&routine.id).await,
        Err(InspectionError::Routine(RoutineError::NotInProgress { .. }))
    ));
}

#[tokio::test]
async fn test_failed_grabs_complete_with_zero_count_report() {
    let fixture = create_fixture(true).await;
    for n in 1..=2 {
        fixture.control.fail_grab(n);
    }

    let routine = fixture
        .orchestrator
        .run_routine(fixture.routine_config(2))
        .await
        .unwrap();

    assert_eq!(routine.state, RoutineState::Completed);
    assert_eq!(routine.captured_count, 0);
    assert_eq!(routine.report.as_ref().unwrap().angle_count, 0);
    assert!(routine.report_path.as_ref().unwrap().is_file());
}

#[tokio::test]
async fn test_analysis_keeps_grab_timestamp() {
    let fixture = create_fixture(true).await;
    let mut config = fixture.routine_config(2);
    config.analysis_delay_ms = 200;

    let routine = fixture.orchestrator.run_routine(config).await.unwrap();
    assert_eq!(routine.analysis_ids.len(), 2);

    let records: Vec<_> = routine
        .analysis_ids
        .iter()
        .map(|id| fixture.sink.analysis(id).unwrap())
        .collect();
    let captured: Vec<_> = records.iter().map(|r| r.captured_at.unwrap()).collect();
    let processed: Vec<_> = records.iter().map(|r| r.processed_at.unwrap()).collect();

    // Both angles were grabbed back to back; only the analyses are spaced
    assert!((captured[1] - captured[0]).num_milliseconds() < 150);
    assert!((processed[1] - processed[0]).num_milliseconds() >= 200);
    assert!(captured[1] < processed[0]);
}

#[tokio::test]
async fn test_resolution_mismatch_skips_analysis() {
    let fixture = create_fixture(true).await;
    let mut config = fixture.routine_config(2);
    config.expected_resolution = Some((640, 640));

    let routine = fixture.orchestrator.start_routine(config).await.unwrap();
    let swept = fixture.orchestrator.execute_sweep(&routine.id).await.unwrap();

    assert_eq!(swept.captured_count, 2);
    assert!(swept.analysis_ids.is_empty());
    assert_eq!(fixture.segmenter.call_count(), 0);

    let finalized = fixture.orchestrator.finalize(&routine.id).await.unwrap();
    assert_eq!(finalized.state, RoutineState::Completed);
    assert_eq!(finalized.report.as_ref().unwrap().angle_count, 0);
}

#[tokio::test]
async fn test_camera_release_blocked_during_sweep() {
    let fixture = create_fixture(true).await;
    fixture.control.set_grab_delay(Duration::from_millis(50));
    let mut config = fixture.routine_config(2);
    config.capture_delay_ms = 100;

    let routine = fixture.orchestrator.start_routine(config).await.unwrap();
    let sweep = fixture.orchestrator.execute_sweep(&routine.id);
    let release = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        fixture.camera.release().await
    };

    let (swept, released) = tokio::join!(sweep, release);
    assert_eq!(swept.unwrap().captured_count, 2);
    assert_eq!(released, Err(crate::error::CameraError::RoutineActive));

    fixture.camera.release().await.unwrap();
}

#[tokio::test]
async fn test_capture_delay_paces_angles() {
    let fixture = create_fixture(true).await;
    let mut config = fixture.routine_config(3);
    config.capture_delay_ms = 40;

    let started = Instant::now();
    let routine = fixture.orchestrator.run_routine(config).await.unwrap();

    assert_eq!(routine.captured_count, 3);
    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[test]
fn test_composite_places_cells_by_angle() {
    let dir = TempDir::new().unwrap();
    let tile = dir.path().join("angle_5.png");
    RgbImage::from_pixel(10, 10, Rgb([200, 0, 0]))
        .save(&tile)
        .unwrap();

    let grid = compose_grid(
        &[
            CompositeCell {
                angle: 5,
                image: Some(tile),
            },
            CompositeCell {
                angle: 1,
                image: Some(dir.path().join("missing.png")),
            },
        ],
        20,
        None,
    );

    assert_eq!(grid.dimensions(), (60, 40));
    // Angle 5 is the middle cell of the second row
    assert_eq!(grid.get_pixel(30, 30), &Rgb([200, 0, 0]));
    // Missing image leaves the background
    assert_eq!(grid.get_pixel(15, 15), &Rgb([240, 240, 240]));
    assert_eq!(grid.get_pixel(55, 5), &Rgb([240, 240, 240]));
}

#[test]
fn test_composite_labels_cells_without_font() {
    let grid = compose_grid(
        &[CompositeCell {
            angle: 2,
            image: None,
        }],
        64,
        None,
    );

    let white_in_cell = |x0: u32| {
        (x0..x0 + 64)
            .flat_map(|x| (0..64).map(move |y| (x, y)))
            .filter(|&(x, y)| grid.get_pixel(x, y) == &Rgb([255, 255, 255]))
            .count()
    };
    // Angle 2 is labelled even though the cell is blank
    assert!(white_in_cell(64) > 20);
    // Slots with no angle carry nothing
    assert_eq!(white_in_cell(0), 0);
    assert_eq!(white_in_cell(128), 0);
}

