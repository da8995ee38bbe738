use super::*;
use crate::camera::{CameraLifecycle, MockBackendFactory};
use crate::config::{CameraConfig, InspectionConfig, OutputConfig, SegmentationConfig};
use crate::error::{InspectionError, SegmentationError};
use crate::frame::Frame;
use crate::measurement::{self, Mask};
use crate::segmentation::{BoundingBox, Centroid, Detection, MockSegmenterFactory};
use crate::storage::{MemoryRecordSink, RecordSink};
use image::{Rgb, RgbImage};
use std::sync::Arc;
use tempfile::TempDir;

fn create_test_configs(output_dir: &TempDir) -> (SegmentationConfig, OutputConfig) {
    let config = InspectionConfig::default();
    let mut output = config.output;
    output.path = output_dir.path().to_string_lossy().to_string();
    output.font_path = output_dir
        .path()
        .join("missing-font.ttf")
        .to_string_lossy()
        .to_string();
    (config.segmentation, output)
}

fn create_coordinator(
    output_dir: &TempDir,
) -> (AnalysisCoordinator, Arc<MockSegmenterFactory>, Arc<MemoryRecordSink>) {
    let (segmentation, output) = create_test_configs(output_dir);
    let factory = Arc::new(MockSegmenterFactory::new(segmentation.clone()));
    let sink = Arc::new(MemoryRecordSink::new());
    let coordinator = AnalysisCoordinator::new(
        segmentation,
        output,
        Arc::clone(&factory) as Arc<dyn crate::segmentation::SegmenterFactory>,
        Arc::clone(&sink) as Arc<dyn RecordSink>,
    );
    (coordinator, factory, sink)
}

fn create_test_frame() -> Frame {
    Frame::new(1, RgbImage::from_pixel(64, 48, Rgb([128, 128, 128])))
}

fn rect_detection(class_name: &str, x: u32, y: u32, w: u32, h: u32) -> Detection {
    let mask = Mask::from_fn(64, 48, |px, py| {
        if px >= x && px < x + w && py >= y && py < y + h {
            1.0
        } else {
            0.0
        }
    });
    Detection {
        class_name: class_name.to_string(),
        confidence: 0.9,
        bbox: BoundingBox {
            x1: x as f32,
            y1: y as f32,
            x2: (x + w) as f32,
            y2: (y + h) as f32,
        },
        centroid: Centroid {
            x: x as f32 + w as f32 / 2.0,
            y: y as f32 + h as f32 / 2.0,
        },
        mask: Some(mask),
        mask_coefficients: vec![0.1, 0.2],
    }
}

#[tokio::test]
async fn test_analyze_frame_completes_with_measurements() {
    let dir = TempDir::new().unwrap();
    let (coordinator, factory, sink) = create_coordinator(&dir);
    factory.set_detections(
        AnalysisKind::Defects,
        vec![rect_detection("rayon", 10, 10, 20, 10)],
    );

    let record = coordinator
        .analyze_frame(
            AnalysisKind::Defects,
            create_test_frame(),
            Some(0.5),
            AnalysisContext::routine("routine_x", 2),
        )
        .await;

    assert_eq!(record.state, AnalysisState::Completed);
    assert_eq!(record.model, "defectos");
    assert_eq!(record.routine_id.as_deref(), Some("routine_x"));
    assert_eq!(record.angle, Some(2));
    assert_eq!(record.conversion_factor, Some(0.5));
    assert_eq!(record.instance_count(), 1);
    assert!(record.captured_at.is_some());
    assert!(record.processed_at.is_some());

    let instance = &record.instances[0];
    assert_eq!(instance.class_name, "rayon");
    assert_eq!(instance.measurements.bbox_width_px, 20.0);
    assert_eq!(instance.measurements.bbox_height_px, 10.0);
    assert_eq!(instance.measurements.bbox_width_mm, Some(10.0));

    assert!(record.timings.total_ms >= record.timings.segmentation_ms);

    let saved = sink.analysis(&record.id).unwrap();
    assert_eq!(saved, record);
}

#[tokio::test]
async fn test_rendered_overlay_is_written() {
    let dir = TempDir::new().unwrap();
    let (coordinator, factory, _sink) = create_coordinator(&dir);
    factory.set_detections(
        AnalysisKind::Pieces,
        vec![rect_detection("cople", 5, 5, 30, 30)],
    );

    let record = coordinator
        .analyze_frame(
            AnalysisKind::Pieces,
            create_test_frame(),
            None,
            AnalysisContext::default(),
        )
        .await;

    let path = record.rendered_image.expect("overlay path");
    assert_eq!(path, dir.path().join("analyses").join(format!("{}.jpg", record.id)));
    let rendered = image::open(&path).unwrap().to_rgb8();
    assert_eq!(rendered.dimensions(), (64, 48));
}

#[tokio::test]
async fn test_zero_detections_is_not_an_error() {
    let dir = TempDir::new().unwrap();
    let (coordinator, _factory, _sink) = create_coordinator(&dir);

    let record = coordinator
        .analyze_frame(
            AnalysisKind::Defects,
            create_test_frame(),
            None,
            AnalysisContext::default(),
        )
        .await;

    assert_eq!(record.state, AnalysisState::Completed);
    assert_eq!(record.instance_count(), 0);
    assert!(record.error.is_none());
}

#[tokio::test]
async fn test_segmentation_failure_marks_record_error() {
    let dir = TempDir::new().unwrap();
    let (coordinator, factory, sink) = create_coordinator(&dir);
    factory.set_failing(AnalysisKind::Defects, true);

    let record = coordinator
        .analyze_frame(
            AnalysisKind::Defects,
            create_test_frame(),
            None,
            AnalysisContext::default(),
        )
        .await;

    assert_eq!(record.state, AnalysisState::Error);
    assert!(record.error.as_deref().unwrap().contains("Segmentation failed"));
    assert!(record.instances.is_empty());
    assert!(record.rendered_image.is_none());
    assert_eq!(sink.analysis(&record.id).unwrap().state, AnalysisState::Error);
}

#[tokio::test]
async fn test_capture_failure_marks_record_error() {
    let dir = TempDir::new().unwrap();
    let (coordinator, factory, _sink) = create_coordinator(&dir);

    let record = coordinator
        .run(
            AnalysisKind::Pieces,
            async { Err(InspectionError::system("sensor unplugged")) },
            |_image| async { Ok(Vec::new()) },
            measurement::compute,
            None,
            AnalysisContext::default(),
        )
        .await;

    assert_eq!(record.state, AnalysisState::Error);
    assert!(record.error.as_deref().unwrap().contains("sensor unplugged"));
    assert_eq!(factory.load_count(), 0);
}

#[tokio::test]
async fn test_run_uses_injected_phases() {
    let dir = TempDir::new().unwrap();
    let (coordinator, _factory, _sink) = create_coordinator(&dir);

    let record = coordinator
        .run(
            AnalysisKind::Pieces,
            async { Ok(create_test_frame()) },
            |image| async move {
                assert_eq!(image.dimensions(), (64, 48));
                Ok(vec![
                    rect_detection("a", 0, 0, 4, 4),
                    rect_detection("b", 10, 10, 4, 4),
                ])
            },
            |_mask, _factor| measurement::MeasurementSet {
                mask_area_px: 42.0,
                ..Default::default()
            },
            None,
            AnalysisContext::default(),
        )
        .await;

    assert_eq!(record.instance_count(), 2);
    assert!(record
        .instances
        .iter()
        .all(|instance| instance.measurements.mask_area_px == 42.0));
}

#[tokio::test]
async fn test_injected_segmentation_error() {
    let dir = TempDir::new().unwrap();
    let (coordinator, _factory, _sink) = create_coordinator(&dir);

    let record = coordinator
        .run(
            AnalysisKind::Pieces,
            async { Ok(create_test_frame()) },
            |_image| async {
                Err(SegmentationError::Inference {
                    details: "out of memory".to_string(),
                })
            },
            measurement::compute,
            None,
            AnalysisContext::default(),
        )
        .await;

    assert_eq!(record.state, AnalysisState::Error);
    assert!(record.error.as_deref().unwrap().contains("out of memory"));
}

#[tokio::test]
async fn test_low_resolution_mask_is_measured_at_image_size() {
    let dir = TempDir::new().unwrap();
    let (coordinator, factory, _sink) = create_coordinator(&dir);

    // Quarter-resolution mask covering the left half of the image
    let mask = Mask::from_fn(16, 12, |x, _| if x < 8 { 1.0 } else { 0.0 });
    let mut detection = rect_detection("cople", 0, 0, 32, 48);
    detection.mask = Some(mask);
    factory.set_detections(AnalysisKind::Pieces, vec![detection]);

    let record = coordinator
        .analyze_frame(
            AnalysisKind::Pieces,
            create_test_frame(),
            None,
            AnalysisContext::default(),
        )
        .await;

    let measurements = &record.instances[0].measurements;
    assert_eq!(measurements.mask_width_px, 32.0);
    assert_eq!(measurements.mask_height_px, 48.0);
}

#[tokio::test]
async fn test_engine_is_reused_and_swapped() {
    let dir = TempDir::new().unwrap();
    let (coordinator, factory, _sink) = create_coordinator(&dir);

    for _ in 0..3 {
        coordinator
            .analyze_frame(
                AnalysisKind::Defects,
                create_test_frame(),
                None,
                AnalysisContext::default(),
            )
            .await;
    }
    assert_eq!(factory.load_count(), 1);
    assert_eq!(factory.call_count(), 3);
    assert_eq!(coordinator.loaded_engine().await, Some(AnalysisKind::Defects));

    coordinator
        .analyze_frame(
            AnalysisKind::Pieces,
            create_test_frame(),
            None,
            AnalysisContext::default(),
        )
        .await;
    assert_eq!(factory.load_count(), 2);
    assert_eq!(coordinator.loaded_engine().await, Some(AnalysisKind::Pieces));

    coordinator.release_engine().await;
    assert_eq!(coordinator.loaded_engine().await, None);
}

#[tokio::test]
async fn test_loaded_model_is_reported_on_camera() {
    let dir = TempDir::new().unwrap();
    let (segmentation, output) = create_test_configs(&dir);
    let factory = Arc::new(MockSegmenterFactory::new(segmentation.clone()));

    let camera_config = CameraConfig {
        resolution: (64, 48),
        ..InspectionConfig::default().camera
    };
    let camera = CameraLifecycle::new(
        camera_config,
        Arc::new(MockBackendFactory::new((64, 48))),
        None,
    );
    camera.initialize("10.0.0.1").await.unwrap();

    let coordinator = AnalysisCoordinator::new(
        segmentation,
        output,
        factory,
        Arc::new(MemoryRecordSink::new()),
    )
    .with_camera(camera.clone());

    let record = coordinator
        .analyze_live(AnalysisKind::Pieces, &camera, None)
        .await;
    assert_eq!(record.state, AnalysisState::Completed);
    assert_eq!(record.resolution.unwrap().width, 64);
    assert_eq!(camera.status().await.loaded_model.as_deref(), Some("piezas"));

    coordinator.release_engine().await;
    assert_eq!(camera.status().await.loaded_model, None);

    camera.release().await.unwrap();
}

#[tokio::test]
async fn test_live_analysis_without_camera_fails_record() {
    let dir = TempDir::new().unwrap();
    let (coordinator, _factory, _sink) = create_coordinator(&dir);
    let camera = CameraLifecycle::new(
        InspectionConfig::default().camera,
        Arc::new(MockBackendFactory::new((64, 48))),
        None,
    );

    let record = coordinator
        .analyze_live(AnalysisKind::Defects, &camera, None)
        .await;
    assert_eq!(record.state, AnalysisState::Error);
    assert!(record.error.as_deref().unwrap().contains("Capture failed"));
}

#[test]
fn test_render_leaves_source_untouched() {
    let source = RgbImage::from_pixel(64, 48, Rgb([100, 100, 100]));
    let detection = rect_detection("cople", 10, 10, 20, 20);

    let rendered = render_detections(
        &source,
        &[detection],
        AnalysisKind::Defects.color(),
        &OverlayStyle::without_labels(0.5),
    );

    assert_eq!(source.get_pixel(15, 15), &Rgb([100, 100, 100]));
    // Fill blends towards red
    let filled = rendered.get_pixel(15, 15);
    assert!(filled[0] > 100 && filled[1] < 100);
    // Box frame is solid
    assert_eq!(rendered.get_pixel(10, 20), &Rgb([255, 0, 0]));
    // Outside untouched
    assert_eq!(rendered.get_pixel(50, 40), &Rgb([100, 100, 100]));
}

#[test]
fn test_record_transitions_are_forward_only() {
    let mut record = AnalysisRecord::new(AnalysisKind::Pieces, "piezas");
    assert!(record.id.starts_with("analysis_"));
    assert_eq!(record.state, AnalysisState::Processing);

    record.complete();
    assert_eq!(record.state, AnalysisState::Completed);

    record.fail("late failure");
    assert_eq!(record.state, AnalysisState::Completed);
    assert!(record.error.is_none());
}

#[test]
fn test_record_serializes_instance_class() {
    let mut record = AnalysisRecord::new(AnalysisKind::Defects, "defectos");
    record.instances.push(InstanceMeasurement::new(
        &rect_detection("poro", 1, 1, 2, 2),
        Default::default(),
    ));

    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["kind"], "defects");
    assert_eq!(json["state"], "processing");
    assert_eq!(json["instances"][0]["class"], "poro");
}
