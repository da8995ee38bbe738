use super::*;
use crate::config::CameraConfig;
use crate::error::CameraError;
use crate::storage::MemoryRecordSink;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn create_test_camera_config() -> CameraConfig {
    CameraConfig {
        address: "10.0.0.5".to_string(),
        webcam_indices: vec![0, 1],
        resolution: (64, 64),
        preview_fps: 20,
        hibernation_seconds: 60,
        capture_timeout_ms: 500,
        preview_join_timeout_ms: 500,
        jpeg_quality: 85,
    }
}

fn create_camera(
    config: CameraConfig,
    factory: MockBackendFactory,
) -> (CameraLifecycle, Arc<MemoryRecordSink>) {
    let sink = Arc::new(MemoryRecordSink::new());
    let camera = CameraLifecycleBuilder::new()
        .config(config)
        .factory(Arc::new(factory))
        .sink(sink.clone())
        .build()
        .unwrap();
    (camera, sink)
}

#[tokio::test]
async fn test_initialize_binds_gige_first() {
    let factory = MockBackendFactory::new((64, 64)).with_webcam(MockControl::new());
    let gige = factory.gige_control();
    let webcam = factory.webcam_control(0).unwrap();
    let (camera, sink) = create_camera(create_test_camera_config(), factory);

    let kind = camera.initialize("10.0.0.5").await.unwrap();
    assert_eq!(kind, BackendKind::GigE);
    assert_eq!(gige.open_count(), 1);
    assert_eq!(webcam.open_count(), 0);

    let status = camera.status().await;
    assert_eq!(status.state, CameraState::Active);
    assert!(status.active);
    assert!(!status.previewing);
    assert!(!status.using_webcam());

    let persisted = sink.last_camera_state().unwrap();
    assert!(persisted.active);
    assert_eq!(persisted.backend, Some(BackendKind::GigE));
}

#[tokio::test]
async fn test_initialize_twice_is_rejected() {
    let (camera, _) = create_camera(create_test_camera_config(), MockBackendFactory::new((64, 64)));
    camera.initialize("10.0.0.5").await.unwrap();
    assert_eq!(
        camera.initialize("10.0.0.5").await,
        Err(CameraError::AlreadyInitialized)
    );
}

#[tokio::test]
async fn test_fallback_picks_first_webcam_with_frames() {
    let blank = MockControl::new();
    blank.set_blank_frames(true);
    let good = MockControl::new();

    let factory = MockBackendFactory::new((64, 64))
        .with_gige(MockControl::unavailable())
        .with_webcam(blank.clone())
        .with_webcam(good.clone());
    let (camera, _) = create_camera(create_test_camera_config(), factory);

    let kind = camera.initialize("10.0.0.5").await.unwrap();
    assert_eq!(kind, BackendKind::Webcam);

    // The webcam that opened but produced nothing was closed again
    assert_eq!(blank.open_count(), 1);
    assert_eq!(blank.close_count(), 1);
    assert_eq!(good.open_count(), 1);
    assert!(camera.status().await.using_webcam());
}

#[tokio::test]
async fn test_no_device_available() {
    let factory = MockBackendFactory::new((64, 64))
        .with_gige(MockControl::unavailable())
        .with_webcam(MockControl::unavailable());
    let (camera, _) = create_camera(create_test_camera_config(), factory);

    match camera.initialize("10.0.0.5").await {
        Err(CameraError::NoDevice { address, webcams }) => {
            assert_eq!(address, "10.0.0.5");
            assert_eq!(webcams, 1);
        }
        other => panic!("Expected NoDevice, got {:?}", other),
    }
    assert_eq!(camera.status().await.state, CameraState::Uninitialized);
}

#[tokio::test]
async fn test_capture_requires_camera() {
    let (camera, _) = create_camera(create_test_camera_config(), MockBackendFactory::new((64, 64)));
    assert!(matches!(
        camera.capture().await,
        Err(CameraError::NotInitialized)
    ));
}

#[tokio::test]
async fn test_capture_returns_frames_and_reports_failures() {
    let factory = MockBackendFactory::new((64, 64));
    let gige = factory.gige_control();
    let (camera, _) = create_camera(create_test_camera_config(), factory);
    camera.initialize("10.0.0.5").await.unwrap();

    let first = camera.capture().await.unwrap();
    assert_eq!((first.width(), first.height()), (64, 64));

    gige.fail_grab(2);
    assert!(matches!(
        camera.capture().await,
        Err(CameraError::GrabFailed { .. })
    ));

    let third = camera.capture().await.unwrap();
    assert!(third.id > first.id);
    assert_eq!(gige.grab_count(), 3);

    // Single-shot grabs do not feed the preview buffer
    assert!(camera.latest_frame().is_none());
}

#[tokio::test]
async fn test_preview_rejections() {
    let (camera, _) = create_camera(create_test_camera_config(), MockBackendFactory::new((64, 64)));

    assert_eq!(camera.start_preview(5).await, Err(CameraError::NotInitialized));
    assert_eq!(camera.stop_preview().await, Err(CameraError::PreviewInactive));

    camera.initialize("10.0.0.5").await.unwrap();
    assert_eq!(
        camera.start_preview(0).await,
        Err(CameraError::InvalidFrameRate { fps: 0 })
    );

    camera.start_preview(5).await.unwrap();
    assert_eq!(camera.start_preview(5).await, Err(CameraError::PreviewActive));

    camera.stop_preview().await.unwrap();
    assert_eq!(camera.stop_preview().await, Err(CameraError::PreviewInactive));
}

#[tokio::test]
async fn test_preview_streams_frames() {
    let factory = MockBackendFactory::new((64, 64));
    let gige = factory.gige_control();
    let (camera, _) = create_camera(create_test_camera_config(), factory);
    camera.initialize("10.0.0.5").await.unwrap();

    assert!(camera.latest_frame_jpeg().is_none());

    camera.start_preview(20).await.unwrap();
    assert!(gige.is_streaming());
    assert_eq!(gige.stream_starts(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let jpeg = camera.latest_frame_jpeg().expect("preview frame");
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

    let status = camera.status().await;
    assert_eq!(status.state, CameraState::Previewing);
    assert_eq!(status.frame_rate, 20);
    assert!(status.has_frame);

    camera.stop_preview().await.unwrap();
    assert!(!gige.is_streaming());
    assert_eq!(gige.stream_stops(), 1);

    // The loop is gone: no grabs after stop
    let grabs = gige.grab_count();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(gige.grab_count(), grabs);
}

#[tokio::test]
async fn test_preview_paces_grabs() {
    let factory = MockBackendFactory::new((64, 64));
    let gige = factory.gige_control();
    let (camera, _) = create_camera(create_test_camera_config(), factory);
    camera.initialize("10.0.0.5").await.unwrap();

    camera.start_preview(10).await.unwrap();
    tokio::time::sleep(Duration::from_millis(550)).await;
    camera.stop_preview().await.unwrap();

    // 10 fps over roughly half a second
    let grabs = gige.grab_count();
    assert!((3..=8).contains(&grabs), "unexpected grab count {}", grabs);
}

#[tokio::test]
async fn test_webcam_preview_has_no_streaming_mode() {
    let webcam = MockControl::new();
    let factory = MockBackendFactory::new((64, 64))
        .with_gige(MockControl::unavailable())
        .with_webcam(webcam.clone());
    let (camera, _) = create_camera(create_test_camera_config(), factory);
    camera.initialize("10.0.0.5").await.unwrap();

    camera.start_preview(20).await.unwrap();
    camera.stop_preview().await.unwrap();
    assert_eq!(webcam.stream_starts(), 0);
    assert_eq!(webcam.stream_stops(), 0);
}

#[tokio::test]
async fn test_hibernate_and_reactivate() {
    let factory = MockBackendFactory::new((64, 64));
    let gige = factory.gige_control();
    let (camera, sink) = create_camera(create_test_camera_config(), factory);
    camera.initialize("10.0.0.5").await.unwrap();
    camera.start_preview(20).await.unwrap();

    camera.hibernate().await.unwrap();
    let status = camera.status().await;
    assert!(status.hibernated);
    assert!(!status.previewing);
    assert!(status.active);
    assert_eq!(status.state, CameraState::Hibernated);
    assert!(!gige.is_streaming());
    assert_eq!(gige.close_count(), 0);
    assert!(sink.last_camera_state().unwrap().hibernated);

    camera.reactivate(20).await.unwrap();
    let status = camera.status().await;
    assert!(!status.hibernated);
    assert!(status.previewing);
    assert_eq!(gige.stream_starts(), 2);
    // Reactivation reuses the bound device
    assert_eq!(gige.open_count(), 1);

    camera.release().await.unwrap();
}

#[tokio::test]
async fn test_reactivate_without_hibernation_starts_preview() {
    let (camera, _) = create_camera(create_test_camera_config(), MockBackendFactory::new((64, 64)));
    camera.initialize("10.0.0.5").await.unwrap();

    camera.reactivate(5).await.unwrap();
    assert!(camera.status().await.previewing);
    assert_eq!(camera.reactivate(5).await, Err(CameraError::PreviewActive));
}

const SHORT_HIBERNATION: Duration = Duration::from_millis(200);

fn create_hibernating_camera() -> CameraLifecycle {
    CameraLifecycleBuilder::new()
        .config(create_test_camera_config())
        .factory(Arc::new(MockBackendFactory::new((64, 64))))
        .hibernation_window(SHORT_HIBERNATION)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_auto_hibernation_ignores_polling() {
    let camera = create_hibernating_camera();
    camera.initialize("10.0.0.5").await.unwrap();
    camera.start_preview(20).await.unwrap();

    let deadline = Instant::now() + SHORT_HIBERNATION * 3;
    while Instant::now() < deadline {
        let _ = camera.latest_frame_jpeg();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let status = camera.status().await;
    assert!(status.hibernated);
    assert!(!status.previewing);
    assert!(status.active);
}

#[tokio::test]
async fn test_reset_postpones_hibernation() {
    let camera = create_hibernating_camera();
    camera.initialize("10.0.0.5").await.unwrap();
    camera.start_preview(20).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(camera.reset_hibernation_timer().await);
    tokio::time::sleep(Duration::from_millis(120)).await;
    // 240ms after start, 120ms after the reset
    assert!(camera.status().await.previewing);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(camera.status().await.hibernated);

    // Nothing to postpone once hibernated
    assert!(!camera.reset_hibernation_timer().await);
}

#[tokio::test]
async fn test_stop_preview_cancels_hibernation() {
    let camera = create_hibernating_camera();
    camera.initialize("10.0.0.5").await.unwrap();

    camera.start_preview(20).await.unwrap();
    camera.stop_preview().await.unwrap();
    tokio::time::sleep(SHORT_HIBERNATION * 2).await;

    let status = camera.status().await;
    assert_eq!(status.state, CameraState::Active);
    assert!(!status.hibernated);
}

#[test]
fn test_builder_rejects_zero_hibernation_window() {
    let result = CameraLifecycleBuilder::new()
        .config(create_test_camera_config())
        .factory(Arc::new(MockBackendFactory::new((64, 64))))
        .hibernation_window(Duration::ZERO)
        .build();
    assert!(result.is_err());
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let factory = MockBackendFactory::new((64, 64));
    let gige = factory.gige_control();
    let (camera, sink) = create_camera(create_test_camera_config(), factory);

    camera.release().await.unwrap();

    camera.initialize("10.0.0.5").await.unwrap();
    camera.start_preview(20).await.unwrap();
    camera.set_loaded_model(Some("defectos")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    camera.release().await.unwrap();
    camera.release().await.unwrap();

    let status = camera.status().await;
    assert_eq!(status.state, CameraState::Uninitialized);
    assert!(!status.has_frame);
    assert!(status.loaded_model.is_none());
    assert_eq!(gige.close_count(), 1);
    assert!(!gige.is_streaming());
    assert!(camera.latest_frame_jpeg().is_none());
    assert!(!sink.last_camera_state().unwrap().active);

    // A released camera can be bound again
    camera.initialize("10.0.0.5").await.unwrap();
    assert_eq!(gige.open_count(), 2);
}

#[tokio::test]
async fn test_release_rejected_while_routine_holds_camera() {
    let (camera, _) = create_camera(create_test_camera_config(), MockBackendFactory::new((64, 64)));
    camera.initialize("10.0.0.5").await.unwrap();

    let lease = camera.acquire_routine_lease().unwrap();
    assert!(matches!(
        camera.acquire_routine_lease(),
        Err(CameraError::RoutineActive)
    ));
    assert_eq!(camera.release().await, Err(CameraError::RoutineActive));
    assert!(camera.status().await.routine_active);

    drop(lease);
    camera.release().await.unwrap();
    assert_eq!(camera.status().await.state, CameraState::Uninitialized);
}

#[tokio::test]
async fn test_hung_grab_does_not_wedge_the_camera() {
    let mut config = create_test_camera_config();
    config.capture_timeout_ms = 100;
    config.preview_join_timeout_ms = 200;
    let factory = MockBackendFactory::new((64, 64));
    let gige = factory.gige_control();
    let (camera, _) = create_camera(config, factory);
    camera.initialize("10.0.0.5").await.unwrap();

    camera.start_preview(20).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    gige.set_grab_delay(Duration::from_millis(800));
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The preview grab now blocks the device; a single-shot grab gives up
    let started = Instant::now();
    assert!(matches!(
        camera.capture().await,
        Err(CameraError::Timeout { .. })
    ));
    assert!(started.elapsed() < Duration::from_millis(600));

    let started = Instant::now();
    camera.stop_preview().await.unwrap();
    camera.release().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(camera.status().await.state, CameraState::Uninitialized);
}

#[tokio::test]
async fn test_loaded_model_bookkeeping() {
    let (camera, _) = create_camera(create_test_camera_config(), MockBackendFactory::new((64, 64)));
    camera.initialize("10.0.0.5").await.unwrap();

    camera.set_loaded_model(Some("piezas")).await;
    assert_eq!(camera.status().await.loaded_model.as_deref(), Some("piezas"));

    camera.set_loaded_model(None).await;
    assert!(camera.status().await.loaded_model.is_none());
}

#[tokio::test]
async fn test_builder_validation() {
    let result = CameraLifecycleBuilder::new().build();
    match result {
        Err(crate::error::InspectionError::System { message }) => {
            assert!(message.contains("Camera configuration must be specified"))
        }
        _ => panic!("Expected system error for missing configuration"),
    }
}
