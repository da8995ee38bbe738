use super::record::{AnalysisKind, AnalysisRecord, InstanceMeasurement};
use super::render::{render_detections, OverlayStyle};
use crate::camera::CameraLifecycle;
use crate::config::{OutputConfig, SegmentationConfig};
use crate::error::{InspectionError, Result, SegmentationError};
use crate::frame::{encode_jpeg, Frame};
use crate::measurement::{self, Mask, MeasurementSet};
use crate::segmentation::{Detection, Segmenter, SegmenterFactory};
use crate::storage::RecordSink;
use image::RgbImage;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// JPEG quality of persisted overlay renders
const RENDER_JPEG_QUALITY: u8 = 90;

/// Routine linkage of an analysis
#[derive(Debug, Clone, Default)]
pub struct AnalysisContext {
    pub routine_id: Option<String>,
    pub angle: Option<u32>,
}

impl AnalysisContext {
    pub fn routine(routine_id: &str, angle: u32) -> Self {
        Self {
            routine_id: Some(routine_id.to_string()),
            angle: Some(angle),
        }
    }
}

struct LoadedEngine {
    kind: AnalysisKind,
    segmenter: Box<dyn Segmenter>,
}

/// Runs capture, segmentation and measurement for one image and records the
/// outcome.
///
/// At most one inference engine is resident: asking for the other model kind
/// releases the loaded one first.
pub struct AnalysisCoordinator {
    segmentation: SegmentationConfig,
    output: OutputConfig,
    factory: Arc<dyn SegmenterFactory>,
    sink: Arc<dyn RecordSink>,
    camera: Option<CameraLifecycle>,
    style: Arc<OverlayStyle>,
    engine: Mutex<Option<LoadedEngine>>,
}

impl AnalysisCoordinator {
    pub fn new(
        segmentation: SegmentationConfig,
        output: OutputConfig,
        factory: Arc<dyn SegmenterFactory>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        let style = Arc::new(OverlayStyle::from_config(&output));
        Self {
            segmentation,
            output,
            factory,
            sink,
            camera: None,
            style,
            engine: Mutex::new(None),
        }
    }

    /// Keep the camera's loaded-model bookkeeping in sync with the engine slot
    pub fn with_camera(mut self, camera: CameraLifecycle) -> Self {
        self.camera = Some(camera);
        self
    }

    pub fn with_style(mut self, style: OverlayStyle) -> Self {
        self.style = Arc::new(style);
        self
    }

    pub fn analyses_dir(&self) -> PathBuf {
        PathBuf::from(&self.output.path).join("analyses")
    }

    /// One capture, segment, measure cycle.
    ///
    /// Never fails: a capture or segmentation failure ends the record in the
    /// error state, and instances whose geometry cannot be measured keep a
    /// zeroed measurement set.
    pub async fn run<C, S, SFut, M>(
        &self,
        kind: AnalysisKind,
        capture: C,
        segment: S,
        measure: M,
        conversion_factor: Option<f64>,
        context: AnalysisContext,
    ) -> AnalysisRecord
    where
        C: Future<Output = Result<Frame>>,
        S: FnOnce(Arc<RgbImage>) -> SFut,
        SFut: Future<Output = std::result::Result<Vec<Detection>, SegmentationError>>,
        M: Fn(Option<&Mask>, Option<f64>) -> MeasurementSet,
    {
        let mut record = AnalysisRecord::new(kind, kind.model_tag(&self.segmentation));
        record.conversion_factor = conversion_factor;
        record.routine_id = context.routine_id;
        record.angle = context.angle;
        self.save(&record).await;

        let started = Instant::now();

        let frame = match capture.await {
            Ok(frame) => frame,
            Err(e) => {
                record.timings.capture_ms = elapsed_ms(started);
                record.timings.total_ms = record.timings.capture_ms;
                error!("Analysis {}: capture failed: {}", record.id, e);
                record.fail(format!("Capture failed: {}", e));
                self.save(&record).await;
                return record;
            }
        };
        record.captured_at = Some(frame.captured_at);
        record.resolution = Some(frame.resolution());
        record.timings.capture_ms = elapsed_ms(started);

        let phase = Instant::now();
        let detections = match segment(Arc::clone(&frame.image)).await {
            Ok(detections) => detections,
            Err(e) => {
                record.timings.segmentation_ms = elapsed_ms(phase);
                record.timings.total_ms = elapsed_ms(started);
                error!("Analysis {}: segmentation failed: {}", record.id, e);
                record.fail(format!("Segmentation failed: {}", e));
                self.save(&record).await;
                return record;
            }
        };
        record.timings.segmentation_ms = elapsed_ms(phase);

        let phase = Instant::now();
        let (width, height) = (frame.width(), frame.height());
        record.instances = detections
            .iter()
            .map(|detection| {
                let mask = detection
                    .mask
                    .as_ref()
                    .map(|mask| at_image_resolution(mask, width, height));
                InstanceMeasurement::new(detection, measure(mask.as_ref(), conversion_factor))
            })
            .collect();
        record.timings.measurement_ms = elapsed_ms(phase);

        if self.output.render_overlays {
            let phase = Instant::now();
            match self
                .render_and_save(&record.id, Arc::clone(&frame.image), detections, kind)
                .await
            {
                Ok(path) => record.rendered_image = Some(path),
                Err(e) => warn!("Analysis {}: overlay not saved: {}", record.id, e),
            }
            record.timings.render_ms = elapsed_ms(phase);
        }

        record.timings.total_ms = elapsed_ms(started);
        record.complete();
        self.save(&record).await;

        info!(
            "Analysis {} ({}) completed: {} instances in {:.0} ms",
            record.id,
            kind,
            record.instance_count(),
            record.timings.total_ms
        );
        record
    }

    /// Analyse an image that was already captured
    pub async fn analyze_frame(
        &self,
        kind: AnalysisKind,
        frame: Frame,
        conversion_factor: Option<f64>,
        context: AnalysisContext,
    ) -> AnalysisRecord {
        self.run(
            kind,
            async move { Ok(frame) },
            |image| self.segment_with_engine(kind, image),
            measurement::compute,
            conversion_factor,
            context,
        )
        .await
    }

    /// Capture from the camera and analyse the result
    pub async fn analyze_live(
        &self,
        kind: AnalysisKind,
        camera: &CameraLifecycle,
        conversion_factor: Option<f64>,
    ) -> AnalysisRecord {
        self.run(
            kind,
            async { camera.capture().await.map_err(InspectionError::from) },
            |image| self.segment_with_engine(kind, image),
            measurement::compute,
            conversion_factor,
            AnalysisContext::default(),
        )
        .await
    }

    /// Segment with the engine for `kind`, loading it (and dropping any other
    /// resident engine) when needed. Inference runs on the blocking pool.
    pub async fn segment_with_engine(
        &self,
        kind: AnalysisKind,
        image: Arc<RgbImage>,
    ) -> std::result::Result<Vec<Detection>, SegmentationError> {
        let mut slot = self.engine.lock().await;

        let loaded = match slot.take() {
            Some(loaded) if loaded.kind == kind => loaded,
            previous => {
                if let Some(previous) = previous {
                    info!(
                        "Releasing {} model before loading {} model",
                        previous.segmenter.model(),
                        kind
                    );
                    drop(previous);
                }
                self.set_camera_model(None).await;

                let factory = Arc::clone(&self.factory);
                let segmenter = tokio::task::spawn_blocking(move || factory.create(kind))
                    .await
                    .map_err(|e| SegmentationError::ModelLoad {
                        model: kind.to_string(),
                        details: format!("Loader task failed: {}", e),
                    })??;
                LoadedEngine { kind, segmenter }
            }
        };

        let model = loaded.segmenter.model().to_string();
        self.set_camera_model(Some(&model)).await;

        let (loaded, result) = tokio::task::spawn_blocking(move || {
            let mut loaded = loaded;
            let result = loaded.segmenter.segment(&image);
            (loaded, result)
        })
        .await
        .map_err(|e| SegmentationError::Inference {
            details: format!("Inference task failed: {}", e),
        })?;

        *slot = Some(loaded);
        result
    }

    /// Drop the resident inference engine, if any
    pub async fn release_engine(&self) {
        let previous = self.engine.lock().await.take();
        if let Some(previous) = previous {
            debug!("Released {} model", previous.segmenter.model());
            drop(previous);
            self.set_camera_model(None).await;
        }
    }

    /// Kind of the resident engine
    pub async fn loaded_engine(&self) -> Option<AnalysisKind> {
        self.engine.lock().await.as_ref().map(|loaded| loaded.kind)
    }

    async fn set_camera_model(&self, model: Option<&str>) {
        if let Some(camera) = &self.camera {
            camera.set_loaded_model(model).await;
        }
    }

    async fn render_and_save(
        &self,
        id: &str,
        image: Arc<RgbImage>,
        detections: Vec<Detection>,
        kind: AnalysisKind,
    ) -> Result<PathBuf> {
        let style = Arc::clone(&self.style);
        let jpeg = tokio::task::spawn_blocking(move || {
            let rendered = render_detections(&image, &detections, kind.color(), &style);
            encode_jpeg(&rendered, RENDER_JPEG_QUALITY)
        })
        .await
        .map_err(|e| {
            InspectionError::component("analysis", &format!("Render task failed: {}", e))
        })??;

        let dir = self.analyses_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.jpg", id));
        tokio::fs::write(&path, jpeg).await?;
        debug!("Saved overlay {}", path.display());
        Ok(path)
    }

    async fn save(&self, record: &AnalysisRecord) {
        if let Err(e) = self.sink.save_analysis(record).await {
            warn!("Failed to persist analysis {}: {}", record.id, e);
        }
    }
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

/// Masks are measured in source image pixels
fn at_image_resolution(mask: &Mask, width: u32, height: u32) -> Mask {
    if mask.dimensions() == (width, height) || mask.is_empty() {
        mask.clone()
    } else {
        Mask::from_gray(&mask.binarize_to(width, height))
    }
}
