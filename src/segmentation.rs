//! Boundary to the external instance-segmentation engines.
//!
//! The engines themselves are not part of this crate. A [`Segmenter`] turns an
//! RGB image into detections; [`CommandSegmenter`] does so by running a
//! configured inference program in a child process for every call, so a crash
//! inside the native inference library cannot take the line controller down.

use crate::analysis::AnalysisKind;
use crate::config::SegmentationConfig;
use crate::error::SegmentationError;
use crate::frame::write_png;
use crate::measurement::Mask;
use image::RgbImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::runtime::Handle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

/// Axis-aligned box in source image pixel coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Centroid {
    pub x: f32,
    pub y: f32,
}

/// One segmented instance
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_name: String,
    /// Score in [0, 1]
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub centroid: Centroid,
    pub mask: Option<Mask>,
    pub mask_coefficients: Vec<f32>,
}

impl Detection {
    pub fn label(&self) -> String {
        format!("{}: {:.2}", self.class_name, self.confidence)
    }
}

/// A loaded inference engine.
///
/// Calls block; an empty result means nothing was detected and is not an error.
pub trait Segmenter: Send {
    /// Model tag of the loaded engine
    fn model(&self) -> &str;

    fn segment(&mut self, image: &RgbImage) -> Result<Vec<Detection>, SegmentationError>;
}

/// Loads engines on demand, one per analysis kind
pub trait SegmenterFactory: Send + Sync {
    fn create(&self, kind: AnalysisKind) -> Result<Box<dyn Segmenter>, SegmentationError>;
}

/// Detection as printed by the inference program
#[derive(Debug, Deserialize)]
struct RawDetection {
    #[serde(rename = "class")]
    class_name: String,
    confidence: f32,
    bbox: BoundingBox,
    #[serde(default)]
    centroid: Option<Centroid>,
    #[serde(default)]
    mask: Option<Vec<Vec<f32>>>,
    #[serde(default)]
    mask_path: Option<PathBuf>,
    #[serde(default)]
    mask_coefficients: Vec<f32>,
}

/// Runs an external inference program once per image.
///
/// The program is invoked as `<command> <args...> <image.png>` with
/// `COPLE_MODEL`, `COPLE_CONFIDENCE` and `COPLE_IOU` in its environment and
/// must print a JSON array of detections on stdout. Masks may be given inline
/// as nested rows or as a path to a grayscale PNG.
pub struct CommandSegmenter {
    command: String,
    args: Vec<String>,
    model: String,
    confidence_threshold: f32,
    iou_threshold: f32,
    timeout: Duration,
    work_dir: PathBuf,
}

impl CommandSegmenter {
    pub fn new(config: &SegmentationConfig, model: &str) -> Result<Self, SegmentationError> {
        let command = config
            .command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| SegmentationError::ModelLoad {
                model: model.to_string(),
                details: "no inference command configured".to_string(),
            })?;

        info!("Loaded {} model via '{}'", model, command);

        Ok(Self {
            command,
            args: config.args.clone(),
            model: model.to_string(),
            confidence_threshold: config.confidence_threshold,
            iou_threshold: config.iou_threshold,
            timeout: Duration::from_secs(config.timeout_seconds),
            work_dir: std::env::temp_dir(),
        })
    }

    /// Directory for the per-call input image
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    async fn run_program(&self, image_path: &Path) -> Result<String, SegmentationError> {
        let child = Command::new(&self.command)
            .args(&self.args)
            .arg(image_path)
            .env("COPLE_MODEL", &self.model)
            .env("COPLE_CONFIDENCE", self.confidence_threshold.to_string())
            .env("COPLE_IOU", self.iou_threshold.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SegmentationError::Inference {
                details: format!("Failed to start '{}': {}", self.command, e),
            })?;

        // Dropping the timed-out future kills the child
        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SegmentationError::Inference {
                details: format!("Inference timed out after {:?}", self.timeout),
            })?
            .map_err(|e| SegmentationError::Inference {
                details: format!("Failed to wait for inference process: {}", e),
            })?;

        let errors = String::from_utf8_lossy(&output.stderr);
        if !errors.trim().is_empty() {
            debug!("Inference stderr: {}", errors.trim());
        }

        if !output.status.success() {
            return Err(SegmentationError::Inference {
                details: format!(
                    "Inference process exited with {}: {}",
                    output.status,
                    errors.lines().last().unwrap_or("")
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Drive [`Self::run_program`] from synchronous code: on the ambient
    /// runtime when called from one of its blocking threads, otherwise on a
    /// private single-threaded runtime
    fn run_program_blocking(&self, image_path: &Path) -> Result<String, SegmentationError> {
        match Handle::try_current() {
            Ok(handle) => handle.block_on(self.run_program(image_path)),
            Err(_) => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| SegmentationError::Inference {
                        details: format!("Failed to start inference runtime: {}", e),
                    })?;
                runtime.block_on(self.run_program(image_path))
            }
        }
    }
}

impl Segmenter for CommandSegmenter {
    fn model(&self) -> &str {
        &self.model
    }

    fn segment(&mut self, image: &RgbImage) -> Result<Vec<Detection>, SegmentationError> {
        let image_path = self.work_dir.join(format!(
            "cople_segment_{}.png",
            uuid::Uuid::new_v4().simple()
        ));

        write_png(image, &image_path).map_err(|e| SegmentationError::Inference {
            details: format!("Failed to write inference input: {}", e),
        })?;

        let started = Instant::now();
        let result = self.run_program_blocking(&image_path);
        if let Err(e) = std::fs::remove_file(&image_path) {
            warn!(
                "Failed to remove inference input {}: {}",
                image_path.display(),
                e
            );
        }

        let detections = parse_detections(&result?)?;
        trace!(
            "{} model returned {} detections in {:?}",
            self.model,
            detections.len(),
            started.elapsed()
        );
        Ok(detections)
    }
}

/// Parse the JSON printed by an inference program
pub fn parse_detections(output: &str) -> Result<Vec<Detection>, SegmentationError> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }

    let raw: Vec<RawDetection> =
        serde_json::from_str(output.trim()).map_err(|e| SegmentationError::Output {
            details: format!("Invalid detection JSON: {}", e),
        })?;

    raw.into_iter().map(Detection::try_from).collect()
}

impl TryFrom<RawDetection> for Detection {
    type Error = SegmentationError;

    fn try_from(raw: RawDetection) -> Result<Self, Self::Error> {
        let mask = match (raw.mask, raw.mask_path) {
            (Some(rows), _) => Some(Mask::from_rows(&rows).ok_or_else(|| {
                SegmentationError::Output {
                    details: format!("Ragged mask rows for '{}'", raw.class_name),
                }
            })?),
            (None, Some(path)) => {
                let gray = image::open(&path)
                    .map_err(|e| SegmentationError::Output {
                        details: format!("Failed to read mask {}: {}", path.display(), e),
                    })?
                    .to_luma8();
                Some(Mask::from_gray(&gray))
            }
            (None, None) => None,
        };

        let centroid = raw.centroid.unwrap_or(Centroid {
            x: (raw.bbox.x1 + raw.bbox.x2) / 2.0,
            y: (raw.bbox.y1 + raw.bbox.y2) / 2.0,
        });

        Ok(Detection {
            class_name: raw.class_name,
            confidence: raw.confidence.clamp(0.0, 1.0),
            bbox: raw.bbox,
            centroid,
            mask,
            mask_coefficients: raw.mask_coefficients,
        })
    }
}

/// Creates [`CommandSegmenter`]s for the configured model tags
pub struct CommandSegmenterFactory {
    config: SegmentationConfig,
}

impl CommandSegmenterFactory {
    pub fn new(config: SegmentationConfig) -> Self {
        Self { config }
    }
}

impl SegmenterFactory for CommandSegmenterFactory {
    fn create(&self, kind: AnalysisKind) -> Result<Box<dyn Segmenter>, SegmentationError> {
        let model = kind.model_tag(&self.config);
        Ok(Box::new(CommandSegmenter::new(&self.config, model)?))
    }
}

/// Scripted segmenter used when no inference program is configured.
///
/// Returns the detections registered for each kind (none by default) and
/// counts engine loads, so callers can be exercised without a model.
pub struct MockSegmenterFactory {
    config: SegmentationConfig,
    detections: Mutex<HashMap<AnalysisKind, Vec<Detection>>>,
    failing: Mutex<HashSet<AnalysisKind>>,
    loads: AtomicUsize,
    calls: Arc<AtomicUsize>,
}

impl MockSegmenterFactory {
    pub fn new(config: SegmentationConfig) -> Self {
        Self {
            config,
            detections: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            loads: AtomicUsize::new(0),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Detections returned for every image of `kind`
    pub fn set_detections(&self, kind: AnalysisKind, detections: Vec<Detection>) {
        self.detections.lock().insert(kind, detections);
    }

    /// Make inference for `kind` fail
    pub fn set_failing(&self, kind: AnalysisKind, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(kind);
        } else {
            set.remove(&kind);
        }
    }

    /// Engines created so far
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Inference calls so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SegmenterFactory for MockSegmenterFactory {
    fn create(&self, kind: AnalysisKind) -> Result<Box<dyn Segmenter>, SegmentationError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let model = kind.model_tag(&self.config).to_string();
        debug!("Loaded mock {} model", model);
        Ok(Box::new(MockSegmenter {
            model,
            detections: self.detections.lock().get(&kind).cloned().unwrap_or_default(),
            failing: self.failing.lock().contains(&kind),
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct MockSegmenter {
    model: String,
    detections: Vec<Detection>,
    failing: bool,
    calls: Arc<AtomicUsize>,
}

impl Segmenter for MockSegmenter {
    fn model(&self) -> &str {
        &self.model
    }

    fn segment(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, SegmentationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(SegmentationError::Inference {
                details: format!("mock {} model failure", self.model),
            });
        }
        Ok(self.detections.clone())
    }
}
