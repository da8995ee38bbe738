use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Maximum number of angles a routine can sweep (one 2x3 composite grid)
pub const MAX_ROUTINE_ANGLES: u32 = 6;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InspectionConfig {
    pub camera: CameraConfig,
    #[serde(default)]
    pub measurement: MeasurementConfig,
    pub segmentation: SegmentationConfig,
    pub routine: RoutineConfig,
    pub output: OutputConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// GigE camera address (IP or aravis camera name)
    #[serde(default = "default_camera_address")]
    pub address: String,

    /// Fallback webcam indices in order of preference (e.g. 0 for /dev/video0)
    #[serde(default = "default_webcam_indices")]
    pub webcam_indices: Vec<u32>,

    /// Capture resolution (width, height)
    #[serde(default = "default_camera_resolution")]
    pub resolution: (u32, u32),

    /// Preview frames per second
    #[serde(default = "default_preview_fps")]
    pub preview_fps: u32,

    /// Inactivity window before the preview hibernates
    #[serde(default = "default_hibernation_seconds")]
    pub hibernation_seconds: u64,

    /// Upper bound for a single frame grab
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,

    /// Upper bound for joining the preview loop on stop
    #[serde(default = "default_preview_join_timeout_ms")]
    pub preview_join_timeout_ms: u64,

    /// JPEG quality for preview frames
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct MeasurementConfig {
    /// Millimeters represented by one pixel; measurements stay in pixels when unset
    #[serde(default)]
    pub conversion_factor_mm_per_px: Option<f64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SegmentationConfig {
    /// External inference program; receives the image path and prints JSON detections
    #[serde(default)]
    pub command: Option<String>,

    /// Extra arguments passed before the image path
    #[serde(default)]
    pub args: Vec<String>,

    /// Model tag for the pieces model
    #[serde(default = "default_pieces_model")]
    pub pieces_model: String,

    /// Model tag for the defects model
    #[serde(default = "default_defects_model")]
    pub defects_model: String,

    /// Confidence threshold forwarded to the inference engine
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,

    /// IoU threshold forwarded to the inference engine
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    /// Upper bound for a single inference call
    #[serde(default = "default_inference_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RoutineConfig {
    /// Number of angles captured per routine
    #[serde(default = "default_routine_angles")]
    pub angles: u32,

    /// Pause between consecutive captures
    #[serde(default = "default_capture_delay_ms")]
    pub capture_delay_ms: u64,

    /// Cooldown between consecutive inference calls
    #[serde(default = "default_analysis_delay_ms")]
    pub analysis_delay_ms: u64,

    /// Resolution every persisted angle must have before analysis
    #[serde(default = "default_expected_resolution")]
    pub expected_resolution: Option<(u32, u32)>,

    /// Scratch directory for lossless angle images
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,

    /// Side of one composite grid cell in pixels
    #[serde(default = "default_composite_cell_size")]
    pub composite_cell_size: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OutputConfig {
    /// Base path for rendered analyses and routine artefacts
    #[serde(default = "default_output_path")]
    pub path: String,

    /// Render overlays for each analysis
    #[serde(default = "default_render_overlays")]
    pub render_overlays: bool,

    /// TrueType font used for overlay labels
    #[serde(default = "default_font_path")]
    pub font_path: String,

    /// Label font size
    #[serde(default = "default_font_size")]
    pub font_size: f32,

    /// Opacity of the mask fill
    #[serde(default = "default_overlay_alpha")]
    pub overlay_alpha: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Directory for JSON records
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl CameraConfig {
    pub fn hibernation_window(&self) -> Duration {
        Duration::from_secs(self.hibernation_seconds)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn preview_join_timeout(&self) -> Duration {
        Duration::from_millis(self.preview_join_timeout_ms)
    }
}

impl RoutineConfig {
    pub fn capture_delay(&self) -> Duration {
        Duration::from_millis(self.capture_delay_ms)
    }

    pub fn analysis_delay(&self) -> Duration {
        Duration::from_millis(self.analysis_delay_ms)
    }

    pub fn scratch_path(&self) -> PathBuf {
        PathBuf::from(&self.scratch_dir)
    }
}

impl InspectionConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("cople.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("camera.address", default_camera_address())?
            .set_default("camera.webcam_indices", default_webcam_indices())?
            .set_default(
                "camera.resolution",
                vec![default_camera_resolution().0, default_camera_resolution().1],
            )?
            .set_default("camera.preview_fps", default_preview_fps())?
            .set_default("camera.hibernation_seconds", default_hibernation_seconds())?
            .set_default("camera.capture_timeout_ms", default_capture_timeout_ms())?
            .set_default(
                "camera.preview_join_timeout_ms",
                default_preview_join_timeout_ms(),
            )?
            .set_default("camera.jpeg_quality", default_jpeg_quality() as u32)?
            .set_default("segmentation.pieces_model", default_pieces_model())?
            .set_default("segmentation.defects_model", default_defects_model())?
            .set_default(
                "segmentation.confidence_threshold",
                default_confidence_threshold() as f64,
            )?
            .set_default("segmentation.iou_threshold", default_iou_threshold() as f64)?
            .set_default(
                "segmentation.timeout_seconds",
                default_inference_timeout_seconds(),
            )?
            .set_default("routine.angles", default_routine_angles())?
            .set_default("routine.capture_delay_ms", default_capture_delay_ms())?
            .set_default("routine.analysis_delay_ms", default_analysis_delay_ms())?
            .set_default("routine.scratch_dir", default_scratch_dir())?
            .set_default(
                "routine.composite_cell_size",
                default_composite_cell_size(),
            )?
            .set_default("output.path", default_output_path())?
            .set_default("output.render_overlays", default_render_overlays())?
            .set_default("output.font_path", default_font_path())?
            .set_default("output.font_size", default_font_size() as f64)?
            .set_default("output.overlay_alpha", default_overlay_alpha() as f64)?
            .set_default("storage.path", default_storage_path())?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // COPLE_CAMERA__PREVIEW_FPS=10 overrides camera.preview_fps
            .add_source(
                Environment::with_prefix("COPLE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: InspectionConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.camera.address.trim().is_empty() {
            return Err(ConfigError::Message(
                "Camera address must not be empty".to_string(),
            ));
        }

        if self.camera.resolution.0 == 0 || self.camera.resolution.1 == 0 {
            return Err(ConfigError::Message(
                "Camera resolution must be greater than 0".to_string(),
            ));
        }

        if self.camera.preview_fps == 0 {
            return Err(ConfigError::Message(
                "Camera preview_fps must be greater than 0".to_string(),
            ));
        }

        if self.camera.hibernation_seconds == 0 {
            return Err(ConfigError::Message(
                "Camera hibernation_seconds must be greater than 0".to_string(),
            ));
        }

        if self.camera.capture_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "Camera capture_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.camera.jpeg_quality == 0 || self.camera.jpeg_quality > 100 {
            return Err(ConfigError::Message(
                "Camera jpeg_quality must be within 1..=100".to_string(),
            ));
        }

        if let Some(factor) = self.measurement.conversion_factor_mm_per_px {
            if !factor.is_finite() || factor <= 0.0 {
                return Err(ConfigError::Message(
                    "Measurement conversion_factor_mm_per_px must be a positive number"
                        .to_string(),
                ));
            }
        }

        for (name, value) in [
            ("confidence_threshold", self.segmentation.confidence_threshold),
            ("iou_threshold", self.segmentation.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Message(format!(
                    "Segmentation {} must be within [0, 1]",
                    name
                )));
            }
        }

        if self.routine.angles == 0 || self.routine.angles > MAX_ROUTINE_ANGLES {
            return Err(ConfigError::Message(format!(
                "Routine angles must be within 1..={}",
                MAX_ROUTINE_ANGLES
            )));
        }

        if self.routine.composite_cell_size == 0 {
            return Err(ConfigError::Message(
                "Routine composite_cell_size must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.output.overlay_alpha) {
            return Err(ConfigError::Message(
                "Output overlay_alpha must be within [0, 1]".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            camera: CameraConfig {
                address: default_camera_address(),
                webcam_indices: default_webcam_indices(),
                resolution: default_camera_resolution(),
                preview_fps: default_preview_fps(),
                hibernation_seconds: default_hibernation_seconds(),
                capture_timeout_ms: default_capture_timeout_ms(),
                preview_join_timeout_ms: default_preview_join_timeout_ms(),
                jpeg_quality: default_jpeg_quality(),
            },
            measurement: MeasurementConfig::default(),
            segmentation: SegmentationConfig {
                command: None,
                args: Vec::new(),
                pieces_model: default_pieces_model(),
                defects_model: default_defects_model(),
                confidence_threshold: default_confidence_threshold(),
                iou_threshold: default_iou_threshold(),
                timeout_seconds: default_inference_timeout_seconds(),
            },
            routine: RoutineConfig {
                angles: default_routine_angles(),
                capture_delay_ms: default_capture_delay_ms(),
                analysis_delay_ms: default_analysis_delay_ms(),
                expected_resolution: default_expected_resolution(),
                scratch_dir: default_scratch_dir(),
                composite_cell_size: default_composite_cell_size(),
            },
            output: OutputConfig {
                path: default_output_path(),
                render_overlays: default_render_overlays(),
                font_path: default_font_path(),
                font_size: default_font_size(),
                overlay_alpha: default_overlay_alpha(),
            },
            storage: StorageConfig {
                path: default_storage_path(),
            },
        }
    }
}

// Default value functions
fn default_camera_address() -> String {
    "172.16.1.24".to_string()
}
fn default_webcam_indices() -> Vec<u32> {
    vec![0, 1, 2]
}
fn default_camera_resolution() -> (u32, u32) {
    (640, 640)
}
fn default_preview_fps() -> u32 {
    5
}
fn default_hibernation_seconds() -> u64 {
    60
}
fn default_capture_timeout_ms() -> u64 {
    2000
}
fn default_preview_join_timeout_ms() -> u64 {
    2000
}
fn default_jpeg_quality() -> u8 {
    85
}

fn default_pieces_model() -> String {
    "piezas".to_string()
}
fn default_defects_model() -> String {
    "defectos".to_string()
}
fn default_confidence_threshold() -> f32 {
    0.55
}
fn default_iou_threshold() -> f32 {
    0.35
}
fn default_inference_timeout_seconds() -> u64 {
    60
}

fn default_routine_angles() -> u32 {
    MAX_ROUTINE_ANGLES
}
fn default_capture_delay_ms() -> u64 {
    2000
}
fn default_analysis_delay_ms() -> u64 {
    10_000
}
fn default_expected_resolution() -> Option<(u32, u32)> {
    Some((640, 640))
}
fn default_scratch_dir() -> String {
    "./scratch/routines".to_string()
}
fn default_composite_cell_size() -> u32 {
    320
}

fn default_output_path() -> String {
    "./output".to_string()
}
fn default_render_overlays() -> bool {
    true
}
fn default_font_path() -> String {
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf".to_string()
}
fn default_font_size() -> f32 {
    20.0
}
fn default_overlay_alpha() -> f32 {
    0.4
}

fn default_storage_path() -> String {
    "./records".to_string()
}
