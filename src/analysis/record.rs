use crate::config::SegmentationConfig;
use crate::frame::Resolution;
use crate::measurement::MeasurementSet;
use crate::segmentation::{BoundingBox, Centroid, Detection};
use chrono::{DateTime, Utc};
use image::Rgb;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Which segmentation model an analysis runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Pieces,
    Defects,
}

impl AnalysisKind {
    pub fn model_tag<'a>(&self, config: &'a SegmentationConfig) -> &'a str {
        match self {
            AnalysisKind::Pieces => &config.pieces_model,
            AnalysisKind::Defects => &config.defects_model,
        }
    }

    /// Overlay colour: pieces green, defects red
    pub fn color(&self) -> Rgb<u8> {
        match self {
            AnalysisKind::Pieces => Rgb([0, 255, 0]),
            AnalysisKind::Defects => Rgb([255, 0, 0]),
        }
    }
}

impl std::fmt::Display for AnalysisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisKind::Pieces => write!(f, "pieces"),
            AnalysisKind::Defects => write!(f, "defects"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisState {
    Processing,
    Completed,
    Error,
}

/// Wall-clock duration of each analysis phase, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub capture_ms: f64,
    pub segmentation_ms: f64,
    pub measurement_ms: f64,
    pub render_ms: f64,
    pub total_ms: f64,
}

/// One detected instance with its measurements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceMeasurement {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub centroid: Centroid,
    pub mask_coefficients: Vec<f32>,
    pub measurements: MeasurementSet,
}

impl InstanceMeasurement {
    pub fn new(detection: &Detection, measurements: MeasurementSet) -> Self {
        Self {
            class_name: detection.class_name.clone(),
            confidence: detection.confidence,
            bbox: detection.bbox,
            centroid: detection.centroid,
            mask_coefficients: detection.mask_coefficients.clone(),
            measurements,
        }
    }
}

/// Outcome of one capture, segment, measure cycle.
///
/// Created in `Processing`; moves forward once to `Completed` or `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: String,
    pub kind: AnalysisKind,
    pub model: String,
    pub state: AnalysisState,
    pub captured_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
    pub conversion_factor: Option<f64>,
    pub timings: PhaseTimings,
    pub instances: Vec<InstanceMeasurement>,
    pub rendered_image: Option<PathBuf>,
    pub routine_id: Option<String>,
    pub angle: Option<u32>,
    pub error: Option<String>,
}

impl AnalysisRecord {
    pub fn new(kind: AnalysisKind, model: &str) -> Self {
        Self {
            id: generate_analysis_id(),
            kind,
            model: model.to_string(),
            state: AnalysisState::Processing,
            captured_at: None,
            processed_at: None,
            resolution: None,
            conversion_factor: None,
            timings: PhaseTimings::default(),
            instances: Vec::new(),
            rendered_image: None,
            routine_id: None,
            angle: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state != AnalysisState::Processing
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn complete(&mut self) {
        if self.is_terminal() {
            warn!("Analysis {} is already {:?}", self.id, self.state);
            return;
        }
        self.state = AnalysisState::Completed;
        self.processed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        if self.is_terminal() {
            warn!("Analysis {} is already {:?}", self.id, self.state);
            return;
        }
        self.state = AnalysisState::Error;
        self.error = Some(message.into());
        self.processed_at = Some(Utc::now());
    }
}

/// `analysis_<8 hex>_<unix seconds>`
pub fn generate_analysis_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("analysis_{}_{}", &uuid[..8], Utc::now().timestamp())
}
