use crate::analysis::AnalysisRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of one angle in the sweep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AngleReport {
    pub angle: u32,
    pub analysis_id: String,
    pub defect_count: usize,
    pub processing_ms: f64,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_defects: usize,
    pub defects_per_angle: Vec<usize>,
    pub average_defects: f64,
    pub total_processing_ms: f64,
}

/// Aggregate over every analysis a routine produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedReport {
    pub routine_id: String,
    pub angle_count: usize,
    pub angles: Vec<AngleReport>,
    pub summary: ReportSummary,
    pub generated_at: DateTime<Utc>,
}

impl ConsolidatedReport {
    /// Build from `(angle number, record)` pairs in sweep order
    pub fn build(routine_id: &str, analyses: &[(u32, &AnalysisRecord)]) -> Self {
        let angles: Vec<AngleReport> = analyses
            .iter()
            .map(|(angle, record)| AngleReport {
                angle: *angle,
                analysis_id: record.id.clone(),
                defect_count: record.instance_count(),
                processing_ms: record.timings.total_ms,
                timestamp: record.processed_at.or(record.captured_at),
            })
            .collect();

        let defects_per_angle: Vec<usize> = angles.iter().map(|a| a.defect_count).collect();
        let total_defects: usize = defects_per_angle.iter().sum();
        let total_processing_ms = angles.iter().map(|a| a.processing_ms).sum();
        let average_defects = total_defects as f64 / angles.len().max(1) as f64;

        Self {
            routine_id: routine_id.to_string(),
            angle_count: angles.len(),
            angles,
            summary: ReportSummary {
                total_defects,
                defects_per_angle,
                average_defects,
                total_processing_ms,
            },
            generated_at: Utc::now(),
        }
    }
}
