use super::contour::{self, Extent};
use super::mask::Mask;
use imageproc::point::Point;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// Geometric measurements of one detected instance.
///
/// The `*_mm` mirrors are present only when a conversion factor was supplied.
/// Eccentricity and orientation are dimensionless and have no mm variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSet {
    pub bbox_width_px: f64,
    pub bbox_height_px: f64,
    pub mask_width_px: f64,
    pub mask_height_px: f64,
    pub mask_area_px: f64,
    pub mask_perimeter_px: f64,
    /// 0 for a circle, approaching 1 for elongated shapes
    pub eccentricity: f64,
    /// Principal axis angle in degrees, within (-90, 90]
    pub orientation_deg: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox_width_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox_height_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_width_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_height_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_area_mm: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask_perimeter_mm: Option<f64>,
}

impl MeasurementSet {
    /// True when every pixel measurement is zero (no usable region)
    pub fn is_empty(&self) -> bool {
        self.mask_area_px == 0.0 && self.bbox_width_px == 0.0 && self.bbox_height_px == 0.0
    }

    pub fn has_mm(&self) -> bool {
        self.bbox_width_mm.is_some()
    }

    fn with_conversion(mut self, factor: f64) -> Self {
        self.bbox_width_mm = Some(self.bbox_width_px * factor);
        self.bbox_height_mm = Some(self.bbox_height_px * factor);
        self.mask_width_mm = Some(self.mask_width_px * factor);
        self.mask_height_mm = Some(self.mask_height_px * factor);
        self.mask_perimeter_mm = Some(self.mask_perimeter_px * factor);
        self.mask_area_mm = Some(self.mask_area_px * factor * factor);
        self
    }
}

/// Shape statistics derived from second-order central moments
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ShapeStats {
    pub eccentricity: f64,
    pub orientation_deg: f64,
}

/// Measure the largest region of `mask`.
///
/// A missing or empty mask, or one without foreground, yields the all-zero
/// set. Results are a pure function of the arguments.
pub fn compute(mask: Option<&Mask>, conversion_factor: Option<f64>) -> MeasurementSet {
    let factor = conversion_factor.and_then(|f| {
        if f.is_finite() && f > 0.0 {
            Some(f)
        } else {
            warn!(
                "Ignoring invalid conversion factor {}, measurements stay in pixels",
                f
            );
            None
        }
    });

    let pixels = match mask.and_then(principal_contour) {
        Some(points) => measure_contour(&points),
        None => {
            trace!("No measurable region in mask");
            MeasurementSet::default()
        }
    };

    match factor {
        Some(f) => pixels.with_conversion(f),
        None => pixels,
    }
}

/// Width of the bounding box of the largest region, in pixels
pub fn mask_width(mask: &Mask) -> f64 {
    principal_extent(mask).map(|e| e.width as f64).unwrap_or(0.0)
}

/// Height of the bounding box of the largest region, in pixels
pub fn mask_height(mask: &Mask) -> f64 {
    principal_extent(mask).map(|e| e.height as f64).unwrap_or(0.0)
}

pub fn mask_area(mask: &Mask) -> f64 {
    principal_contour(mask)
        .map(|points| contour::polygon_area(&points))
        .unwrap_or(0.0)
}

pub fn mask_perimeter(mask: &Mask) -> f64 {
    principal_contour(mask)
        .map(|points| contour::arc_length(&points))
        .unwrap_or(0.0)
}

/// Eccentricity and orientation from the central moments of a closed polygon
pub fn shape_stats(points: &[Point<i32>]) -> ShapeStats {
    let moments = contour::polygon_moments(points);
    let central = match moments.central() {
        Some(central) => central,
        None => return ShapeStats::default(),
    };

    let mu20 = central.mu20 / moments.m00;
    let mu02 = central.mu02 / moments.m00;
    let mu11 = central.mu11 / moments.m00;

    let sum = mu20 + mu02;
    let diff = (4.0 * mu11 * mu11 + (mu20 - mu02) * (mu20 - mu02)).sqrt();
    let lambda1 = (sum + diff) / 2.0;
    let lambda2 = (sum - diff) / 2.0;

    let eccentricity = if lambda1 > 0.0 && lambda2 < lambda1 {
        (1.0 - lambda2 / lambda1).clamp(0.0, 1.0).sqrt()
    } else {
        0.0
    };

    // Perfectly symmetric second moments have no principal axis; report 0
    let orientation_deg = if mu20 != mu02 {
        fold_angle((0.5 * (2.0 * mu11).atan2(mu20 - mu02)).to_degrees())
    } else {
        0.0
    };

    ShapeStats {
        eccentricity: if eccentricity.is_finite() { eccentricity } else { 0.0 },
        orientation_deg: if orientation_deg.is_finite() {
            orientation_deg
        } else {
            0.0
        },
    }
}

/// Fold an angle in degrees into (-90, 90]
pub fn fold_angle(mut degrees: f64) -> f64 {
    if !degrees.is_finite() {
        return 0.0;
    }
    while degrees > 90.0 {
        degrees -= 180.0;
    }
    while degrees <= -90.0 {
        degrees += 180.0;
    }
    degrees
}

fn principal_contour(mask: &Mask) -> Option<Vec<Point<i32>>> {
    if mask.is_empty() {
        return None;
    }
    let binary = mask.binarize();
    contour::largest_contour(contour::external_contours(&binary))
}

fn principal_extent(mask: &Mask) -> Option<Extent> {
    principal_contour(mask).and_then(|points| contour::extent(&points))
}

fn measure_contour(points: &[Point<i32>]) -> MeasurementSet {
    let extent = match contour::extent(points) {
        Some(extent) => extent,
        None => return MeasurementSet::default(),
    };
    let stats = shape_stats(points);

    let width = extent.width as f64;
    let height = extent.height as f64;

    MeasurementSet {
        bbox_width_px: width,
        bbox_height_px: height,
        mask_width_px: width,
        mask_height_px: height,
        mask_area_px: contour::polygon_area(points),
        mask_perimeter_px: contour::arc_length(points),
        eccentricity: stats.eccentricity,
        orientation_deg: stats.orientation_deg,
        ..MeasurementSet::default()
    }
}
