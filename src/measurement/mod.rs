//! Geometric measurement of segmentation masks.
//!
//! Everything here is a pure function of its inputs: the conversion factor is
//! passed on every call and nothing is cached between calls.

pub mod contour;
pub mod engine;
pub mod mask;

pub use engine::{
    compute, fold_angle, mask_area, mask_height, mask_perimeter, mask_width, shape_stats,
    MeasurementSet, ShapeStats,
};
pub use mask::Mask;
