use image::{imageops, GrayImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::point::Point;

/// Raw (non-central) moments of a closed polygon, computed with Green's theorem
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PolygonMoments {
    pub m00: f64,
    pub m10: f64,
    pub m01: f64,
    pub m20: f64,
    pub m11: f64,
    pub m02: f64,
}

/// Second-order central moments
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CentralMoments {
    pub mu20: f64,
    pub mu11: f64,
    pub mu02: f64,
}

/// Axis-aligned extent of a point set, inclusive of both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Outermost contours of the foreground of a 0/255 image.
///
/// Contours nested inside holes are skipped, matching an external-only
/// retrieval mode. The image is traced inside a one pixel background frame
/// so regions touching the border still come back as outer contours;
/// returned points are in the coordinates of `binary`.
pub fn external_contours(binary: &GrayImage) -> Vec<Vec<Point<i32>>> {
    let mut padded = GrayImage::new(binary.width() + 2, binary.height() + 2);
    imageops::replace(&mut padded, binary, 1, 1);

    find_contours::<i32>(&padded)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .map(|c| {
            c.points
                .into_iter()
                .map(|p| Point::new(p.x - 1, p.y - 1))
                .collect::<Vec<_>>()
        })
        .filter(|points| !points.is_empty())
        .collect()
}

/// The contour enclosing the largest area; smaller components are dropped
pub fn largest_contour(contours: Vec<Vec<Point<i32>>>) -> Option<Vec<Point<i32>>> {
    let mut best: Option<(f64, Vec<Point<i32>>)> = None;
    for contour in contours {
        let area = polygon_area(&contour);
        match &best {
            Some((best_area, _)) if *best_area >= area => {}
            _ => best = Some((area, contour)),
        }
    }
    best.map(|(_, contour)| contour)
}

pub fn extent(points: &[Point<i32>]) -> Option<Extent> {
    let first = points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in points.iter().skip(1) {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    Some(Extent {
        x: min_x,
        y: min_y,
        width: (max_x - min_x + 1) as u32,
        height: (max_y - min_y + 1) as u32,
    })
}

/// Enclosed area of the closed polygon through `points` (shoelace formula)
pub fn polygon_area(points: &[Point<i32>]) -> f64 {
    polygon_moments(points).m00
}

/// Length of the closed polyline through `points`
pub fn arc_length(points: &[Point<i32>]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let mut length = 0.0;
    let mut prev = points[points.len() - 1];
    for &p in points {
        let dx = (p.x - prev.x) as f64;
        let dy = (p.y - prev.y) as f64;
        length += (dx * dx + dy * dy).sqrt();
        prev = p;
    }
    length
}

/// Spatial moments of the polygon interior.
///
/// The sign is normalized so the result does not depend on the winding
/// direction of the contour.
pub fn polygon_moments(points: &[Point<i32>]) -> PolygonMoments {
    if points.len() < 3 {
        return PolygonMoments::default();
    }

    let (mut a00, mut a10, mut a01, mut a20, mut a11, mut a02) = (0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
    let last = points[points.len() - 1];
    let (mut xp, mut yp) = (last.x as f64, last.y as f64);

    for p in points {
        let (x, y) = (p.x as f64, p.y as f64);
        let cross = xp * y - x * yp;
        let sx = xp + x;
        let sy = yp + y;

        a00 += cross;
        a10 += cross * sx;
        a01 += cross * sy;
        a20 += cross * (xp * sx + x * x);
        a11 += cross * (xp * (sy + yp) + x * (sy + y));
        a02 += cross * (yp * sy + y * y);

        xp = x;
        yp = y;
    }

    let sign = if a00 < 0.0 { -1.0 } else { 1.0 };
    PolygonMoments {
        m00: sign * a00 / 2.0,
        m10: sign * a10 / 6.0,
        m01: sign * a01 / 6.0,
        m20: sign * a20 / 12.0,
        m11: sign * a11 / 24.0,
        m02: sign * a02 / 12.0,
    }
}

impl PolygonMoments {
    /// Central moments about the centroid; `None` for a degenerate region
    pub fn central(&self) -> Option<CentralMoments> {
        if self.m00 == 0.0 {
            return None;
        }
        let cx = self.m10 / self.m00;
        let cy = self.m01 / self.m00;
        Some(CentralMoments {
            mu20: self.m20 - self.m10 * cx,
            mu11: self.m11 - self.m10 * cy,
            mu02: self.m02 - self.m01 * cy,
        })
    }
}
