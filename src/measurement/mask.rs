use image::{imageops, GrayImage, ImageBuffer, Luma};

/// Per-pixel membership map of one detected instance.
///
/// Values may be strict binary (0/1 or 0/255) or raw scores such as mask
/// probabilities; [`Mask::binarize`] normalizes either form.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl Mask {
    /// Create a mask from row-major values; `None` if the length does not match
    pub fn new(width: u32, height: u32, values: Vec<f32>) -> Option<Self> {
        if values.len() != width as usize * height as usize {
            return None;
        }
        Some(Self {
            width,
            height,
            values,
        })
    }

    /// Build a mask by evaluating `f(x, y)` for every pixel
    pub fn from_fn<F>(width: u32, height: u32, mut f: F) -> Self
    where
        F: FnMut(u32, u32) -> f32,
    {
        let mut values = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                values.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            values,
        }
    }

    pub fn from_gray(image: &GrayImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            values: image.pixels().map(|p| p[0] as f32).collect(),
        }
    }

    /// Build a mask from nested rows as produced by inference engines
    pub fn from_rows(rows: &[Vec<f32>]) -> Option<Self> {
        let height = rows.len();
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        if rows.iter().any(|r| r.len() != width) {
            return None;
        }
        Self::new(
            width as u32,
            height as u32,
            rows.iter().flatten().copied().collect(),
        )
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Normalize to a strict 0/255 image.
    ///
    /// Masks already in {0,1} or {0,255} keep every non-zero pixel. Anything
    /// else is thresholded at the midpoint of its value range. Non-finite
    /// values count as background.
    pub fn binarize(&self) -> GrayImage {
        let finite = |v: f32| if v.is_finite() { v } else { 0.0 };

        let already_binary = self.values.iter().all(|&v| v == 0.0 || v == 1.0)
            || self.values.iter().all(|&v| v == 0.0 || v == 255.0);

        let threshold = if already_binary {
            0.0
        } else {
            let (min, max) = self
                .values
                .iter()
                .map(|&v| finite(v))
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                    (lo.min(v), hi.max(v))
                });
            (min + max) / 2.0
        };

        ImageBuffer::from_fn(self.width, self.height, |x, y| {
            let v = finite(self.values[(y * self.width + x) as usize]);
            Luma([if v > threshold { 255u8 } else { 0u8 }])
        })
    }

    /// Binarize and resample to `width`x`height` with nearest-neighbour filtering
    pub fn binarize_to(&self, width: u32, height: u32) -> GrayImage {
        let binary = self.binarize();
        if binary.dimensions() == (width, height) {
            binary
        } else {
            imageops::resize(&binary, width, height, imageops::FilterType::Nearest)
        }
    }

    /// Number of foreground pixels after binarization
    pub fn active_pixels(&self) -> usize {
        self.binarize().pixels().filter(|p| p[0] > 0).count()
    }
}
