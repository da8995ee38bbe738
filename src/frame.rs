use crate::error::{InspectionError, Result};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Image resolution of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
}

impl Resolution {
    pub fn of(image: &RgbImage) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            channels: 3,
        }
    }
}

/// A captured frame with its capture metadata
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic frame identifier within the camera session
    pub id: u64,
    /// When the frame was grabbed
    pub captured_at: DateTime<Utc>,
    /// Decoded RGB pixels (shared to avoid copies between preview readers)
    pub image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(id: u64, image: RgbImage) -> Self {
        Self {
            id,
            captured_at: Utc::now(),
            image: Arc::new(image),
        }
    }

    /// Restamp with the original grab time, e.g. when reloading a persisted image
    pub fn with_captured_at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::of(&self.image)
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    /// Encode the frame as JPEG
    pub fn to_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        encode_jpeg(&self.image, quality)
    }
}

/// Encode an RGB image as JPEG with the given quality
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    JpegEncoder::new_with_quality(&mut output, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| {
            InspectionError::component("frame", &format!("Failed to encode JPEG: {}", e))
        })?;
    Ok(output)
}

/// Write an image as lossless PNG
pub fn write_png(image: &RgbImage, path: &Path) -> Result<()> {
    image.save_with_format(path, ImageFormat::Png)?;
    Ok(())
}

/// Read an image back and convert it to 8-bit RGB
pub fn read_rgb(path: &Path) -> Result<RgbImage> {
    let decoded = image::open(path)?;
    match decoded {
        image::DynamicImage::ImageRgb8(rgb) => Ok(rgb),
        other => Err(InspectionError::component(
            "frame",
            &format!(
                "Unexpected pixel layout {:?} in {}, expected 8-bit RGB",
                other.color(),
                path.display()
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_frame_metadata() {
        let frame = Frame::new(7, RgbImage::from_pixel(32, 16, Rgb([10, 20, 30])));
        assert_eq!(frame.id, 7);
        assert_eq!(
            frame.resolution(),
            Resolution {
                width: 32,
                height: 16,
                channels: 3
            }
        );
        assert!(!frame.is_empty());
    }

    #[test]
    fn test_jpeg_encoding_produces_markers() {
        let frame = Frame::new(1, RgbImage::from_pixel(16, 16, Rgb([200, 100, 50])));
        let jpeg = frame.to_jpeg(85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn test_png_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("angle_1.png");
        let mut image = RgbImage::new(8, 8);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            *pixel = Rgb([(x * 31) as u8, (y * 17) as u8, (x * y) as u8]);
        }

        write_png(&image, &path).unwrap();
        let restored = read_rgb(&path).unwrap();
        assert_eq!(restored, image);
    }
}
