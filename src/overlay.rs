use crate::error::{InspectionError, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_text_mut, text_size};
use rusttype::{Font, Scale};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// A TrueType font with the size labels are drawn at
pub struct LabelFont {
    font: Font<'static>,
    scale: Scale,
}

impl LabelFont {
    pub fn load(path: &Path, size: f32) -> Result<Self> {
        let font_data = fs::read(path).map_err(|e| {
            InspectionError::component(
                "overlay",
                &format!("Failed to read font file '{}': {}", path.display(), e),
            )
        })?;

        let font = Font::try_from_vec(font_data).ok_or_else(|| {
            InspectionError::component(
                "overlay",
                &format!("Failed to parse font file '{}'", path.display()),
            )
        })?;

        debug!("Loaded label font {} at size {}", path.display(), size);
        Ok(Self {
            font,
            scale: Scale::uniform(size),
        })
    }

    /// Load the font, or log and fall back to drawing labels without text
    pub fn load_or_warn(path: &Path, size: f32) -> Option<Self> {
        match Self::load(path, size) {
            Ok(font) => Some(font),
            Err(e) => {
                warn!("Overlay labels disabled: {}", e);
                None
            }
        }
    }

    pub fn text_size(&self, text: &str) -> (i32, i32) {
        text_size(self.scale, &self.font, text)
    }
}

/// Draw `text` with its top-left corner at (x, y) on a solid backdrop
pub fn draw_label(
    image: &mut RgbImage,
    font: &LabelFont,
    text: &str,
    x: i32,
    y: i32,
    color: Rgb<u8>,
    backdrop: Rgb<u8>,
) {
    let (text_width, text_height) = font.text_size(text);

    for dy in -2..(text_height + 2) {
        for dx in -2..(text_width + 2) {
            let px = x + dx;
            let py = y + dy;
            if px >= 0 && py >= 0 && (px as u32) < image.width() && (py as u32) < image.height() {
                image.put_pixel(px as u32, py as u32, backdrop);
            }
        }
    }

    draw_text_mut(image, color, x, y, font.scale, &font.font, text);
}

/// Draw `text` directly, without a backdrop
pub fn draw_plain_text(
    image: &mut RgbImage,
    font: &LabelFont,
    text: &str,
    x: i32,
    y: i32,
    color: Rgb<u8>,
) {
    draw_text_mut(image, color, x, y, font.scale, &font.font, text);
}

/// 5x7 glyphs for labels drawn without a TrueType font, one bit per column
/// with the most significant of the low five bits on the left
const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;

fn glyph(c: char) -> Option<[u8; 7]> {
    let rows = match c {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'e' => [0b00000, 0b00000, 0b01110, 0b10001, 0b11111, 0b10000, 0b01110],
        'g' => [0b00000, 0b01111, 0b10001, 0b10001, 0b01111, 0b00001, 0b01110],
        'l' => [0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'n' => [0b00000, 0b00000, 0b10110, 0b11001, 0b10001, 0b10001, 0b10001],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}

/// Draw `text` with the built-in bitmap glyphs, each pixel blown up to a
/// `scale`x`scale` square. Characters without a glyph are skipped; pixels
/// outside the image are clipped.
pub fn draw_bitmap_text(
    image: &mut RgbImage,
    text: &str,
    x: u32,
    y: u32,
    scale: u32,
    color: Rgb<u8>,
) {
    let scale = scale.max(1);
    let advance = (GLYPH_WIDTH + 1) * scale;
    let mut pen_x = x;

    for c in text.chars() {
        let Some(rows) = glyph(c) else {
            continue;
        };
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_WIDTH {
                if bits & (1 << (GLYPH_WIDTH - 1 - col)) == 0 {
                    continue;
                }
                let px = pen_x + col * scale;
                let py = y + row as u32 * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        if px + dx < image.width() && py + dy < image.height() {
                            image.put_pixel(px + dx, py + dy, color);
                        }
                    }
                }
            }
        }
        pen_x += advance;
    }
}

/// Height in pixels of bitmap text at `scale`
pub fn bitmap_text_height(scale: u32) -> u32 {
    GLYPH_HEIGHT * scale.max(1)
}

/// Alpha-blend `color` into one pixel
pub fn blend_pixel(image: &mut RgbImage, x: u32, y: u32, color: Rgb<u8>, alpha: f32) {
    let alpha = alpha.clamp(0.0, 1.0);
    let pixel = image.get_pixel_mut(x, y);
    for channel in 0..3 {
        let base = pixel[channel] as f32;
        let blended = base * (1.0 - alpha) + color[channel] as f32 * alpha;
        pixel[channel] = blended.round().clamp(0.0, 255.0) as u8;
    }
}
