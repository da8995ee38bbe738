use crate::config::OutputConfig;
use crate::measurement::contour::external_contours;
use crate::overlay::{blend_pixel, draw_label, LabelFont};
use crate::segmentation::Detection;
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::path::Path;

const LABEL_TEXT: Rgb<u8> = Rgb([255, 255, 255]);

/// How detections are drawn
pub struct OverlayStyle {
    /// Opacity of the mask fill
    pub alpha: f32,
    /// Label font; labels are skipped without one
    pub font: Option<LabelFont>,
}

impl OverlayStyle {
    pub fn from_config(config: &OutputConfig) -> Self {
        Self {
            alpha: config.overlay_alpha,
            font: LabelFont::load_or_warn(Path::new(&config.font_path), config.font_size),
        }
    }

    pub fn without_labels(alpha: f32) -> Self {
        Self { alpha, font: None }
    }
}

/// Draw every detection on a copy of `source`.
///
/// Masks get a translucent fill and an outline, boxes a 2px frame and a
/// `class: confidence` label. The source is left untouched.
pub fn render_detections(
    source: &RgbImage,
    detections: &[Detection],
    color: Rgb<u8>,
    style: &OverlayStyle,
) -> RgbImage {
    let mut canvas = source.clone();
    let (width, height) = canvas.dimensions();
    if width == 0 || height == 0 {
        return canvas;
    }

    for detection in detections {
        if let Some(mask) = detection.mask.as_ref().filter(|m| !m.is_empty()) {
            let binary = mask.binarize_to(width, height);

            for (x, y, pixel) in binary.enumerate_pixels() {
                if pixel[0] > 0 {
                    blend_pixel(&mut canvas, x, y, color, style.alpha);
                }
            }

            for contour in external_contours(&binary) {
                for point in contour {
                    for (dx, dy) in [(0, 0), (1, 0), (0, 1)] {
                        let x = point.x + dx;
                        let y = point.y + dy;
                        if x >= 0 && y >= 0 && (x as u32) < width && (y as u32) < height {
                            canvas.put_pixel(x as u32, y as u32, color);
                        }
                    }
                }
            }
        }

        let x1 = (detection.bbox.x1.round() as i32).clamp(0, width as i32 - 1);
        let y1 = (detection.bbox.y1.round() as i32).clamp(0, height as i32 - 1);
        let x2 = (detection.bbox.x2.round() as i32).clamp(0, width as i32 - 1);
        let y2 = (detection.bbox.y2.round() as i32).clamp(0, height as i32 - 1);

        for inset in 0..2 {
            let box_w = x2 - x1 + 1 - 2 * inset;
            let box_h = y2 - y1 + 1 - 2 * inset;
            if box_w > 0 && box_h > 0 {
                draw_hollow_rect_mut(
                    &mut canvas,
                    Rect::at(x1 + inset, y1 + inset).of_size(box_w as u32, box_h as u32),
                    color,
                );
            }
        }

        if let Some(font) = &style.font {
            let label = detection.label();
            let (_, text_height) = font.text_size(&label);
            let label_y = if y1 - text_height - 4 >= 0 {
                y1 - text_height - 4
            } else {
                y1 + 4
            };
            draw_label(&mut canvas, font, &label, x1 + 2, label_y, LABEL_TEXT, color);
        }
    }

    canvas
}
