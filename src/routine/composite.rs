use crate::config::MAX_ROUTINE_ANGLES;
use crate::overlay::{draw_bitmap_text, draw_plain_text, LabelFont};
use image::{imageops, Rgb, RgbImage};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Grid columns; two rows hold the maximum number of angles
pub const GRID_COLUMNS: u32 = 3;
pub const GRID_ROWS: u32 = 2;

const BACKGROUND: Rgb<u8> = Rgb([240, 240, 240]);
const LABEL_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// One grid slot: the angle number and the rendered analysis to show, if any
#[derive(Debug, Clone)]
pub struct CompositeCell {
    pub angle: u32,
    pub image: Option<PathBuf>,
}

/// Tile per-angle renders into a 3x2 grid of `cell_size` squares.
///
/// Angle `n` lands in slot `n - 1`, row-major. Slots without a readable image
/// stay background-coloured but still carry their label, drawn with the
/// built-in bitmap glyphs when no font is available.
pub fn compose_grid(
    cells: &[CompositeCell],
    cell_size: u32,
    font: Option<&LabelFont>,
) -> RgbImage {
    let mut canvas = RgbImage::from_pixel(
        GRID_COLUMNS * cell_size,
        GRID_ROWS * cell_size,
        BACKGROUND,
    );

    for cell in cells {
        if cell.angle == 0 || cell.angle > MAX_ROUTINE_ANGLES {
            warn!("Angle {} does not fit the composite grid", cell.angle);
            continue;
        }
        let slot = cell.angle - 1;
        let x = (slot % GRID_COLUMNS) * cell_size;
        let y = (slot / GRID_COLUMNS) * cell_size;

        if let Some(path) = &cell.image {
            match image::open(path) {
                Ok(decoded) => {
                    let tile = imageops::resize(
                        &decoded.to_rgb8(),
                        cell_size,
                        cell_size,
                        imageops::FilterType::Triangle,
                    );
                    imageops::replace(&mut canvas, &tile, x as i64, y as i64);
                }
                Err(e) => warn!(
                    "Composite cell {} left blank, cannot read {}: {}",
                    cell.angle,
                    path.display(),
                    e
                ),
            }
        }

        let label = format!("Angle {}", cell.angle);
        match font {
            Some(font) => draw_plain_text(
                &mut canvas,
                font,
                &label,
                x as i32 + 10,
                y as i32 + 30,
                LABEL_COLOR,
            ),
            None => {
                let margin = (cell_size / 32).max(1);
                let scale = (cell_size / 160).max(1);
                draw_bitmap_text(&mut canvas, &label, x + margin, y + margin, scale, LABEL_COLOR);
            }
        }
    }

    debug!(
        "Composed {} cells into {}x{} grid",
        cells.len(),
        canvas.width(),
        canvas.height()
    );
    canvas
}
