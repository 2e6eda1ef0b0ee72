//! Draw detections onto images.
//!
use std::path::Path;

use anyhow::{Context, Result};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
    rect::Rect,
};
use rusttype::{Font, Scale};
use simple_error::simple_error;

use crate::detection::DetectionResult;

const CAPTION_SCALE: f32 = 16.0;
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const PALETTE: [[u8; 3]; 10] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
    [0, 194, 255],
    [132, 56, 255],
];

/// Draws bounding boxes and captions.
///
/// Without a font only the boxes are drawn.
#[derive(Default)]
pub struct Annotator {
    font: Option<Font<'static>>,
}

impl Annotator {
    pub fn new(font: Option<Font<'static>>) -> Self {
        Self { font }
    }

    /// Load a TrueType font for the captions.
    pub fn with_font_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let font_data = std::fs::read(path)
            .with_context(|| format!("failed to read font {}", path.display()))?;
        let font = Font::try_from_vec(font_data)
            .with_context(|| format!("failed to parse font {}", path.display()))?;

        Ok(Self::new(Some(font)))
    }

    /// Annotator using the DejaVu Sans Mono font compiled into the binary.
    pub fn with_embedded_font() -> Result<Self> {
        let font_data: &'static [u8] = include_bytes!("../resources/DejaVuSansMono.ttf");
        let font = Font::try_from_bytes(font_data)
            .ok_or_else(|| simple_error!("failed to parse embedded font"))?;

        Ok(Self::new(Some(font)))
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }

    /// Draw all detections of `result` onto `frame`.
    pub fn draw(&self, frame: &mut RgbImage, result: &DetectionResult) {
        let (width, height) = frame.dimensions();
        let (width_f, height_f) = (width as f32, height as f32);

        for detection in result.detections.iter() {
            let color = class_color(detection.class_id);
            let bbox = detection.bbox;

            // Coordinate frame basis is on the top left corner
            let (x_tl, y_tl) = (bbox[0] * width_f, bbox[1] * height_f);
            let (x_br, y_br) = (bbox[2] * width_f, bbox[3] * height_f);
            let rect_width = (x_br - x_tl).max(1.0);
            let rect_height = (y_br - y_tl).max(1.0);

            let rect =
                Rect::at(x_tl as i32, y_tl as i32).of_size(rect_width as u32, rect_height as u32);
            draw_hollow_rect_mut(frame, rect, color);

            if let Some(font) = self.font.as_ref() {
                let scale = Scale::uniform(CAPTION_SCALE);
                let caption = result.caption(detection);
                let (text_width, text_height) = text_size(scale, font, &caption);

                // Put the caption above the box, or inside if there is no room
                let y_text = match y_tl as i32 - text_height {
                    y if y >= 0 => y,
                    _ => y_tl as i32,
                };
                let background = Rect::at(x_tl as i32, y_text)
                    .of_size(text_width.max(1) as u32, text_height.max(1) as u32);
                draw_filled_rect_mut(frame, background, color);
                draw_text_mut(frame, TEXT_COLOR, x_tl as i32, y_text, scale, font, &caption);
            }
        }
    }
}

fn class_color(class_id: usize) -> Rgb<u8> {
    Rgb(PALETTE[class_id % PALETTE.len()])
}
