//! annotate — draw detection boxes and score labels onto a frame in place
//!
//! For each detection, in the order the engine returned them: a 2-px
//! rectangle outline, a filled label background sitting on top of the box,
//! and the confidence score formatted to two decimals in white. Later boxes
//! may overlap earlier ones; that is accepted behaviour.
//!
//! Boxes partly or fully outside the frame never fail — the imageproc
//! primitives clip against the canvas.

use ab_glyph::{FontRef, PxScale};
use image::{ImageBuffer, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::sync::OnceLock;

use crate::engine::Detection;
use crate::video::BgrFrame;

// The frame buffer is BGR but the palette below is symmetric under channel
// reversal (green, grey, white), so drawing through `Rgb` pixels is exact.
const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LABEL_BG: Rgb<u8> = Rgb([32, 32, 32]);
const LABEL_FG: Rgb<u8> = Rgb([255, 255, 255]);

/// Label text height in pixels.
const LABEL_SCALE: f32 = 14.0;

static LABEL_FONT: OnceLock<FontRef<'static>> = OnceLock::new();

fn label_font() -> &'static FontRef<'static> {
    LABEL_FONT.get_or_init(|| {
        FontRef::try_from_slice(include_bytes!("../../assets/DejaVuSansMono.ttf"))
            .expect("bundled font parses")
    })
}

/// Draw `detections` onto `frame`. Mutates the pixel buffer in place and
/// never changes the frame's dimensions or byte layout.
pub fn annotate(frame: &mut BgrFrame, detections: &[Detection]) {
    if detections.is_empty() || !frame.layout_is_valid() {
        return;
    }

    let (width, height) = (frame.width, frame.height);
    let mut img: RgbImage =
        ImageBuffer::from_raw(width, height, std::mem::take(&mut frame.data))
            .expect("layout checked above");

    let font = label_font();
    let scale = PxScale::from(LABEL_SCALE);

    for det in detections {
        let x = det.bbox.x.round() as i32;
        let y = det.bbox.y.round() as i32;
        let w = (det.bbox.width.round() as i64).max(1) as u32;
        let h = (det.bbox.height.round() as i64).max(1) as u32;

        // 2-px outline: outer rectangle plus a 1-px inset.
        draw_hollow_rect_mut(&mut img, Rect::at(x, y).of_size(w, h), BOX_COLOR);
        if w > 2 && h > 2 {
            draw_hollow_rect_mut(
                &mut img,
                Rect::at(x + 1, y + 1).of_size(w - 2, h - 2),
                BOX_COLOR,
            );
        }

        let label = format!("{:.2}", det.score);
        let (text_w, text_h) = text_size(scale, font, &label);
        let (text_w, text_h) = (text_w as i64, text_h as i64);
        if text_w <= 0 || text_h <= 0 {
            continue;
        }

        // Filled background directly above the box's top edge, then the
        // score in white on top of it.
        let label_y = y - text_h as i32;
        draw_filled_rect_mut(
            &mut img,
            Rect::at(x, label_y).of_size(text_w as u32, text_h as u32),
            LABEL_BG,
        );
        draw_text_mut(&mut img, LABEL_FG, x, label_y, scale, font, &label);
    }

    frame.data = img.into_raw();
}
