//! Detection overlay.
//!
//! Draws box outlines plus a filled label band carrying [`label_text`] directly
//! into the packed BGR frame. Text uses the 8x8 bitmap glyphs from `font8x8`.

use font8x8::{UnicodeFonts, BASIC_FONTS};

use crate::detect::{BoundingBox, DetectionRecord, CLASS_FIRE, CLASS_HUMAN, CLASS_SMOKE};
use crate::frame::Frame;

/// BGR colour used for a class.
pub fn class_color(class_name: &str) -> [u8; 3] {
    match class_name {
        CLASS_FIRE => [0, 0, 255],
        CLASS_SMOKE => [100, 100, 100],
        CLASS_HUMAN => [0, 255, 0],
        _ => [255, 0, 0],
    }
}

/// Human-readable label, e.g. `human: Standing (80%)` or `fire (91%)`.
pub fn label_text(record: &DetectionRecord) -> String {
    match (&record.pose, record.pose_score) {
        (Some(pose), Some(score)) => format!(
            "{}: {} ({:.0}%)",
            record.class_name,
            pose,
            score * 100.0
        ),
        _ => format!("{} ({:.0}%)", record.class_name, record.confidence * 100.0),
    }
}

const GLYPH_SIZE: u32 = 8;
const LABEL_PAD: u32 = 1;
const LABEL_HEIGHT: u32 = GLYPH_SIZE + 2 * LABEL_PAD;
const TEXT_COLOR: [u8; 3] = [255, 255, 255];

#[derive(Clone, Copy, Debug)]
pub struct OverlayRenderer {
    pub thickness: u32,
    /// Draw the text label band above each box.
    pub labels: bool,
}

impl Default for OverlayRenderer {
    fn default() -> Self {
        Self {
            thickness: 2,
            labels: true,
        }
    }
}

impl OverlayRenderer {
    /// Draw every record onto `frame`. Returns the number of boxes drawn.
    ///
    /// Degenerate boxes are skipped; an empty slice leaves the frame untouched.
    pub fn render(&self, frame: &mut Frame, records: &[DetectionRecord]) -> usize {
        let mut drawn = 0;
        for record in records {
            let bbox = record.bbox.clamp_to(frame.width, frame.height);
            if bbox.is_degenerate() {
                continue;
            }
            let color = class_color(&record.class_name);
            self.draw_outline(frame, bbox, color);
            if self.labels {
                draw_label(frame, bbox, &label_text(record), color);
            }
            drawn += 1;
        }
        drawn
    }

    fn draw_outline(&self, frame: &mut Frame, bbox: BoundingBox, color: [u8; 3]) {
        let (x1, y1) = (bbox.x1 as u32, bbox.y1 as u32);
        let (x2, y2) = (bbox.x2 as u32, bbox.y2 as u32);
        let t = self.thickness.max(1);
        fill_rect(frame, x1, y1, x2, y1.saturating_add(t), color);
        fill_rect(frame, x1, y2.saturating_sub(t), x2, y2, color);
        fill_rect(frame, x1, y1, x1.saturating_add(t), y2, color);
        fill_rect(frame, x2.saturating_sub(t), y1, x2, y2, color);
    }
}

// Band sits just above the box, or just inside it when the box touches the top edge.
fn draw_label(frame: &mut Frame, bbox: BoundingBox, text: &str, color: [u8; 3]) {
    let x1 = bbox.x1 as u32;
    let y1 = bbox.y1 as u32;
    let band = LABEL_HEIGHT;
    let top = if y1 >= band { y1 - band } else { y1 };
    let text_width = (text.chars().count() as u32).saturating_mul(GLYPH_SIZE);
    let right = x1
        .saturating_add(text_width + 2 * LABEL_PAD)
        .min(frame.width);
    fill_rect(frame, x1, top, right, top.saturating_add(band), color);

    let mut origin = x1 + LABEL_PAD;
    for ch in text.chars() {
        if origin >= right {
            break;
        }
        let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) else {
            origin += GLYPH_SIZE;
            continue;
        };
        for (row, bits) in glyph.iter().enumerate() {
            for col in 0..GLYPH_SIZE {
                // Bit 0 is the leftmost column.
                if bits & (1 << col) == 0 {
                    continue;
                }
                let x = origin + col;
                if x < right {
                    frame.put_pixel(x, top + LABEL_PAD + row as u32, TEXT_COLOR);
                }
            }
        }
        origin += GLYPH_SIZE;
    }
}

// Half-open rectangle [x1, x2) x [y1, y2), clipped to the frame.
fn fill_rect(frame: &mut Frame, x1: u32, y1: u32, x2: u32, y2: u32, color: [u8; 3]) {
    let x2 = x2.min(frame.width);
    let y2 = y2.min(frame.height);
    for y in y1..y2 {
        for x in x1..x2 {
            frame.put_pixel(x, y, color);
        }
    }
}
