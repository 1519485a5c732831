// SPDX-License-Identifier: GPL-3.0-only

//! Timestamp overlay stamped into hi-res frames
//!
//! Text is drawn white on a black box in the top-left corner, directly into
//! the I420 planes so it ends up in both photos and encoded clips.

use crate::backends::camera::{Frame, PreprocessHook, ResolutionTier, chroma_dimensions};
use crate::clock::Clock;
use std::sync::Arc;

/// Format of the stamped text
pub const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const PADDING: u32 = 2;

/// Rows of a 5x7 glyph, bit 4 is the leftmost column
fn glyph(c: char) -> [u8; 7] {
    match c {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        _ => [0; 7],
    }
}

/// Pixel scale so the text stays legible at any resolution
fn scale_for(width: u32) -> u32 {
    (width / 480).max(1)
}

/// Draw `text` into the top-left corner of an I420 frame
pub fn stamp_text(frame: &mut Frame, text: &str) {
    let scale = scale_for(frame.width);
    let advance = (GLYPH_WIDTH + 1) * scale;
    let box_w = (PADDING * 2 * scale + advance * text.chars().count() as u32).min(frame.width);
    let box_h = ((GLYPH_HEIGHT + PADDING * 2) * scale).min(frame.height);
    let width = frame.width;

    if frame.data.len() < Frame::i420_len(frame.width, frame.height) {
        return;
    }

    let y_plane = frame.y_plane_mut();
    for row in 0..box_h {
        let start = (row * width) as usize;
        y_plane[start..start + box_w as usize].fill(0);
    }

    for (i, c) in text.chars().enumerate() {
        let x0 = PADDING * scale + i as u32 * advance;
        let y0 = PADDING * scale;
        for (gy, bits) in glyph(c).iter().enumerate() {
            for gx in 0..GLYPH_WIDTH {
                if bits & (0x10 >> gx) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let x = x0 + gx * scale + dx;
                        let y = y0 + gy as u32 * scale + dy;
                        if x < box_w && y < box_h {
                            y_plane[(y * width + x) as usize] = 255;
                        }
                    }
                }
            }
        }
    }

    // neutral chroma under the box
    let (cw, ch) = chroma_dimensions(frame.width, frame.height);
    let y_len = (frame.width * frame.height) as usize;
    let c_len = (cw * ch) as usize;
    for plane in 0..2 {
        let base = y_len + plane * c_len;
        for row in 0..box_h.div_ceil(2).min(ch) {
            let start = base + (row * cw) as usize;
            let len = box_w.div_ceil(2).min(cw) as usize;
            frame.data[start..start + len].fill(128);
        }
    }
}

/// Hook that stamps the current wall-clock time on hi-res frames
pub fn timestamp_hook(clock: Arc<dyn Clock>) -> PreprocessHook {
    Arc::new(move |frame: &mut Frame| {
        if frame.tier == ResolutionTier::High {
            let text = clock.wall().format(TIMESTAMP_FORMAT).to_string();
            stamp_text(frame, &text);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    fn grey_frame(width: u32, height: u32, tier: ResolutionTier) -> Frame {
        Frame {
            data: vec![128; Frame::i420_len(width, height)],
            width,
            height,
            tier,
            pts: Duration::ZERO,
        }
    }

    #[test]
    fn stamps_box_and_glyphs() {
        let mut frame = grey_frame(160, 60, ResolutionTier::High);
        stamp_text(&mut frame, "12:34");

        let y = frame.y_plane();
        assert_eq!(y[0], 0, "box background");
        assert!(y.iter().any(|&v| v == 255), "glyph pixels");
        // outside the box is untouched
        assert_eq!(y[(50 * 160 + 150) as usize], 128);
    }

    #[test]
    fn hook_skips_low_res_frames() {
        let hook = timestamp_hook(Arc::new(ManualClock::new()));

        let mut low = grey_frame(64, 32, ResolutionTier::Low);
        hook(&mut low);
        assert!(low.y_plane().iter().all(|&v| v == 128));

        let mut high = grey_frame(64, 32, ResolutionTier::High);
        hook(&mut high);
        assert!(high.y_plane().iter().any(|&v| v == 0));
    }

    #[test]
    fn tiny_frames_do_not_panic() {
        let mut frame = grey_frame(6, 4, ResolutionTier::High);
        stamp_text(&mut frame, "01/01/2026 00:00:00");
    }
}
