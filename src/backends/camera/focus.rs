// SPDX-License-Identifier: GPL-3.0-only

//! Focus lock detection
//!
//! After a focus trigger the lens sweeps for a few frames. A cycle counts as
//! locked once two consecutive readings agree: the lens position when the
//! driver reports one, otherwise the contrast of the luma plane.

use super::types::Frame;
use crate::constants::focus;

/// Variance of the 4-neighbour Laplacian over the luma plane
///
/// Sharper images score higher. Returns `None` when the buffer is shorter
/// than its dimensions or too small to filter.
pub fn focus_measure(frame: &Frame) -> Option<f64> {
    let (width, height) = (frame.width as usize, frame.height as usize);
    if width < 3 || height < 3 || frame.data.len() < width * height {
        return None;
    }
    let luma = &frame.data[..width * height];

    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let at = |x: usize, y: usize| luma[y * width + x] as f64;
            let laplacian =
                at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            sum += laplacian;
            sum_sq += laplacian * laplacian;
        }
    }
    let count = ((width - 2) * (height - 2)) as f64;
    let mean = sum / count;
    Some(sum_sq / count - mean * mean)
}

/// Whether two consecutive readings agree within `tolerance` of the latest
pub fn readings_agree(previous: f64, current: f64, tolerance: f64) -> bool {
    (current - previous).abs() <= tolerance * current.abs().max(previous.abs()).max(f64::EPSILON)
}

/// Watches readings from one focus cycle
#[derive(Debug, Default)]
pub struct FocusTracker {
    previous: Option<f64>,
}

impl FocusTracker {
    /// Feed the lens position reported with a frame
    pub fn lens_position(&mut self, position: f64) -> bool {
        self.push(position)
    }

    /// Feed a frame's contrast when no lens position is available
    ///
    /// Flat frames cannot show focus and restart the comparison.
    pub fn contrast(&mut self, frame: &Frame) -> bool {
        match focus_measure(frame) {
            Some(contrast) if contrast >= focus::MIN_CONTRAST => self.push(contrast),
            _ => {
                self.previous = None;
                false
            }
        }
    }

    fn push(&mut self, reading: f64) -> bool {
        let settled = self
            .previous
            .is_some_and(|previous| readings_agree(previous, reading, focus::SETTLE_TOLERANCE));
        self.previous = Some(reading);
        settled
    }
}
