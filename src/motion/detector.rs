// SPDX-License-Identifier: GPL-3.0-only

//! Motion scoring
//!
//! Each low-res frame is turned to grayscale and blurred, then compared with
//! a rolling background. Pixels that differ by at least the delta threshold
//! are "changed"; the score is the bounding box around all of them.

use crate::constants::motion;
use image::{GrayImage, RgbImage, imageops};

/// Bounding box of changed pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Frame differencer with a rolling background
#[derive(Debug, Clone)]
pub struct MotionScorer {
    baseline: Vec<f32>,
    dimensions: (u32, u32),
    threshold: u8,
    weight: f32,
    sigma: f32,
}

impl Default for MotionScorer {
    fn default() -> Self {
        Self::new(motion::DELTA_THRESHOLD, motion::BASELINE_WEIGHT, motion::BLUR_SIGMA)
    }
}

impl MotionScorer {
    /// # Arguments
    /// * `threshold` - Luma difference that marks a pixel as changed
    /// * `weight` - How much of each new frame is folded into the background
    /// * `sigma` - Blur applied before differencing
    pub fn new(threshold: u8, weight: f32, sigma: f32) -> Self {
        Self {
            baseline: Vec::new(),
            dimensions: (0, 0),
            threshold,
            weight: weight.clamp(0.0, 1.0),
            sigma,
        }
    }

    /// Forget the background, the next frame becomes it
    pub fn reset(&mut self) {
        self.baseline.clear();
        self.dimensions = (0, 0);
    }

    fn prepare(&self, image: &RgbImage) -> GrayImage {
        let gray = imageops::grayscale(image);
        if self.sigma > 0.0 {
            imageops::blur(&gray, self.sigma)
        } else {
            gray
        }
    }

    /// Compare `image` with the background and fold it in
    ///
    /// Returns `None` for the first frame, after a size change, and when
    /// nothing changed.
    pub fn score(&mut self, image: &RgbImage) -> Option<MotionBox> {
        let frame = self.prepare(image);
        if self.dimensions != frame.dimensions() || self.baseline.is_empty() {
            self.dimensions = frame.dimensions();
            self.baseline = frame.as_raw().iter().map(|&p| p as f32).collect();
            return None;
        }

        let width = frame.width();
        let threshold = self.threshold as f32;
        let mut bounds: Option<(u32, u32, u32, u32)> = None;

        for (i, (&pixel, background)) in frame.as_raw().iter().zip(self.baseline.iter_mut()).enumerate() {
            let pixel = pixel as f32;
            if (pixel - *background).abs() >= threshold {
                let (x, y) = (i as u32 % width, i as u32 / width);
                bounds = Some(match bounds {
                    None => (x, y, x, y),
                    Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
                });
            }
            *background += self.weight * (pixel - *background);
        }

        bounds.map(|(x0, y0, x1, y1)| MotionBox {
            x: x0,
            y: y0,
            width: x1 - x0 + 1,
            height: y1 - y0 + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn scene(block: Option<(u32, u32, u32)>) -> RgbImage {
        RgbImage::from_fn(320, 180, |x, y| match block {
            Some((bx, by, size)) if x >= bx && x < bx + size && y >= by && y < by + size => {
                Rgb([240, 240, 240])
            }
            _ => Rgb([30, 30, 30]),
        })
    }

    fn sharp_scorer() -> MotionScorer {
        MotionScorer::new(motion::DELTA_THRESHOLD, motion::BASELINE_WEIGHT, 0.0)
    }

    #[test]
    fn first_frame_sets_background() {
        let mut scorer = sharp_scorer();
        assert_eq!(scorer.score(&scene(None)), None);
        assert_eq!(scorer.score(&scene(None)), None);
    }

    #[test]
    fn box_covers_changed_pixels() {
        let mut scorer = sharp_scorer();
        scorer.score(&scene(None));
        let found = scorer.score(&scene(Some((40, 20, 120)))).unwrap();
        assert_eq!(
            found,
            MotionBox {
                x: 40,
                y: 20,
                width: 120,
                height: 120
            }
        );
    }

    #[test]
    fn background_absorbs_still_objects() {
        let mut scorer = MotionScorer::new(motion::DELTA_THRESHOLD, 0.5, 0.0);
        scorer.score(&scene(None));
        let parked = scene(Some((10, 10, 50)));
        assert!(scorer.score(&parked).is_some());
        for _ in 0..10 {
            scorer.score(&parked);
        }
        assert_eq!(scorer.score(&parked), None);
    }

    #[test]
    fn blur_keeps_box_near_object() {
        let mut scorer = MotionScorer::default();
        scorer.score(&scene(None));
        let found = scorer.score(&scene(Some((100, 40, 80)))).unwrap();
        assert!(found.width >= 78 && found.width <= 90, "width {}", found.width);
    }

    #[test]
    fn size_change_resets() {
        let mut scorer = sharp_scorer();
        scorer.score(&scene(None));
        assert_eq!(scorer.score(&RgbImage::new(64, 48)), None);
    }
}
