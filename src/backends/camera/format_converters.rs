// SPDX-License-Identifier: GPL-3.0-only
//! Pixel format conversion between device frames and display images
//!
//! Devices hand out planar I420; motion scoring, previews and photos work
//! on packed RGB. Conversions use BT.601 full-range coefficients.

use super::types::{Frame, ResolutionTier, chroma_dimensions};
use image::RgbImage;
use std::time::Duration;

/// Convert an I420 frame to RGB
///
/// I420 layout: full-size Y plane, then quarter-size U and V planes.
/// Frames whose buffer is shorter than the declared size yield `None`.
pub fn i420_to_rgb(frame: &Frame) -> Option<RgbImage> {
    let (width, height) = (frame.width, frame.height);
    if frame.data.len() < Frame::i420_len(width, height) || width == 0 || height == 0 {
        return None;
    }

    let (cw, ch) = chroma_dimensions(width, height);
    let y_len = (width * height) as usize;
    let c_len = (cw * ch) as usize;
    let (y_plane, chroma) = frame.data.split_at(y_len);
    let (u_plane, v_plane) = chroma.split_at(c_len);

    let mut rgb = Vec::with_capacity(y_len * 3);
    for row in 0..height {
        let c_row = (row / 2) * cw;
        for col in 0..width {
            let y = y_plane[(row * width + col) as usize] as f32;
            let c_idx = (c_row + col / 2) as usize;
            let u = u_plane[c_idx] as f32 - 128.0;
            let v = v_plane[c_idx] as f32 - 128.0;

            rgb.push((y + 1.402 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8);
            rgb.push((y + 1.772 * u).clamp(0.0, 255.0) as u8);
        }
    }

    RgbImage::from_raw(width, height, rgb)
}

/// Convert an RGB image to an I420 frame
///
/// Chroma is averaged over each 2x2 block.
pub fn rgb_to_i420(image: &RgbImage, tier: ResolutionTier, pts: Duration) -> Frame {
    let (width, height) = image.dimensions();
    let (cw, ch) = chroma_dimensions(width, height);
    let y_len = (width * height) as usize;
    let c_len = (cw * ch) as usize;

    let mut data = vec![0u8; y_len + 2 * c_len];
    let (y_plane, chroma) = data.split_at_mut(y_len);
    let (u_plane, v_plane) = chroma.split_at_mut(c_len);

    for (x, y, px) in image.enumerate_pixels() {
        let [r, g, b] = px.0.map(|c| c as f32);
        let luma = 0.299 * r + 0.587 * g + 0.114 * b;
        y_plane[(y * width + x) as usize] = luma.round().clamp(0.0, 255.0) as u8;
    }

    for cy in 0..ch {
        for cx in 0..cw {
            let (mut u_sum, mut v_sum, mut n) = (0.0f32, 0.0f32, 0.0f32);
            for dy in 0..2 {
                for dx in 0..2 {
                    let (x, y) = (cx * 2 + dx, cy * 2 + dy);
                    if x >= width || y >= height {
                        continue;
                    }
                    let [r, g, b] = image.get_pixel(x, y).0.map(|c| c as f32);
                    u_sum += -0.169 * r - 0.331 * g + 0.5 * b;
                    v_sum += 0.5 * r - 0.419 * g - 0.081 * b;
                    n += 1.0;
                }
            }
            let idx = (cy * cw + cx) as usize;
            u_plane[idx] = (u_sum / n + 128.0).round().clamp(0.0, 255.0) as u8;
            v_plane[idx] = (v_sum / n + 128.0).round().clamp(0.0, 255.0) as u8;
        }
    }

    Frame {
        data,
        width,
        height,
        tier,
        pts,
    }
}

/// Rotate an I420 frame by 180 degrees in place
pub fn rotate_i420_180(frame: &mut Frame) {
    let (cw, ch) = chroma_dimensions(frame.width, frame.height);
    let y_len = (frame.width * frame.height) as usize;
    let c_len = (cw * ch) as usize;
    if frame.data.len() < y_len + 2 * c_len {
        return;
    }
    frame.data[..y_len].reverse();
    frame.data[y_len..y_len + c_len].reverse();
    frame.data[y_len + c_len..y_len + 2 * c_len].reverse();
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(color))
    }

    fn close(a: [u8; 3], b: [u8; 3]) -> bool {
        a.iter().zip(b.iter()).all(|(x, y)| (*x as i16 - *y as i16).abs() <= 3)
    }

    #[test]
    fn grey_survives_conversion() {
        let image = solid(8, 6, [128, 128, 128]);
        let frame = rgb_to_i420(&image, ResolutionTier::Low, Duration::ZERO);
        assert_eq!(frame.data.len(), Frame::i420_len(8, 6));

        let back = i420_to_rgb(&frame).unwrap();
        assert!(close(back.get_pixel(3, 3).0, [128, 128, 128]));
    }

    #[test]
    fn primaries_stay_close() {
        for color in [[200, 30, 30], [30, 200, 30], [30, 30, 200]] {
            let frame = rgb_to_i420(&solid(4, 4, color), ResolutionTier::High, Duration::ZERO);
            let back = i420_to_rgb(&frame).unwrap();
            assert!(close(back.get_pixel(1, 1).0, color), "{:?}", back.get_pixel(1, 1));
        }
    }

    #[test]
    fn short_buffer_is_rejected() {
        let mut frame = rgb_to_i420(&solid(4, 4, [0, 0, 0]), ResolutionTier::Low, Duration::ZERO);
        frame.data.truncate(10);
        assert!(i420_to_rgb(&frame).is_none());
    }

    #[test]
    fn rotation_moves_corner_pixels() {
        let mut image = solid(4, 2, [0, 0, 0]);
        image.put_pixel(0, 0, Rgb([255, 255, 255]));
        let mut frame = rgb_to_i420(&image, ResolutionTier::Low, Duration::ZERO);

        rotate_i420_180(&mut frame);
        let y = frame.y_plane();
        assert!(y[7] > 200);
        assert!(y[0] < 50);
    }
}
