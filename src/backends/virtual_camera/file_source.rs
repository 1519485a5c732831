// SPDX-License-Identifier: GPL-3.0-only

//! Recorded footage for the simulated camera
//!
//! A [`FrameReel`] is the list of frames the simulated camera loops over. It
//! can be loaded from a directory of images, an animated GIF, a single image,
//! or (with the `hardware` feature) any video GStreamer can decode.

use crate::constants::file_formats;
use crate::errors::{HalError, HalResult};
use image::{AnimationDecoder, RgbImage};
use std::path::Path;
use tracing::info;

/// Longest reel decoded from a video file
pub const MAX_VIDEO_FRAMES: usize = 600;

/// Width video reels are scaled to while decoding
pub const VIDEO_DECODE_WIDTH: u32 = 640;

/// Looping sequence of frames of equal size
#[derive(Debug, Clone)]
pub struct FrameReel {
    frames: Vec<RgbImage>,
    source: String,
}

impl FrameReel {
    /// Build a reel from frames already in memory
    pub fn from_frames(frames: Vec<RgbImage>, source: &str) -> HalResult<Self> {
        let first = frames
            .first()
            .ok_or_else(|| HalError::DeviceUnavailable(format!("reel '{}' is empty", source)))?;
        let dims = first.dimensions();
        if frames.iter().any(|f| f.dimensions() != dims) {
            return Err(HalError::DeviceUnavailable(format!(
                "reel '{}' mixes frame sizes",
                source
            )));
        }
        Ok(Self {
            frames,
            source: source.to_string(),
        })
    }

    /// Load a reel from disk
    ///
    /// Directories are read in file name order, skipping non-image files.
    pub fn open(path: &Path) -> HalResult<Self> {
        let source = path.display().to_string();
        info!(path = %source, "Loading simulated camera reel");

        let frames = if path.is_dir() {
            load_image_dir(path)?
        } else {
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
                .unwrap_or_default();

            if extension == "gif" {
                load_gif(path)?
            } else if file_formats::is_image_extension(&extension) {
                vec![load_image(path)?]
            } else if file_formats::is_video_extension(&extension) {
                load_video(path)?
            } else {
                return Err(HalError::DeviceUnavailable(format!(
                    "unsupported reel format: {}",
                    extension
                )));
            }
        };

        let reel = Self::from_frames(frames, &source)?;
        let (width, height) = reel.dimensions();
        info!(frames = reel.len(), width, height, "Reel loaded");
        Ok(reel)
    }

    /// Generated footage: a bright block sweeping across a dark gradient
    pub fn synthetic(width: u32, height: u32, len: usize) -> Self {
        let len = len.max(1);
        let block = (width / 6).max(1);
        let frames = (0..len)
            .map(|i| {
                let offset = (i as u32 * width.max(1) / len as u32) % width.max(1);
                RgbImage::from_fn(width, height, |x, y| {
                    let inside = x >= offset && x < offset + block && y >= height / 3 && y < height / 3 + block;
                    if inside {
                        image::Rgb([230, 230, 230])
                    } else {
                        let shade = (20 + (y * 40 / height.max(1))) as u8;
                        image::Rgb([shade, shade, shade + 10])
                    }
                })
            })
            .collect();
        Self {
            frames,
            source: "synthetic".to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.frames[0].dimensions()
    }

    pub fn frames(&self) -> &[RgbImage] {
        &self.frames
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

fn load_image(path: &Path) -> HalResult<RgbImage> {
    let img = image::open(path).map_err(|e| {
        HalError::DeviceUnavailable(format!("Failed to load image '{}': {}", path.display(), e))
    })?;
    Ok(img.to_rgb8())
}

fn load_image_dir(dir: &Path) -> HalResult<Vec<RgbImage>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?
        .flatten()
        .map(|entry| entry.path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(file_formats::is_image_extension)
        })
        .collect();
    paths.sort();
    paths.iter().map(|p| load_image(p)).collect()
}

fn load_gif(path: &Path) -> HalResult<Vec<RgbImage>> {
    let file = std::io::BufReader::new(std::fs::File::open(path)?);
    let decoder = image::codecs::gif::GifDecoder::new(file)
        .map_err(|e| HalError::DeviceUnavailable(format!("Failed to read GIF: {}", e)))?;
    let frames = decoder
        .into_frames()
        .collect_frames()
        .map_err(|e| HalError::DeviceUnavailable(format!("Failed to decode GIF: {}", e)))?;
    Ok(frames
        .into_iter()
        .map(|frame| image::DynamicImage::ImageRgba8(frame.into_buffer()).to_rgb8())
        .collect())
}

#[cfg(not(feature = "hardware"))]
fn load_video(path: &Path) -> HalResult<Vec<RgbImage>> {
    Err(HalError::DeviceUnavailable(format!(
        "'{}': video reels need the `hardware` feature",
        path.display()
    )))
}

/// Decode a video file to RGB frames through GStreamer
#[cfg(feature = "hardware")]
fn load_video(path: &Path) -> HalResult<Vec<RgbImage>> {
    use gstreamer::prelude::*;

    gstreamer::init().map_err(|e| HalError::DeviceUnavailable(format!("GStreamer init failed: {}", e)))?;

    let pipeline_str = format!(
        "filesrc location=\"{}\" ! decodebin ! videoconvert ! videoscale ! \
         video/x-raw,format=RGB,width={},pixel-aspect-ratio=1/1 ! \
         appsink name=sink sync=false",
        path.to_string_lossy(),
        VIDEO_DECODE_WIDTH
    );

    let pipeline = gstreamer::parse::launch(&pipeline_str)
        .map_err(|e| HalError::DeviceUnavailable(format!("Failed to create pipeline: {}", e)))?
        .downcast::<gstreamer::Pipeline>()
        .map_err(|_| HalError::DeviceUnavailable("Failed to downcast to Pipeline".into()))?;
    let appsink = pipeline
        .by_name("sink")
        .ok_or_else(|| HalError::DeviceUnavailable("Failed to find appsink".into()))?
        .downcast::<gstreamer_app::AppSink>()
        .map_err(|_| HalError::DeviceUnavailable("Failed to downcast to AppSink".into()))?;

    pipeline
        .set_state(gstreamer::State::Playing)
        .map_err(|e| HalError::DeviceUnavailable(format!("Failed to start pipeline: {:?}", e)))?;

    let mut frames = Vec::new();
    while frames.len() < MAX_VIDEO_FRAMES {
        let Some(sample) = appsink.try_pull_sample(gstreamer::ClockTime::from_seconds(5)) else {
            break;
        };
        let Some(info) = sample
            .caps()
            .and_then(|caps| gstreamer_video::VideoInfo::from_caps(caps).ok())
        else {
            continue;
        };
        let Some(buffer) = sample.buffer() else {
            continue;
        };
        let Ok(map) = buffer.map_readable() else {
            continue;
        };

        let (width, height) = (info.width(), info.height());
        let stride = info.stride()[0] as usize;
        let mut rgb = Vec::with_capacity((width * height * 3) as usize);
        for row in map.as_slice().chunks(stride).take(height as usize) {
            rgb.extend_from_slice(&row[..(width * 3) as usize]);
        }
        if let Some(image) = RgbImage::from_raw(width, height, rgb) {
            frames.push(image);
        }
    }

    let _ = pipeline.set_state(gstreamer::State::Null);
    Ok(frames)
}
