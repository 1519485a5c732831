// SPDX-License-Identifier: GPL-3.0-only

//! Shared types for camera devices

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Which of the two simultaneous streams a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionTier {
    /// Motion detection and live preview stream
    Low,
    /// Photo and video stream
    High,
}

impl std::fmt::Display for ResolutionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionTier::Low => write!(f, "low"),
            ResolutionTier::High => write!(f, "high"),
        }
    }
}

/// Supported sensor modes
///
/// The low-res stream keeps the aspect ratio of the main stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResolutionPreset {
    #[default]
    #[serde(rename = "1920x1080")]
    FullHd,
    #[serde(rename = "1640x1232")]
    FourThree,
}

impl ResolutionPreset {
    pub const ALL: [ResolutionPreset; 2] = [ResolutionPreset::FullHd, ResolutionPreset::FourThree];

    /// Main stream size
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            ResolutionPreset::FullHd => (1920, 1080),
            ResolutionPreset::FourThree => (1640, 1232),
        }
    }

    /// Motion detection stream size
    pub fn lores_dimensions(&self) -> (u32, u32) {
        match self {
            ResolutionPreset::FullHd => (320, 180),
            ResolutionPreset::FourThree => (320, 240),
        }
    }

    pub fn dimensions_for(&self, tier: ResolutionTier) -> (u32, u32) {
        match tier {
            ResolutionTier::Low => self.lores_dimensions(),
            ResolutionTier::High => self.dimensions(),
        }
    }
}

impl std::fmt::Display for ResolutionPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (w, h) = self.dimensions();
        write!(f, "{}x{}", w, h)
    }
}

impl std::str::FromStr for ResolutionPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResolutionPreset::ALL
            .into_iter()
            .find(|preset| preset.to_string() == s)
            .ok_or_else(|| format!("unsupported resolution '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExposureMode {
    #[default]
    Auto,
    Manual,
}

/// Requested exposure
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExposureSettings {
    pub mode: ExposureMode,
    /// Shutter time in microseconds (manual mode)
    pub shutter_us: u32,
    /// Analogue gain (manual mode)
    pub gain: f32,
}

impl Default for ExposureSettings {
    fn default() -> Self {
        Self {
            mode: ExposureMode::Auto,
            shutter_us: 0,
            gain: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharpnessMode {
    #[default]
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharpnessSettings {
    pub mode: SharpnessMode,
    pub value: u32,
}

impl Default for SharpnessSettings {
    fn default() -> Self {
        Self {
            mode: SharpnessMode::Auto,
            value: crate::constants::exposure::AUTO_SHARPNESS,
        }
    }
}

impl SharpnessSettings {
    /// Settings after switching to `mode`
    ///
    /// Auto always uses the automatic level. Manual without a value keeps
    /// the current one.
    pub fn with_mode(self, mode: SharpnessMode, value: Option<u32>) -> Self {
        match mode {
            SharpnessMode::Auto => Self::default(),
            SharpnessMode::Manual => Self {
                mode,
                value: value.unwrap_or(self.value),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedState {
    #[default]
    Off,
    On,
}

/// Everything a device needs to (re)start
///
/// Handed by value to [`CameraDevice::initialise`](super::CameraDevice::initialise).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfiguration {
    pub resolution: ResolutionPreset,
    pub frame_rate: u32,
    /// Rotate both streams by 180 degrees
    pub rotate: bool,
    pub exposure: ExposureSettings,
    pub sharpness: SharpnessSettings,
    pub led: LedState,
    /// Stamp the capture time onto photos and clips
    pub timestamp_overlay: bool,
    pub autofocus: bool,
}

impl Default for CameraConfiguration {
    fn default() -> Self {
        Self {
            resolution: ResolutionPreset::default(),
            frame_rate: 30,
            rotate: false,
            exposure: ExposureSettings::default(),
            sharpness: SharpnessSettings::default(),
            led: LedState::Off,
            timestamp_overlay: true,
            autofocus: true,
        }
    }
}

impl CameraConfiguration {
    /// Whether switching from `self` to `other` requires the device to restart
    pub fn requires_restart(&self, other: &CameraConfiguration) -> bool {
        self.resolution != other.resolution
            || self.rotate != other.rotate
            || self.frame_rate != other.frame_rate
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frame_rate.max(1) as f64)
    }
}

/// Actual exposure reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExposureReadback {
    pub shutter_us: u32,
    pub gain: f32,
}

/// Planar YUV 4:2:0 frame
///
/// `pts` is the device clock time at which the frame was exposed.
#[derive(Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub tier: ResolutionTier,
    pub pts: Duration,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("tier", &self.tier)
            .field("pts", &self.pts)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Frame {
    /// Size in bytes of an I420 buffer
    pub fn i420_len(width: u32, height: u32) -> usize {
        let (cw, ch) = chroma_dimensions(width, height);
        (width * height) as usize + 2 * (cw * ch) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn y_plane(&self) -> &[u8] {
        &self.data[..(self.width * self.height) as usize]
    }

    pub fn y_plane_mut(&mut self) -> &mut [u8] {
        let len = (self.width * self.height) as usize;
        &mut self.data[..len]
    }
}

/// Dimensions of each chroma plane of an I420 frame
pub fn chroma_dimensions(width: u32, height: u32) -> (u32, u32) {
    (width.div_ceil(2), height.div_ceil(2))
}

/// Callback run on every frame before it is finalized
///
/// Applied to hi-res frames on their way to the encoder and to photos.
pub type PreprocessHook = Arc<dyn Fn(&mut Frame) + Send + Sync>;

/// A finished clip written by the device
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedClip {
    /// Final location, the device may change the extension
    pub path: PathBuf,
    pub frames: usize,
    pub first_pts: Option<Duration>,
    pub last_pts: Option<Duration>,
}

impl RecordedClip {
    pub fn duration(&self) -> Duration {
        match (self.first_pts, self.last_pts) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_presets_parse_and_print() {
        for preset in ResolutionPreset::ALL {
            assert_eq!(preset.to_string().parse::<ResolutionPreset>(), Ok(preset));
        }
        assert!("1280x720".parse::<ResolutionPreset>().is_err());
    }

    #[test]
    fn lores_keeps_aspect_ratio() {
        for preset in ResolutionPreset::ALL {
            let (w, h) = preset.dimensions();
            let (lw, lh) = preset.lores_dimensions();
            let main = w as f64 / h as f64;
            let lores = lw as f64 / lh as f64;
            assert!((main - lores).abs() < 0.02, "{} vs {}", main, lores);
        }
    }

    #[test]
    fn restart_needed_only_for_stream_layout() {
        let base = CameraConfiguration::default();

        let mut led = base.clone();
        led.led = LedState::On;
        assert!(!base.requires_restart(&led));

        let mut rotated = base.clone();
        rotated.rotate = true;
        assert!(base.requires_restart(&rotated));

        let mut faster = base.clone();
        faster.frame_rate = 15;
        assert!(base.requires_restart(&faster));
    }

    #[test]
    fn manual_sharpness_without_value_keeps_current_level() {
        let current = SharpnessSettings {
            mode: SharpnessMode::Manual,
            value: 12,
        };
        assert_eq!(current.with_mode(SharpnessMode::Manual, None).value, 12);
        assert_eq!(current.with_mode(SharpnessMode::Manual, Some(4)).value, 4);

        let auto = current.with_mode(SharpnessMode::Auto, Some(4));
        assert_eq!(auto, SharpnessSettings::default());
        let back = auto.with_mode(SharpnessMode::Manual, None);
        assert_eq!(back.mode, SharpnessMode::Manual);
        assert_eq!(back.value, crate::constants::exposure::AUTO_SHARPNESS);
    }

    #[test]
    fn i420_length_rounds_chroma_up() {
        assert_eq!(Frame::i420_len(4, 4), 16 + 2 * 4);
        assert_eq!(Frame::i420_len(3, 3), 9 + 2 * 4);
    }
}
