// SPDX-License-Identifier: GPL-3.0-only

//! Service configuration
//!
//! Stored as JSON. Every section has defaults, so a partial file (or none at
//! all) gives a working setup.

use crate::backends::camera::{CameraConfiguration, ExposureMode, ShutterTable};
use crate::constants::{exposure, motion, storage, timing, video};
use crate::errors::ConfigError;
use crate::motion::{SensitivityPreset, SessionSettings, TimelapseSettings};
use crate::pipelines::photo::{EncodingFormat, EncodingQuality, PhotoEncoder};
use crate::pipelines::video::VideoTiming;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Highest frame rate accepted for either resolution preset
pub const MAX_FRAME_RATE: u32 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    pub sensitivity: SensitivityPreset,
    /// Seconds after a motion photo before the next one may be taken
    pub photo_cooldown_seconds: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            sensitivity: SensitivityPreset::Default,
            photo_cooldown_seconds: motion::DEFAULT_PHOTO_COOLDOWN_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Footage kept from before the trigger
    pub pre_roll_seconds: f64,
    /// Time without motion before a clip is closed
    pub quiet_timeout_seconds: f64,
    /// Extra ring capacity on top of the pre-roll
    pub buffer_margin_seconds: f64,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            pre_roll_seconds: video::DEFAULT_PRE_ROLL_SECS,
            quiet_timeout_seconds: video::DEFAULT_QUIET_TIMEOUT_SECS,
            buffer_margin_seconds: video::DEFAULT_BUFFER_MARGIN_SECS,
        }
    }
}

impl VideoConfig {
    pub fn timing(&self) -> VideoTiming {
        VideoTiming {
            pre_roll: seconds(self.pre_roll_seconds),
            quiet_timeout: seconds(self.quiet_timeout_seconds),
            margin: seconds(self.buffer_margin_seconds),
        }
    }
}

/// Seconds from the config as a `Duration`, zero for anything unrepresentable
///
/// [`Config::validate`] rejects such values before they get here.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}

/// Finite and within `range`
fn check_seconds(name: &str, value: f64, range: RangeInclusive<f64>) -> Result<(), ConfigError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{} {} outside {}..={}",
            name,
            value,
            range.start(),
            range.end()
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelapseConfig {
    pub interval_seconds: u64,
    pub active: bool,
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            active: true,
        }
    }
}

impl TimelapseConfig {
    pub fn settings(&self) -> TimelapseSettings {
        TimelapseSettings {
            interval: Duration::from_secs(self.interval_seconds),
            active: self.active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotoConfig {
    pub format: EncodingFormat,
    pub quality: EncodingQuality,
}

impl Default for PhotoConfig {
    fn default() -> Self {
        Self {
            format: EncodingFormat::Jpeg,
            quality: EncodingQuality::High,
        }
    }
}

impl PhotoConfig {
    pub fn encoder(&self) -> PhotoEncoder {
        PhotoEncoder::new(self.format, self.quality)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of everything the service writes
    pub data_path: PathBuf,
    pub photos_dir: String,
    pub videos_dir: String,
    /// Clips are written here while open, then moved to `videos_dir`
    pub staging_dir: String,
    /// Saves are refused at or above this disk usage
    pub max_disk_usage_percent: u8,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            photos_dir: "photos".to_string(),
            videos_dir: "videos".to_string(),
            staging_dir: "staging".to_string(),
            max_disk_usage_percent: storage::DEFAULT_MAX_DISK_USAGE_PERCENT,
        }
    }
}

impl StorageConfig {
    pub fn photos_path(&self) -> PathBuf {
        self.data_path.join(&self.photos_dir)
    }

    pub fn videos_path(&self) -> PathBuf {
        self.data_path.join(&self.videos_dir)
    }

    pub fn staging_path(&self) -> PathBuf {
        self.data_path.join(&self.staging_dir)
    }
}

fn default_data_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("fieldcam")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfiguration,
    /// Shutter speeds read-back exposure is snapped to
    pub shutter_table: ShutterTable,
    pub motion: MotionConfig,
    pub video: VideoConfig,
    pub timelapse: TimelapseConfig,
    pub photo: PhotoConfig,
    pub storage: StorageConfig,
    /// Default tracing filter, `RUST_LOG` takes precedence
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera: CameraConfiguration::default(),
            shutter_table: ShutterTable::default(),
            motion: MotionConfig::default(),
            video: VideoConfig::default(),
            timelapse: TimelapseConfig::default(),
            photo: PhotoConfig::default(),
            storage: StorageConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Default location of the config file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("fieldcam")
            .join("config.json")
    }

    /// Read and validate a config file
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let text = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
            std::fs::write(path, text)
        };
        write().map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let camera = &self.camera;
        if camera.frame_rate == 0 || camera.frame_rate > MAX_FRAME_RATE {
            return Err(ConfigError::Invalid(format!(
                "frame_rate {} outside 1..={}",
                camera.frame_rate, MAX_FRAME_RATE
            )));
        }
        if camera.exposure.mode == ExposureMode::Manual
            && !(0.0..=exposure::MAX_ANALOGUE_GAIN).contains(&camera.exposure.gain)
        {
            return Err(ConfigError::Invalid(format!(
                "exposure gain {} outside 0..={}",
                camera.exposure.gain,
                exposure::MAX_ANALOGUE_GAIN
            )));
        }
        if camera.sharpness.value > exposure::MAX_SHARPNESS {
            return Err(ConfigError::Invalid(format!(
                "sharpness {} above {}",
                camera.sharpness.value,
                exposure::MAX_SHARPNESS
            )));
        }
        let video = &self.video;
        check_seconds("pre_roll_seconds", video.pre_roll_seconds, 0.0..=video::MAX_PRE_ROLL_SECS)?;
        check_seconds(
            "quiet_timeout_seconds",
            video.quiet_timeout_seconds,
            0.0..=video::MAX_QUIET_TIMEOUT_SECS,
        )?;
        if video.quiet_timeout_seconds == 0.0 {
            return Err(ConfigError::Invalid("quiet_timeout_seconds must be positive".into()));
        }
        check_seconds(
            "buffer_margin_seconds",
            video.buffer_margin_seconds,
            0.0..=video::MAX_BUFFER_MARGIN_SECS,
        )?;
        check_seconds(
            "photo_cooldown_seconds",
            self.motion.photo_cooldown_seconds,
            0.0..=motion::MAX_PHOTO_COOLDOWN_SECS,
        )?;
        let interval = self.timelapse.interval_seconds;
        if interval == 0 || interval > timing::MAX_TIMELAPSE_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "timelapse interval {}s outside 1..={}",
                interval,
                timing::MAX_TIMELAPSE_INTERVAL_SECS
            )));
        }
        if self.storage.max_disk_usage_percent > 100 {
            return Err(ConfigError::Invalid(format!(
                "max_disk_usage_percent {} above 100",
                self.storage.max_disk_usage_percent
            )));
        }
        Ok(())
    }

    /// Camera configuration with the manual-shutter default applied
    pub fn effective_camera(&self) -> CameraConfiguration {
        let mut camera = self.camera.clone();
        if camera.exposure.mode == ExposureMode::Manual && camera.exposure.shutter_us == 0 {
            camera.exposure.shutter_us = exposure::DEFAULT_MANUAL_SHUTTER_US;
        }
        camera
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            profile: self.motion.sensitivity.profile(),
            photo_cooldown: seconds(self.motion.photo_cooldown_seconds),
            timelapse: self.timelapse.settings(),
            video: self.video.timing(),
        }
    }
}
