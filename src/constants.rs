// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use std::time::Duration;

/// Frame source cadence and recovery timing
pub mod timing {
    use super::Duration;

    /// Wait between low-res pulls while no clip is being written (~30 fps)
    pub const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(33);

    /// Wait between low-res pulls while a clip is being written
    pub const RECORDING_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Back-off after a failed capture before the next attempt
    pub const REINIT_BACKOFF: Duration = Duration::from_millis(20);

    /// Autofocus cycles attempted before reporting a timeout
    pub const AUTOFOCUS_ATTEMPTS: u32 = 5;

    /// Pause between autofocus cycles
    pub const AUTOFOCUS_BACKOFF: Duration = Duration::from_secs(1);

    /// Motion detector sampling cadence
    pub const MOTION_SAMPLE_INTERVAL: Duration = Duration::from_millis(33);

    /// Longest accepted timelapse interval (one week)
    pub const MAX_TIMELAPSE_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;

    /// Frames pulled while waiting for the lens to settle in one focus cycle
    pub const AUTOFOCUS_SETTLE_FRAMES: usize = 8;
}

/// Exposure controls
pub mod exposure {
    /// Shutter speeds (microseconds) used to present read-back exposure values
    pub const DEFAULT_SHUTTER_TABLE_US: &[u32] = &[
        250, 313, 400, 500, 625, 800, 1000, 1250, 1563, 2000, 2500, 3125, 4000, 5000, 6250, 8000,
        10000, 12500, 16666, 20000, 25000, 33333,
    ];

    /// Shutter speed substituted when manual exposure is requested with a zero shutter
    pub const DEFAULT_MANUAL_SHUTTER_US: u32 = 5000;

    /// Sharpness value applied in automatic mode
    pub const AUTO_SHARPNESS: u32 = 1;

    /// Highest sharpness the ISP accepts
    pub const MAX_SHARPNESS: u32 = 16;

    /// Highest analogue gain accepted in manual mode
    pub const MAX_ANALOGUE_GAIN: f32 = 16.0;
}

/// Pre-roll and post-roll defaults
pub mod video {
    /// Seconds of footage kept before a trigger
    pub const DEFAULT_PRE_ROLL_SECS: f64 = 5.0;

    /// Seconds without qualifying motion before a clip is closed
    pub const DEFAULT_QUIET_TIMEOUT_SECS: f64 = 5.0;

    /// Extra seconds of ring capacity on top of the pre-roll
    pub const DEFAULT_BUFFER_MARGIN_SECS: f64 = 1.1;

    /// Longest accepted pre-roll, bounds the ring size
    pub const MAX_PRE_ROLL_SECS: f64 = 30.0;

    /// Longest accepted quiet timeout
    pub const MAX_QUIET_TIMEOUT_SECS: f64 = 3600.0;

    /// Largest accepted ring margin
    pub const MAX_BUFFER_MARGIN_SECS: f64 = 5.0;

    /// Keyframe interval of the hardware H.264 encoder
    pub const KEYFRAME_INTERVAL: u32 = 15;

    /// JPEG quality for frames written by the simulated encoder
    pub const SIMULATED_JPEG_QUALITY: u8 = 75;
}

/// Motion detection defaults, in low-res pixels
pub mod motion {
    pub const LESS_SENSITIVE_MIN_WIDTH: u32 = 150;
    pub const DEFAULT_MIN_WIDTH: u32 = 100;
    pub const MORE_SENSITIVE_MIN_WIDTH: u32 = 50;
    pub const MAX_WIDTH: u32 = 280;

    /// Per-pixel luma delta treated as change
    pub const DELTA_THRESHOLD: u8 = 25;

    /// Weight of the newest frame in the rolling baseline
    pub const BASELINE_WEIGHT: f32 = 0.1;

    /// Gaussian blur sigma applied before differencing
    pub const BLUR_SIGMA: f32 = 1.5;

    /// Minimum seconds between motion-triggered photos
    pub const DEFAULT_PHOTO_COOLDOWN_SECS: f64 = 2.0;

    /// Longest accepted photo cooldown
    pub const MAX_PHOTO_COOLDOWN_SECS: f64 = 3600.0;
}

/// Autofocus lock detection
pub mod focus {
    /// Relative change between two readings below which the lens counts as settled
    pub const SETTLE_TOLERANCE: f64 = 0.02;

    /// Contrast below which a frame is too flat to judge focus on
    pub const MIN_CONTRAST: f64 = 1.0;
}

/// Device clock synchronisation
pub mod clock_sync {
    /// Unix timestamps at or below this value are rejected as implausible
    pub const MIN_PLAUSIBLE_EPOCH_SECS: i64 = 1_580_317_004;
}

/// Storage defaults
pub mod storage {
    /// Saves are refused once the data filesystem reaches this usage
    pub const DEFAULT_MAX_DISK_USAGE_PERCENT: u8 = 99;

    /// File name pattern for saved media
    pub const FILE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";
}

/// Real hardware
pub mod hardware {
    /// BCM GPIO line driving the illumination LED
    pub const LED_GPIO: u32 = 16;

    /// Sensors known to carry a focus motor
    pub const AUTOFOCUS_SENSORS: &[&str] = &["imx708"];

    pub const THERMAL_ZONE_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";
}

/// File formats
pub mod file_formats {
    /// Image file extensions accepted as simulated reels
    pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp"];

    /// Video file extensions accepted as simulated reels
    pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "avi", "mov", "h264"];

    /// Check if extension is an image format
    pub fn is_image_extension(ext: &str) -> bool {
        IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str())
    }

    /// Check if extension is a video format
    pub fn is_video_extension(ext: &str) -> bool {
        VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str())
    }
}
