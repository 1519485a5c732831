// SPDX-License-Identifier: GPL-3.0-only

//! Command and status surface
//!
//! [`CameraService`] wires the frame source, the motion detector and the file
//! handoff together and is what a request layer (or the CLI) talks to.
//! Commands are validated here, so a rejected command never reaches the
//! camera and leaves the configuration untouched.

use crate::backends::camera::{
    CameraConfiguration, CameraDevice, ExposureMode, FrameSource, FrameSourceHandle, LedState,
    ResolutionPreset, SharpnessMode, SharpnessSettings,
};
use crate::clock::Clock;
use crate::config::Config;
use crate::constants::{clock_sync, exposure};
use crate::errors::{AppResult, CommandError, HalError};
use crate::motion::{
    DetectorHandle, MotionDetector, SensitivityPreset, SessionController, SessionMode,
};
use crate::pipelines::CaptureControl;
use crate::pipelines::photo::{EncodingQuality, PhotoPipeline, encoding::encode_jpeg};
use crate::pipelines::video::CapturePhase;
use crate::storage::FileHandoff;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Shown when the SoC temperature cannot be read
pub const UNKNOWN_TEMPERATURE: &str = "???";

/// Snapshot of everything a remote viewer displays
#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub version: &'static str,
    pub session: SessionMode,
    pub session_started: Option<DateTime<Local>>,
    pub capture_phase: CapturePhase,
    pub resolution: ResolutionPreset,
    pub frame_rate: u32,
    pub rotate: bool,
    pub exposure_mode: ExposureMode,
    /// Read back from the sensor, snapped to the shutter table
    pub shutter_us: u32,
    pub gain: f32,
    pub sharpness: SharpnessSettings,
    pub led: LedState,
    pub timestamp_overlay: bool,
    pub sensitivity: SensitivityPreset,
    pub timelapse_interval_seconds: u64,
    pub timelapse_active: bool,
    pub pre_roll_seconds: f64,
    pub quiet_timeout_seconds: f64,
    pub cpu_temperature: String,
    pub clock_synchronised: bool,
    pub camera_restarts: u64,
}

/// Running capture service
pub struct CameraService {
    config: Mutex<Config>,
    clock: Arc<dyn Clock>,
    source: FrameSource,
    camera: FrameSourceHandle,
    detector: MotionDetector,
    session: DetectorHandle,
    clock_synchronised: AtomicBool,
    update_system_clock: bool,
}

fn rejected(e: impl std::fmt::Display) -> CommandError {
    CommandError::ConfigurationRejected(e.to_string())
}

impl CameraService {
    /// Open the camera and start the frame source and motion detector
    ///
    /// # Returns
    /// * `Err(AppError::Config)` - The configuration is invalid
    /// * `Err(AppError::Hal)` - The camera could not be opened
    pub fn start(
        config: Config,
        device: Box<dyn CameraDevice>,
        clock: Arc<dyn Clock>,
        handoff: Arc<dyn FileHandoff>,
    ) -> AppResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(config.storage.staging_path())?;

        let source = FrameSource::spawn(device, config.effective_camera(), Arc::clone(&clock))?;
        let camera = source.handle();
        let control: Arc<dyn CaptureControl> = Arc::new(camera.clone());

        let session = SessionController::new(
            control,
            handoff,
            config.session_settings(),
            PhotoPipeline::new(config.photo.encoder()),
            config.storage.staging_path(),
        );
        let detector = MotionDetector::spawn(session, camera.snapshots(), Arc::clone(&clock));
        let session = detector.handle();

        info!(
            resolution = %config.camera.resolution,
            frame_rate = config.camera.frame_rate,
            "Camera service started"
        );
        Ok(Self {
            config: Mutex::new(config),
            clock,
            source,
            camera,
            detector,
            session,
            clock_synchronised: AtomicBool::new(false),
            update_system_clock: false,
        })
    }

    /// Also set the host clock when a time sync is accepted
    pub fn with_system_clock_updates(mut self, enabled: bool) -> Self {
        self.update_system_clock = enabled;
        self
    }

    /// Current configuration, including every accepted command
    pub fn config(&self) -> Config {
        self.config.lock().unwrap().clone()
    }

    pub fn camera(&self) -> &FrameSourceHandle {
        &self.camera
    }

    pub fn session(&self) -> &DetectorHandle {
        &self.session
    }

    // ===== Sessions =====

    pub fn start_session(&self, mode: SessionMode) -> Result<(), CommandError> {
        self.session.start_session(mode)
    }

    pub fn stop_session(&self) -> Result<(), CommandError> {
        self.session.stop_session()
    }

    /// Take one photo now, whatever the session
    pub fn take_photo(&self) -> Result<(), CommandError> {
        self.session
            .call(|worker| worker.session().capture_photo())?
    }

    // ===== Motion =====

    pub fn set_sensitivity(&self, preset: SensitivityPreset) -> Result<(), CommandError> {
        let mut config = self.config.lock().unwrap();
        let profile = preset.profile();
        self.session
            .call(move |worker| worker.session().set_sensitivity(profile))?;
        config.motion.sensitivity = preset;
        Ok(())
    }

    pub fn set_timelapse(&self, interval_seconds: u64, active: bool) -> Result<(), CommandError> {
        let mut config = self.config.lock().unwrap();
        let mut candidate = config.clone();
        candidate.timelapse.interval_seconds = interval_seconds;
        candidate.timelapse.active = active;
        candidate.validate().map_err(rejected)?;

        let settings = candidate.timelapse.settings();
        self.session.call(move |worker| {
            let now = worker.clock().now();
            worker.session().set_timelapse(settings, now)
        })?;
        *config = candidate;
        Ok(())
    }

    /// Change pre-roll and quiet timeout, the encoder restarts if the ring size changes
    pub fn set_video_timing(
        &self,
        pre_roll_seconds: f64,
        quiet_timeout_seconds: f64,
    ) -> Result<(), CommandError> {
        let mut config = self.config.lock().unwrap();
        let mut candidate = config.clone();
        candidate.video.pre_roll_seconds = pre_roll_seconds;
        candidate.video.quiet_timeout_seconds = quiet_timeout_seconds;
        candidate.validate().map_err(rejected)?;

        let timing = candidate.video.timing();
        self.session
            .call(move |worker| worker.session().set_video_timing(timing))??;
        *config = candidate;
        Ok(())
    }

    // ===== Camera =====

    /// Validate a camera change and push it through the session
    ///
    /// Unchanged settings are not sent to the camera at all.
    fn update_camera(
        &self,
        change: impl FnOnce(&mut CameraConfiguration),
    ) -> Result<(), CommandError> {
        let mut config = self.config.lock().unwrap();
        let mut candidate = config.clone();
        change(&mut candidate.camera);
        candidate.validate().map_err(rejected)?;
        if candidate.camera == config.camera {
            return Ok(());
        }

        let previous = config.effective_camera();
        let next = candidate.effective_camera();
        self.session
            .call(move |worker| worker.session().apply_camera_config(&previous, next))??;
        *config = candidate;
        Ok(())
    }

    pub fn set_resolution(&self, resolution: ResolutionPreset) -> Result<(), CommandError> {
        self.update_camera(|camera| camera.resolution = resolution)
    }

    pub fn set_rotation(&self, rotate: bool) -> Result<(), CommandError> {
        self.update_camera(|camera| camera.rotate = rotate)
    }

    pub fn set_frame_rate(&self, frame_rate: u32) -> Result<(), CommandError> {
        self.update_camera(|camera| camera.frame_rate = frame_rate)
    }

    /// Automatic exposure, or manual with shutter and gain
    ///
    /// A manual shutter of zero (or none) means the default manual shutter.
    pub fn set_exposure(
        &self,
        mode: ExposureMode,
        shutter_us: Option<u32>,
        gain: Option<f32>,
    ) -> Result<(), CommandError> {
        self.update_camera(|camera| {
            camera.exposure.mode = mode;
            if mode == ExposureMode::Manual {
                camera.exposure.shutter_us = match shutter_us {
                    None | Some(0) => exposure::DEFAULT_MANUAL_SHUTTER_US,
                    Some(shutter_us) => shutter_us,
                };
                if let Some(gain) = gain {
                    camera.exposure.gain = gain;
                }
            }
        })
    }

    pub fn set_sharpness(&self, mode: SharpnessMode, value: Option<u32>) -> Result<(), CommandError> {
        self.update_camera(|camera| camera.sharpness = camera.sharpness.with_mode(mode, value))
    }

    pub fn set_led(&self, led: LedState) -> Result<(), CommandError> {
        self.update_camera(|camera| camera.led = led)
    }

    pub fn set_timestamp_overlay(&self, enabled: bool) -> Result<(), CommandError> {
        self.update_camera(|camera| camera.timestamp_overlay = enabled)
    }

    pub fn set_autofocus(&self, enabled: bool) -> Result<(), CommandError> {
        self.update_camera(|camera| camera.autofocus = enabled)
    }

    // ===== Device =====

    /// Accept the first plausible wall-clock time from a client
    ///
    /// # Returns
    /// * `Err(CommandError::NotModified)` - The clock was already synchronised
    /// * `Err(CommandError::ConfigurationRejected)` - The time is implausibly old
    pub fn sync_clock(&self, epoch_secs: i64) -> Result<(), CommandError> {
        if self.clock_synchronised.load(Ordering::SeqCst) {
            return Err(CommandError::NotModified);
        }
        if epoch_secs <= clock_sync::MIN_PLAUSIBLE_EPOCH_SECS {
            return Err(rejected(format!("implausible time {}", epoch_secs)));
        }
        if self.update_system_clock {
            set_system_time(epoch_secs).map_err(HalError::Io)?;
        }
        if self
            .clock_synchronised
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CommandError::NotModified);
        }
        info!(epoch_secs, "Device clock synchronised");
        Ok(())
    }

    /// Stop capturing and power the host off (or reboot it)
    pub fn shutdown(&mut self, reboot: bool) -> Result<(), CommandError> {
        self.detector.stop();
        self.camera.shutdown(reboot)
    }

    // ===== Status =====

    pub fn status(&self) -> CameraStatus {
        let config = self.config.lock().unwrap().clone();
        let session = self.session.state();
        let camera = config.effective_camera();

        let readback = self
            .camera
            .exposure_readback(config.shutter_table.clone())
            .inspect_err(|e| warn!(error = %e, "Exposure read-back failed"))
            .ok();
        let cpu_temperature = self
            .camera
            .cpu_temperature()
            .ok()
            .flatten()
            .unwrap_or_else(|| UNKNOWN_TEMPERATURE.to_string());

        CameraStatus {
            version: crate::VERSION,
            session: session.mode,
            session_started: session.started_wall,
            capture_phase: self.session.phase(),
            resolution: camera.resolution,
            frame_rate: camera.frame_rate,
            rotate: camera.rotate,
            exposure_mode: camera.exposure.mode,
            shutter_us: readback.map_or(camera.exposure.shutter_us, |r| r.shutter_us),
            gain: readback.map_or(camera.exposure.gain, |r| r.gain),
            sharpness: camera.sharpness,
            led: camera.led,
            timestamp_overlay: camera.timestamp_overlay,
            sensitivity: config.motion.sensitivity,
            timelapse_interval_seconds: config.timelapse.interval_seconds,
            timelapse_active: config.timelapse.active,
            pre_roll_seconds: config.video.pre_roll_seconds,
            quiet_timeout_seconds: config.video.quiet_timeout_seconds,
            cpu_temperature,
            clock_synchronised: self.clock_synchronised.load(Ordering::SeqCst),
            camera_restarts: self.camera.reinitialisations(),
        }
    }

    /// Latest low-res frame as JPEG, `None` before the first frame
    pub fn preview_jpeg(&self) -> Result<Option<Vec<u8>>, CommandError> {
        let Some(snapshot) = self.camera.latest() else {
            return Ok(None);
        };
        encode_jpeg(&snapshot.image, EncodingQuality::Low.jpeg_quality())
            .map(Some)
            .map_err(CommandError::Encoding)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Stop the detector and release the camera
    pub fn stop(&mut self) {
        self.detector.stop();
        self.source.stop();
        info!("Camera service stopped");
    }
}

impl Drop for CameraService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_system_time(epoch_secs: i64) -> std::io::Result<()> {
    let time = libc::timespec {
        tv_sec: epoch_secs as libc::time_t,
        tv_nsec: 0,
    };
    let result = unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &time) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
