// SPDX-License-Identifier: GPL-3.0-only

//! Simulated camera backed by recorded footage
//!
//! Plays a [`FrameReel`] in a loop, paced by the injected [`Clock`], and
//! behaves like the real camera behind the [`CameraDevice`] trait: two
//! resolution tiers, a pre-roll encoder with a circular output, exposure and
//! LED controls, autofocus and fault injection for tests.
//!
//! # Architecture
//!
//! ```text
//!   FrameReel (RGB)
//!        │ low-res at initialise(), hi-res on first use
//!        ├───────────────────────┐
//!        ▼                       ▼
//! ┌──────────────┐      ┌──────────────────┐
//! │ Low-res I420 │      │  Hi-res I420     │
//! │ (preview)    │      │  + preprocess    │
//! └──────────────┘      └────────┬─────────┘
//!   index = clock × fps          │ encoder cursor, one frame per 1/fps
//!                                ▼
//!                       ┌──────────────────┐
//!                       │ JPEG → Circular  │ → .mjpg clip
//!                       │      Output      │
//!                       └──────────────────┘
//! ```
//!
//! The encoder has its own read cursor: it encodes every frame that became
//! due since it last ran, so clips have no gaps no matter how often preview
//! frames are pulled.

mod file_source;

pub use file_source::FrameReel;

use crate::backends::camera::format_converters::{i420_to_rgb, rgb_to_i420, rotate_i420_180};
use crate::backends::camera::types::*;
use crate::backends::camera::CameraDevice;
use crate::clock::Clock;
use crate::constants::video::SIMULATED_JPEG_QUALITY;
use crate::errors::{CaptureError, HalError, HalResult};
use crate::pipelines::photo::encoding::encode_jpeg;
use crate::pipelines::video::{CircularOutput, ClipFormat, ClipWriter, EncodedFrame};
use image::imageops::FilterType;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Shutter reported while exposure is automatic
const AUTO_SHUTTER_US: u32 = 8000;

/// Knobs and counters shared between a [`SimulatedDevice`] and its owner
///
/// The device is moved into the frame source thread; tests keep an `Arc` to
/// this to inject faults and observe what the device was asked to do.
#[derive(Debug, Default)]
pub struct SimulatedControls {
    open_handles: AtomicUsize,
    initialisations: AtomicU64,
    fail_captures: AtomicU32,
    fail_initialise: AtomicBool,
    fail_controls: AtomicBool,
    autofocus_failures: AtomicU32,
    autofocus_cycles: AtomicU32,
    led_on: AtomicBool,
    shutdown: Mutex<Option<bool>>,
}

impl SimulatedControls {
    /// Camera handles currently open, never more than one
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    pub fn initialisations(&self) -> u64 {
        self.initialisations.load(Ordering::SeqCst)
    }

    /// Make the next `count` frame captures fail
    pub fn fail_next_captures(&self, count: u32) {
        self.fail_captures.store(count, Ordering::SeqCst);
    }

    /// Make every initialisation fail until cleared
    pub fn set_fail_initialise(&self, fail: bool) {
        self.fail_initialise.store(fail, Ordering::SeqCst);
    }

    /// Make every exposure, sharpness and LED change fail until cleared
    pub fn set_fail_controls(&self, fail: bool) {
        self.fail_controls.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` focus cycles miss
    pub fn fail_autofocus_cycles(&self, count: u32) {
        self.autofocus_failures.store(count, Ordering::SeqCst);
    }

    pub fn autofocus_cycles(&self) -> u32 {
        self.autofocus_cycles.load(Ordering::SeqCst)
    }

    pub fn led_on(&self) -> bool {
        self.led_on.load(Ordering::SeqCst)
    }

    /// `Some(reboot)` once a shutdown was requested
    pub fn shutdown_requested(&self) -> Option<bool> {
        *self.shutdown.lock().unwrap()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_control(&self, control: &str) -> HalResult<()> {
        if self.fail_controls.load(Ordering::SeqCst) {
            return Err(HalError::DeviceUnavailable(format!(
                "simulated camera rejected {}",
                control
            )));
        }
        Ok(())
    }
}

/// Pre-roll encoder state
struct SimulatedEncoder {
    output: CircularOutput,
    started_at: Duration,
    /// Index of the next frame to encode, counted from `started_at`
    next_index: u64,
}

/// Camera that plays back a reel
pub struct SimulatedDevice {
    reel: Arc<FrameReel>,
    clock: Arc<dyn Clock>,
    controls: Arc<SimulatedControls>,
    autofocus_capable: bool,
    configuration: Option<CameraConfiguration>,
    lores: Vec<Frame>,
    /// Hi-res frames, converted the first time each reel frame is needed
    hires: Vec<Option<Frame>>,
    /// Fixed hi-res size instead of the configured resolution's
    hires_dimensions: Option<(u32, u32)>,
    started_at: Duration,
    hook: Option<PreprocessHook>,
    encoder: Option<SimulatedEncoder>,
    handle_open: bool,
}

impl SimulatedDevice {
    pub fn new(reel: FrameReel, clock: Arc<dyn Clock>) -> Self {
        Self {
            reel: Arc::new(reel),
            clock,
            controls: Arc::new(SimulatedControls::default()),
            autofocus_capable: false,
            configuration: None,
            lores: Vec::new(),
            hires: Vec::new(),
            hires_dimensions: None,
            started_at: Duration::ZERO,
            hook: None,
            encoder: None,
            handle_open: false,
        }
    }

    /// Pretend the sensor has a focus motor
    pub fn with_autofocus(mut self, capable: bool) -> Self {
        self.autofocus_capable = capable;
        self
    }

    /// Deliver hi-res frames at a fixed size
    ///
    /// By default they are scaled to the configured resolution.
    pub fn with_hires_dimensions(mut self, width: u32, height: u32) -> Self {
        self.hires_dimensions = Some((width, height));
        self
    }

    pub fn controls(&self) -> Arc<SimulatedControls> {
        Arc::clone(&self.controls)
    }

    fn require_configuration(&self) -> HalResult<&CameraConfiguration> {
        self.configuration
            .as_ref()
            .ok_or(HalError::Capture(CaptureError::NotInitialised))
    }

    fn frame_rate(&self) -> f64 {
        self.configuration
            .as_ref()
            .map_or(30, |c| c.frame_rate.max(1)) as f64
    }

    /// Reel index showing at `now`
    fn reel_index(&self, now: Duration) -> usize {
        let elapsed = now.saturating_sub(self.started_at).as_secs_f64();
        ((elapsed * self.frame_rate()).floor() as u64 % self.reel.len() as u64) as usize
    }

    fn prepare_frames(&mut self, configuration: &CameraConfiguration) {
        let (lores_w, lores_h) = configuration.resolution.lores_dimensions();
        let now = self.clock.now();
        self.lores = self
            .reel
            .frames()
            .iter()
            .map(|image| {
                let small = image::imageops::resize(image, lores_w, lores_h, FilterType::Triangle);
                to_device_frame(&small, ResolutionTier::Low, configuration.rotate, now)
            })
            .collect();
        self.hires = vec![None; self.reel.len()];
    }

    /// Hi-res frame for reel `index`, scaled to the stream size
    fn hires_frame(&mut self, index: usize) -> HalResult<Frame> {
        let configuration = self.require_configuration()?;
        let (width, height) = self
            .hires_dimensions
            .unwrap_or_else(|| configuration.resolution.dimensions());
        let rotate = configuration.rotate;

        if let Some(Some(frame)) = self.hires.get(index) {
            return Ok(frame.clone());
        }
        let source = &self.reel.frames()[index];
        let frame = if source.dimensions() == (width, height) {
            to_device_frame(source, ResolutionTier::High, rotate, Duration::ZERO)
        } else {
            let scaled = image::imageops::resize(source, width, height, FilterType::Triangle);
            to_device_frame(&scaled, ResolutionTier::High, rotate, Duration::ZERO)
        };
        if let Some(slot) = self.hires.get_mut(index) {
            *slot = Some(frame.clone());
        }
        Ok(frame)
    }

    /// Encode every frame that became due since the encoder last ran
    fn pump_encoder(&mut self) -> HalResult<()> {
        let now = self.clock.now();
        let fps = self.frame_rate();
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        if now < encoder.started_at {
            return Ok(());
        }

        let due = ((now - encoder.started_at).as_secs_f64() * fps).floor() as u64 + 1;
        let capacity = encoder.output.capacity() as u64;
        if !encoder.output.is_writing() && due > encoder.next_index + capacity {
            // frames older than the ring would be evicted unseen
            encoder.next_index = due - capacity;
        }
        let (started_at, mut next_index) = (encoder.started_at, encoder.next_index);

        let reel_len = self.reel.len() as u64;
        while next_index < due {
            let pts = started_at + Duration::from_secs_f64(next_index as f64 / fps);
            let since_start = pts.saturating_sub(self.started_at).as_secs_f64();
            let index = ((since_start * fps).round() as u64 % reel_len) as usize;

            let mut frame = self.hires_frame(index)?;
            frame.pts = pts;
            if let Some(hook) = &self.hook {
                hook(&mut frame);
            }
            let image = i420_to_rgb(&frame).ok_or_else(|| {
                CaptureError::FrameDropped("hi-res buffer shorter than its dimensions".into())
            })?;
            let data = encode_jpeg(&image, SIMULATED_JPEG_QUALITY).map_err(HalError::Encoder)?;

            let Some(encoder) = self.encoder.as_mut() else {
                return Ok(());
            };
            encoder.output.push(EncodedFrame {
                pts,
                keyframe: true,
                data: data.into(),
            })?;
            next_index += 1;
            encoder.next_index = next_index;
        }
        Ok(())
    }
}

fn to_device_frame(image: &image::RgbImage, tier: ResolutionTier, rotate: bool, pts: Duration) -> Frame {
    let mut frame = rgb_to_i420(image, tier, pts);
    if rotate {
        rotate_i420_180(&mut frame);
    }
    frame
}

impl CameraDevice for SimulatedDevice {
    fn initialise(&mut self, configuration: CameraConfiguration) -> HalResult<()> {
        self.release();
        self.controls.initialisations.fetch_add(1, Ordering::SeqCst);

        if self.controls.fail_initialise.load(Ordering::SeqCst) {
            return Err(HalError::DeviceUnavailable("simulated camera refused to open".into()));
        }

        self.prepare_frames(&configuration);
        self.started_at = self.clock.now();
        self.controls
            .led_on
            .store(configuration.led == LedState::On, Ordering::SeqCst);
        self.controls.open_handles.fetch_add(1, Ordering::SeqCst);
        self.handle_open = true;

        info!(
            reel = self.reel.source(),
            resolution = %configuration.resolution,
            frame_rate = configuration.frame_rate,
            "Simulated camera started"
        );
        self.configuration = Some(configuration);
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut encoder) = self.encoder.take()
            && encoder.output.is_writing()
        {
            let _ = encoder.output.stop();
        }
        if self.handle_open {
            self.controls.open_handles.fetch_sub(1, Ordering::SeqCst);
            self.handle_open = false;
            debug!("Simulated camera released");
        }
        self.configuration = None;
        self.lores.clear();
        self.hires.clear();
    }

    fn shutdown(&mut self, reboot: bool) -> HalResult<()> {
        self.release();
        *self.controls.shutdown.lock().unwrap() = Some(reboot);
        info!(reboot, "Simulated host shutdown");
        Ok(())
    }

    fn capture_frame(&mut self, tier: ResolutionTier) -> HalResult<Frame> {
        self.require_configuration()?;
        if SimulatedControls::take_failure(&self.controls.fail_captures) {
            return Err(CaptureError::FrameDropped("injected capture failure".into()).into());
        }
        self.pump_encoder()?;

        let now = self.clock.now();
        let index = self.reel_index(now);
        let mut frame = match tier {
            ResolutionTier::Low => self.lores[index].clone(),
            ResolutionTier::High => self.hires_frame(index)?,
        };
        frame.pts = now;
        if tier == ResolutionTier::High
            && let Some(hook) = &self.hook
        {
            hook(&mut frame);
        }
        Ok(frame)
    }

    fn set_preprocess_hook(&mut self, hook: Option<PreprocessHook>) {
        self.hook = hook;
    }

    fn set_exposure(
        &mut self,
        mode: ExposureMode,
        shutter_us: Option<u32>,
        gain: Option<f32>,
    ) -> HalResult<()> {
        self.require_configuration()?;
        self.controls.check_control("exposure")?;
        if let Some(configuration) = self.configuration.as_mut() {
            configuration.exposure.mode = mode;
            if let Some(shutter_us) = shutter_us {
                configuration.exposure.shutter_us = shutter_us;
            }
            if let Some(gain) = gain {
                configuration.exposure.gain = gain;
            }
        }
        Ok(())
    }

    fn set_sharpness(&mut self, mode: SharpnessMode, value: Option<u32>) -> HalResult<()> {
        self.require_configuration()?;
        self.controls.check_control("sharpness")?;
        if let Some(configuration) = self.configuration.as_mut() {
            configuration.sharpness = configuration.sharpness.with_mode(mode, value);
        }
        Ok(())
    }

    fn set_led(&mut self, state: LedState) -> HalResult<()> {
        self.require_configuration()?;
        self.controls.check_control("LED")?;
        self.controls
            .led_on
            .store(state == LedState::On, Ordering::SeqCst);
        Ok(())
    }

    fn exposure_settings(&mut self) -> HalResult<ExposureReadback> {
        let exposure = self.require_configuration()?.exposure;
        Ok(match exposure.mode {
            ExposureMode::Auto => ExposureReadback {
                shutter_us: AUTO_SHUTTER_US,
                gain: 1.0,
            },
            ExposureMode::Manual => ExposureReadback {
                shutter_us: exposure.shutter_us,
                gain: if exposure.gain > 0.0 { exposure.gain } else { 1.0 },
            },
        })
    }

    fn cpu_temperature(&self) -> Option<String> {
        Some("99.9".to_string())
    }

    fn capability_autofocus(&self) -> bool {
        self.autofocus_capable
    }

    fn autofocus_cycle(&mut self) -> HalResult<bool> {
        if !self.autofocus_capable {
            return Err(HalError::Unsupported("autofocus"));
        }
        self.controls.autofocus_cycles.fetch_add(1, Ordering::SeqCst);
        Ok(!SimulatedControls::take_failure(&self.controls.autofocus_failures))
    }

    fn start_preroll_encoder(
        &mut self,
        capacity_frames: usize,
        pre_roll: Duration,
    ) -> HalResult<()> {
        self.require_configuration()?;
        self.stop_preroll_encoder()?;
        self.encoder = Some(SimulatedEncoder {
            output: CircularOutput::new(capacity_frames, pre_roll),
            started_at: self.clock.now(),
            next_index: 0,
        });
        debug!(capacity_frames, "Simulated pre-roll encoder started");
        Ok(())
    }

    fn stop_preroll_encoder(&mut self) -> HalResult<()> {
        if let Some(mut encoder) = self.encoder.take()
            && encoder.output.is_writing()
        {
            encoder.output.stop()?;
        }
        Ok(())
    }

    fn start_capture_to(&mut self, path: &Path) -> HalResult<()> {
        self.pump_encoder()?;
        let encoder = self
            .encoder
            .as_mut()
            .ok_or(HalError::Capture(CaptureError::NotArmed))?;
        if encoder.output.is_writing() {
            return Err(CaptureError::AlreadyCapturing.into());
        }
        let writer = ClipWriter::create(
            &path.with_extension(ClipFormat::Framed.extension()),
            ClipFormat::Framed,
        )?;
        encoder.output.start(writer)?;
        Ok(())
    }

    fn stop_capture(&mut self) -> HalResult<RecordedClip> {
        self.pump_encoder()?;
        let encoder = self
            .encoder
            .as_mut()
            .ok_or(HalError::Capture(CaptureError::NotCapturing))?;
        encoder.output.stop()
    }

    fn is_capturing(&self) -> bool {
        self.encoder
            .as_ref()
            .is_some_and(|encoder| encoder.output.is_writing())
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pipelines::video::read_framed;

    fn device() -> (SimulatedDevice, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let device = SimulatedDevice::new(FrameReel::synthetic(64, 48, 10), clock.clone());
        (device, clock)
    }

    #[test]
    fn repeated_initialise_keeps_one_handle() {
        let (mut device, _clock) = device();
        let controls = device.controls();
        device.initialise(CameraConfiguration::default()).unwrap();
        device.initialise(CameraConfiguration::default()).unwrap();
        device.initialise(CameraConfiguration::default()).unwrap();
        assert_eq!(controls.open_handles(), 1);
        assert_eq!(controls.initialisations(), 3);
        device.release();
        assert_eq!(controls.open_handles(), 0);
    }

    #[test]
    fn tiers_have_their_own_sizes() {
        let (mut device, _clock) = device();
        device.initialise(CameraConfiguration::default()).unwrap();
        let low = device.capture_frame(ResolutionTier::Low).unwrap();
        let high = device.capture_frame(ResolutionTier::High).unwrap();
        assert_eq!((low.width, low.height), (320, 180));
        assert_eq!((high.width, high.height), (1920, 1080));
    }

    #[test]
    fn hires_follows_resolution_preset() {
        let (mut device, _clock) = device();
        let mut configuration = CameraConfiguration::default();
        configuration.resolution = ResolutionPreset::FourThree;
        device.initialise(configuration).unwrap();
        let high = device.capture_frame(ResolutionTier::High).unwrap();
        assert_eq!((high.width, high.height), (1640, 1232));
        assert_eq!(high.data.len(), Frame::i420_len(1640, 1232));
    }

    #[test]
    fn fixed_hires_dimensions_override_preset() {
        let (device, _clock) = device();
        let mut device = device.with_hires_dimensions(64, 48);
        device.initialise(CameraConfiguration::default()).unwrap();
        let high = device.capture_frame(ResolutionTier::High).unwrap();
        assert_eq!((high.width, high.height), (64, 48));
    }

    #[test]
    fn rejected_controls_report_errors() {
        let (mut device, _clock) = device();
        device.initialise(CameraConfiguration::default()).unwrap();
        device.controls().set_fail_controls(true);
        assert!(device.set_led(LedState::On).is_err());
        assert!(!device.controls().led_on());
        assert!(device.set_exposure(ExposureMode::Manual, Some(1000), None).is_err());
        assert_eq!(device.exposure_settings().unwrap().shutter_us, AUTO_SHUTTER_US);
    }

    #[test]
    fn capture_before_initialise_fails() {
        let (mut device, _clock) = device();
        assert!(device.capture_frame(ResolutionTier::Low).is_err());
    }

    #[test]
    fn injected_failures_are_consumed() {
        let (mut device, _clock) = device();
        device.initialise(CameraConfiguration::default()).unwrap();
        device.controls().fail_next_captures(2);
        assert!(device.capture_frame(ResolutionTier::Low).is_err());
        assert!(device.capture_frame(ResolutionTier::Low).is_err());
        assert!(device.capture_frame(ResolutionTier::Low).is_ok());
    }

    #[test]
    fn manual_exposure_is_read_back() {
        let (mut device, _clock) = device();
        device.initialise(CameraConfiguration::default()).unwrap();
        assert_eq!(device.exposure_settings().unwrap().shutter_us, AUTO_SHUTTER_US);
        device
            .set_exposure(ExposureMode::Manual, Some(712), Some(2.0))
            .unwrap();
        let readback = device.exposure_settings().unwrap();
        assert_eq!(readback.shutter_us, 712);
        assert_eq!(readback.gain, 2.0);
    }

    #[test]
    fn clip_reaches_back_by_pre_roll() {
        let dir = std::env::temp_dir().join(format!("fieldcam-sim-{}", uuid::Uuid::new_v4()));
        let (device, clock) = device();
        let mut device = device.with_hires_dimensions(64, 48);
        let mut configuration = CameraConfiguration::default();
        configuration.frame_rate = 10;
        configuration.timestamp_overlay = false;
        device.initialise(configuration).unwrap();
        device
            .start_preroll_encoder(31, Duration::from_secs(2))
            .unwrap();

        clock.set(Duration::from_secs(5));
        device.start_capture_to(&dir.join("clip")).unwrap();
        assert!(device.is_capturing());
        clock.set(Duration::from_secs(6));
        let clip = device.stop_capture().unwrap();

        assert_eq!(clip.path.extension().unwrap(), "mjpg");
        assert_eq!(clip.first_pts, Some(Duration::from_secs(3)));
        assert_eq!(clip.last_pts, Some(Duration::from_secs(6)));
        let frames = read_framed(&clip.path).unwrap();
        assert_eq!(frames.len(), 31);
        assert!(frames.windows(2).all(|w| w[0].pts < w[1].pts));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn capture_needs_the_encoder() {
        let (mut device, _clock) = device();
        device.initialise(CameraConfiguration::default()).unwrap();
        assert!(device.start_capture_to(Path::new("/tmp/never")).is_err());
        assert!(device.stop_capture().is_err());
    }

    #[test]
    fn shutdown_releases_and_records_request() {
        let (mut device, _clock) = device();
        let controls = device.controls();
        device.initialise(CameraConfiguration::default()).unwrap();
        device.shutdown(true).unwrap();
        assert_eq!(controls.open_handles(), 0);
        assert_eq!(controls.shutdown_requested(), Some(true));
    }
}
