// SPDX-License-Identifier: GPL-3.0-only

//! Raspberry Pi camera through GStreamer's `libcamerasrc`
//!
//! Besides the camera itself this device drives the illumination LED on a
//! GPIO line, reads the SoC temperature and powers the host off.

mod pipeline;

use self::pipeline::{SharedHook, SharedOutput, StreamGraph};
use super::CameraDevice;
use super::focus::FocusTracker;
use super::types::*;
use crate::constants::{hardware, timing};
use crate::errors::{CaptureError, HalError, HalResult};
use crate::pipelines::video::{CircularOutput, ClipFormat, ClipWriter};
use gstreamer as gst;
use gstreamer::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// LED on a sysfs GPIO line
struct GpioLed {
    line: u32,
}

impl GpioLed {
    fn line_dir(&self) -> PathBuf {
        PathBuf::from(format!("/sys/class/gpio/gpio{}", self.line))
    }

    fn set(&self, state: LedState) -> HalResult<()> {
        let dir = self.line_dir();
        if !dir.exists() {
            std::fs::write("/sys/class/gpio/export", self.line.to_string())?;
            std::fs::write(dir.join("direction"), "out")?;
        }
        let value = if state == LedState::On { "1" } else { "0" };
        std::fs::write(dir.join("value"), value)?;
        debug!(line = self.line, value, "LED set");
        Ok(())
    }
}

/// Camera name and sensor model of the first libcamera source
fn detect_camera() -> Option<(String, String)> {
    gst::init().ok()?;
    let monitor = gst::DeviceMonitor::new();
    monitor.add_filter(Some("Video/Source"), None);
    monitor.start().ok()?;
    let devices = monitor.devices();
    monitor.stop();

    devices.iter().find_map(|device| {
        let name = device.display_name().to_string();
        let sensor = hardware::AUTOFOCUS_SENSORS
            .iter()
            .find(|sensor| name.to_lowercase().contains(*sensor))
            .map(|s| s.to_string())
            .unwrap_or_else(|| name.clone());
        name.starts_with('/').then_some((name, sensor))
    })
}

/// Sensor-backed camera
pub struct LibcameraDevice {
    camera_name: Option<String>,
    sensor: String,
    graph: Option<StreamGraph>,
    configuration: Option<CameraConfiguration>,
    output: SharedOutput,
    hook: SharedHook,
    led: GpioLed,
}

impl LibcameraDevice {
    /// Use the first camera libcamera reports
    pub fn new() -> Self {
        let (camera_name, sensor) = match detect_camera() {
            Some((name, sensor)) => (Some(name), sensor),
            None => (None, String::from("unknown")),
        };
        info!(camera = ?camera_name, sensor = %sensor, "libcamera device selected");
        Self {
            camera_name,
            sensor,
            graph: None,
            configuration: None,
            output: Arc::new(Mutex::new(None)),
            hook: Arc::new(Mutex::new(None)),
            led: GpioLed {
                line: hardware::LED_GPIO,
            },
        }
    }

    fn graph(&self) -> HalResult<&StreamGraph> {
        self.graph
            .as_ref()
            .ok_or(HalError::Capture(CaptureError::NotInitialised))
    }

    fn apply_controls(&self, configuration: &CameraConfiguration) -> HalResult<()> {
        let exposure = configuration.exposure;
        let manual = exposure.mode == ExposureMode::Manual;
        optional_control(self.set_exposure_controls(
            exposure.mode,
            manual.then_some(exposure.shutter_us),
            manual.then_some(exposure.gain),
        ))?;
        let sharpness = configuration.sharpness;
        self.set_sharpness_control(sharpness.value)?;
        self.led.set(configuration.led)
    }

    fn set_exposure_controls(
        &self,
        mode: ExposureMode,
        shutter_us: Option<u32>,
        gain: Option<f32>,
    ) -> HalResult<()> {
        let graph = self.graph()?;
        match mode {
            ExposureMode::Auto => {
                graph.set_control("ae-enable", "true")?;
                // libcamera keeps the last manual values unless they are cleared
                if graph.has_control("exposure-time") {
                    graph.set_control("exposure-time", "0")?;
                }
            }
            ExposureMode::Manual => {
                graph.set_control("ae-enable", "false")?;
                if let Some(shutter_us) = shutter_us {
                    graph.set_control("exposure-time", &shutter_us.to_string())?;
                }
                if let Some(gain) = gain.filter(|g| *g > 0.0) {
                    graph.set_control("analogue-gain", &gain.to_string())?;
                }
            }
        }
        Ok(())
    }

    fn set_sharpness_control(&self, value: u32) -> HalResult<()> {
        optional_control(self.graph()?.set_control("sharpness", &value.to_string()))
    }
}

/// Older `libcamerasrc` builds lack some controls, carry on without them
fn optional_control(result: HalResult<()>) -> HalResult<()> {
    match result {
        Err(HalError::Unsupported(control)) => {
            warn!(control, "Camera control not available");
            Ok(())
        }
        other => other,
    }
}

impl Default for LibcameraDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDevice for LibcameraDevice {
    fn initialise(&mut self, configuration: CameraConfiguration) -> HalResult<()> {
        self.release();

        let graph = StreamGraph::start(
            &configuration,
            self.camera_name.as_deref(),
            Arc::clone(&self.output),
            Arc::clone(&self.hook),
        )?;
        self.graph = Some(graph);
        self.apply_controls(&configuration)?;
        self.configuration = Some(configuration);
        Ok(())
    }

    fn release(&mut self) {
        if let Some(mut output) = self.output.lock().unwrap().take()
            && output.is_writing()
        {
            let _ = output.stop();
        }
        if let Some(graph) = self.graph.take() {
            graph.stop();
            debug!("Camera pipeline stopped");
        }
        self.configuration = None;
    }

    fn shutdown(&mut self, reboot: bool) -> HalResult<()> {
        self.release();
        let _ = self.led.set(LedState::Off);
        let command = if reboot { "reboot" } else { "shutdown" };
        info!(command, "Shutting down host");
        let status = Command::new(command).arg("now").status()?;
        if status.success() {
            Ok(())
        } else {
            Err(HalError::DeviceUnavailable(format!("{} exited with {}", command, status)))
        }
    }

    fn capture_frame(&mut self, tier: ResolutionTier) -> HalResult<Frame> {
        let mut frame = self.graph()?.pull(tier)?;
        if tier == ResolutionTier::High
            && let Some(hook) = self.hook.lock().unwrap().as_ref()
        {
            hook(&mut frame);
        }
        Ok(frame)
    }

    fn set_preprocess_hook(&mut self, hook: Option<PreprocessHook>) {
        *self.hook.lock().unwrap() = hook;
    }

    fn set_exposure(
        &mut self,
        mode: ExposureMode,
        shutter_us: Option<u32>,
        gain: Option<f32>,
    ) -> HalResult<()> {
        self.set_exposure_controls(mode, shutter_us, gain)?;
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
        let current = self
            .configuration
            .as_ref()
            .ok_or(HalError::Capture(CaptureError::NotInitialised))?
            .sharpness;
        let sharpness = current.with_mode(mode, value);
        self.set_sharpness_control(sharpness.value)?;
        if let Some(configuration) = self.configuration.as_mut() {
            configuration.sharpness = sharpness;
        }
        Ok(())
    }

    fn set_led(&mut self, state: LedState) -> HalResult<()> {
        self.led.set(state)
    }

    fn exposure_settings(&mut self) -> HalResult<ExposureReadback> {
        let configuration = self
            .configuration
            .as_ref()
            .ok_or(HalError::Capture(CaptureError::NotInitialised))?;
        let graph = self.graph()?;

        let shutter_us = graph
            .property_string("exposure-time")
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(configuration.exposure.shutter_us);
        let gain = if configuration.exposure.gain > 0.0 {
            configuration.exposure.gain
        } else {
            1.0
        };
        Ok(ExposureReadback { shutter_us, gain })
    }

    fn cpu_temperature(&self) -> Option<String> {
        let raw = std::fs::read_to_string(hardware::THERMAL_ZONE_PATH).ok()?;
        let millidegrees: f64 = raw.trim().parse().ok()?;
        Some(format!("{:.1}", millidegrees / 1000.0))
    }

    fn capability_autofocus(&self) -> bool {
        hardware::AUTOFOCUS_SENSORS.contains(&self.sensor.as_str())
    }

    fn autofocus_cycle(&mut self) -> HalResult<bool> {
        if !self.capability_autofocus() {
            return Err(HalError::Unsupported("autofocus"));
        }
        let graph = self.graph()?;
        if !graph.has_control("af-mode") {
            return Ok(false);
        }
        graph.set_control("af-mode", "auto")?;
        if graph.has_control("af-trigger") {
            graph.set_control("af-trigger", "start")?;
        }

        let mut tracker = FocusTracker::default();
        for frame_index in 0..timing::AUTOFOCUS_SETTLE_FRAMES {
            let frame = graph.pull(ResolutionTier::Low)?;
            let position = graph
                .property_string("lens-position")
                .and_then(|v| v.parse::<f64>().ok());
            let settled = match position {
                Some(position) => tracker.lens_position(position),
                None => tracker.contrast(&frame),
            };
            if settled {
                debug!(frames = frame_index + 1, ?position, "Focus settled");
                return Ok(true);
            }
        }
        debug!(frames = timing::AUTOFOCUS_SETTLE_FRAMES, "Lens still moving");
        Ok(false)
    }

    fn start_preroll_encoder(
        &mut self,
        capacity_frames: usize,
        pre_roll: Duration,
    ) -> HalResult<()> {
        self.stop_preroll_encoder()?;
        let graph = self.graph()?;
        *self.output.lock().unwrap() = Some(CircularOutput::new(capacity_frames, pre_roll));
        graph.set_encoding(true);
        info!(capacity_frames, "Pre-roll encoder started");
        Ok(())
    }

    fn stop_preroll_encoder(&mut self) -> HalResult<()> {
        if let Ok(graph) = self.graph() {
            graph.set_encoding(false);
        }
        if let Some(mut output) = self.output.lock().unwrap().take()
            && output.is_writing()
        {
            output.stop()?;
        }
        Ok(())
    }

    fn start_capture_to(&mut self, path: &Path) -> HalResult<()> {
        let mut output = self.output.lock().unwrap();
        let output = output
            .as_mut()
            .ok_or(HalError::Capture(CaptureError::NotArmed))?;
        let writer = ClipWriter::create(
            &path.with_extension(ClipFormat::RawStream.extension()),
            ClipFormat::RawStream,
        )?;
        output.start(writer)?;
        Ok(())
    }

    fn stop_capture(&mut self) -> HalResult<RecordedClip> {
        self.output
            .lock()
            .unwrap()
            .as_mut()
            .ok_or(HalError::Capture(CaptureError::NotCapturing))?
            .stop()
    }

    fn is_capturing(&self) -> bool {
        self.output
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|output| output.is_writing())
    }
}

impl Drop for LibcameraDevice {
    fn drop(&mut self) {
        self.release();
    }
}
