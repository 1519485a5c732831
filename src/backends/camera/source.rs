// SPDX-License-Identifier: GPL-3.0-only

//! Frame source: the thread that owns the camera
//!
//! Only this thread ever touches the [`CameraDevice`]. Everyone else talks to
//! it through [`FrameSourceHandle`], which queues closures that run on the
//! source thread between frames and waits for their result.
//!
//! Each loop iteration:
//! 1. runs queued commands,
//! 2. pulls a low-res frame, converts it to RGB and publishes it,
//! 3. waits ~33 ms (1 s while a clip is open) for further commands.
//!
//! Capture failures never leave the loop: the device is reinitialised with
//! the last configuration, the pre-roll encoder is re-armed and the loop
//! backs off for 20 ms before trying again.

use super::format_converters::i420_to_rgb;
use super::frame_loop::{CaptureLoopController, LoopAction};
use super::snapshot::{FrameSnapshot, SnapshotCell};
use super::types::*;
use super::{CameraDevice, ShutterTable};
use crate::clock::Clock;
use crate::constants::timing;
use crate::errors::{CaptureError, CommandError, HalError, HalResult};
use crate::pipelines::CaptureControl;
use crate::pipelines::photo::overlay;
use crate::pipelines::video::PrerollWindow;
use futures::channel::oneshot;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

type Job = Box<dyn FnOnce(&mut SourceWorker) + Send>;

/// State owned by the frame source thread
pub struct SourceWorker {
    device: Box<dyn CameraDevice>,
    configuration: CameraConfiguration,
    preroll: Option<PrerollWindow>,
    initialised: bool,
    /// Set once the host is shutting down, the loop exits on the next pass
    halted: bool,
    /// Clip closed by a reinitialisation, returned by the next `end_clip`
    interrupted_clip: Option<RecordedClip>,
    cell: Arc<SnapshotCell>,
    clock: Arc<dyn Clock>,
    commands: Receiver<Job>,
    capturing: Arc<AtomicBool>,
    reinitialisations: Arc<AtomicU64>,
}

impl SourceWorker {
    /// One pass of the frame source loop
    fn step(&mut self) -> LoopAction {
        if self.drain_commands() == LoopAction::Stop || self.halted {
            return LoopAction::Stop;
        }

        if !self.initialised {
            self.recover(None);
        } else {
            match self.device.capture_frame(ResolutionTier::Low) {
                Ok(frame) => self.publish(&frame),
                Err(e) => self.recover(Some(e)),
            }
        }

        let wait = if self.device.is_capturing() {
            timing::RECORDING_POLL_INTERVAL
        } else {
            timing::IDLE_POLL_INTERVAL
        };
        self.wait_for_commands(wait)
    }

    fn publish(&mut self, frame: &Frame) {
        match i420_to_rgb(frame) {
            Some(image) => {
                self.cell.publish(
                    image,
                    ResolutionTier::Low,
                    self.clock.now(),
                    self.clock.wall(),
                );
            }
            None => self.recover(Some(
                CaptureError::FrameDropped(format!(
                    "{} byte buffer for {}x{}",
                    frame.data.len(),
                    frame.width,
                    frame.height
                ))
                .into(),
            )),
        }
    }

    fn drain_commands(&mut self) -> LoopAction {
        loop {
            match self.commands.try_recv() {
                Ok(job) => job(self),
                Err(mpsc::TryRecvError::Empty) => return LoopAction::Continue,
                Err(mpsc::TryRecvError::Disconnected) => return LoopAction::Stop,
            }
        }
    }

    /// Sleep until the next frame is due, running commands as they arrive
    fn wait_for_commands(&mut self, wait: Duration) -> LoopAction {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return LoopAction::Continue;
            }
            match self.commands.recv_timeout(remaining) {
                Ok(job) => {
                    job(self);
                    // give the stop flag a chance after every command
                    return LoopAction::Continue;
                }
                Err(RecvTimeoutError::Timeout) => return LoopAction::Continue,
                Err(RecvTimeoutError::Disconnected) => return LoopAction::Stop,
            }
        }
    }

    /// Bring the device up with the current configuration
    fn initialise(&mut self) -> HalResult<()> {
        self.initialised = false;
        self.device.initialise(self.configuration.clone())?;
        self.install_hook();

        if self.configuration.autofocus && self.device.capability_autofocus() {
            self.device.autofocus();
        }

        if let Some(window) = self.preroll {
            let capacity = window.capacity(self.configuration.frame_rate);
            self.device.start_preroll_encoder(capacity, window.pre_roll)?;
        }

        self.initialised = true;
        self.capturing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn install_hook(&mut self) {
        let hook = self
            .configuration
            .timestamp_overlay
            .then(|| overlay::timestamp_hook(Arc::clone(&self.clock)));
        self.device.set_preprocess_hook(hook);
    }

    /// Reinitialise after a fault
    fn recover(&mut self, cause: Option<HalError>) {
        let attempt = self.reinitialisations.fetch_add(1, Ordering::SeqCst) + 1;
        match &cause {
            Some(e) if e.is_transient() => warn!(error = %e, attempt, "Capture failed, reinitialising camera"),
            Some(e) => error!(error = %e, attempt, "Camera fault, reinitialising camera"),
            None => warn!(attempt, "Camera not running, reinitialising"),
        }

        self.salvage_clip();
        match self.initialise() {
            Ok(()) => info!(attempt, "Camera reinitialised"),
            Err(e) => error!(error = %e, attempt, "Camera reinitialisation failed"),
        }
        std::thread::sleep(timing::REINIT_BACKOFF);
    }

    /// Close an open clip before the device is restarted
    fn salvage_clip(&mut self) {
        if !self.device.is_capturing() {
            return;
        }
        match self.device.stop_capture() {
            Ok(clip) => {
                info!(path = %clip.path.display(), frames = clip.frames, "Clip closed for camera restart");
                self.interrupted_clip = Some(clip);
            }
            Err(e) => warn!(error = %e, "Failed to close clip before camera restart"),
        }
        self.capturing.store(false, Ordering::SeqCst);
    }

    // ===== Commands =====

    /// Apply a new configuration
    ///
    /// Stream layout changes (resolution, rotation, frame rate) restart the
    /// device; everything else is applied to the running camera. When the
    /// device refuses the change the previous configuration is put back, so
    /// a later recovery never brings up rejected settings.
    pub fn reconfigure(&mut self, configuration: CameraConfiguration) -> HalResult<()> {
        let previous = std::mem::replace(&mut self.configuration, configuration.clone());

        if !self.initialised || previous.requires_restart(&configuration) {
            info!(
                resolution = %configuration.resolution,
                frame_rate = configuration.frame_rate,
                rotate = configuration.rotate,
                "Restarting camera with new stream layout"
            );
            self.salvage_clip();
            if let Err(e) = self.initialise() {
                warn!(error = %e, "Camera refused the new layout, restoring the previous one");
                self.configuration = previous;
                if let Err(e) = self.initialise() {
                    // the capture loop keeps retrying with the restored configuration
                    error!(error = %e, "Camera restart with the previous layout failed");
                }
                return Err(e);
            }
            return Ok(());
        }

        if let Err(e) = self.apply_controls(&previous, &configuration) {
            warn!(error = %e, "Camera refused the new settings, restoring the previous ones");
            self.configuration = previous.clone();
            if let Err(e) = self.apply_controls(&configuration, &previous) {
                warn!(error = %e, "Failed to restore previous camera settings");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Push the controls that differ between `from` and `to` to the running camera
    fn apply_controls(&mut self, from: &CameraConfiguration, to: &CameraConfiguration) -> HalResult<()> {
        if from.exposure != to.exposure {
            let exposure = to.exposure;
            let manual = exposure.mode == ExposureMode::Manual;
            self.device.set_exposure(
                exposure.mode,
                manual.then_some(exposure.shutter_us),
                manual.then_some(exposure.gain),
            )?;
        }
        if from.sharpness != to.sharpness {
            let sharpness = to.sharpness;
            let value = (sharpness.mode == SharpnessMode::Manual).then_some(sharpness.value);
            self.device.set_sharpness(sharpness.mode, value)?;
        }
        if from.led != to.led {
            self.device.set_led(to.led)?;
        }
        if from.timestamp_overlay != to.timestamp_overlay {
            self.install_hook();
        }
        if to.autofocus && !from.autofocus && self.device.capability_autofocus() {
            self.device.autofocus();
        }
        Ok(())
    }

    /// Start (or restart with a new size) the pre-roll encoder
    pub fn arm(&mut self, window: PrerollWindow) -> HalResult<()> {
        if self.preroll == Some(window) {
            return Ok(());
        }
        if self.preroll.is_some() {
            self.salvage_clip();
            self.device.stop_preroll_encoder()?;
        }
        self.preroll = Some(window);
        let capacity = window.capacity(self.configuration.frame_rate);
        self.device.start_preroll_encoder(capacity, window.pre_roll)
    }

    pub fn disarm(&mut self) -> HalResult<()> {
        if self.preroll.take().is_none() {
            return Ok(());
        }
        self.salvage_clip();
        self.device.stop_preroll_encoder()
    }

    pub fn begin_clip(&mut self, path: &Path) -> HalResult<()> {
        self.interrupted_clip = None;
        self.device.start_capture_to(path)?;
        self.capturing.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn end_clip(&mut self) -> HalResult<RecordedClip> {
        self.capturing.store(false, Ordering::SeqCst);
        if self.device.is_capturing() {
            return self.device.stop_capture();
        }
        self.interrupted_clip
            .take()
            .ok_or(HalError::Capture(CaptureError::NotCapturing))
    }

    /// Clip closed by a restart since the last `begin_clip`, if any
    pub fn take_interrupted_clip(&mut self) -> Option<RecordedClip> {
        if self.device.is_capturing() {
            return None;
        }
        self.interrupted_clip.take()
    }

    /// Grab one hi-res frame, on demand and unbuffered
    pub fn hires_frame(&mut self) -> HalResult<Arc<FrameSnapshot>> {
        let frame = match self.device.capture_frame(ResolutionTier::High) {
            Ok(frame) => frame,
            Err(e) => {
                self.recover(Some(HalError::Capture(CaptureError::FrameDropped(e.to_string()))));
                return Err(e);
            }
        };
        let image = i420_to_rgb(&frame).ok_or_else(|| {
            CaptureError::FrameDropped("hi-res buffer shorter than its dimensions".into())
        })?;
        debug!(width = image.width(), height = image.height(), "Hi-res frame captured");
        Ok(Arc::new(FrameSnapshot {
            image,
            tier: ResolutionTier::High,
            captured_at: self.clock.now(),
            wall_time: self.clock.wall(),
            sequence: 0,
        }))
    }

    /// Read back exposure and snap the shutter to `table`
    pub fn exposure_readback(&mut self, table: &ShutterTable) -> HalResult<ExposureReadback> {
        let raw = self.device.exposure_settings()?;
        Ok(ExposureReadback {
            shutter_us: table.quantize(raw.shutter_us as f64),
            gain: raw.gain,
        })
    }

    pub fn cpu_temperature(&self) -> Option<String> {
        self.device.cpu_temperature()
    }

    pub fn configuration(&self) -> &CameraConfiguration {
        &self.configuration
    }

    pub fn shutdown(&mut self, reboot: bool) -> HalResult<()> {
        self.salvage_clip();
        self.preroll = None;
        self.initialised = false;
        self.halted = true;
        self.device.shutdown(reboot)
    }
}

/// Cloneable access to a running frame source
#[derive(Clone)]
pub struct FrameSourceHandle {
    commands: Sender<Job>,
    cell: Arc<SnapshotCell>,
    clock: Arc<dyn Clock>,
    capturing: Arc<AtomicBool>,
    reinitialisations: Arc<AtomicU64>,
}

impl FrameSourceHandle {
    /// Run `f` on the frame source thread and wait for its result
    pub fn call<R, F>(&self, f: F) -> Result<R, CommandError>
    where
        R: Send + 'static,
        F: FnOnce(&mut SourceWorker) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Box::new(move |worker| {
                let _ = tx.send(f(worker));
            }))
            .map_err(|_| CommandError::SourceStopped)?;
        futures::executor::block_on(rx).map_err(|_| CommandError::SourceStopped)
    }

    /// Latest low-res snapshot, never waits on the capture loop
    pub fn latest(&self) -> Option<Arc<FrameSnapshot>> {
        self.cell.latest()
    }

    pub fn snapshots(&self) -> Arc<SnapshotCell> {
        Arc::clone(&self.cell)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    /// Whether a clip output is open
    pub fn is_capturing(&self) -> bool {
        self.capturing.load(Ordering::SeqCst)
    }

    /// Number of reinitialisations since start
    pub fn reinitialisations(&self) -> u64 {
        self.reinitialisations.load(Ordering::SeqCst)
    }

    pub fn configuration(&self) -> Result<CameraConfiguration, CommandError> {
        self.call(|worker| worker.configuration().clone())
    }

    pub fn exposure_readback(&self, table: ShutterTable) -> Result<ExposureReadback, CommandError> {
        Ok(self.call(move |worker| worker.exposure_readback(&table))??)
    }

    pub fn cpu_temperature(&self) -> Result<Option<String>, CommandError> {
        self.call(|worker| worker.cpu_temperature())
    }

    pub fn shutdown(&self, reboot: bool) -> Result<(), CommandError> {
        Ok(self.call(move |worker| worker.shutdown(reboot))??)
    }
}

impl CaptureControl for FrameSourceHandle {
    fn reconfigure(&self, configuration: CameraConfiguration) -> Result<(), CommandError> {
        Ok(self.call(move |worker| worker.reconfigure(configuration))??)
    }

    fn arm(&self, window: PrerollWindow) -> Result<(), CommandError> {
        Ok(self.call(move |worker| worker.arm(window))??)
    }

    fn disarm(&self) -> Result<(), CommandError> {
        Ok(self.call(|worker| worker.disarm())??)
    }

    fn begin_clip(&self, path: &Path) -> Result<(), CommandError> {
        let path = path.to_path_buf();
        Ok(self.call(move |worker| worker.begin_clip(&path))??)
    }

    fn end_clip(&self) -> Result<RecordedClip, CommandError> {
        Ok(self.call(|worker| worker.end_clip())??)
    }

    fn take_interrupted_clip(&self) -> Result<Option<RecordedClip>, CommandError> {
        // an open clip output means nothing was cut short
        if self.is_capturing() {
            return Ok(None);
        }
        self.call(|worker| worker.take_interrupted_clip())
    }

    fn still_frame(&self) -> Result<Arc<FrameSnapshot>, CommandError> {
        Ok(self.call(|worker| worker.hires_frame())??)
    }
}

/// Running frame source thread
pub struct FrameSource {
    controller: CaptureLoopController,
    handle: FrameSourceHandle,
}

impl FrameSource {
    /// Take ownership of `device`, initialise it and start the loop
    ///
    /// # Returns
    /// * `Err(HalError::DeviceUnavailable)` - The first initialisation failed
    pub fn spawn(
        device: Box<dyn CameraDevice>,
        configuration: CameraConfiguration,
        clock: Arc<dyn Clock>,
    ) -> HalResult<Self> {
        let (commands, receiver) = mpsc::channel::<Job>();
        let cell = Arc::new(SnapshotCell::new());
        let capturing = Arc::new(AtomicBool::new(false));
        let reinitialisations = Arc::new(AtomicU64::new(0));
        let (ready_tx, ready_rx) = mpsc::channel::<HalResult<()>>();

        let worker = SourceWorker {
            device,
            configuration,
            preroll: None,
            initialised: false,
            halted: false,
            interrupted_clip: None,
            cell: Arc::clone(&cell),
            clock: Arc::clone(&clock),
            commands: receiver,
            capturing: Arc::clone(&capturing),
            reinitialisations: Arc::clone(&reinitialisations),
        };

        let controller = CaptureLoopController::start_with_lifecycle(
            "frame-source",
            move || {
                let mut worker = worker;
                match worker.initialise() {
                    Ok(()) => {
                        let _ = ready_tx.send(Ok(()));
                        Ok(worker)
                    }
                    Err(e) => {
                        let message = e.to_string();
                        worker.device.release();
                        let _ = ready_tx.send(Err(e));
                        Err(message)
                    }
                }
            },
            SourceWorker::step,
            |worker| {
                worker.salvage_clip();
                worker.device.release();
                info!("Camera released");
            },
        );

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(HalError::DeviceUnavailable(
                    "frame source thread exited during startup".into(),
                ));
            }
        }

        Ok(Self {
            controller,
            handle: FrameSourceHandle {
                commands,
                cell,
                clock,
                capturing,
                reinitialisations,
            },
        })
    }

    pub fn handle(&self) -> FrameSourceHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    /// Stop the loop; the device is released before the thread exits
    pub fn stop(&mut self) {
        self.controller.request_stop();
        // wake the loop if it is waiting for commands
        let _ = self.handle.commands.send(Box::new(|_| {}));
        self.controller.join();
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}
