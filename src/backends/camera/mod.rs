// SPDX-License-Identifier: MPL-2.0

//! Camera device abstraction
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────┐     ┌─────────────────────┐
//! │   Motion detector   │     │   Preview readers   │
//! └──────────┬──────────┘     └──────────┬──────────┘
//!            │ commands                  │ snapshots
//!            ▼                           ▼
//! ┌──────────────────────────────────────────────────┐
//! │      FrameSource thread (sole device owner)      │
//! └──────────────────────────┬───────────────────────┘
//!                            │
//!                            ▼
//!                ┌─────────────────────┐
//!                │  CameraDevice trait │
//!                └──────────┬──────────┘
//!                   ┌───────┴────────┐
//!                   ▼                ▼
//!            ┌────────────┐   ┌────────────┐
//!            │ Simulated  │   │ libcamera  │
//!            └────────────┘   └────────────┘
//! ```

pub mod exposure;
pub mod focus;
pub mod format_converters;
pub mod frame_loop;
#[cfg(feature = "hardware")]
pub mod libcamera;
pub mod snapshot;
pub mod source;
pub mod types;

pub use exposure::ShutterTable;
#[cfg(feature = "hardware")]
pub use libcamera::LibcameraDevice;
pub use snapshot::{FrameSnapshot, SnapshotCell};
pub use source::{FrameSource, FrameSourceHandle};
pub use types::*;

use crate::constants::timing;
use crate::errors::{HalError, HalResult};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Capability surface of a camera
///
/// Implementations are driven from a single thread (the frame source), so
/// methods take `&mut self` and the trait only requires `Send`.
pub trait CameraDevice: Send {
    // ===== Lifecycle =====

    /// Fully (re)configure and (re)start the camera
    ///
    /// Calling this again with the same configuration leaves the device in the
    /// same state. Any running pre-roll encoder and clip output are stopped.
    ///
    /// # Returns
    /// * `Err(HalError::DeviceUnavailable)` - Camera could not be opened
    fn initialise(&mut self, configuration: CameraConfiguration) -> HalResult<()>;

    /// Close the camera and free its resources
    fn release(&mut self);

    /// Power off or reboot the host
    ///
    /// The device is released first; nothing should be called afterwards.
    fn shutdown(&mut self, reboot: bool) -> HalResult<()>;

    // ===== Frames =====

    /// Block until the next frame of the given tier is available
    fn capture_frame(&mut self, tier: ResolutionTier) -> HalResult<Frame>;

    /// Install or clear the hook applied to hi-res frames before they are finalized
    fn set_preprocess_hook(&mut self, hook: Option<PreprocessHook>);

    // ===== Controls =====

    fn set_exposure(
        &mut self,
        mode: ExposureMode,
        shutter_us: Option<u32>,
        gain: Option<f32>,
    ) -> HalResult<()>;

    fn set_sharpness(&mut self, mode: SharpnessMode, value: Option<u32>) -> HalResult<()>;

    fn set_led(&mut self, state: LedState) -> HalResult<()>;

    /// Shutter and gain the sensor is actually using
    fn exposure_settings(&mut self) -> HalResult<ExposureReadback>;

    /// SoC temperature in degrees Celsius, formatted for display
    fn cpu_temperature(&self) -> Option<String>;

    fn capability_autofocus(&self) -> bool;

    /// Run one focus cycle, `true` when focus locked
    fn autofocus_cycle(&mut self) -> HalResult<bool>;

    /// Focus with retries
    ///
    /// Returns `false` when focus did not lock or the camera has no focus
    /// motor; the camera keeps running either way.
    fn autofocus(&mut self) -> bool {
        match focus_with_retry(self, timing::AUTOFOCUS_ATTEMPTS, timing::AUTOFOCUS_BACKOFF) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Continuing without focus lock");
                false
            }
        }
    }

    // ===== Circular video output =====

    /// Start the hi-res encoder feeding a ring of `capacity_frames`
    ///
    /// `pre_roll` is how far back a clip reaches when it is started.
    fn start_preroll_encoder(&mut self, capacity_frames: usize, pre_roll: Duration)
    -> HalResult<()>;

    fn stop_preroll_encoder(&mut self) -> HalResult<()>;

    /// Flush the ring into `path` and keep appending live frames
    ///
    /// The device picks the extension for its bitstream.
    fn start_capture_to(&mut self, path: &Path) -> HalResult<()>;

    /// Stop appending and close the clip, the encoder keeps running
    fn stop_capture(&mut self) -> HalResult<RecordedClip>;

    fn is_capturing(&self) -> bool;
}

/// Run focus cycles until one locks
///
/// # Returns
/// * `Err(HalError::Unsupported)` - The camera has no focus motor
/// * `Err(HalError::AutofocusTimeout)` - No cycle locked within `attempts`
pub fn focus_with_retry<D: CameraDevice + ?Sized>(
    device: &mut D,
    attempts: u32,
    backoff: Duration,
) -> HalResult<()> {
    if !device.capability_autofocus() {
        return Err(HalError::Unsupported("autofocus"));
    }

    for attempt in 1..=attempts {
        if device.autofocus_cycle()? {
            debug!(attempt, "Autofocus locked");
            return Ok(());
        }
        if attempt < attempts {
            std::thread::sleep(backoff);
        }
    }

    Err(HalError::AutofocusTimeout { attempts })
}
