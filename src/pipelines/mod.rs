// SPDX-License-Identifier: MPL-2.0

//! Capture pipelines for photos and video clips
//!
//! # Pipeline Architecture
//!
//! ```text
//! ┌──────────────┐     ┌───────────────────┐     ┌──────────────┐
//! │ Hi-res frame │ ──▶ │  Photo Pipeline   │ ──▶ │ save_photo() │
//! │  (on demand) │     │  - I420→RGB       │     │              │
//! │              │     │  - JPEG encoding  │     │              │
//! └──────────────┘     └───────────────────┘     └──────────────┘
//!
//! ┌──────────────┐     ┌───────────────────┐     ┌──────────────┐
//! │ Hi-res       │ ──▶ │  Video Pipeline   │ ──▶ │ save_video() │
//! │ encoder      │     │  - pre-roll ring  │     │              │
//! │ (continuous) │     │  - clip phases    │     │              │
//! └──────────────┘     └───────────────────┘     └──────────────┘
//! ```
//!
//! Both pipelines drive the camera through [`CaptureControl`], which the
//! frame source implements by queueing work onto its own thread.

pub mod photo;
pub mod video;

use crate::backends::camera::{CameraConfiguration, FrameSnapshot, RecordedClip};
use crate::errors::CommandError;
use std::path::Path;
use std::sync::Arc;
use video::PrerollWindow;

/// Camera operations needed by the capture pipelines
pub trait CaptureControl: Send + Sync {
    /// Apply a configuration, restarting the camera if the stream layout changed
    fn reconfigure(&self, configuration: CameraConfiguration) -> Result<(), CommandError>;

    /// Start the pre-roll encoder, restarting it if the window changed
    fn arm(&self, window: PrerollWindow) -> Result<(), CommandError>;

    /// Stop the pre-roll encoder
    fn disarm(&self) -> Result<(), CommandError>;

    /// Flush the pre-roll into a clip at `path` and keep appending
    fn begin_clip(&self, path: &Path) -> Result<(), CommandError>;

    /// Close the open clip
    fn end_clip(&self) -> Result<RecordedClip, CommandError>;

    /// A clip the camera closed on its own while restarting after a fault
    fn take_interrupted_clip(&self) -> Result<Option<RecordedClip>, CommandError>;

    /// One hi-res frame for a photo
    fn still_frame(&self) -> Result<Arc<FrameSnapshot>, CommandError>;
}
