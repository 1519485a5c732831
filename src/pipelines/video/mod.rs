// SPDX-License-Identifier: MPL-2.0

//! Pre-roll/post-roll video capture
//!
//! - [`circular`]: the fixed-capacity ring the camera encoder writes into,
//!   and the clip files it is flushed to
//! - [`recorder`]: the `Armed → Capturing → Stopping → Armed` phase machine

pub mod circular;
pub mod recorder;

pub use circular::{
    CircularOutput, ClipFormat, ClipWriter, EncodedFrame, PrerollWindow, preroll_capacity,
    read_framed,
};
pub use recorder::{CapturePhase, CapturePipeline, TriggerOutcome, VideoTiming};
