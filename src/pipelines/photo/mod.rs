// SPDX-License-Identifier: MPL-2.0

//! Single-shot photo capture
//!
//! ```text
//! still_frame() → JPEG encoding → save_photo()
//! ```
//!
//! The timestamp overlay is applied by the camera's preprocess hook before
//! the frame reaches this pipeline. No buffering is involved.

pub mod encoding;
pub mod overlay;

pub use encoding::{EncodingFormat, EncodingQuality, PhotoEncoder};

use super::CaptureControl;
use crate::errors::CommandError;
use crate::storage::FileHandoff;
use tracing::{info, warn};

/// Capture → encode → hand off
#[derive(Debug, Clone, Copy, Default)]
pub struct PhotoPipeline {
    encoder: PhotoEncoder,
}

impl PhotoPipeline {
    pub fn new(encoder: PhotoEncoder) -> Self {
        Self { encoder }
    }

    /// Take one photo
    ///
    /// Capture and encoding failures are returned; a failed save is logged
    /// and otherwise ignored.
    pub fn capture(
        &self,
        control: &dyn CaptureControl,
        handoff: &dyn FileHandoff,
    ) -> Result<(), CommandError> {
        let still = control.still_frame()?;
        let bytes = self
            .encoder
            .encode(&still.image)
            .map_err(CommandError::Encoding)?;

        info!(
            width = still.image.width(),
            height = still.image.height(),
            size = bytes.len(),
            "Photo captured"
        );

        if let Err(e) = handoff.save_photo(bytes, still.wall_time) {
            warn!(error = %e, "Photo handoff failed");
        }
        Ok(())
    }
}
