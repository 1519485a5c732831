// SPDX-License-Identifier: GPL-3.0-only

//! Still image encoding
//!
//! Photos and preview frames are encoded to JPEG; PNG is available for
//! lossless stills.

use image::{ImageFormat, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Supported encoding formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingFormat {
    /// JPEG format (lossy compression)
    #[default]
    Jpeg,
    /// PNG format (lossless compression)
    Png,
}

impl EncodingFormat {
    /// Get file extension for this format
    pub fn extension(&self) -> &'static str {
        match self {
            EncodingFormat::Jpeg => "jpg",
            EncodingFormat::Png => "png",
        }
    }
}

/// Encoding quality settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncodingQuality {
    /// Live preview frames
    Low,
    Medium,
    #[default]
    High,
    Maximum,
}

impl EncodingQuality {
    /// Get JPEG quality value (0-100)
    pub fn jpeg_quality(&self) -> u8 {
        match self {
            EncodingQuality::Low => 60,
            EncodingQuality::Medium => 80,
            EncodingQuality::High => 92,
            EncodingQuality::Maximum => 98,
        }
    }
}

/// Photo encoder
#[derive(Debug, Clone, Copy, Default)]
pub struct PhotoEncoder {
    format: EncodingFormat,
    quality: EncodingQuality,
}

impl PhotoEncoder {
    pub fn new(format: EncodingFormat, quality: EncodingQuality) -> Self {
        Self { format, quality }
    }

    pub fn format(&self) -> EncodingFormat {
        self.format
    }

    /// Encode an RGB image
    pub fn encode(&self, image: &RgbImage) -> Result<Vec<u8>, String> {
        let data = match self.format {
            EncodingFormat::Jpeg => encode_jpeg(image, self.quality.jpeg_quality())?,
            EncodingFormat::Png => {
                let mut buffer = Vec::new();
                image
                    .write_to(&mut std::io::Cursor::new(&mut buffer), ImageFormat::Png)
                    .map_err(|e| format!("PNG encoding failed: {}", e))?;
                buffer
            }
        };

        debug!(
            width = image.width(),
            height = image.height(),
            size = data.len(),
            format = ?self.format,
            "Image encoded"
        );
        Ok(data)
    }
}

/// Encode image as JPEG
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, String> {
    let mut buffer = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut buffer);

    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality);

    encoder
        .encode(
            image.as_raw(),
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgb8,
        )
        .map_err(|e| format!("JPEG encoding failed: {}", e))?;

    Ok(buffer)
}
