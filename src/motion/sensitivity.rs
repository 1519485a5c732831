// SPDX-License-Identifier: GPL-3.0-only

//! Sensitivity presets
//!
//! A motion box qualifies when its width lies strictly between the profile's
//! `min_width` and `max_width`. Narrower boxes are noise; wider ones are
//! whole-frame lighting changes.

use crate::constants::motion;
use crate::errors::CommandError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensitivityPreset {
    /// Only large subjects trigger
    Less,
    #[default]
    Default,
    /// Small subjects trigger too
    More,
}

impl SensitivityPreset {
    pub const ALL: [SensitivityPreset; 3] = [
        SensitivityPreset::Less,
        SensitivityPreset::Default,
        SensitivityPreset::More,
    ];

    pub fn profile(&self) -> SensitivityProfile {
        let min_width = match self {
            SensitivityPreset::Less => motion::LESS_SENSITIVE_MIN_WIDTH,
            SensitivityPreset::Default => motion::DEFAULT_MIN_WIDTH,
            SensitivityPreset::More => motion::MORE_SENSITIVE_MIN_WIDTH,
        };
        SensitivityProfile {
            min_width,
            max_width: motion::MAX_WIDTH,
        }
    }
}

impl std::fmt::Display for SensitivityPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensitivityPreset::Less => write!(f, "less"),
            SensitivityPreset::Default => write!(f, "default"),
            SensitivityPreset::More => write!(f, "more"),
        }
    }
}

impl std::str::FromStr for SensitivityPreset {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "less" => Ok(SensitivityPreset::Less),
            "default" => Ok(SensitivityPreset::Default),
            "more" => Ok(SensitivityPreset::More),
            other => Err(CommandError::ConfigurationRejected(format!(
                "unknown sensitivity '{}'",
                other
            ))),
        }
    }
}

/// Accepted band of motion box widths, in low-res pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitivityProfile {
    pub min_width: u32,
    pub max_width: u32,
}

impl SensitivityProfile {
    /// # Returns
    /// * `Err(CommandError::ConfigurationRejected)` - The band is empty
    pub fn new(min_width: u32, max_width: u32) -> Result<Self, CommandError> {
        if max_width <= min_width.saturating_add(1) {
            return Err(CommandError::ConfigurationRejected(format!(
                "no width fits strictly between {} and {}",
                min_width, max_width
            )));
        }
        Ok(Self {
            min_width,
            max_width,
        })
    }

    /// Whether a motion box of `width` counts as motion
    pub fn qualifies(&self, width: u32) -> bool {
        width > self.min_width && width < self.max_width
    }
}

impl Default for SensitivityProfile {
    fn default() -> Self {
        SensitivityPreset::default().profile()
    }
}

impl From<SensitivityPreset> for SensitivityProfile {
    fn from(preset: SensitivityPreset) -> Self {
        preset.profile()
    }
}
