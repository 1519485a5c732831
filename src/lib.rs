// SPDX-License-Identifier: GPL-3.0-only

//! fieldcam - motion-triggered capture for unattended camera devices
//!
//! A single camera is watched at low resolution. Depending on the session
//! the operator selects, detected motion produces stills or video clips
//! that include footage from before the motion started, or stills are
//! taken on a fixed interval.
//!
//! # Architecture
//!
//! - [`backends`]: camera devices (real hardware and a simulated one) and
//!   the frame source thread that owns them
//! - [`motion`]: motion scoring, sensitivity and the session state machine
//! - [`pipelines`]: photo capture and the pre-roll video pipeline
//! - [`storage`]: hands finished files to disk off the capture path
//! - [`service`]: command and status surface tying it all together
//! - [`config`]: JSON configuration

pub mod backends;
pub mod clock;
pub mod config;
pub mod constants;
pub mod errors;
pub mod motion;
pub mod pipelines;
pub mod service;
pub mod storage;

/// Build version, from `git describe` unless overridden at build time
pub const VERSION: &str = env!("GIT_VERSION");

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use errors::{AppError, AppResult};
pub use motion::SessionMode;
pub use service::{CameraService, CameraStatus};
