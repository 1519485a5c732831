// SPDX-License-Identifier: MPL-2.0

//! Camera backends
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Frame source / capture pipelines      │
//! └────────────────────┬────────────────────────┘
//!                      │ CameraDevice
//! ┌────────────────────┴────────────────────────┐
//! │  ┌─────────────────┐   ┌─────────────────┐  │
//! │  │    libcamera    │   │    Simulated    │  │
//! │  │  (GStreamer)    │   │  (frame reel)   │  │
//! │  └─────────────────┘   └─────────────────┘  │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! - [`camera`]: device trait, frame types, the frame source thread and the
//!   `libcamera` device (feature `hardware`)
//! - [`virtual_camera`]: simulated camera playing recorded footage

pub mod camera;
pub mod virtual_camera;
