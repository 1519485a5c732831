// SPDX-License-Identifier: MPL-2.0

//! Motion-triggered clip recording
//!
//! ```text
//!  Disarmed ──arm──▶ Armed ──trigger──▶ Capturing ──quiet timeout──▶ Stopping
//!                      ▲                  │    ▲                        │
//!                      │                  └────┘ trigger: extend        │
//!                      └────────────────────────────────────────────────┘
//! ```
//!
//! While `Armed` the camera's pre-roll encoder fills its ring. A trigger opens
//! a clip (ring contents first, then live frames). Further triggers push the
//! quiet deadline back; once it passes the clip is closed, handed to the file
//! saver and the pipeline returns to `Armed`. The encoder keeps running
//! across all of this.

use super::circular::PrerollWindow;
use crate::backends::camera::RecordedClip;
use crate::constants::storage::FILE_TIMESTAMP_FORMAT;
use crate::errors::{CaptureError, CommandError};
use crate::pipelines::CaptureControl;
use crate::storage::FileHandoff;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Transitions remembered for status and diagnostics
const TRANSITION_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapturePhase {
    Disarmed,
    Armed,
    Capturing,
    Stopping,
}

/// Result of a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// A new clip was opened
    Started,
    /// The open clip's deadline moved later
    Extended,
}

/// Pre-roll and post-roll durations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoTiming {
    pub pre_roll: Duration,
    pub quiet_timeout: Duration,
    /// Extra ring capacity on top of the pre-roll
    pub margin: Duration,
}

impl VideoTiming {
    pub fn window(&self) -> PrerollWindow {
        PrerollWindow {
            pre_roll: self.pre_roll,
            margin: self.margin,
        }
    }
}

/// Clip phase machine driven by the motion detector
pub struct CapturePipeline {
    control: Arc<dyn CaptureControl>,
    handoff: Arc<dyn FileHandoff>,
    phase: Arc<RwLock<CapturePhase>>,
    transitions: VecDeque<CapturePhase>,
    timing: VideoTiming,
    staging_dir: PathBuf,
    deadline: Option<Duration>,
}

impl CapturePipeline {
    /// # Arguments
    /// * `staging_dir` - Where clips are written while open
    pub fn new(
        control: Arc<dyn CaptureControl>,
        handoff: Arc<dyn FileHandoff>,
        timing: VideoTiming,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            control,
            handoff,
            phase: Arc::new(RwLock::new(CapturePhase::Disarmed)),
            transitions: VecDeque::from([CapturePhase::Disarmed]),
            timing,
            staging_dir,
            deadline: None,
        }
    }

    pub fn phase(&self) -> CapturePhase {
        *self.phase.read().unwrap()
    }

    /// Phase tag readable from other threads
    pub fn shared_phase(&self) -> Arc<RwLock<CapturePhase>> {
        Arc::clone(&self.phase)
    }

    /// Phases entered so far, oldest first
    pub fn transitions(&self) -> Vec<CapturePhase> {
        self.transitions.iter().copied().collect()
    }

    /// When the open clip will be closed if no trigger arrives
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    pub fn timing(&self) -> VideoTiming {
        self.timing
    }

    fn enter(&mut self, phase: CapturePhase) {
        let previous = std::mem::replace(&mut *self.phase.write().unwrap(), phase);
        if previous != phase {
            debug!(from = ?previous, to = ?phase, "Capture phase");
            self.transitions.push_back(phase);
            while self.transitions.len() > TRANSITION_HISTORY {
                self.transitions.pop_front();
            }
        }
    }

    /// Start the pre-roll encoder
    pub fn arm(&mut self) -> Result<(), CommandError> {
        self.control.arm(self.timing.window())?;
        if self.phase() == CapturePhase::Disarmed {
            self.enter(CapturePhase::Armed);
        }
        Ok(())
    }

    /// Close any open clip and stop the encoder
    pub fn disarm(&mut self) -> Result<(), CommandError> {
        let finished = self.interrupt();
        let disarmed = self.control.disarm();
        self.enter(CapturePhase::Disarmed);
        finished?;
        disarmed
    }

    /// Motion seen at `now`
    pub fn trigger(
        &mut self,
        now: Duration,
        wall: DateTime<Local>,
    ) -> Result<TriggerOutcome, CommandError> {
        self.reconcile()?;
        match self.phase() {
            CapturePhase::Disarmed | CapturePhase::Stopping => Err(CaptureError::NotArmed.into()),
            CapturePhase::Armed => {
                let stem = format!(
                    "{}-{}",
                    wall.format(FILE_TIMESTAMP_FORMAT),
                    &uuid::Uuid::new_v4().simple().to_string()[..8]
                );
                let path = self.staging_dir.join(stem);
                self.control.begin_clip(&path)?;
                self.deadline = Some(now.saturating_add(self.timing.quiet_timeout));
                self.enter(CapturePhase::Capturing);
                info!(path = %path.display(), "Motion clip started");
                Ok(TriggerOutcome::Started)
            }
            CapturePhase::Capturing => {
                let extended = now.saturating_add(self.timing.quiet_timeout);
                self.deadline = Some(self.deadline.map_or(extended, |d| d.max(extended)));
                debug!(deadline_secs = extended.as_secs_f64(), "Motion clip extended");
                Ok(TriggerOutcome::Extended)
            }
        }
    }

    /// Close the clip once its quiet deadline has passed
    pub fn poll(&mut self, now: Duration) -> Result<Option<RecordedClip>, CommandError> {
        if let Some(clip) = self.reconcile()? {
            return Ok(Some(clip));
        }
        match (self.phase(), self.deadline) {
            (CapturePhase::Capturing, Some(deadline)) if now >= deadline => self.finish().map(Some),
            _ => Ok(None),
        }
    }

    /// Close an open clip immediately, e.g. before the camera restarts
    pub fn interrupt(&mut self) -> Result<Option<RecordedClip>, CommandError> {
        if self.phase() == CapturePhase::Capturing {
            self.finish().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Change pre/post-roll, the encoder restarts when the ring size changes
    pub fn set_timing(&mut self, timing: VideoTiming) -> Result<(), CommandError> {
        if timing.window() != self.timing.window() {
            self.interrupt()?;
        }
        self.timing = timing;
        if self.phase() != CapturePhase::Disarmed {
            self.control.arm(timing.window())?;
        }
        Ok(())
    }

    /// Catch up with a clip the camera closed during a restart
    ///
    /// The salvaged clip is handed off and the pipeline falls back to
    /// `Armed`, so the next trigger opens a fresh clip with whatever pre-roll
    /// the restarted encoder has gathered.
    fn reconcile(&mut self) -> Result<Option<RecordedClip>, CommandError> {
        if self.phase() != CapturePhase::Capturing {
            return Ok(None);
        }
        let Some(clip) = self.control.take_interrupted_clip()? else {
            return Ok(None);
        };
        warn!(path = %clip.path.display(), frames = clip.frames, "Motion clip cut short by camera restart");
        self.enter(CapturePhase::Stopping);
        self.deadline = None;
        self.enter(CapturePhase::Armed);
        self.hand_off(&clip);
        Ok(Some(clip))
    }

    fn finish(&mut self) -> Result<RecordedClip, CommandError> {
        self.enter(CapturePhase::Stopping);
        self.deadline = None;
        let result = self.control.end_clip();
        self.enter(CapturePhase::Armed);

        let clip = result?;
        info!(
            path = %clip.path.display(),
            frames = clip.frames,
            duration_secs = clip.duration().as_secs_f64(),
            "Motion clip finished"
        );
        self.hand_off(&clip);
        Ok(clip)
    }

    fn hand_off(&self, clip: &RecordedClip) {
        if let Err(e) = self.handoff.save_video(&clip.path) {
            warn!(error = %e, path = %clip.path.display(), "Clip handoff failed");
        }
    }
}
