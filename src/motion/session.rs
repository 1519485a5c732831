// SPDX-License-Identifier: GPL-3.0-only

//! Session state machine
//!
//! ```text
//!           ┌──────── start(photo) ───────▶ Photo      motion → still, cooldown
//!   Idle ───┼──────── start(video) ───────▶ Video      motion → clip (pre/post-roll)
//!    ▲      └──────── start(timelapse) ───▶ Timelapse  still every interval
//!    └──────────────── stop ──────────────────┘
//! ```
//!
//! Only operator commands change the session mode. Within a session, motion
//! and time drive the capture pipelines.

use super::detector::{MotionBox, MotionScorer};
use super::sensitivity::SensitivityProfile;
use crate::backends::camera::{CameraConfiguration, FrameSnapshot};
use crate::errors::CommandError;
use crate::pipelines::CaptureControl;
use crate::pipelines::photo::PhotoPipeline;
use crate::pipelines::video::{CapturePhase, CapturePipeline, VideoTiming};
use crate::storage::FileHandoff;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    #[default]
    Idle,
    Photo,
    Video,
    Timelapse,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::Idle => write!(f, "idle"),
            SessionMode::Photo => write!(f, "photo"),
            SessionMode::Video => write!(f, "video"),
            SessionMode::Timelapse => write!(f, "timelapse"),
        }
    }
}

impl std::str::FromStr for SessionMode {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SessionMode::Idle),
            "photo" => Ok(SessionMode::Photo),
            "video" => Ok(SessionMode::Video),
            "timelapse" => Ok(SessionMode::Timelapse),
            other => Err(CommandError::ConfigurationRejected(format!(
                "unknown session '{}'",
                other
            ))),
        }
    }
}

/// Active mode and when it started
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SessionState {
    pub mode: SessionMode,
    #[serde(skip)]
    pub started_at: Option<Duration>,
    pub started_wall: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelapseSettings {
    pub interval: Duration,
    /// Shots are paused while false
    pub active: bool,
}

/// Everything besides the capture plumbing a session needs
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub profile: SensitivityProfile,
    pub photo_cooldown: Duration,
    pub timelapse: TimelapseSettings,
    pub video: VideoTiming,
}

/// Owns the session mode and both capture pipelines
pub struct SessionController {
    control: Arc<dyn CaptureControl>,
    handoff: Arc<dyn FileHandoff>,
    video: CapturePipeline,
    photo: PhotoPipeline,
    scorer: MotionScorer,
    profile: SensitivityProfile,
    photo_cooldown: Duration,
    next_photo: Option<Duration>,
    timelapse: TimelapseSettings,
    next_shot: Option<Duration>,
    last_sequence: Option<u64>,
    state: Arc<RwLock<SessionState>>,
}

impl SessionController {
    pub fn new(
        control: Arc<dyn CaptureControl>,
        handoff: Arc<dyn FileHandoff>,
        settings: SessionSettings,
        photo: PhotoPipeline,
        staging_dir: PathBuf,
    ) -> Self {
        let video = CapturePipeline::new(
            Arc::clone(&control),
            Arc::clone(&handoff),
            settings.video,
            staging_dir,
        );
        Self {
            control,
            handoff,
            video,
            photo,
            scorer: MotionScorer::default(),
            profile: settings.profile,
            photo_cooldown: settings.photo_cooldown,
            next_photo: None,
            timelapse: settings.timelapse,
            next_shot: None,
            last_sequence: None,
            state: Arc::new(RwLock::new(SessionState::default())),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    /// Session state readable from other threads
    pub fn shared_state(&self) -> Arc<RwLock<SessionState>> {
        Arc::clone(&self.state)
    }

    pub fn mode(&self) -> SessionMode {
        self.state().mode
    }

    pub fn phase(&self) -> CapturePhase {
        self.video.phase()
    }

    pub fn shared_phase(&self) -> Arc<RwLock<CapturePhase>> {
        self.video.shared_phase()
    }

    /// Capture phases entered so far
    pub fn transitions(&self) -> Vec<CapturePhase> {
        self.video.transitions()
    }

    pub fn profile(&self) -> SensitivityProfile {
        self.profile
    }

    pub fn timelapse(&self) -> TimelapseSettings {
        self.timelapse
    }

    /// Enter `mode`, stopping the running session first
    pub fn start(
        &mut self,
        mode: SessionMode,
        now: Duration,
        wall: DateTime<Local>,
    ) -> Result<(), CommandError> {
        if self.mode() != SessionMode::Idle {
            self.stop()?;
        }
        if mode == SessionMode::Idle {
            return Ok(());
        }

        if mode == SessionMode::Video {
            self.video.arm()?;
        }
        self.scorer.reset();
        self.next_photo = None;
        self.next_shot = (mode == SessionMode::Timelapse)
            .then(|| now.checked_add(self.timelapse.interval))
            .flatten();

        *self.state.write().unwrap() = SessionState {
            mode,
            started_at: Some(now),
            started_wall: Some(wall),
        };
        info!(session = %mode, "Session started");
        Ok(())
    }

    /// Return to idle, closing any open clip and stopping the encoder
    pub fn stop(&mut self) -> Result<(), CommandError> {
        let previous = std::mem::take(&mut *self.state.write().unwrap());
        self.next_shot = None;
        self.next_photo = None;
        if previous.mode == SessionMode::Video {
            self.video.disarm()?;
        }
        if previous.mode != SessionMode::Idle {
            info!(session = %previous.mode, "Session stopped");
        }
        Ok(())
    }

    /// Score a new low-res snapshot
    ///
    /// Snapshots already seen are skipped. Returns whether a capture was
    /// triggered.
    pub fn observe(&mut self, now: Duration, snapshot: &FrameSnapshot) -> Result<bool, CommandError> {
        if self.last_sequence == Some(snapshot.sequence) {
            return Ok(false);
        }
        self.last_sequence = Some(snapshot.sequence);

        if !matches!(self.mode(), SessionMode::Photo | SessionMode::Video) {
            return Ok(false);
        }
        match self.scorer.score(&snapshot.image) {
            Some(found) => self.handle_motion(now, snapshot.wall_time, &found),
            None => Ok(false),
        }
    }

    /// React to a motion box, returns whether it caused a capture
    pub fn handle_motion(
        &mut self,
        now: Duration,
        wall: DateTime<Local>,
        found: &MotionBox,
    ) -> Result<bool, CommandError> {
        if !self.profile.qualifies(found.width) {
            debug!(width = found.width, "Motion outside sensitivity band");
            return Ok(false);
        }

        match self.mode() {
            SessionMode::Photo => {
                if self.next_photo.is_some_and(|eligible| now < eligible) {
                    return Ok(false);
                }
                info!(width = found.width, "Motion, taking photo");
                self.photo.capture(self.control.as_ref(), self.handoff.as_ref())?;
                self.next_photo = Some(now.saturating_add(self.photo_cooldown));
                Ok(true)
            }
            SessionMode::Video => match self.video.phase() {
                CapturePhase::Armed | CapturePhase::Capturing => {
                    self.video.trigger(now, wall)?;
                    Ok(true)
                }
                _ => Ok(false),
            },
            SessionMode::Idle | SessionMode::Timelapse => Ok(false),
        }
    }

    /// Time-driven work: clip deadlines and timelapse shots
    pub fn tick(&mut self, now: Duration) -> Result<(), CommandError> {
        match self.mode() {
            SessionMode::Video => {
                self.video.poll(now)?;
            }
            SessionMode::Timelapse if self.timelapse.active => {
                let Some(due) = self.next_shot else {
                    // stays unscheduled while the interval runs past the clock's range
                    self.next_shot = now.checked_add(self.timelapse.interval);
                    return Ok(());
                };
                if now >= due {
                    let interval = self.timelapse.interval.max(Duration::from_millis(1));
                    let mut next = due.saturating_add(interval);
                    while next <= now {
                        next = next.saturating_add(interval);
                    }
                    self.next_shot = Some(next);
                    debug!(due_secs = due.as_secs_f64(), "Timelapse shot");
                    self.photo.capture(self.control.as_ref(), self.handoff.as_ref())?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Take a still outside of any session schedule
    pub fn capture_photo(&self) -> Result<(), CommandError> {
        self.photo.capture(self.control.as_ref(), self.handoff.as_ref())
    }

    pub fn set_sensitivity(&mut self, profile: SensitivityProfile) {
        info!(min_width = profile.min_width, max_width = profile.max_width, "Sensitivity changed");
        self.profile = profile;
    }

    pub fn set_photo_cooldown(&mut self, cooldown: Duration) {
        self.photo_cooldown = cooldown;
    }

    /// Change the timelapse schedule
    ///
    /// A new interval, or resuming after a pause, restarts the count from
    /// `now`.
    pub fn set_timelapse(&mut self, settings: TimelapseSettings, now: Duration) {
        let resumed = settings.active && !self.timelapse.active;
        let retimed = settings.interval != self.timelapse.interval;
        self.timelapse = settings;
        if self.mode() == SessionMode::Timelapse && (resumed || retimed) {
            self.next_shot = now.checked_add(settings.interval);
        }
    }

    pub fn set_video_timing(&mut self, timing: VideoTiming) -> Result<(), CommandError> {
        self.video.set_timing(timing)
    }

    pub fn video_timing(&self) -> VideoTiming {
        self.video.timing()
    }

    /// Push a camera configuration change through the frame source
    ///
    /// When the change restarts the camera an open clip is closed first and
    /// the encoder is re-armed afterwards.
    pub fn apply_camera_config(
        &mut self,
        previous: &CameraConfiguration,
        next: CameraConfiguration,
    ) -> Result<(), CommandError> {
        let restart = previous.requires_restart(&next);
        if restart {
            self.video.interrupt()?;
        }
        self.control.reconfigure(next)?;
        if restart {
            // the old background no longer lines up with the new stream
            self.scorer.reset();
            if self.mode() == SessionMode::Video
                && let Err(e) = self.video.arm()
            {
                warn!(error = %e, "Failed to re-arm after camera restart");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Close everything before shutdown
    pub fn shutdown(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Failed to stop session cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::camera::{RecordedClip, ResolutionTier};
    use crate::pipelines::video::PrerollWindow;
    use std::path::Path;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeControl {
        calls: Mutex<Vec<String>>,
    }

    impl FakeControl {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }
    }

    impl CaptureControl for FakeControl {
        fn reconfigure(&self, _configuration: CameraConfiguration) -> Result<(), CommandError> {
            self.record("reconfigure");
            Ok(())
        }

        fn arm(&self, _window: PrerollWindow) -> Result<(), CommandError> {
            self.record("arm");
            Ok(())
        }

        fn disarm(&self) -> Result<(), CommandError> {
            self.record("disarm");
            Ok(())
        }

        fn begin_clip(&self, _path: &Path) -> Result<(), CommandError> {
            self.record("begin_clip");
            Ok(())
        }

        fn end_clip(&self) -> Result<RecordedClip, CommandError> {
            self.record("end_clip");
            Ok(RecordedClip {
                path: PathBuf::from("/tmp/fake.mjpg"),
                frames: 0,
                first_pts: None,
                last_pts: None,
            })
        }

        fn take_interrupted_clip(&self) -> Result<Option<RecordedClip>, CommandError> {
            Ok(None)
        }

        fn still_frame(&self) -> Result<Arc<FrameSnapshot>, CommandError> {
            self.record("still_frame");
            Ok(Arc::new(FrameSnapshot {
                image: image::RgbImage::new(8, 8),
                tier: ResolutionTier::High,
                captured_at: Duration::ZERO,
                wall_time: Local::now(),
                sequence: 0,
            }))
        }
    }

    #[derive(Default)]
    struct CountingHandoff {
        photos: Mutex<usize>,
        videos: Mutex<usize>,
    }

    impl FileHandoff for CountingHandoff {
        fn save_photo(&self, _bytes: Vec<u8>, _taken_at: DateTime<Local>) -> std::io::Result<()> {
            *self.photos.lock().unwrap() += 1;
            Ok(())
        }

        fn save_video(&self, _path: &Path) -> std::io::Result<()> {
            *self.videos.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            profile: SensitivityProfile::default(),
            photo_cooldown: Duration::from_secs(2),
            timelapse: TimelapseSettings {
                interval: Duration::from_secs(10),
                active: true,
            },
            video: VideoTiming {
                pre_roll: Duration::from_secs(5),
                quiet_timeout: Duration::from_secs(5),
                margin: Duration::from_millis(1100),
            },
        }
    }

    fn controller() -> (SessionController, Arc<FakeControl>, Arc<CountingHandoff>) {
        let control = Arc::new(FakeControl::default());
        let handoff = Arc::new(CountingHandoff::default());
        let session = SessionController::new(
            control.clone(),
            handoff.clone(),
            settings(),
            PhotoPipeline::default(),
            std::env::temp_dir(),
        );
        (session, control, handoff)
    }

    fn wide() -> MotionBox {
        MotionBox {
            x: 0,
            y: 0,
            width: 200,
            height: 50,
        }
    }

    #[test]
    fn photo_session_respects_cooldown() {
        let (mut session, _control, handoff) = controller();
        session.start(SessionMode::Photo, Duration::ZERO, Local::now()).unwrap();

        let s = Duration::from_secs;
        assert!(session.handle_motion(s(1), Local::now(), &wide()).unwrap());
        assert!(!session.handle_motion(s(2), Local::now(), &wide()).unwrap());
        assert!(session.handle_motion(s(3), Local::now(), &wide()).unwrap());
        assert_eq!(*handoff.photos.lock().unwrap(), 2);
    }

    #[test]
    fn narrow_and_full_frame_boxes_are_ignored() {
        let (mut session, control, _handoff) = controller();
        session.start(SessionMode::Photo, Duration::ZERO, Local::now()).unwrap();
        let profile = session.profile();
        for width in [profile.min_width, profile.max_width] {
            let found = MotionBox { width, ..wide() };
            assert!(!session.handle_motion(Duration::ZERO, Local::now(), &found).unwrap());
        }
        assert!(!control.calls().contains(&"still_frame".to_string()));
    }

    fn snapshot(sequence: u64, subject: bool) -> FrameSnapshot {
        let image = image::RgbImage::from_fn(320, 180, |x, y| {
            if subject && (80..230).contains(&x) && (40..160).contains(&y) {
                image::Rgb([235, 235, 235])
            } else {
                image::Rgb([25, 25, 25])
            }
        });
        FrameSnapshot {
            image,
            tier: ResolutionTier::Low,
            captured_at: Duration::ZERO,
            wall_time: Local::now(),
            sequence,
        }
    }

    #[test]
    fn repeated_snapshot_is_scored_once() {
        let (mut session, control, handoff) = controller();
        session.start(SessionMode::Photo, Duration::ZERO, Local::now()).unwrap();
        let s = Duration::from_secs;

        assert!(!session.observe(s(1), &snapshot(1, false)).unwrap());
        // same sequence number, already scored
        assert!(!session.observe(s(1), &snapshot(1, true)).unwrap());
        assert!(!control.calls().contains(&"still_frame".to_string()));

        assert!(session.observe(s(1), &snapshot(2, true)).unwrap());
        assert_eq!(*handoff.photos.lock().unwrap(), 1);
    }

    #[test]
    fn video_session_records_and_returns_to_armed() {
        let (mut session, control, handoff) = controller();
        let s = Duration::from_secs;
        session.start(SessionMode::Video, s(0), Local::now()).unwrap();
        assert_eq!(session.phase(), CapturePhase::Armed);

        session.handle_motion(s(10), Local::now(), &wide()).unwrap();
        assert_eq!(session.phase(), CapturePhase::Capturing);
        session.handle_motion(s(12), Local::now(), &wide()).unwrap();
        session.tick(s(16)).unwrap();
        assert_eq!(session.phase(), CapturePhase::Capturing);
        session.tick(s(17)).unwrap();
        assert_eq!(session.phase(), CapturePhase::Armed);
        assert_eq!(*handoff.videos.lock().unwrap(), 1);
        assert_eq!(
            control.calls().iter().filter(|c| *c == "begin_clip").count(),
            1
        );
    }

    #[test]
    fn timelapse_fires_on_interval_without_motion() {
        let (mut session, _control, handoff) = controller();
        session.start(SessionMode::Timelapse, Duration::ZERO, Local::now()).unwrap();
        for second in 0..=30 {
            session.tick(Duration::from_secs(second)).unwrap();
        }
        assert_eq!(*handoff.photos.lock().unwrap(), 3);
    }

    #[test]
    fn paused_timelapse_restarts_count_on_resume() {
        let (mut session, _control, handoff) = controller();
        let s = Duration::from_secs;
        session.start(SessionMode::Timelapse, s(0), Local::now()).unwrap();
        session.set_timelapse(
            TimelapseSettings {
                interval: s(10),
                active: false,
            },
            s(5),
        );
        session.tick(s(10)).unwrap();
        assert_eq!(*handoff.photos.lock().unwrap(), 0);

        session.set_timelapse(
            TimelapseSettings {
                interval: s(10),
                active: true,
            },
            s(12),
        );
        session.tick(s(21)).unwrap();
        assert_eq!(*handoff.photos.lock().unwrap(), 0);
        session.tick(s(22)).unwrap();
        assert_eq!(*handoff.photos.lock().unwrap(), 1);
    }

    #[test]
    fn interval_past_the_clock_range_never_fires() {
        let (mut session, _control, handoff) = controller();
        let s = Duration::from_secs;
        session.start(SessionMode::Timelapse, s(1), Local::now()).unwrap();
        session.set_timelapse(
            TimelapseSettings {
                interval: Duration::MAX,
                active: true,
            },
            s(1),
        );
        for second in 1..=30 {
            session.tick(s(second)).unwrap();
        }
        assert_eq!(*handoff.photos.lock().unwrap(), 0);
        assert_eq!(session.mode(), SessionMode::Timelapse);
    }

    #[test]
    fn switching_sessions_stops_the_previous_one() {
        let (mut session, control, handoff) = controller();
        let s = Duration::from_secs;
        session.start(SessionMode::Video, s(0), Local::now()).unwrap();
        session.handle_motion(s(1), Local::now(), &wide()).unwrap();
        session.start(SessionMode::Photo, s(2), Local::now()).unwrap();

        assert_eq!(session.mode(), SessionMode::Photo);
        assert_eq!(session.phase(), CapturePhase::Disarmed);
        assert!(control.calls().contains(&"disarm".to_string()));
        assert_eq!(*handoff.videos.lock().unwrap(), 1);
        assert_eq!(session.state().started_at, Some(s(2)));
    }

    #[test]
    fn restart_closes_clip_and_rearms() {
        let (mut session, control, handoff) = controller();
        let s = Duration::from_secs;
        session.start(SessionMode::Video, s(0), Local::now()).unwrap();
        session.handle_motion(s(1), Local::now(), &wide()).unwrap();

        let previous = CameraConfiguration::default();
        let mut next = previous.clone();
        next.rotate = true;
        session.apply_camera_config(&previous, next).unwrap();

        assert_eq!(session.phase(), CapturePhase::Armed);
        assert_eq!(*handoff.videos.lock().unwrap(), 1);
        let calls = control.calls();
        let end = calls.iter().position(|c| c == "end_clip").unwrap();
        let reconfigure = calls.iter().position(|c| c == "reconfigure").unwrap();
        assert!(end < reconfigure);
        assert_eq!(calls.last().map(String::as_str), Some("arm"));
    }
}
