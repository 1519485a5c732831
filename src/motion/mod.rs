// SPDX-License-Identifier: GPL-3.0-only

//! Motion detector thread
//!
//! Samples the frame source's latest snapshot every ~33 ms, scores it and
//! drives the [`SessionController`]. Commands from the service (start/stop a
//! session, change sensitivity...) are closures run on this thread between
//! samples, the same way the frame source takes its commands.

pub mod detector;
pub mod sensitivity;
pub mod session;

pub use detector::{MotionBox, MotionScorer};
pub use sensitivity::{SensitivityPreset, SensitivityProfile};
pub use session::{SessionController, SessionMode, SessionSettings, SessionState, TimelapseSettings};

use crate::backends::camera::SnapshotCell;
use crate::backends::camera::frame_loop::{CaptureLoopController, LoopAction};
use crate::clock::Clock;
use crate::constants::timing;
use crate::errors::CommandError;
use crate::pipelines::video::CapturePhase;
use futures::channel::oneshot;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

type Job = Box<dyn FnOnce(&mut DetectorWorker) + Send>;

/// State owned by the detector thread
pub struct DetectorWorker {
    session: SessionController,
    cell: Arc<SnapshotCell>,
    clock: Arc<dyn Clock>,
    commands: Receiver<Job>,
}

impl DetectorWorker {
    pub fn session(&mut self) -> &mut SessionController {
        &mut self.session
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// One sampling pass
    ///
    /// Errors are logged: a failed capture must not stop motion detection.
    pub fn sample(&mut self) {
        let now = self.clock.now();
        if let Some(snapshot) = self.cell.latest()
            && let Err(e) = self.session.observe(now, &snapshot)
        {
            warn!(error = %e, "Motion capture failed");
        }
        if let Err(e) = self.session.tick(now) {
            warn!(error = %e, "Scheduled capture failed");
        }
    }

    fn step(&mut self) -> LoopAction {
        loop {
            match self.commands.try_recv() {
                Ok(job) => job(self),
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => return LoopAction::Stop,
            }
        }

        self.sample();

        match self.commands.recv_timeout(timing::MOTION_SAMPLE_INTERVAL) {
            Ok(job) => {
                job(self);
                LoopAction::Continue
            }
            Err(RecvTimeoutError::Timeout) => LoopAction::Continue,
            Err(RecvTimeoutError::Disconnected) => LoopAction::Stop,
        }
    }
}

/// Cloneable access to a running detector
#[derive(Clone)]
pub struct DetectorHandle {
    commands: Sender<Job>,
    state: Arc<RwLock<SessionState>>,
    phase: Arc<RwLock<CapturePhase>>,
}

impl DetectorHandle {
    /// Run `f` on the detector thread and wait for its result
    pub fn call<R, F>(&self, f: F) -> Result<R, CommandError>
    where
        R: Send + 'static,
        F: FnOnce(&mut DetectorWorker) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Box::new(move |worker| {
                let _ = tx.send(f(worker));
            }))
            .map_err(|_| CommandError::DetectorStopped)?;
        futures::executor::block_on(rx).map_err(|_| CommandError::DetectorStopped)
    }

    /// Current session, never waits on the detector
    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap()
    }

    pub fn phase(&self) -> CapturePhase {
        *self.phase.read().unwrap()
    }

    pub fn start_session(&self, mode: SessionMode) -> Result<(), CommandError> {
        self.call(move |worker| {
            let (now, wall) = (worker.clock.now(), worker.clock.wall());
            worker.session.start(mode, now, wall)
        })?
    }

    pub fn stop_session(&self) -> Result<(), CommandError> {
        self.call(|worker| worker.session.stop())?
    }
}

/// Running detector thread
pub struct MotionDetector {
    controller: CaptureLoopController,
    handle: DetectorHandle,
}

impl MotionDetector {
    pub fn spawn(session: SessionController, cell: Arc<SnapshotCell>, clock: Arc<dyn Clock>) -> Self {
        let (commands, receiver) = mpsc::channel::<Job>();
        let handle = DetectorHandle {
            commands,
            state: session.shared_state(),
            phase: session.shared_phase(),
        };
        let worker = DetectorWorker {
            session,
            cell,
            clock,
            commands: receiver,
        };

        let controller = CaptureLoopController::start_with_lifecycle(
            "motion-detector",
            move || Ok(worker),
            DetectorWorker::step,
            |worker| {
                worker.session.shutdown();
                info!("Motion detector stopped");
            },
        );

        Self { controller, handle }
    }

    pub fn handle(&self) -> DetectorHandle {
        self.handle.clone()
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_running()
    }

    /// Stop sampling; the session is stopped before the thread exits
    pub fn stop(&mut self) {
        self.controller.request_stop();
        let _ = self.handle.commands.send(Box::new(|_| {}));
        self.controller.join();
    }
}

impl Drop for MotionDetector {
    fn drop(&mut self) {
        self.stop();
    }
}
