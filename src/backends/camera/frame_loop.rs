// SPDX-License-Identifier: GPL-3.0-only
//! Thread lifecycle for long-running loops
//!
//! The frame source and the motion detector each run on a dedicated thread
//! driven by a [`CaptureLoopController`]: a stop flag checked before every
//! iteration, state owned by the thread, and a teardown hook that runs on the
//! loop thread before it exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// What the loop should do after an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    Continue,
    Stop,
}

/// Owner of a loop thread
///
/// ```ignore
/// let controller = CaptureLoopController::start_with_lifecycle(
///     "frame-source",
///     move || open_device(),
///     |device| {
///         publish(device.capture_frame(ResolutionTier::Low));
///         LoopAction::Continue
///     },
///     |device| device.release(),
/// );
///
/// // `release` runs on the loop thread before `stop` returns
/// controller.stop();
/// ```
pub struct CaptureLoopController {
    thread_handle: Option<JoinHandle<()>>,
    stop_signal: Arc<AtomicBool>,
    name: String,
}

impl CaptureLoopController {
    /// Spawn `name` and run `loop_fn` until it stops or [`stop`](Self::stop) is called
    ///
    /// # Arguments
    ///
    /// * `init_fn` - Runs first on the loop thread; on `Err` the thread exits
    ///   without iterating
    /// * `loop_fn` - One iteration over the state
    /// * `teardown_fn` - Runs after the last iteration, however the loop ended
    pub fn start_with_lifecycle<S, I, F, T>(
        name: &str,
        init_fn: I,
        mut loop_fn: F,
        teardown_fn: T,
    ) -> Self
    where
        S: Send + 'static,
        I: FnOnce() -> Result<S, String> + Send + 'static,
        F: FnMut(&mut S) -> LoopAction + Send + 'static,
        T: FnOnce(&mut S) + Send + 'static,
    {
        let stop_signal = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&stop_signal);
        let thread_name = name.to_string();

        info!(name, "Starting loop thread");

        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            let mut state = match init_fn() {
                Ok(state) => state,
                Err(e) => {
                    warn!(name = %thread_name, error = %e, "Loop initialisation failed");
                    return;
                }
            };

            while !stop.load(Ordering::SeqCst) {
                if loop_fn(&mut state) == LoopAction::Stop {
                    debug!(name = %thread_name, "Loop requested stop");
                    break;
                }
            }

            teardown_fn(&mut state);
            info!(name = %thread_name, "Loop thread exiting");
        });

        let thread_handle = match spawned {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(name, error = %e, "Failed to spawn loop thread");
                None
            }
        };

        Self {
            thread_handle,
            stop_signal,
            name: name.to_string(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Raise the stop flag without waiting
    pub fn request_stop(&self) {
        debug!(name = %self.name, "Requesting loop stop");
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Raise the stop flag and wait for teardown to finish
    pub fn stop(&mut self) {
        self.request_stop();
        self.join();
    }

    /// Wait for the thread to exit on its own
    pub fn join(&mut self) {
        if let Some(handle) = self.thread_handle.take()
            && let Err(e) = handle.join()
        {
            warn!(name = %self.name, "Loop thread panicked: {:?}", e);
        }
    }
}

impl Drop for CaptureLoopController {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn counting(limit: u32, counter: Arc<AtomicU32>) -> CaptureLoopController {
        CaptureLoopController::start_with_lifecycle(
            "counting",
            || Ok(()),
            move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) + 1 >= limit {
                    LoopAction::Stop
                } else {
                    LoopAction::Continue
                }
            },
            |_| {},
        )
    }

    #[test]
    fn loop_stops_itself() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut controller = counting(5, Arc::clone(&counter));
        controller.join();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert!(!controller.is_running());
    }

    #[test]
    fn stop_runs_teardown_on_state() {
        let released = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&released);

        let mut controller = CaptureLoopController::start_with_lifecycle(
            "teardown",
            || Ok(0u32),
            |iterations| {
                *iterations += 1;
                thread::sleep(Duration::from_millis(5));
                LoopAction::Continue
            },
            move |iterations| {
                assert!(*iterations > 0);
                flag.store(true, Ordering::SeqCst);
            },
        );

        thread::sleep(Duration::from_millis(30));
        controller.stop();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_init_skips_loop_and_teardown() {
        let touched = Arc::new(AtomicBool::new(false));
        let in_loop = Arc::clone(&touched);
        let in_teardown = Arc::clone(&touched);

        let mut controller = CaptureLoopController::start_with_lifecycle(
            "failing",
            || Err::<(), _>("no camera".to_string()),
            move |_| {
                in_loop.store(true, Ordering::SeqCst);
                LoopAction::Stop
            },
            move |_| in_teardown.store(true, Ordering::SeqCst),
        );

        controller.join();
        assert!(!touched.load(Ordering::SeqCst));
    }
}
