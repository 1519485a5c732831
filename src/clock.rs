// SPDX-License-Identifier: GPL-3.0-only

//! Time sources
//!
//! Everything that schedules captures (encoder timestamps, quiet deadlines,
//! timelapse shots, simulated frame positions) reads time through [`Clock`]
//! so that tests can step time by hand.

use chrono::{DateTime, Local};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Monotonic and wall-clock time source
pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created
    fn now(&self) -> Duration;

    /// Local wall-clock time
    fn wall(&self) -> DateTime<Local>;
}

/// Clock backed by the operating system
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wall(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    elapsed: Mutex<Duration>,
    wall_origin: DateTime<Local>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            elapsed: Mutex::new(Duration::ZERO),
            wall_origin: Local::now(),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.elapsed.lock().unwrap() += by;
    }

    pub fn set(&self, to: Duration) {
        *self.elapsed.lock().unwrap() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.elapsed.lock().unwrap()
    }

    fn wall(&self) -> DateTime<Local> {
        let elapsed = chrono::Duration::from_std(self.now()).unwrap_or(chrono::Duration::zero());
        self.wall_origin + elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_advanced() {
        let clock = ManualClock::new();
        assert_eq!(clock.now(), Duration::ZERO);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Duration::from_millis(1500));

        clock.set(Duration::from_secs(10));
        assert_eq!(clock.now(), Duration::from_secs(10));
    }

    #[test]
    fn manual_wall_clock_tracks_elapsed() {
        let clock = ManualClock::new();
        let start = clock.wall();
        clock.advance(Duration::from_secs(60));
        assert_eq!((clock.wall() - start).num_seconds(), 60);
    }
}
