// SPDX-License-Identifier: GPL-3.0-only

//! Latest-frame cell shared between the frame source and its readers
//!
//! A single writer replaces the stored snapshot; any number of readers clone
//! the `Arc` under a read lock. Readers never wait on the capture loop beyond
//! that pointer copy, and a published snapshot is never mutated.

use super::types::ResolutionTier;
use chrono::{DateTime, Local};
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Immutable decoded frame
#[derive(Debug)]
pub struct FrameSnapshot {
    pub image: RgbImage,
    pub tier: ResolutionTier,
    /// Monotonic capture time
    pub captured_at: Duration,
    pub wall_time: DateTime<Local>,
    /// Increases by one for every published low-res frame
    pub sequence: u64,
}

/// Single-writer, multi-reader slot holding the latest snapshot
#[derive(Debug, Default)]
pub struct SnapshotCell {
    slot: RwLock<Option<Arc<FrameSnapshot>>>,
    sequence: AtomicU64,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored snapshot, returns its sequence number
    pub fn publish(
        &self,
        image: RgbImage,
        tier: ResolutionTier,
        captured_at: Duration,
        wall_time: DateTime<Local>,
    ) -> u64 {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(FrameSnapshot {
            image,
            tier,
            captured_at,
            wall_time,
            sequence,
        });
        *self.slot.write().unwrap() = Some(snapshot);
        sequence
    }

    pub fn latest(&self) -> Option<Arc<FrameSnapshot>> {
        self.slot.read().unwrap().clone()
    }

    /// Sequence number of the latest snapshot, 0 before the first publish
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn empty_until_first_publish() {
        let cell = SnapshotCell::new();
        assert!(cell.latest().is_none());
        assert_eq!(cell.sequence(), 0);
    }

    #[test]
    fn readers_keep_their_copy() {
        let cell = SnapshotCell::new();
        cell.publish(RgbImage::new(2, 2), ResolutionTier::Low, Duration::ZERO, Local::now());
        let held = cell.latest().unwrap();

        cell.publish(RgbImage::new(4, 4), ResolutionTier::Low, Duration::from_millis(33), Local::now());
        assert_eq!(held.image.width(), 2);
        assert_eq!(held.sequence, 1);
        assert_eq!(cell.latest().unwrap().sequence, 2);
    }

    #[test]
    fn concurrent_readers_see_monotonic_sequence() {
        let cell = Arc::new(SnapshotCell::new());
        let writer = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                for i in 0..200u64 {
                    cell.publish(
                        RgbImage::new(1, 1),
                        ResolutionTier::Low,
                        Duration::from_millis(i),
                        Local::now(),
                    );
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..200 {
                        if let Some(snap) = cell.latest() {
                            assert!(snap.sequence >= last);
                            last = snap.sequence;
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(cell.sequence(), 200);
    }
}
