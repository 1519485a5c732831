// SPDX-License-Identifier: GPL-3.0-only

//! Circular pre-roll output
//!
//! The encoder writes every frame into a fixed-capacity ring. When a clip is
//! started the ring is flushed into the clip from the newest keyframe that is
//! at least `pre_roll` old, and from then on live frames are appended. The
//! ring keeps filling while a clip is open, so the encoder never has to be
//! restarted between clips.

use crate::backends::camera::RecordedClip;
use crate::errors::{CaptureError, HalResult};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Number of ring slots needed to hold `pre_roll + margin` at `frame_rate`
pub fn preroll_capacity(frame_rate: u32, pre_roll: Duration, margin: Duration) -> usize {
    ((frame_rate as f64) * (pre_roll + margin).as_secs_f64()).floor().max(1.0) as usize
}

/// How much footage to keep ahead of a trigger
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrerollWindow {
    pub pre_roll: Duration,
    pub margin: Duration,
}

impl PrerollWindow {
    pub fn capacity(&self, frame_rate: u32) -> usize {
        preroll_capacity(frame_rate, self.pre_roll, self.margin)
    }
}

/// One compressed frame as produced by the encoder
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub pts: Duration,
    pub keyframe: bool,
    pub data: Arc<[u8]>,
}

/// On-disk layout of a clip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipFormat {
    /// Each frame prefixed with its timestamp, flags and length
    Framed,
    /// Encoder bitstream written back to back (H.264 Annex B)
    RawStream,
}

impl ClipFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ClipFormat::Framed => "mjpg",
            ClipFormat::RawStream => "h264",
        }
    }
}

const FLAG_KEYFRAME: u8 = 0x01;

/// Sequential writer for one clip
pub struct ClipWriter {
    path: PathBuf,
    out: BufWriter<File>,
    format: ClipFormat,
    frames: usize,
    first_pts: Option<Duration>,
    last_pts: Option<Duration>,
}

impl ClipWriter {
    pub fn create(path: &Path, format: ClipFormat) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(file),
            format,
            frames: 0,
            first_pts: None,
            last_pts: None,
        })
    }

    pub fn write(&mut self, frame: &EncodedFrame) -> io::Result<()> {
        if self.format == ClipFormat::Framed {
            let pts_us = frame.pts.as_micros() as u64;
            self.out.write_all(&pts_us.to_le_bytes())?;
            self.out
                .write_all(&[if frame.keyframe { FLAG_KEYFRAME } else { 0 }])?;
            self.out.write_all(&(frame.data.len() as u32).to_le_bytes())?;
        }
        self.out.write_all(&frame.data)?;

        self.frames += 1;
        self.first_pts.get_or_insert(frame.pts);
        self.last_pts = Some(frame.pts);
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<RecordedClip> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(RecordedClip {
            path: self.path,
            frames: self.frames,
            first_pts: self.first_pts,
            last_pts: self.last_pts,
        })
    }
}

/// Read back a clip written in [`ClipFormat::Framed`]
pub fn read_framed(path: &Path) -> io::Result<Vec<EncodedFrame>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut frames = Vec::new();
    let mut header = [0u8; 13];

    loop {
        match reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
        let mut pts = [0u8; 8];
        pts.copy_from_slice(&header[..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&header[9..13]);

        let mut data = vec![0u8; u32::from_le_bytes(len) as usize];
        reader.read_exact(&mut data)?;
        frames.push(EncodedFrame {
            pts: Duration::from_micros(u64::from_le_bytes(pts)),
            keyframe: header[8] & FLAG_KEYFRAME != 0,
            data: data.into(),
        });
    }

    Ok(frames)
}

/// Fixed-capacity ring of encoded frames with an optional clip output
pub struct CircularOutput {
    ring: VecDeque<EncodedFrame>,
    capacity: usize,
    pre_roll: Duration,
    writer: Option<ClipWriter>,
    last_written: Option<Duration>,
    awaiting_keyframe: bool,
}

impl CircularOutput {
    pub fn new(capacity: usize, pre_roll: Duration) -> Self {
        debug!(capacity, pre_roll_secs = pre_roll.as_secs_f64(), "Allocating pre-roll ring");
        Self {
            ring: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            pre_roll,
            writer: None,
            last_written: None,
            awaiting_keyframe: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn is_writing(&self) -> bool {
        self.writer.is_some()
    }

    /// Timestamp of the newest frame in the ring
    pub fn newest_pts(&self) -> Option<Duration> {
        self.ring.back().map(|f| f.pts)
    }

    /// Add a frame from the encoder
    ///
    /// Frames at or before the last written timestamp are kept in the ring
    /// but never written again.
    pub fn push(&mut self, frame: EncodedFrame) -> io::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            let newer = self.last_written.is_none_or(|last| frame.pts > last);
            if newer && (!self.awaiting_keyframe || frame.keyframe) {
                self.awaiting_keyframe = false;
                writer.write(&frame)?;
                self.last_written = Some(frame.pts);
            }
        }

        self.ring.push_back(frame);
        while self.ring.len() > self.capacity {
            self.ring.pop_front();
        }
        Ok(())
    }

    /// Open a clip and flush the pre-roll into it
    ///
    /// Returns the number of frames taken from the ring.
    pub fn start(&mut self, mut writer: ClipWriter) -> HalResult<usize> {
        if self.writer.is_some() {
            return Err(CaptureError::AlreadyCapturing.into());
        }

        let start = self.flush_start();
        let mut flushed = 0;
        let mut last_written = None;
        if let Some(start) = start {
            for frame in self.ring.iter().skip(start) {
                writer.write(frame)?;
                last_written = Some(frame.pts);
                flushed += 1;
            }
        }

        info!(
            path = %writer.path.display(),
            flushed,
            ring = self.ring.len(),
            "Clip output started"
        );

        self.awaiting_keyframe = start.is_none();
        self.last_written = last_written;
        self.writer = Some(writer);
        Ok(flushed)
    }

    /// Close the clip, the ring keeps filling
    pub fn stop(&mut self) -> HalResult<RecordedClip> {
        let writer = self.writer.take().ok_or(CaptureError::NotCapturing)?;
        self.last_written = None;
        self.awaiting_keyframe = false;
        let clip = writer.finish()?;
        info!(path = %clip.path.display(), frames = clip.frames, "Clip output stopped");
        Ok(clip)
    }

    /// Index of the keyframe the flush begins at
    fn flush_start(&self) -> Option<usize> {
        let newest = self.newest_pts()?;
        let cutoff = newest.saturating_sub(self.pre_roll);
        self.ring
            .iter()
            .rposition(|f| f.keyframe && f.pts <= cutoff)
            .or_else(|| self.ring.iter().position(|f| f.keyframe))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fieldcam-ring-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn frame(ms: u64, keyframe: bool) -> EncodedFrame {
        EncodedFrame {
            pts: Duration::from_millis(ms),
            keyframe,
            data: Arc::from(ms.to_le_bytes().as_slice()),
        }
    }

    #[test]
    fn capacity_matches_rate_and_window() {
        let cap = preroll_capacity(30, Duration::from_secs(5), Duration::from_millis(1100));
        assert_eq!(cap, 183);
        assert_eq!(preroll_capacity(0, Duration::ZERO, Duration::ZERO), 1);
    }

    #[test]
    fn ring_drops_oldest() {
        let mut out = CircularOutput::new(3, Duration::from_secs(1));
        for ms in 0..5 {
            out.push(frame(ms * 100, true)).unwrap();
        }
        assert_eq!(out.len(), 3);
        assert_eq!(out.newest_pts(), Some(Duration::from_millis(400)));
    }

    #[test]
    fn flush_starts_at_keyframe_before_window() {
        let dir = scratch_dir();
        let mut out = CircularOutput::new(100, Duration::from_millis(500));
        // keyframes every 300ms, frames every 100ms, newest at 1500ms
        for i in 0..=15 {
            out.push(frame(i * 100, i % 3 == 0)).unwrap();
        }

        let path = dir.join("clip.mjpg");
        let flushed = out
            .start(ClipWriter::create(&path, ClipFormat::Framed).unwrap())
            .unwrap();
        out.push(frame(1600, false)).unwrap();
        let clip = out.stop().unwrap();

        // cutoff is 1000ms, the newest keyframe at or before it is 900ms
        assert_eq!(flushed, 7);
        assert_eq!(clip.first_pts, Some(Duration::from_millis(900)));
        assert_eq!(clip.last_pts, Some(Duration::from_millis(1600)));

        let frames = read_framed(&path).unwrap();
        assert_eq!(frames.len(), 8);
        assert!(frames[0].keyframe);
        assert!(frames.windows(2).all(|w| w[0].pts < w[1].pts));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn splice_never_duplicates() {
        let dir = scratch_dir();
        let mut out = CircularOutput::new(10, Duration::from_millis(200));
        for i in 0..5 {
            out.push(frame(i * 100, true)).unwrap();
        }
        let path = dir.join("clip.mjpg");
        out.start(ClipWriter::create(&path, ClipFormat::Framed).unwrap())
            .unwrap();
        // replayed and stale frames are ignored
        out.push(frame(400, true)).unwrap();
        out.push(frame(300, true)).unwrap();
        out.push(frame(500, true)).unwrap();
        out.stop().unwrap();

        let pts: Vec<u64> = read_framed(&path)
            .unwrap()
            .iter()
            .map(|f| f.pts.as_millis() as u64)
            .collect();
        assert_eq!(pts, vec![200, 300, 400, 500]);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn waits_for_keyframe_when_ring_has_none() {
        let dir = scratch_dir();
        let mut out = CircularOutput::new(10, Duration::from_secs(1));
        out.push(frame(0, false)).unwrap();
        let path = dir.join("clip.h264");
        let flushed = out
            .start(ClipWriter::create(&path, ClipFormat::RawStream).unwrap())
            .unwrap();
        assert_eq!(flushed, 0);

        out.push(frame(100, false)).unwrap();
        out.push(frame(200, true)).unwrap();
        out.push(frame(300, false)).unwrap();
        let clip = out.stop().unwrap();
        assert_eq!(clip.frames, 2);
        assert_eq!(clip.first_pts, Some(Duration::from_millis(200)));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn double_start_is_rejected() {
        let dir = scratch_dir();
        let mut out = CircularOutput::new(4, Duration::from_secs(1));
        out.push(frame(0, true)).unwrap();
        out.start(ClipWriter::create(&dir.join("a.mjpg"), ClipFormat::Framed).unwrap())
            .unwrap();
        let second = out.start(ClipWriter::create(&dir.join("b.mjpg"), ClipFormat::Framed).unwrap());
        assert!(second.is_err());
        assert!(out.stop().is_ok());
        assert!(out.stop().is_err());
        std::fs::remove_dir_all(dir).ok();
    }
}
