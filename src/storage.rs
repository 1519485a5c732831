// SPDX-License-Identifier: MPL-2.0

//! Persisting finished photos and clips
//!
//! The capture pipelines hand artifacts to a [`FileHandoff`] and move on.
//! [`FileSaver`] queues them to a background thread running a tokio runtime,
//! so the capture and detector threads never wait on the disk.

use crate::constants::storage::FILE_TIMESTAMP_FORMAT;
use chrono::{DateTime, Local};
use futures::channel::oneshot;
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Receiver of finished artifacts
///
/// Both calls return once the artifact is queued; errors cover only what can
/// be known up front (e.g. a full disk).
pub trait FileHandoff: Send + Sync {
    fn save_photo(&self, bytes: Vec<u8>, taken_at: DateTime<Local>) -> io::Result<()>;

    /// Take ownership of a closed clip file
    fn save_video(&self, path: &Path) -> io::Result<()>;
}

/// Percentage of the filesystem holding `path` in use, as `df` reports it
pub fn disk_usage_percent(path: &Path) -> io::Result<f64> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };

    let result = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }

    let used = stat.f_blocks as f64 - stat.f_bfree as f64;
    let total = used + stat.f_bavail as f64;
    if total <= 0.0 {
        return Ok(0.0);
    }
    Ok(used / total * 100.0)
}

enum SaveJob {
    Photo {
        bytes: Vec<u8>,
        taken_at: DateTime<Local>,
    },
    Video {
        path: PathBuf,
    },
    Flush(oneshot::Sender<()>),
}

/// Writes photos and moves clips into the media directories
pub struct FileSaver {
    photos_dir: PathBuf,
    videos_dir: PathBuf,
    max_usage_percent: f64,
    jobs: Mutex<Option<mpsc::UnboundedSender<SaveJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FileSaver {
    /// Create the media directories and start the writer thread
    pub fn new(photos_dir: PathBuf, videos_dir: PathBuf, max_usage_percent: u8) -> io::Result<Self> {
        std::fs::create_dir_all(&photos_dir)?;
        std::fs::create_dir_all(&videos_dir)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<SaveJob>();

        let worker_photos = photos_dir.clone();
        let worker_videos = videos_dir.clone();
        let worker = std::thread::Builder::new()
            .name("file-saver".into())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(job) = rx.recv().await {
                        match job {
                            SaveJob::Photo { bytes, taken_at } => {
                                match write_photo(&worker_photos, bytes, taken_at).await {
                                    Ok(path) => info!(path = %path.display(), "Photo saved"),
                                    Err(e) => error!(error = %e, "Failed to save photo"),
                                }
                            }
                            SaveJob::Video { path } => match move_clip(&worker_videos, &path).await {
                                Ok(dest) => info!(path = %dest.display(), "Video saved"),
                                Err(e) => {
                                    error!(error = %e, path = %path.display(), "Failed to save video")
                                }
                            },
                            SaveJob::Flush(done) => {
                                let _ = done.send(());
                            }
                        }
                    }
                    debug!("File saver queue closed");
                });
            })?;

        Ok(Self {
            photos_dir,
            videos_dir,
            max_usage_percent: max_usage_percent as f64,
            jobs: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn photos_dir(&self) -> &Path {
        &self.photos_dir
    }

    pub fn videos_dir(&self) -> &Path {
        &self.videos_dir
    }

    /// Refuse new artifacts once the disk is nearly full
    fn check_space(&self) -> io::Result<()> {
        match disk_usage_percent(&self.photos_dir) {
            Ok(usage) if usage >= self.max_usage_percent => Err(io::Error::new(
                io::ErrorKind::StorageFull,
                format!("disk {:.1}% full", usage),
            )),
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Could not read disk usage");
                Ok(())
            }
        }
    }

    fn enqueue(&self, job: SaveJob) -> io::Result<()> {
        let jobs = self.jobs.lock().unwrap();
        let sender = jobs
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "file saver closed"))?;
        sender
            .send(job)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "file saver stopped"))
    }

    /// Block until everything queued so far has been written
    pub fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.enqueue(SaveJob::Flush(tx)).is_ok() {
            let _ = futures::executor::block_on(rx);
        }
    }

    /// Finish queued work and stop the writer thread
    pub fn close(&self) {
        self.jobs.lock().unwrap().take();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            if worker.join().is_err() {
                warn!("File saver thread panicked");
            }
        }
    }
}

impl FileHandoff for FileSaver {
    fn save_photo(&self, bytes: Vec<u8>, taken_at: DateTime<Local>) -> io::Result<()> {
        self.check_space()?;
        self.enqueue(SaveJob::Photo { bytes, taken_at })
    }

    fn save_video(&self, path: &Path) -> io::Result<()> {
        if let Err(e) = self.check_space() {
            // the clip is already on disk, drop it rather than fill the card
            let _ = std::fs::remove_file(path);
            return Err(e);
        }
        self.enqueue(SaveJob::Video {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for FileSaver {
    fn drop(&mut self) {
        self.close();
    }
}

/// First free `<stem>.<ext>`, `<stem>-1.<ext>`, ... in `dir`
async fn unique_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let mut candidate = dir.join(format!("{}.{}", stem, extension));
    let mut n = 1;
    while tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        candidate = dir.join(format!("{}-{}.{}", stem, n, extension));
        n += 1;
    }
    candidate
}

async fn write_photo(dir: &Path, bytes: Vec<u8>, taken_at: DateTime<Local>) -> io::Result<PathBuf> {
    let extension = image::guess_format(&bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("jpg");
    let stem = taken_at.format(FILE_TIMESTAMP_FORMAT).to_string();
    let path = unique_path(dir, &stem, extension).await;
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}

async fn move_clip(dir: &Path, source: &Path) -> io::Result<PathBuf> {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| Local::now().format(FILE_TIMESTAMP_FORMAT).to_string());
    let extension = source
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dest = unique_path(dir, &stem, &extension).await;

    if tokio::fs::rename(source, &dest).await.is_err() {
        // staging dir on another filesystem
        tokio::fs::copy(source, &dest).await?;
        tokio::fs::remove_file(source).await?;
    }
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("fieldcam-saver-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn disk_usage_is_a_percentage() {
        let usage = disk_usage_percent(&std::env::temp_dir()).unwrap();
        assert!((0.0..=100.0).contains(&usage));
    }

    #[test]
    fn photos_get_timestamp_names() {
        let dir = scratch_dir();
        let saver = FileSaver::new(dir.join("photos"), dir.join("videos"), 100).unwrap();
        let taken_at = Local::now();
        let jpeg = crate::pipelines::photo::encoding::encode_jpeg(
            &image::RgbImage::new(4, 4),
            80,
        )
        .unwrap();

        saver.save_photo(jpeg.clone(), taken_at).unwrap();
        saver.save_photo(jpeg, taken_at).unwrap();
        saver.flush();

        let stem = taken_at.format(FILE_TIMESTAMP_FORMAT).to_string();
        assert!(dir.join("photos").join(format!("{}.jpg", stem)).exists());
        assert!(dir.join("photos").join(format!("{}-1.jpg", stem)).exists());
        drop(saver);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn clips_move_into_videos_dir() {
        let dir = scratch_dir();
        let saver = FileSaver::new(dir.join("photos"), dir.join("videos"), 100).unwrap();
        let staged = dir.join("clip-1.mjpg");
        std::fs::write(&staged, b"frames").unwrap();

        saver.save_video(&staged).unwrap();
        saver.flush();

        assert!(!staged.exists());
        assert_eq!(
            std::fs::read(dir.join("videos").join("clip-1.mjpg")).unwrap(),
            b"frames"
        );
        drop(saver);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn full_disk_refuses_saves() {
        let dir = scratch_dir();
        let saver = FileSaver::new(dir.join("photos"), dir.join("videos"), 0).unwrap();

        let err = saver.save_photo(vec![1, 2, 3], Local::now()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::StorageFull);

        let staged = dir.join("clip.mjpg");
        std::fs::write(&staged, b"x").unwrap();
        assert!(saver.save_video(&staged).is_err());
        drop(saver);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn closed_saver_rejects_work() {
        let dir = scratch_dir();
        let saver = FileSaver::new(dir.join("photos"), dir.join("videos"), 100).unwrap();
        saver.close();
        assert!(saver.save_photo(vec![0], Local::now()).is_err());
        std::fs::remove_dir_all(dir).ok();
    }
}
