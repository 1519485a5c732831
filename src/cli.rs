// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! Each command builds a [`CameraService`] around either the real camera or a
//! simulated one and drives it for a single purpose.

use chrono::{DateTime, Local};
use fieldcam::backends::camera::CameraDevice;
use fieldcam::backends::virtual_camera::{FrameReel, SimulatedDevice};
use fieldcam::storage::{FileHandoff, FileSaver};
use fieldcam::{AppResult, CameraService, Clock, Config, SessionMode, SystemClock};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{info, warn};

/// How often `run` checks for Ctrl-C
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Size and length of the built-in reel used when no camera is available
#[cfg(not(feature = "hardware"))]
const SYNTHETIC_REEL: (u32, u32, usize) = (640, 360, 30);

/// Open the configured camera
///
/// With `simulate` set the given reel is played back; without the
/// `hardware` feature a synthetic reel stands in for the camera.
fn open_device(simulate: Option<PathBuf>, clock: Arc<dyn Clock>) -> AppResult<Box<dyn CameraDevice>> {
    if let Some(path) = simulate {
        let reel = FrameReel::open(&path)?;
        info!(source = %reel.source(), frames = reel.len(), "Using simulated camera");
        return Ok(Box::new(SimulatedDevice::new(reel, clock)));
    }

    #[cfg(feature = "hardware")]
    {
        let _ = clock;
        Ok(Box::new(fieldcam::backends::camera::LibcameraDevice::new()))
    }

    #[cfg(not(feature = "hardware"))]
    {
        let (width, height, frames) = SYNTHETIC_REEL;
        warn!("Built without camera hardware support, using a synthetic reel");
        let reel = FrameReel::synthetic(width, height, frames);
        Ok(Box::new(SimulatedDevice::new(reel, clock)))
    }
}

fn file_saver(config: &Config) -> AppResult<Arc<FileSaver>> {
    let storage = &config.storage;
    Ok(Arc::new(FileSaver::new(
        storage.photos_path(),
        storage.videos_path(),
        storage.max_disk_usage_percent,
    )?))
}

fn start_service(
    config: Config,
    simulate: Option<PathBuf>,
    handoff: Arc<dyn FileHandoff>,
) -> AppResult<CameraService> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let device = open_device(simulate, Arc::clone(&clock))?;
    CameraService::start(config, device, clock, handoff)
}

/// Run until Ctrl-C, then write the (possibly changed) config back
pub fn run(
    config: Config,
    config_path: &Path,
    simulate: Option<PathBuf>,
    session: Option<SessionMode>,
    set_system_clock: bool,
) -> AppResult<()> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .map_err(|e| format!("Failed to install Ctrl-C handler: {}", e))?;

    let saver = file_saver(&config)?;
    let mut service = start_service(config, simulate, saver.clone())?
        .with_system_clock_updates(set_system_clock);

    if let Some(mode) = session.filter(|mode| *mode != SessionMode::Idle) {
        service.start_session(mode)?;
    }
    println!("fieldcam {} running, press Ctrl-C to stop", fieldcam::VERSION);

    while !interrupted.load(Ordering::SeqCst) {
        std::thread::sleep(RUN_POLL_INTERVAL);
    }

    info!("Interrupted, shutting down");
    if let Err(e) = service.stop_session() {
        warn!(error = %e, "Failed to stop session");
    }
    let config = service.config();
    service.stop();
    saver.close();

    config.save(config_path)?;
    info!(path = %config_path.display(), "Config saved");
    Ok(())
}

/// Writes the single photo of a `photo` run to a chosen file
struct OutputFile {
    path: PathBuf,
}

impl FileHandoff for OutputFile {
    fn save_photo(&self, bytes: Vec<u8>, _taken_at: DateTime<Local>) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, bytes)
    }

    fn save_video(&self, path: &Path) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unexpected clip {}", path.display()),
        ))
    }
}

/// Take one photo
pub fn take_photo(config: Config, simulate: Option<PathBuf>, output: Option<PathBuf>) -> AppResult<()> {
    match output {
        Some(path) => {
            let handoff = Arc::new(OutputFile { path: path.clone() });
            let mut service = start_service(config, simulate, handoff)?;
            service.take_photo()?;
            service.stop();
            println!("Photo saved: {}", path.display());
        }
        None => {
            let saver = file_saver(&config)?;
            let mut service = start_service(config, simulate, saver.clone())?;
            service.take_photo()?;
            service.stop();
            saver.flush();
            println!("Photo saved to {}", saver.photos_dir().display());
        }
    }
    Ok(())
}

/// Print the validated configuration
pub fn check_config(config: &Config, config_path: &Path) -> AppResult<()> {
    config.validate()?;
    println!("# {}", config_path.display());
    let text = serde_json::to_string_pretty(config).map_err(fieldcam::errors::ConfigError::from)?;
    println!("{}", text);
    Ok(())
}

/// Start the camera, print one status report and stop
pub fn print_status(config: Config, simulate: Option<PathBuf>) -> AppResult<()> {
    let saver = file_saver(&config)?;
    let mut service = start_service(config, simulate, saver)?;
    let status = service.status();
    service.stop();

    let text = serde_json::to_string_pretty(&status).map_err(fieldcam::errors::ConfigError::from)?;
    println!("{}", text);
    Ok(())
}
