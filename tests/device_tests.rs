// SPDX-License-Identifier: GPL-3.0-only

//! Camera device and frame source behaviour

use fieldcam::backends::camera::{
    CameraConfiguration, CameraDevice, ExposureMode, ExposureSettings, FrameSource, LedState,
    ResolutionPreset, ResolutionTier, ShutterTable, focus_with_retry,
};
use fieldcam::backends::virtual_camera::{FrameReel, SimulatedDevice};
use fieldcam::clock::{Clock, ManualClock};
use fieldcam::errors::HalError;
use fieldcam::pipelines::CaptureControl;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn simulated() -> (SimulatedDevice, Arc<dyn Clock>) {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
    let device = SimulatedDevice::new(FrameReel::synthetic(64, 48, 8), Arc::clone(&clock))
        .with_hires_dimensions(64, 48);
    (device, clock)
}

/// Poll `condition` for up to two seconds
fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn initialise_twice_leaves_one_open_camera() {
    let (mut device, _clock) = simulated();
    let controls = device.controls();

    device.initialise(CameraConfiguration::default()).unwrap();
    let first = device.capture_frame(ResolutionTier::Low).unwrap();
    device.initialise(CameraConfiguration::default()).unwrap();
    let second = device.capture_frame(ResolutionTier::Low).unwrap();

    assert_eq!(controls.open_handles(), 1);
    assert_eq!((first.width, first.height), (second.width, second.height));
    assert_eq!(first.data, second.data);
}

#[test]
fn frame_source_publishes_snapshots() {
    let (device, clock) = simulated();
    let source = FrameSource::spawn(Box::new(device), CameraConfiguration::default(), clock).unwrap();
    let handle = source.handle();

    assert!(eventually(|| handle.latest().is_some()));
    let snapshot = handle.latest().unwrap();
    assert_eq!(snapshot.image.dimensions(), (320, 180));
}

#[test]
fn capture_faults_reinitialise_the_camera() {
    let (device, clock) = simulated();
    let controls = device.controls();
    controls.fail_next_captures(2);

    let source = FrameSource::spawn(Box::new(device), CameraConfiguration::default(), clock).unwrap();
    let handle = source.handle();

    assert!(eventually(|| handle.reinitialisations() >= 2));
    assert!(eventually(|| handle.latest().is_some()));
    assert_eq!(controls.open_handles(), 1);
    assert!(controls.initialisations() >= 3);
}

#[test]
fn startup_failure_is_reported_and_releases_camera() {
    let (device, clock) = simulated();
    let controls = device.controls();
    controls.set_fail_initialise(true);

    let result = FrameSource::spawn(Box::new(device), CameraConfiguration::default(), clock);
    assert!(matches!(result, Err(HalError::DeviceUnavailable(_))));
    assert_eq!(controls.open_handles(), 0);
}

#[test]
fn stopping_the_source_releases_the_camera() {
    let (device, clock) = simulated();
    let controls = device.controls();
    let mut source =
        FrameSource::spawn(Box::new(device), CameraConfiguration::default(), clock).unwrap();
    assert_eq!(controls.open_handles(), 1);

    source.stop();
    assert_eq!(controls.open_handles(), 0);
    assert!(source.handle().configuration().is_err());
}

#[test]
fn layout_change_restarts_camera() {
    let (device, clock) = simulated();
    let controls = device.controls();
    let source = FrameSource::spawn(Box::new(device), CameraConfiguration::default(), clock).unwrap();
    let handle = source.handle();

    let mut next = CameraConfiguration::default();
    next.resolution = ResolutionPreset::FourThree;
    handle.reconfigure(next).unwrap();

    assert_eq!(controls.initialisations(), 2);
    assert_eq!(controls.open_handles(), 1);
    assert!(eventually(|| {
        handle
            .latest()
            .is_some_and(|snapshot| snapshot.image.dimensions() == (320, 240))
    }));
}

#[test]
fn control_change_keeps_camera_running() {
    let (device, clock) = simulated();
    let controls = device.controls();
    let source = FrameSource::spawn(Box::new(device), CameraConfiguration::default(), clock).unwrap();
    let handle = source.handle();

    let mut next = CameraConfiguration::default();
    next.led = LedState::On;
    handle.reconfigure(next).unwrap();

    assert_eq!(controls.initialisations(), 1);
    assert!(controls.led_on());
}

#[test]
fn manual_shutter_reads_back_quantized() {
    let (device, clock) = simulated();
    let source = FrameSource::spawn(Box::new(device), CameraConfiguration::default(), clock).unwrap();
    let handle = source.handle();

    let mut next = CameraConfiguration::default();
    next.exposure = ExposureSettings {
        mode: ExposureMode::Manual,
        shutter_us: 712,
        gain: 2.0,
    };
    handle.reconfigure(next).unwrap();

    let readback = handle.exposure_readback(ShutterTable::default()).unwrap();
    assert_eq!(readback.shutter_us, 625);
    assert_eq!(readback.gain, 2.0);
}

#[test]
fn autofocus_retries_until_lock() {
    let (device, _clock) = simulated();
    let mut device = device.with_autofocus(true);
    let controls = device.controls();
    device.initialise(CameraConfiguration::default()).unwrap();

    controls.fail_autofocus_cycles(2);
    focus_with_retry(&mut device, 5, Duration::ZERO).unwrap();
    assert_eq!(controls.autofocus_cycles(), 3);
}

#[test]
fn autofocus_gives_up_after_attempts() {
    let (device, _clock) = simulated();
    let mut device = device.with_autofocus(true);
    let controls = device.controls();
    device.initialise(CameraConfiguration::default()).unwrap();

    controls.fail_autofocus_cycles(10);
    let result = focus_with_retry(&mut device, 5, Duration::ZERO);
    assert!(matches!(result, Err(HalError::AutofocusTimeout { attempts: 5 })));
    assert_eq!(controls.autofocus_cycles(), 5);
}

#[test]
fn autofocus_unsupported_without_motor() {
    let (mut device, _clock) = simulated();
    device.initialise(CameraConfiguration::default()).unwrap();
    assert!(matches!(
        focus_with_retry(&mut device, 5, Duration::ZERO),
        Err(HalError::Unsupported(_))
    ));
    assert!(!device.autofocus());
}

#[test]
fn refused_control_change_keeps_previous_configuration() {
    let (device, clock) = simulated();
    let controls = device.controls();
    let source = FrameSource::spawn(Box::new(device), CameraConfiguration::default(), clock).unwrap();
    let handle = source.handle();

    controls.set_fail_controls(true);
    let mut next = CameraConfiguration::default();
    next.led = LedState::On;
    assert!(handle.reconfigure(next).is_err());
    assert_eq!(handle.configuration().unwrap().led, LedState::Off);
    assert!(!controls.led_on());

    // a restart after a fault brings up the settings that were accepted
    controls.set_fail_controls(false);
    controls.fail_next_captures(1);
    assert!(eventually(|| handle.reinitialisations() >= 1));
    assert!(eventually(|| handle.latest().is_some()));
    assert_eq!(handle.configuration().unwrap().led, LedState::Off);
    assert!(!controls.led_on());
}

#[test]
fn hires_still_matches_resolution_preset() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
    let device = SimulatedDevice::new(FrameReel::synthetic(64, 48, 4), Arc::clone(&clock));
    let source = FrameSource::spawn(Box::new(device), CameraConfiguration::default(), clock).unwrap();
    let handle = source.handle();

    let still = handle.still_frame().unwrap();
    assert_eq!(still.image.dimensions(), ResolutionPreset::FullHd.dimensions());
}
