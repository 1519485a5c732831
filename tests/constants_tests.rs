// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for constants module

use fieldcam::backends::camera::ShutterTable;
use fieldcam::constants::{clock_sync, exposure, motion, video};
use fieldcam::motion::SensitivityPreset;
use fieldcam::pipelines::video::preroll_capacity;
use std::time::Duration;

#[test]
fn test_shutter_table_is_sorted() {
    for pair in exposure::DEFAULT_SHUTTER_TABLE_US.windows(2) {
        assert!(pair[0] < pair[1], "{} before {}", pair[0], pair[1]);
    }
}

#[test]
fn test_shutter_quantization() {
    let table = ShutterTable::default();
    assert_eq!(table.quantize(712.0), 625);
    assert_eq!(table.quantize(1406.5), 1250);
    assert_eq!(table.quantize(10.0), 250);
    assert_eq!(table.quantize(1_000_000.0), 33333);
}

#[test]
fn test_tie_picks_smaller_entry() {
    let table = ShutterTable::new(vec![800, 1200]).unwrap();
    assert_eq!(table.quantize(1000.0), 800);
}

#[test]
fn test_sensitivity_bands_are_ordered() {
    assert!(motion::MORE_SENSITIVE_MIN_WIDTH < motion::DEFAULT_MIN_WIDTH);
    assert!(motion::DEFAULT_MIN_WIDTH < motion::LESS_SENSITIVE_MIN_WIDTH);
    for preset in SensitivityPreset::ALL {
        let profile = preset.profile();
        assert!(profile.min_width < profile.max_width);
        assert_eq!(profile.max_width, motion::MAX_WIDTH);
    }
}

#[test]
fn test_default_ring_holds_pre_roll_and_margin() {
    let capacity = preroll_capacity(
        30,
        Duration::from_secs_f64(video::DEFAULT_PRE_ROLL_SECS),
        Duration::from_secs_f64(video::DEFAULT_BUFFER_MARGIN_SECS),
    );
    assert_eq!(capacity, 183);
}

#[test]
fn test_clock_sync_floor() {
    // 2020-01-29, anything earlier means the device clock was never set
    assert_eq!(clock_sync::MIN_PLAUSIBLE_EPOCH_SECS, 1_580_317_004);
}
