// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for configuration module

use fieldcam::Config;
use fieldcam::backends::camera::{ExposureMode, ResolutionPreset};
use fieldcam::errors::ConfigError;
use fieldcam::motion::SensitivityPreset;
use std::path::PathBuf;

fn scratch_file() -> PathBuf {
    std::env::temp_dir()
        .join(format!("fieldcam-config-{}", uuid::Uuid::new_v4()))
        .join("config.json")
}

#[test]
fn test_config_default_is_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.camera.resolution, ResolutionPreset::FullHd);
    assert_eq!(config.motion.sensitivity, SensitivityPreset::Default);
    assert_eq!(config.log_level, "info");
}

#[test]
fn test_missing_file_gives_defaults() {
    let config = Config::load(&scratch_file()).unwrap();
    assert_eq!(config, Config::default());
}

#[test]
fn test_save_then_load() {
    let path = scratch_file();
    let mut config = Config::default();
    config.camera.resolution = ResolutionPreset::FourThree;
    config.camera.exposure.mode = ExposureMode::Manual;
    config.camera.exposure.shutter_us = 2000;
    config.timelapse.interval_seconds = 300;
    config.motion.sensitivity = SensitivityPreset::Less;

    config.save(&path).unwrap();
    let loaded = Config::load(&path).unwrap();
    assert_eq!(loaded, config);

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn test_json_names() {
    let json: serde_json::Value = serde_json::to_value(Config::default()).unwrap();
    assert_eq!(json["camera"]["resolution"], "1920x1080");
    assert_eq!(json["camera"]["exposure"]["mode"], "auto");
    assert_eq!(json["motion"]["sensitivity"], "default");
}

#[test]
fn test_invalid_file_is_rejected() {
    let path = scratch_file();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();

    std::fs::write(&path, r#"{"camera": {"frame_rate": 0}}"#).unwrap();
    assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));

    std::fs::write(&path, r#"{"camera": {"resolution": "640x480"}}"#).unwrap();
    assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));

    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn test_validation_limits() {
    let mut config = Config::default();
    config.camera.frame_rate = 61;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.camera.exposure.mode = ExposureMode::Manual;
    config.camera.exposure.gain = 17.0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.video.quiet_timeout_seconds = 0.0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.storage.max_disk_usage_percent = 101;
    assert!(config.validate().is_err());

    // gain is ignored while exposure is automatic
    let mut config = Config::default();
    config.camera.exposure.gain = 99.0;
    assert!(config.validate().is_ok());
}

#[test]
fn test_durations_must_be_finite_and_bounded() {
    let cases: [fn(&mut Config); 8] = [
        |c| c.video.pre_roll_seconds = 1e20,
        |c| c.video.pre_roll_seconds = f64::NAN,
        |c| c.video.quiet_timeout_seconds = f64::INFINITY,
        |c| c.video.buffer_margin_seconds = 1e9,
        |c| c.video.pre_roll_seconds = -1.0,
        |c| c.motion.photo_cooldown_seconds = f64::INFINITY,
        |c| c.timelapse.interval_seconds = u64::MAX,
        |c| c.timelapse.interval_seconds = 0,
    ];
    for (i, change) in cases.iter().enumerate() {
        let mut config = Config::default();
        change(&mut config);
        assert!(
            matches!(config.validate(), Err(ConfigError::Invalid(_))),
            "case {} was accepted",
            i
        );
    }

    let mut config = Config::default();
    config.video.pre_roll_seconds = 30.0;
    config.timelapse.interval_seconds = 24 * 60 * 60;
    assert!(config.validate().is_ok());
}

#[test]
fn test_huge_pre_roll_file_is_rejected() {
    let path = scratch_file();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, r#"{"video": {"pre_roll_seconds": 1e20}}"#).unwrap();
    assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn test_storage_paths_share_data_root() {
    let config = Config::default();
    let storage = &config.storage;
    assert!(storage.photos_path().starts_with(&storage.data_path));
    assert!(storage.videos_path().starts_with(&storage.data_path));
    assert_ne!(storage.photos_path(), storage.staging_path());
}
