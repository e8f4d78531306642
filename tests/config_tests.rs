// SPDX-License-Identifier: MPL-2.0

//! Integration tests for configuration module

use camera_hal::{HalConfig, HalError};

#[test]
fn test_config_default() {
    let config = HalConfig::default();

    assert_eq!(config.cameras.len(), 1, "One camera should be configured by default");
    assert!(config.validate().is_ok(), "Defaults should validate");
    assert!(config.extra_buffer_quirk);
}

#[test]
fn test_config_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("camera-hal").join("config.json");

    let mut config = HalConfig::default();
    config.preview_fps = 15.0;
    config.sensor.css_major_version = 2;
    config.cameras[0].event_subdev = Some("/dev/v4l-subdev7".to_string());
    config.save_to(&path).unwrap();

    let loaded = HalConfig::load_from(&path).unwrap();
    assert_eq!(loaded, config);
    assert_eq!(loaded.effective_exposure_lag(), 3);
}

#[test]
fn test_partial_config_fills_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{ "poll_timeout_ms": 250, "sensor": { "raw_buffer_lock": true } }"#).unwrap();

    let loaded = HalConfig::load_from(&path).unwrap();
    assert_eq!(loaded.poll_timeout_ms, 250);
    assert!(loaded.sensor.raw_buffer_lock);
    assert_eq!(loaded.media_device, HalConfig::default().media_device);
    assert_eq!(loaded.sensor.exposure_lag, HalConfig::default().sensor.exposure_lag);
}

#[test]
fn test_invalid_config_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");

    // Malformed JSON
    std::fs::write(&path, "{ not json").unwrap();
    assert!(matches!(HalConfig::load_from(&path), Err(HalError::Config(_))));
    assert_eq!(HalConfig::load_or_default(&path), HalConfig::default());

    // Well formed but rejected by validation
    std::fs::write(&path, r#"{ "buffer_count": 0 }"#).unwrap();
    assert!(matches!(HalConfig::load_from(&path), Err(HalError::Config(_))));
    assert_eq!(HalConfig::load_or_default(&path), HalConfig::default());

    // Missing file
    assert_eq!(
        HalConfig::load_or_default(&dir.path().join("absent.json")),
        HalConfig::default()
    );
}
