//! Unit tests for configuration module
//!
//! Tests layering of file, environment and defaults, plus validation.

use super::*;
use anyhow::Result;
use serial_test::serial;
use std::collections::HashMap;
use std::fs;
use tempfile::tempdir;

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

#[test]
fn test_default_configuration_is_valid() {
    let config = CompositorConfig::default();
    assert!(config.validate().is_ok());

    assert_eq!(config.drm.device, PathBuf::from("/dev/dri/card0"));
    assert_eq!(config.drm.connector, 0);
    assert_eq!(config.input.seat, "seat0");
    assert_eq!(config.keyboard.rules, "evdev");
    assert_eq!(config.keyboard.model, "pc105");
    assert_eq!(config.keyboard.layout, "us");
    assert!(!config.output.vsync);
    assert!(!config.output.fullscreen);
    assert!(config.requested_size().is_none());
}

#[test]
fn test_configuration_from_file() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("kmsbox.toml");
    fs::write(
        &path,
        r#"
debug = true

[output]
width = 1280
height = 720
vsync = true

[drm]
device = "/dev/dri/card1"
connector = 1

[input]
seat = "seat1"
keyboard = "/dev/input/event3"
"#,
    )?;

    let config = CompositorConfig::load(&path)?;
    assert!(config.debug);
    assert_eq!(
        config.requested_size(),
        Some(OutputSize {
            width: 1280,
            height: 720
        })
    );
    assert!(config.output.vsync);
    assert_eq!(config.drm.device, PathBuf::from("/dev/dri/card1"));
    assert_eq!(config.drm.connector, 1);
    assert_eq!(config.input.seat, "seat1");
    assert_eq!(config.input.keyboard, Some(PathBuf::from("/dev/input/event3")));
    // Sections not mentioned keep their defaults
    assert_eq!(config.keyboard, KeyboardConfig::default());
    Ok(())
}

#[test]
fn test_partial_file_keeps_defaults() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("partial.toml");
    fs::write(&path, "[drm]\nconnector = 2\n")?;

    let config = CompositorConfig::load(&path)?;
    assert_eq!(config.drm.connector, 2);
    assert_eq!(config.drm.device, PathBuf::from("/dev/dri/card0"));
    assert_eq!(config.output, OutputConfig::default());
    Ok(())
}

#[test]
fn test_invalid_toml_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[output\nwidth = ")?;

    let err = CompositorConfig::load(&path).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
    Ok(())
}

#[test]
fn test_missing_file_is_an_error() {
    let err = CompositorConfig::load("/nonexistent/kmsbox.toml").unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_env_overrides_file_values() -> Result<()> {
    let mut config = CompositorConfig::default();
    config.drm.connector = 3;

    config.apply_env(env_of(&[
        ("KMSBOX_DRM_DEVICE", "/dev/dri/card2"),
        ("KMSBOX_DRM_CONNECTOR", "1"),
        ("KMSBOX_SEAT", "seat-test"),
        ("KMSBOX_MOUSE_DEV", "/dev/input/by-id/mouse"),
        ("KMSBOX_MOUSE_ABS_DEV", "/dev/input/event9"),
        ("KMSBOX_TOUCH_DEV", "/dev/input/event7"),
        ("KMSBOX_DEBUG", "1"),
        ("XKB_DEFAULT_LAYOUT", "de"),
    ]))?;

    assert_eq!(config.drm.device, PathBuf::from("/dev/dri/card2"));
    assert_eq!(config.drm.connector, 1);
    assert_eq!(config.input.seat, "seat-test");
    assert_eq!(config.input.mouse, Some(PathBuf::from("/dev/input/by-id/mouse")));
    assert_eq!(config.input.mouse_abs, Some(PathBuf::from("/dev/input/event9")));
    assert_eq!(config.input.touch, Some(PathBuf::from("/dev/input/event7")));
    assert!(config.input.keyboard.is_none());
    assert!(config.debug);
    assert_eq!(config.keyboard.layout, "de");
    Ok(())
}

#[test]
fn test_empty_env_values_are_ignored() -> Result<()> {
    let mut config = CompositorConfig::default();
    config.apply_env(env_of(&[("KMSBOX_SEAT", ""), ("KMSBOX_DRM_DEVICE", "")]))?;
    assert_eq!(config, CompositorConfig::default());
    Ok(())
}

#[test]
fn test_debug_toggle_accepts_false_spellings() -> Result<()> {
    for off in ["0", "false", "no", "off"] {
        let mut config = CompositorConfig::default();
        config.debug = true;
        config.apply_env(env_of(&[("KMSBOX_DEBUG", off)]))?;
        assert!(!config.debug, "{} should disable debug", off);
    }
    Ok(())
}

#[test]
fn test_bad_connector_index_is_rejected() {
    let mut config = CompositorConfig::default();
    let err = config
        .apply_env(env_of(&[("KMSBOX_DRM_CONNECTOR", "first")]))
        .unwrap_err();
    assert!(err.to_string().contains("KMSBOX_DRM_CONNECTOR"));
}

#[test]
fn test_validation_rejects_half_size() {
    let mut config = CompositorConfig::default();
    config.output.width = 800;
    assert!(config.validate().is_err());

    config.output.height = 600;
    assert!(config.validate().is_ok());
}

#[test]
fn test_validation_rejects_bad_socket_names() {
    let mut config = CompositorConfig::default();
    let long = "x".repeat(101);
    for bad in ["", "a/b", long.as_str()] {
        config.wayland.socket = Some(bad.to_string());
        assert!(config.validate().is_err(), "{:?} should be rejected", bad);
    }
    config.wayland.socket = Some("wayland-7".to_string());
    assert!(config.validate().is_ok());
}

#[test]
fn test_output_size_parsing() {
    assert_eq!(
        "800x600".parse::<OutputSize>(),
        Ok(OutputSize {
            width: 800,
            height: 600
        })
    );
    assert_eq!(
        "1920X1080".parse::<OutputSize>(),
        Ok(OutputSize {
            width: 1920,
            height: 1080
        })
    );
    assert!("800".parse::<OutputSize>().is_err());
    assert!("0x600".parse::<OutputSize>().is_err());
    assert!("800x".parse::<OutputSize>().is_err());
    assert!("axb".parse::<OutputSize>().is_err());
}

#[test]
#[serial]
fn test_from_env_reads_config_file_variable() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("env.toml");
    fs::write(&path, "[output]\nfullscreen = true\n")?;

    std::env::set_var(CONFIG_ENV, &path);
    let config = CompositorConfig::from_env(None);
    std::env::remove_var(CONFIG_ENV);

    assert!(config?.output.fullscreen);
    Ok(())
}

#[test]
#[serial]
fn test_from_env_prefers_explicit_path() -> Result<()> {
    let dir = tempdir()?;
    let env_path = dir.path().join("env.toml");
    let cli_path = dir.path().join("cli.toml");
    fs::write(&env_path, "[drm]\nconnector = 4\n")?;
    fs::write(&cli_path, "[drm]\nconnector = 5\n")?;

    std::env::set_var(CONFIG_ENV, &env_path);
    let config = CompositorConfig::from_env(Some(&cli_path));
    std::env::remove_var(CONFIG_ENV);

    assert_eq!(config?.drm.connector, 5);
    Ok(())
}
