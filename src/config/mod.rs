//! Configuration management for kmsbox
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then environment variables, then command-line flags. The environment is
//! read exactly once at startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable naming an optional TOML configuration file
pub const CONFIG_ENV: &str = "KMSBOX_CONFIG";

/// Main configuration struct containing all compositor settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CompositorConfig {
    /// Output size and presentation behaviour
    #[serde(default)]
    pub output: OutputConfig,

    /// DRM device and connector selection
    #[serde(default)]
    pub drm: DrmConfig,

    /// Input device discovery
    #[serde(default)]
    pub input: InputConfig,

    /// XKB keymap names
    #[serde(default)]
    pub keyboard: KeyboardConfig,

    /// Listening socket
    #[serde(default)]
    pub wayland: WaylandConfig,

    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    /// Requested output width; 0 adopts the connector's first mode
    pub width: u32,

    /// Requested output height; 0 adopts the connector's first mode
    pub height: u32,

    /// Configure every toplevel fullscreen on its first commit (kiosk mode)
    pub fullscreen: bool,

    /// Block each swap until the page flip completes
    pub vsync: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DrmConfig {
    /// DRM device node
    pub device: PathBuf,

    /// Index into the card's full connector list, connected or not; the
    /// connector at that index must be connected and report modes
    pub connector: usize,
}

/// Per-class device overrides. A path here wins over auto-detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InputConfig {
    /// udev seat to collect devices from
    pub seat: String,

    pub mouse: Option<PathBuf>,
    pub mouse_abs: Option<PathBuf>,
    pub keyboard: Option<PathBuf>,
    pub touch: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeyboardConfig {
    pub rules: String,
    pub model: String,
    pub layout: String,
    pub variant: String,
    pub options: Option<String>,

    /// Repeat rate advertised to clients (keys per second)
    pub repeat_rate: i32,

    /// Repeat delay advertised to clients (milliseconds)
    pub repeat_delay: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct WaylandConfig {
    /// Socket name under `$XDG_RUNTIME_DIR`; auto-allocated when unset
    pub socket: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            fullscreen: false,
            vsync: false,
        }
    }
}

impl Default for DrmConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/dri/card0"),
            connector: 0,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            seat: "seat0".to_string(),
            mouse: None,
            mouse_abs: None,
            keyboard: None,
            touch: None,
        }
    }
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self {
            rules: "evdev".to_string(),
            model: "pc105".to_string(),
            layout: "us".to_string(),
            variant: String::new(),
            options: None,
            repeat_rate: 25,
            repeat_delay: 600,
        }
    }
}

/// Output size given on the command line as `WxH`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSize {
    pub width: u32,
    pub height: u32,
}

impl FromStr for OutputSize {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WxH, got '{}'", s))?;
        let width: u32 = w
            .trim()
            .parse()
            .map_err(|_| format!("invalid width '{}'", w))?;
        let height: u32 = h
            .trim()
            .parse()
            .map_err(|_| format!("invalid height '{}'", h))?;
        if width == 0 || height == 0 {
            return Err(format!("size must be non-zero, got {}x{}", width, height));
        }
        Ok(Self { width, height })
    }
}

impl CompositorConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            let rest = path.strip_prefix("~").unwrap_or(path);
            Path::new(&home).join(rest)
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: CompositorConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Build the startup configuration: defaults, the file named by
    /// `explicit` or `KMSBOX_CONFIG` if any, then the process environment.
    pub fn from_env(explicit: Option<&Path>) -> Result<Self> {
        let file = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        let mut config = match file {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides. `lookup` returns the value of a variable
    /// if it is set.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(dev) = non_empty("KMSBOX_DRM_DEVICE") {
            self.drm.device = PathBuf::from(dev);
        }
        if let Some(idx) = non_empty("KMSBOX_DRM_CONNECTOR") {
            self.drm.connector = idx
                .parse()
                .with_context(|| format!("Invalid KMSBOX_DRM_CONNECTOR: {}", idx))?;
        }
        if let Some(seat) = non_empty("KMSBOX_SEAT") {
            self.input.seat = seat;
        }
        if let Some(p) = non_empty("KMSBOX_MOUSE_DEV") {
            self.input.mouse = Some(PathBuf::from(p));
        }
        if let Some(p) = non_empty("KMSBOX_MOUSE_ABS_DEV") {
            self.input.mouse_abs = Some(PathBuf::from(p));
        }
        if let Some(p) = non_empty("KMSBOX_KEYBOARD_DEV") {
            self.input.keyboard = Some(PathBuf::from(p));
        }
        if let Some(p) = non_empty("KMSBOX_TOUCH_DEV") {
            self.input.touch = Some(PathBuf::from(p));
        }
        if let Some(v) = non_empty("KMSBOX_DEBUG") {
            self.debug = !matches!(v.as_str(), "0" | "false" | "no" | "off");
        }

        // Same variables libxkbcommon itself honours
        if let Some(v) = non_empty("XKB_DEFAULT_RULES") {
            self.keyboard.rules = v;
        }
        if let Some(v) = non_empty("XKB_DEFAULT_MODEL") {
            self.keyboard.model = v;
        }
        if let Some(v) = non_empty("XKB_DEFAULT_LAYOUT") {
            self.keyboard.layout = v;
        }
        if let Some(v) = non_empty("XKB_DEFAULT_VARIANT") {
            self.keyboard.variant = v;
        }
        if let Some(v) = non_empty("XKB_DEFAULT_OPTIONS") {
            self.keyboard.options = Some(v);
        }

        self.validate()
    }

    /// Requested output size, if one was given
    pub fn requested_size(&self) -> Option<OutputSize> {
        if self.output.width > 0 && self.output.height > 0 {
            Some(OutputSize {
                width: self.output.width,
                height: self.output.height,
            })
        } else {
            None
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if (self.output.width == 0) != (self.output.height == 0) {
            anyhow::bail!(
                "Invalid output size {}x{}: width and height must both be set or both be zero",
                self.output.width,
                self.output.height
            );
        }

        if self.drm.device.as_os_str().is_empty() {
            anyhow::bail!("Invalid DRM device: path is empty");
        }

        if self.input.seat.is_empty() {
            anyhow::bail!("Invalid seat: name is empty");
        }

        if let Some(ref name) = self.wayland.socket {
            // sun_path is 108 bytes including the runtime dir prefix
            if name.is_empty() || name.len() > 100 || name.contains('/') {
                anyhow::bail!("Invalid socket name: {:?}", name);
            }
        }

        if self.keyboard.repeat_rate < 0 || self.keyboard.repeat_delay < 0 {
            anyhow::bail!("Invalid keyboard repeat: rate and delay must be non-negative");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
