//! Input device discovery
//!
//! Enumerates udev's `input` subsystem for event nodes on one seat and
//! decides which of them the router should open.

use log::{info, warn};
use std::path::{Path, PathBuf};

use crate::config::InputConfig;

/// The udev facts classification looks at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProps {
    pub sysname: String,
    pub devnode: Option<PathBuf>,
    pub seat: Option<String>,
    /// Symlinks to the device node (`DEVLINKS`)
    pub devlinks: Vec<PathBuf>,
    pub keyboard: bool,
    pub mouse: bool,
    pub touchpad: bool,
    pub touchscreen: bool,
}

impl DeviceProps {
    fn from_udev(dev: &udev::Device) -> Self {
        let flag = |name: &str| dev.property_value(name).is_some_and(|v| v == "1");
        Self {
            sysname: dev.sysname().to_string_lossy().into_owned(),
            devnode: dev.devnode().map(Path::to_path_buf),
            seat: dev
                .property_value("ID_SEAT")
                .map(|s| s.to_string_lossy().into_owned()),
            devlinks: dev
                .property_value("DEVLINKS")
                .map(|links| {
                    links
                        .to_string_lossy()
                        .split_whitespace()
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default(),
            keyboard: flag("ID_INPUT_KEYBOARD"),
            mouse: flag("ID_INPUT_MOUSE"),
            touchpad: flag("ID_INPUT_TOUCHPAD"),
            touchscreen: flag("ID_INPUT_TOUCHSCREEN"),
        }
    }

    /// Whether `wanted` names this device by node or by one of its links
    fn is(&self, wanted: Option<&Path>) -> bool {
        match (wanted, &self.devnode) {
            (Some(w), Some(node)) => node == w || self.devlinks.iter().any(|l| l == w),
            _ => false,
        }
    }

    fn on_seat(&self, seat: &str) -> bool {
        // udev leaves ID_SEAT unset for the default seat
        self.seat.as_deref().unwrap_or("seat0") == seat
    }
}

fn push_unique(list: &mut Vec<PathBuf>, path: &Path) {
    if !list.iter().any(|p| p == path) {
        list.push(path.to_path_buf());
    }
}

/// Pick the device nodes to open. Overrides from `config` win over
/// auto-detected devices of the same class; paths are never repeated.
/// Keyboards come first, then touch devices, then pointers.
pub fn select_devices(devices: &[DeviceProps], config: &InputConfig) -> Vec<PathBuf> {
    let mut keyboards = Vec::new();
    let mut touches = Vec::new();
    let mut mice = Vec::new();
    let mut chosen_keyboard = None;
    let mut chosen_touch = None;
    let mut chosen_mouse = None;
    let mut chosen_mouse_abs = None;

    for dev in devices {
        if !dev.on_seat(&config.seat) || !dev.sysname.starts_with("event") {
            continue;
        }
        let Some(node) = dev.devnode.as_deref() else {
            warn!("cannot find devnode for {}", dev.sysname);
            continue;
        };

        if dev.keyboard {
            if dev.is(config.keyboard.as_deref()) {
                info!("Specified device: {} is a keyboard", node.display());
                chosen_keyboard = Some(node.to_path_buf());
            } else {
                info!("Default device: {} is a keyboard", node.display());
                push_unique(&mut keyboards, node);
            }
        }

        if dev.mouse {
            let mut specified = false;
            if dev.is(config.mouse.as_deref()) {
                info!("Specified device: {} is a mouse", node.display());
                chosen_mouse = Some(node.to_path_buf());
                specified = true;
            }
            if dev.is(config.mouse_abs.as_deref()) {
                info!("Specified device: {} is an absolute mouse", node.display());
                chosen_mouse_abs = Some(node.to_path_buf());
                specified = true;
            }
            if !specified {
                info!("Default device: {} is a mouse", node.display());
                push_unique(&mut mice, node);
            }
        }

        if dev.touchpad || dev.touchscreen {
            if dev.is(config.touch.as_deref()) {
                info!("Specified device: {} is a touch device", node.display());
                chosen_touch = Some(node.to_path_buf());
            } else {
                info!("Default device: {} is a touch device", node.display());
                push_unique(&mut touches, node);
            }
        }
    }

    let mut out = Vec::new();
    match chosen_keyboard {
        Some(k) => push_unique(&mut out, &k),
        None => keyboards.iter().for_each(|k| push_unique(&mut out, k)),
    }
    match chosen_touch {
        Some(t) => push_unique(&mut out, &t),
        None => touches.iter().for_each(|t| push_unique(&mut out, t)),
    }
    if chosen_mouse.is_none() && chosen_mouse_abs.is_none() {
        mice.iter().for_each(|m| push_unique(&mut out, m));
    } else {
        for m in chosen_mouse.iter().chain(chosen_mouse_abs.iter()) {
            push_unique(&mut out, m);
        }
    }
    out
}

/// Enumerate the `input` subsystem
pub fn scan_udev() -> std::io::Result<Vec<DeviceProps>> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("input")?;
    Ok(enumerator
        .scan_devices()?
        .map(|dev| DeviceProps::from_udev(&dev))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(n: u32) -> DeviceProps {
        DeviceProps {
            sysname: format!("event{}", n),
            devnode: Some(PathBuf::from(format!("/dev/input/event{}", n))),
            ..DeviceProps::default()
        }
    }

    fn keyboard(n: u32) -> DeviceProps {
        DeviceProps {
            keyboard: true,
            ..dev(n)
        }
    }

    fn mouse(n: u32) -> DeviceProps {
        DeviceProps {
            mouse: true,
            ..dev(n)
        }
    }

    fn touchscreen(n: u32) -> DeviceProps {
        DeviceProps {
            touchscreen: true,
            ..dev(n)
        }
    }

    fn paths(list: &[&str]) -> Vec<PathBuf> {
        list.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn defaults_are_ordered_keyboard_touch_mouse() {
        let devices = vec![mouse(1), keyboard(2), touchscreen(3), keyboard(4)];
        let out = select_devices(&devices, &InputConfig::default());
        assert_eq!(
            out,
            paths(&[
                "/dev/input/event2",
                "/dev/input/event4",
                "/dev/input/event3",
                "/dev/input/event1"
            ])
        );
    }

    #[test]
    fn other_seats_and_non_event_nodes_are_skipped() {
        let mut other = keyboard(1);
        other.seat = Some("seat1".into());
        let mut js = mouse(2);
        js.sysname = "mouse0".into();
        let mut headless = keyboard(3);
        headless.devnode = None;

        let out = select_devices(&[other, js, headless, keyboard(4)], &InputConfig::default());
        assert_eq!(out, paths(&["/dev/input/event4"]));
    }

    #[test]
    fn explicit_seat_must_match() {
        let mut on_seat = keyboard(1);
        on_seat.seat = Some("seat-test".into());
        let config = InputConfig {
            seat: "seat-test".into(),
            ..InputConfig::default()
        };
        let out = select_devices(&[on_seat, keyboard(2)], &config);
        assert_eq!(out, paths(&["/dev/input/event1"]));
    }

    #[test]
    fn override_replaces_auto_detected_class() {
        let config = InputConfig {
            keyboard: Some(PathBuf::from("/dev/input/event4")),
            ..InputConfig::default()
        };
        let out = select_devices(&[keyboard(2), keyboard(4), mouse(5)], &config);
        assert_eq!(out, paths(&["/dev/input/event4", "/dev/input/event5"]));
    }

    #[test]
    fn override_matches_devlinks() {
        let mut m = mouse(7);
        m.devlinks = paths(&["/dev/input/by-id/usb-mouse-event-mouse", "/dev/input/by-path/x"]);
        let config = InputConfig {
            mouse: Some(PathBuf::from("/dev/input/by-id/usb-mouse-event-mouse")),
            ..InputConfig::default()
        };
        let out = select_devices(&[mouse(6), m], &config);
        assert_eq!(out, paths(&["/dev/input/event7"]));
    }

    #[test]
    fn unmatched_mouse_override_falls_back_to_defaults() {
        let config = InputConfig {
            mouse: Some(PathBuf::from("/dev/input/event99")),
            ..InputConfig::default()
        };
        let out = select_devices(&[mouse(1), mouse(2)], &config);
        assert_eq!(out, paths(&["/dev/input/event1", "/dev/input/event2"]));
    }

    #[test]
    fn relative_and_absolute_mouse_overrides_combine() {
        let config = InputConfig {
            mouse: Some(PathBuf::from("/dev/input/event1")),
            mouse_abs: Some(PathBuf::from("/dev/input/event3")),
            ..InputConfig::default()
        };
        let out = select_devices(&[mouse(1), mouse(2), mouse(3)], &config);
        assert_eq!(out, paths(&["/dev/input/event1", "/dev/input/event3"]));
    }

    #[test]
    fn multi_class_device_is_listed_once() {
        let combo = DeviceProps {
            keyboard: true,
            mouse: true,
            touchpad: true,
            ..dev(8)
        };
        let out = select_devices(&[combo], &InputConfig::default());
        assert_eq!(out, paths(&["/dev/input/event8"]));
    }
}
