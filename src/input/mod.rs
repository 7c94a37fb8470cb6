//! Input router
//!
//! A dedicated thread owns one libinput context opened on the selected
//! device nodes and turns its events into [`InputEvent`]s in output
//! coordinates. Events reach the compositor over a calloop channel, so all
//! protocol-visible effects happen on the main loop.

pub mod devices;

use anyhow::{Context, Result};
use calloop::generic::Generic;
use calloop::ping::{make_ping, Ping};
use calloop::{EventLoop, Interest, LoopSignal, Mode, PostAction};
use input::event::keyboard::{KeyState, KeyboardEvent, KeyboardEventTrait};
use input::event::pointer::{ButtonState, PointerEvent};
use input::event::touch::{TouchEvent, TouchEventPosition, TouchEventSlot};
use input::event::Event;
use input::{AccelProfile, DeviceCapability, Libinput, LibinputInterface};
use log::{debug, error, info, warn};
use std::fs::OpenOptions;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use crate::config::InputConfig;

/// A device event already mapped to output space
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InputEvent {
    Motion { x: f64, y: f64 },
    Button { button: u32, pressed: bool, x: f64, y: f64 },
    Key { key: u32, pressed: bool },
    TouchDown { id: i32, x: f64, y: f64 },
    TouchMotion { id: i32, x: f64, y: f64 },
    TouchUp { id: i32 },
    TouchFrame,
}

/// Pointer position clamped to the output
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CursorState {
    x: f64,
    y: f64,
    max_x: f64,
    max_y: f64,
}

impl CursorState {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            max_x: f64::from(width.saturating_sub(1)),
            max_y: f64::from(height.saturating_sub(1)),
        }
    }

    pub fn position(&self) -> (f64, f64) {
        (self.x, self.y)
    }

    /// Relative motion accumulates on top of the last clamped position
    pub fn move_by(&mut self, dx: f64, dy: f64) -> (f64, f64) {
        self.move_to(self.x + dx, self.y + dy)
    }

    /// Absolute motion replaces the position outright
    pub fn move_to(&mut self, x: f64, y: f64) -> (f64, f64) {
        self.x = x.clamp(0.0, self.max_x);
        self.y = y.clamp(0.0, self.max_y);
        (self.x, self.y)
    }
}

/// Only the first press and the last release across the whole seat are
/// forwarded; per-device repeats are swallowed.
pub fn forward_key(pressed: bool, seat_key_count: u32) -> bool {
    if pressed {
        seat_key_count == 1
    } else {
        seat_key_count == 0
    }
}

struct Interface;

impl LibinputInterface for Interface {
    fn open_restricted(&mut self, path: &Path, flags: i32) -> Result<OwnedFd, i32> {
        let access = flags & libc::O_ACCMODE;
        OpenOptions::new()
            .custom_flags(flags)
            .read(access == libc::O_RDONLY || access == libc::O_RDWR)
            .write(access == libc::O_WRONLY || access == libc::O_RDWR)
            .open(path)
            .map(OwnedFd::from)
            .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))
    }

    fn close_restricted(&mut self, fd: OwnedFd) {
        drop(fd);
    }
}

struct RouterState {
    cursor: CursorState,
    width: u32,
    height: u32,
    sender: calloop::channel::Sender<InputEvent>,
    signal: LoopSignal,
}

impl RouterState {
    fn send(&self, event: InputEvent) {
        if self.sender.send(event).is_err() {
            // Compositor side is gone
            self.signal.stop();
        }
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Pointer(PointerEvent::Motion(m)) => {
                let (x, y) = self
                    .cursor
                    .move_by(m.dx_unaccelerated(), m.dy_unaccelerated());
                self.send(InputEvent::Motion { x, y });
            }
            Event::Pointer(PointerEvent::MotionAbsolute(m)) => {
                let (x, y) = self.cursor.move_to(
                    m.absolute_x_transformed(self.width),
                    m.absolute_y_transformed(self.height),
                );
                self.send(InputEvent::Motion { x, y });
            }
            Event::Pointer(PointerEvent::Button(b)) => {
                let (x, y) = self.cursor.position();
                self.send(InputEvent::Button {
                    button: b.button(),
                    pressed: b.button_state() == ButtonState::Pressed,
                    x,
                    y,
                });
            }
            Event::Keyboard(KeyboardEvent::Key(k)) => {
                let pressed = k.key_state() == KeyState::Pressed;
                if forward_key(pressed, k.seat_key_count()) {
                    self.send(InputEvent::Key {
                        key: k.key(),
                        pressed,
                    });
                }
            }
            Event::Touch(TouchEvent::Down(t)) => {
                let id = touch_id(t.slot(), t.seat_slot());
                self.send(InputEvent::TouchDown {
                    id,
                    x: t.x_transformed(self.width),
                    y: t.y_transformed(self.height),
                });
            }
            Event::Touch(TouchEvent::Motion(t)) => {
                let id = touch_id(t.slot(), t.seat_slot());
                self.send(InputEvent::TouchMotion {
                    id,
                    x: t.x_transformed(self.width),
                    y: t.y_transformed(self.height),
                });
            }
            Event::Touch(TouchEvent::Up(t)) => {
                self.send(InputEvent::TouchUp {
                    id: touch_id(t.slot(), t.seat_slot()),
                });
            }
            Event::Touch(TouchEvent::Frame(_)) => self.send(InputEvent::TouchFrame),
            _ => {}
        }
    }
}

fn touch_id(slot: Option<u32>, seat_slot: u32) -> i32 {
    slot.unwrap_or(seat_slot) as i32
}

/// Handle to the running input thread. Dropping it stops the thread.
pub struct InputRouter {
    stop: Ping,
    thread: Option<JoinHandle<()>>,
}

impl InputRouter {
    /// Discover devices on `config.seat` and start translating their events
    pub fn spawn(
        config: &InputConfig,
        output_size: (u32, u32),
        sender: calloop::channel::Sender<InputEvent>,
    ) -> Result<Self> {
        let found = devices::scan_udev().context("Failed to enumerate input devices")?;
        let paths = devices::select_devices(&found, config);
        if paths.is_empty() {
            warn!("No input devices found on {}", config.seat);
        }

        let (stop, stop_source) = make_ping().context("Failed to create the input stop ping")?;
        let (width, height) = output_size;

        let thread = std::thread::Builder::new()
            .name("input".into())
            .spawn(move || {
                if let Err(e) = run(&paths, stop_source, width, height, sender) {
                    error!("Input thread failed: {:#}", e);
                }
            })
            .context("Failed to spawn the input thread")?;

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for InputRouter {
    fn drop(&mut self) {
        self.stop.ping();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn open_devices(paths: &[PathBuf]) -> Libinput {
    let mut li = Libinput::new_from_path(Interface);
    for path in paths {
        let Some(name) = path.to_str() else {
            continue;
        };
        match li.path_add_device(name) {
            Some(mut device) => {
                if device.has_capability(DeviceCapability::Pointer) {
                    // Deltas are used as-is: no acceleration curve
                    let _ = device.config_accel_set_profile(AccelProfile::Flat);
                    let _ = device.config_accel_set_speed(0.0);
                }
                info!("🖱️  Input device {} ({})", name, device.name());
            }
            None => warn!("libinput could not open {}", name),
        }
    }
    li
}

fn run(
    paths: &[PathBuf],
    stop: calloop::ping::PingSource,
    width: u32,
    height: u32,
    sender: calloop::channel::Sender<InputEvent>,
) -> Result<()> {
    let mut event_loop: EventLoop<RouterState> =
        EventLoop::try_new().context("Failed to create the input event loop")?;
    let handle = event_loop.handle();
    let li = open_devices(paths);

    handle
        .insert_source(
            Generic::new(li, Interest::READ, Mode::Level),
            |_, source, state: &mut RouterState| {
                let li = unsafe { source.get_mut() };
                li.dispatch()?;
                for event in li.by_ref() {
                    state.handle(event);
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|e| anyhow::anyhow!("Failed to watch libinput: {}", e))?;

    handle
        .insert_source(stop, |_, _, state: &mut RouterState| state.signal.stop())
        .map_err(|e| anyhow::anyhow!("Failed to watch the stop ping: {}", e))?;

    let mut state = RouterState {
        cursor: CursorState::new(width, height),
        width,
        height,
        sender,
        signal: event_loop.get_signal(),
    };

    debug!("input thread running");
    event_loop
        .run(None, &mut state, |_| {})
        .context("Input event loop failed")?;
    debug!("input thread stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn relative_motion_accumulates_on_clamped_position() {
        let mut cursor = CursorState::new(100, 50);
        assert_eq!(cursor.move_by(-10.0, -10.0), (0.0, 0.0));
        // The overshoot above was discarded, not remembered
        assert_eq!(cursor.move_by(5.0, 5.0), (5.0, 5.0));
        assert_eq!(cursor.move_by(500.0, 500.0), (99.0, 49.0));
        assert_eq!(cursor.move_by(-9.0, -9.0), (90.0, 40.0));
    }

    #[test]
    fn absolute_motion_bypasses_accumulation() {
        let mut cursor = CursorState::new(100, 100);
        cursor.move_by(30.0, 30.0);
        assert_eq!(cursor.move_to(10.0, 20.0), (10.0, 20.0));
        assert_eq!(cursor.move_to(150.0, -3.0), (99.0, 0.0));
    }

    #[test]
    fn key_repeats_are_filtered() {
        // Two keyboards pressing the same key: only the first press passes
        assert!(forward_key(true, 1));
        assert!(!forward_key(true, 2));
        assert!(!forward_key(false, 1));
        assert!(forward_key(false, 0));
    }

    #[test]
    fn touch_id_prefers_device_slot() {
        assert_eq!(touch_id(Some(3), 7), 3);
        assert_eq!(touch_id(None, 7), 7);
    }

    proptest! {
        #[test]
        fn cursor_stays_on_output(
            w in 1u32..4000,
            h in 1u32..4000,
            moves in proptest::collection::vec((-5000.0f64..5000.0, -5000.0f64..5000.0), 1..40),
        ) {
            let mut cursor = CursorState::new(w, h);
            for (dx, dy) in moves {
                let (x, y) = cursor.move_by(dx, dy);
                prop_assert!(x >= 0.0 && x <= f64::from(w - 1));
                prop_assert!(y >= 0.0 && y <= f64::from(h - 1));
            }
        }
    }
}
