//! wl_seat and input delivery
//!
//! Input events from the router go to the client owning the focused
//! surface. Pointer enter/leave follow the pointer crossing that surface's
//! bounds; keyboard enter happens lazily on the first key.

use log::{debug, trace, warn};
use std::ffi::CString;
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use wayland_server::backend::{ClientId, ObjectId};
use wayland_server::protocol::wl_keyboard::{self, WlKeyboard};
use wayland_server::protocol::wl_pointer::{self, WlPointer};
use wayland_server::protocol::wl_seat::{self, WlSeat};
use wayland_server::protocol::wl_surface::WlSurface;
use wayland_server::protocol::wl_touch::{self, WlTouch};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};
use xkbcommon::xkb;

use super::{monotonic_ms, CompositorState};
use crate::config::KeyboardConfig;
use crate::input::InputEvent;

/// Seat objects one client has bound
#[derive(Debug, Default)]
pub struct ClientRecord {
    pub pointers: Vec<WlPointer>,
    pub keyboards: Vec<WlKeyboard>,
    pub touches: Vec<WlTouch>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Modifiers {
    pub depressed: u32,
    pub latched: u32,
    pub locked: u32,
    pub group: u32,
}

/// Compiled keymap shared with every client, plus the modifier state
pub struct KeyboardState {
    keymap_fd: OwnedFd,
    keymap_size: u32,
    xkb: xkb::State,
    modifiers: Modifiers,
}

impl std::fmt::Debug for KeyboardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyboardState")
            .field("keymap_size", &self.keymap_size)
            .field("modifiers", &self.modifiers)
            .finish()
    }
}

impl KeyboardState {
    /// Compile the configured keymap. `None` when xkb cannot build it; the
    /// seat then works without a keymap.
    pub fn new(config: &KeyboardConfig) -> Option<Self> {
        debug!(
            "rules: {}, model: {}, layout: {}",
            config.rules, config.model, config.layout
        );
        let ctx = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let Some(keymap) = xkb::Keymap::new_from_names(
            &ctx,
            &config.rules,
            &config.model,
            &config.layout,
            &config.variant,
            config.options.clone(),
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        ) else {
            warn!("Failed to compile the xkb keymap; keyboards get no keymap");
            return None;
        };
        let text = keymap.get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1);
        let keymap_fd = match keymap_file(&text) {
            Ok(fd) => fd,
            Err(e) => {
                warn!("Failed to create the keymap file: {}", e);
                return None;
            }
        };
        Some(Self {
            keymap_fd,
            keymap_size: text.len() as u32 + 1,
            xkb: xkb::State::new(&keymap),
            modifiers: Modifiers::default(),
        })
    }

    /// Feed a key to xkb. Returns the new modifiers if they changed.
    fn update_key(&mut self, key: u32, pressed: bool) -> Option<Modifiers> {
        let direction = if pressed {
            xkb::KeyDirection::Down
        } else {
            xkb::KeyDirection::Up
        };
        // evdev codes are offset by 8 in xkb
        self.xkb.update_key(xkb::Keycode::new(key + 8), direction);
        let mods = Modifiers {
            depressed: self.xkb.serialize_mods(xkb::STATE_MODS_DEPRESSED),
            latched: self.xkb.serialize_mods(xkb::STATE_MODS_LATCHED),
            locked: self.xkb.serialize_mods(xkb::STATE_MODS_LOCKED),
            group: self.xkb.serialize_layout(xkb::STATE_LAYOUT_EFFECTIVE),
        };
        if mods == self.modifiers {
            return None;
        }
        self.modifiers = mods;
        Some(mods)
    }
}

/// A sealed memfd holding the NUL-terminated keymap text
fn keymap_file(text: &str) -> std::io::Result<OwnedFd> {
    let name = CString::new("kmsbox-keymap").map_err(std::io::Error::other)?;
    let fd = unsafe {
        libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING)
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let mut file = unsafe { File::from_raw_fd(fd) };
    file.write_all(text.as_bytes())?;
    file.write_all(&[0])?;
    let seals = libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE | libc::F_SEAL_SEAL;
    if unsafe { libc::fcntl(fd, libc::F_ADD_SEALS, seals) } < 0 {
        warn!("could not seal keymap: {}", std::io::Error::last_os_error());
    }
    Ok(OwnedFd::from(file))
}

impl CompositorState {
    fn client_record(&mut self, client: &Client) -> &mut ClientRecord {
        self.clients.entry(client.id()).or_default()
    }

    fn owner_of(&self, surface: &WlSurface) -> Option<ClientId> {
        surface.client().map(|c| c.id())
    }

    /// Send leave events for a surface losing focus
    pub(crate) fn leave_surface(&mut self, id: &ObjectId) {
        let Some(rec) = self.surfaces.get(id) else {
            return;
        };
        let (had_pointer, had_keyboard) = (rec.pointer_focused, rec.keyboard_focused);
        if !had_pointer && !had_keyboard {
            return;
        }
        let surface = rec.surface.clone();
        let serial = self.next_serial();
        if let Some(record) = self.owner_of(&surface).and_then(|c| self.clients.get(&c)) {
            if had_pointer {
                for pointer in &record.pointers {
                    pointer.leave(serial, &surface);
                    if pointer.version() >= 5 {
                        pointer.frame();
                    }
                }
            }
            if had_keyboard {
                for keyboard in &record.keyboards {
                    keyboard.leave(serial, &surface);
                }
            }
        }
        if let Some(rec) = self.surfaces.get_mut(id) {
            rec.pointer_focused = false;
            rec.keyboard_focused = false;
        }
    }

    /// Route one input event to the focused surface
    pub fn handle_input(&mut self, event: InputEvent) {
        if let InputEvent::Motion { x, y } = event {
            self.pointer_pos = (x, y);
        }
        let Some(id) = self.focus.clone() else {
            return;
        };
        let Some(rec) = self.surfaces.get(&id) else {
            return;
        };
        let surface = rec.surface.clone();
        let (width, height) = rec.size();
        let (pointer_focused, keyboard_focused) = (rec.pointer_focused, rec.keyboard_focused);
        let Some(client) = self.owner_of(&surface) else {
            return;
        };
        let time = monotonic_ms();

        match event {
            InputEvent::Motion { x, y } => {
                let inside = x >= 0.0 && x < f64::from(width) && y >= 0.0 && y < f64::from(height);
                let serial = self.next_serial();
                let Some(record) = self.clients.get(&client) else {
                    return;
                };
                let focused = match (pointer_focused, inside) {
                    (false, true) => {
                        for pointer in &record.pointers {
                            pointer.enter(serial, &surface, x, y);
                        }
                        true
                    }
                    (true, false) => {
                        for pointer in &record.pointers {
                            pointer.leave(serial, &surface);
                        }
                        false
                    }
                    (focused, _) => focused,
                };
                let sent = focused || pointer_focused;
                for pointer in &record.pointers {
                    if focused {
                        pointer.motion(time, x, y);
                    }
                    if sent && pointer.version() >= 5 {
                        pointer.frame();
                    }
                }
                if let Some(rec) = self.surfaces.get_mut(&id) {
                    rec.pointer_focused = focused;
                }
            }
            InputEvent::Button {
                button,
                pressed,
                x,
                y,
            } => {
                trace!("button {} {} at {},{}", button, pressed, x, y);
                if !pointer_focused {
                    return;
                }
                let serial = self.next_serial();
                let state = if pressed {
                    wl_pointer::ButtonState::Pressed
                } else {
                    wl_pointer::ButtonState::Released
                };
                if let Some(record) = self.clients.get(&client) {
                    for pointer in &record.pointers {
                        pointer.button(serial, time, button, state);
                        if pointer.version() >= 5 {
                            pointer.frame();
                        }
                    }
                }
            }
            InputEvent::Key { key, pressed } => {
                let enter_serial = self.next_serial();
                let serial = self.next_serial();
                let changed = self
                    .keyboard
                    .as_mut()
                    .and_then(|kb| kb.update_key(key, pressed));
                let current = self
                    .keyboard
                    .as_ref()
                    .map(|kb| kb.modifiers)
                    .unwrap_or_default();
                let Some(record) = self.clients.get(&client) else {
                    return;
                };
                if record.keyboards.is_empty() {
                    return;
                }
                for keyboard in &record.keyboards {
                    if !keyboard_focused {
                        keyboard.enter(enter_serial, &surface, Vec::new());
                        keyboard.modifiers(
                            enter_serial,
                            current.depressed,
                            current.latched,
                            current.locked,
                            current.group,
                        );
                    } else if let Some(m) = changed {
                        keyboard.modifiers(serial, m.depressed, m.latched, m.locked, m.group);
                    }
                    let state = if pressed {
                        wl_keyboard::KeyState::Pressed
                    } else {
                        wl_keyboard::KeyState::Released
                    };
                    keyboard.key(serial, time, key, state);
                }
                if let Some(rec) = self.surfaces.get_mut(&id) {
                    rec.keyboard_focused = true;
                }
            }
            InputEvent::TouchDown { id: touch, x, y } => {
                let serial = self.next_serial();
                if let Some(record) = self.clients.get(&client) {
                    for t in &record.touches {
                        t.down(serial, time, &surface, touch, x, y);
                    }
                }
            }
            InputEvent::TouchMotion { id: touch, x, y } => {
                if let Some(record) = self.clients.get(&client) {
                    for t in &record.touches {
                        t.motion(time, touch, x, y);
                    }
                }
            }
            InputEvent::TouchUp { id: touch } => {
                let serial = self.next_serial();
                if let Some(record) = self.clients.get(&client) {
                    for t in &record.touches {
                        t.up(serial, time, touch);
                    }
                }
            }
            InputEvent::TouchFrame => {
                if let Some(record) = self.clients.get(&client) {
                    for t in &record.touches {
                        t.frame();
                    }
                }
            }
        }
    }

    pub fn pointer_position(&self) -> (f64, f64) {
        self.pointer_pos
    }
}

impl GlobalDispatch<WlSeat, ()> for CompositorState {
    fn bind(
        state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<WlSeat>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let seat = data_init.init(resource, ());
        seat.capabilities(
            wl_seat::Capability::Pointer | wl_seat::Capability::Keyboard | wl_seat::Capability::Touch,
        );
        if seat.version() >= 2 {
            seat.name(state.seat_name.clone());
        }
    }
}

impl Dispatch<WlSeat, ()> for CompositorState {
    fn request(
        state: &mut Self,
        client: &Client,
        _resource: &WlSeat,
        request: wl_seat::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_seat::Request::GetPointer { id } => {
                let pointer = data_init.init(id, ());
                state.client_record(client).pointers.push(pointer);
            }
            wl_seat::Request::GetKeyboard { id } => {
                let keyboard = data_init.init(id, ());
                if let Some(kb) = &state.keyboard {
                    keyboard.keymap(
                        wl_keyboard::KeymapFormat::XkbV1,
                        kb.keymap_fd.as_fd(),
                        kb.keymap_size,
                    );
                }
                if keyboard.version() >= 4 {
                    keyboard.repeat_info(state.repeat_rate, state.repeat_delay);
                }
                state.client_record(client).keyboards.push(keyboard);
            }
            wl_seat::Request::GetTouch { id } => {
                let touch = data_init.init(id, ());
                state.client_record(client).touches.push(touch);
            }
            _ => {}
        }
    }
}

impl Dispatch<WlPointer, ()> for CompositorState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &WlPointer,
        request: wl_pointer::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_pointer::Request::SetCursor { serial, .. } = request {
            trace!("set_cursor serial {} ignored", serial);
        }
    }

    fn destroyed(state: &mut Self, client: ClientId, resource: &WlPointer, _data: &()) {
        if let Some(record) = state.clients.get_mut(&client) {
            record.pointers.retain(|p| p != resource);
        }
    }
}

impl Dispatch<WlKeyboard, ()> for CompositorState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &WlKeyboard,
        _request: wl_keyboard::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }

    fn destroyed(state: &mut Self, client: ClientId, resource: &WlKeyboard, _data: &()) {
        if let Some(record) = state.clients.get_mut(&client) {
            record.keyboards.retain(|k| k != resource);
        }
    }
}

impl Dispatch<WlTouch, ()> for CompositorState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &WlTouch,
        _request: wl_touch::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }

    fn destroyed(state: &mut Self, client: ClientId, resource: &WlTouch, _data: &()) {
        if let Some(record) = state.clients.get_mut(&client) {
            record.touches.retain(|t| t != resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom};

    #[test]
    fn keymap_file_is_nul_terminated_and_sealed() {
        let fd = keymap_file("xkb_keymap {};").expect("memfd");
        let mut file = File::from(fd);
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"xkb_keymap {};\0");
        // Sealed against writes
        assert!(file.write_all(b"x").is_err());
    }

    #[test]
    fn client_records_start_empty() {
        let record = ClientRecord::default();
        assert!(record.pointers.is_empty());
        assert!(record.keyboards.is_empty());
        assert!(record.touches.is_empty());
    }
}
