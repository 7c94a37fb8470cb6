//! Compositor protocol core
//!
//! [`CompositorState`] is the single owner of everything clients can see:
//! surfaces in stacking order, their shell roles, the focused surface, the
//! per-client seat objects and the texture pipeline of every surface. The
//! `Dispatch` impls in the submodules translate wire requests into calls on
//! it; the frame scheduler drives the pipeline side.
//!
//! Surfaces join the stack when they acquire a shell role. Role-less
//! surfaces still run their pipeline (callbacks fire, buffers are released)
//! but are never composited.

pub mod buffer;
pub mod compositor;
pub mod output;
pub mod seat;
pub mod shell;
pub mod xdg;

use log::{debug, info, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use wayland_protocols::wp::linux_dmabuf::zv1::server::zwp_linux_dmabuf_v1::ZwpLinuxDmabufV1;
use wayland_protocols::xdg::shell::server::xdg_surface::XdgSurface;
use wayland_protocols::xdg::shell::server::xdg_toplevel::{self, XdgToplevel};
use wayland_protocols::xdg::shell::server::xdg_wm_base::XdgWmBase;
use wayland_server::backend::{ClientData, ClientId, DisconnectReason, ObjectId};
use wayland_server::protocol::wl_buffer::WlBuffer;
use wayland_server::protocol::wl_callback::WlCallback;
use wayland_server::protocol::wl_compositor::WlCompositor;
use wayland_server::protocol::wl_output::WlOutput;
use wayland_server::protocol::wl_seat::WlSeat;
use wayland_server::protocol::wl_shell::WlShell;
use wayland_server::protocol::wl_shell_surface::{self, WlShellSurface};
use wayland_server::protocol::wl_shm::WlShm;
use wayland_server::protocol::wl_surface::WlSurface;
use wayland_server::{DisplayHandle, Resource};

use crate::config::KeyboardConfig;
use crate::pipeline::{Promotion, SurfaceTextures, TextureBackend, TextureId};
use crate::render::Rect;

use self::seat::{ClientRecord, KeyboardState};

/// Static description of the output advertised through `wl_output`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputInfo {
    pub width: i32,
    pub height: i32,
    /// Refresh rate in mHz, 0 when unknown
    pub refresh_mhz: i32,
    pub make: String,
    pub model: String,
}

impl OutputInfo {
    pub fn new(width: u32, height: u32, refresh_hz: u32) -> Self {
        Self {
            width: width as i32,
            height: height as i32,
            refresh_mhz: (refresh_hz * 1000) as i32,
            make: "unknown".into(),
            model: "unknown".into(),
        }
    }
}

/// Window state bits carried in a toplevel configure
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    pub maximized: bool,
    pub fullscreen: bool,
    pub resizing: bool,
    pub activated: bool,
}

impl WindowState {
    /// The `states` array of `xdg_toplevel.configure`
    pub fn xdg_states(&self) -> Vec<u8> {
        let mut states = Vec::new();
        let flags = [
            (self.maximized, xdg_toplevel::State::Maximized),
            (self.fullscreen, xdg_toplevel::State::Fullscreen),
            (self.resizing, xdg_toplevel::State::Resizing),
            (self.activated, xdg_toplevel::State::Activated),
        ];
        for (set, state) in flags {
            if set {
                states.extend_from_slice(&(state as u32).to_ne_bytes());
            }
        }
        states
    }
}

/// The protocol objects behind a shell role
#[derive(Debug)]
pub enum ShellHandle {
    Xdg {
        surface: XdgSurface,
        toplevel: Option<XdgToplevel>,
    },
    Shell(WlShellSurface),
}

/// Window-level state of a surface with a shell role
#[derive(Debug)]
pub struct ShellSurface {
    handle: ShellHandle,
    pub state: WindowState,
    /// Size sent with the next configure; (0, 0) lets the client choose
    pub size: (i32, i32),
    pub initial_configure_sent: bool,
    pub title: Option<String>,
    pub app_id: Option<String>,
    pub geometry: Option<Rect>,
    pub min_size: (i32, i32),
    pub max_size: (i32, i32),
    pub last_configure: Option<u32>,
    pub acked_configure: Option<u32>,
}

impl ShellSurface {
    fn new(handle: ShellHandle) -> Self {
        Self {
            handle,
            state: WindowState::default(),
            size: (0, 0),
            initial_configure_sent: false,
            title: None,
            app_id: None,
            geometry: None,
            min_size: (0, 0),
            max_size: (0, 0),
            last_configure: None,
            acked_configure: None,
        }
    }

    pub fn handle(&self) -> &ShellHandle {
        &self.handle
    }

    /// An xdg surface that has been given the toplevel role
    pub fn is_xdg_toplevel(&self) -> bool {
        matches!(
            self.handle,
            ShellHandle::Xdg {
                toplevel: Some(_),
                ..
            }
        )
    }

    fn send_configure(&mut self, serial: u32) {
        let (width, height) = self.size;
        match &self.handle {
            ShellHandle::Xdg {
                surface,
                toplevel: Some(toplevel),
            } => {
                if !surface.is_alive() || !toplevel.is_alive() {
                    return;
                }
                toplevel.configure(width, height, self.state.xdg_states());
                surface.configure(serial);
                self.last_configure = Some(serial);
                debug!(
                    "configure {}x{} {:?} serial {}",
                    width, height, self.state, serial
                );
            }
            ShellHandle::Xdg { toplevel: None, .. } => {}
            ShellHandle::Shell(shell_surface) => {
                if shell_surface.is_alive() {
                    shell_surface.configure(wl_shell_surface::Resize::empty(), width, height);
                }
            }
        }
    }
}

/// Compositor-side state of one `wl_surface`
#[derive(Debug)]
pub struct SurfaceRecord {
    pub surface: WlSurface,
    pending_buffer: Option<WlBuffer>,
    textures: SurfaceTextures<WlBuffer, WlCallback>,
    pub pointer_focused: bool,
    pub keyboard_focused: bool,
    pub shell: Option<ShellSurface>,
}

impl SurfaceRecord {
    fn new(surface: WlSurface) -> Self {
        Self {
            surface,
            pending_buffer: None,
            textures: SurfaceTextures::new(),
            pointer_focused: false,
            keyboard_focused: false,
            shell: None,
        }
    }

    pub fn textures(&self) -> &SurfaceTextures<WlBuffer, WlCallback> {
        &self.textures
    }

    /// Size of the image on screen, or (0, 0)
    pub fn size(&self) -> (i32, i32) {
        self.textures.size()
    }
}

/// Per-connection data handed to `insert_client`
#[derive(Debug)]
pub struct ClientState {
    disconnected: Arc<Mutex<Vec<ClientId>>>,
}

impl ClientData for ClientState {
    fn initialized(&self, client_id: ClientId) {
        debug!("client connected: {:?}", client_id);
    }

    fn disconnected(&self, client_id: ClientId, reason: DisconnectReason) {
        debug!("client disconnected: {:?} ({:?})", client_id, reason);
        self.disconnected.lock().push(client_id);
    }
}

pub struct CompositorState {
    gpu: Box<dyn TextureBackend>,
    output: OutputInfo,
    /// Launched in kiosk mode: every toplevel is configured fullscreen
    fullscreen: bool,
    seat_name: String,

    surfaces: HashMap<ObjectId, SurfaceRecord>,
    /// Role-bound surfaces, bottom to top
    stack: Vec<ObjectId>,
    focus: Option<ObjectId>,
    pending_configures: Vec<ObjectId>,

    clients: HashMap<ClientId, ClientRecord>,
    disconnected: Arc<Mutex<Vec<ClientId>>>,

    keyboard: Option<KeyboardState>,
    repeat_rate: i32,
    repeat_delay: i32,
    pointer_pos: (f64, f64),
    serial: u32,
}

impl std::fmt::Debug for CompositorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositorState")
            .field("output", &self.output)
            .field("fullscreen", &self.fullscreen)
            .field("surfaces", &self.surfaces.len())
            .field("stack", &self.stack)
            .field("focus", &self.focus)
            .field("clients", &self.clients.len())
            .finish()
    }
}

impl CompositorState {
    pub fn new(
        gpu: Box<dyn TextureBackend>,
        output: OutputInfo,
        fullscreen: bool,
        seat_name: &str,
        keyboard: &KeyboardConfig,
    ) -> Self {
        Self {
            gpu,
            output,
            fullscreen,
            seat_name: seat_name.to_string(),
            surfaces: HashMap::new(),
            stack: Vec::new(),
            focus: None,
            pending_configures: Vec::new(),
            clients: HashMap::new(),
            disconnected: Arc::new(Mutex::new(Vec::new())),
            keyboard: KeyboardState::new(keyboard),
            repeat_rate: keyboard.repeat_rate,
            repeat_delay: keyboard.repeat_delay,
            pointer_pos: (0.0, 0.0),
            serial: 1,
        }
    }

    /// Data to attach to a freshly accepted client
    pub fn client_state(&self) -> Arc<ClientState> {
        Arc::new(ClientState {
            disconnected: self.disconnected.clone(),
        })
    }

    pub fn output(&self) -> &OutputInfo {
        &self.output
    }

    pub fn next_serial(&mut self) -> u32 {
        let serial = self.serial;
        self.serial = self.serial.wrapping_add(1);
        serial
    }

    pub fn surface(&self, id: &ObjectId) -> Option<&SurfaceRecord> {
        self.surfaces.get(id)
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    /// Role-bound surfaces in stacking order, bottom first
    pub fn stack(&self) -> &[ObjectId] {
        &self.stack
    }

    pub fn focused(&self) -> Option<&ObjectId> {
        self.focus.as_ref()
    }

    pub(crate) fn add_surface(&mut self, surface: WlSurface) {
        trace!("new surface {}", surface.id());
        self.surfaces
            .insert(surface.id(), SurfaceRecord::new(surface));
    }

    pub(crate) fn has_role(&self, id: &ObjectId) -> bool {
        self.surfaces
            .get(id)
            .is_some_and(|rec| rec.shell.is_some())
    }

    pub(crate) fn shell_mut(&mut self, id: &ObjectId) -> Option<&mut ShellSurface> {
        self.surfaces.get_mut(id).and_then(|rec| rec.shell.as_mut())
    }

    /// Give `id` a shell role. A wl_shell surface goes on top of the stack
    /// and takes focus right away; an xdg_surface waits until it becomes a
    /// toplevel, so a popup never steals focus from its parent.
    pub(crate) fn grant_role(&mut self, id: &ObjectId, handle: ShellHandle) {
        let Some(rec) = self.surfaces.get_mut(id) else {
            return;
        };
        let window = matches!(handle, ShellHandle::Shell(_));
        rec.shell = Some(ShellSurface::new(handle));
        if window {
            self.activate(id);
        }
    }

    pub(crate) fn set_toplevel(&mut self, id: &ObjectId, new_toplevel: XdgToplevel) {
        let Some(ShellSurface {
            handle: ShellHandle::Xdg { toplevel, .. },
            ..
        }) = self.shell_mut(id)
        else {
            return;
        };
        *toplevel = Some(new_toplevel);
        self.activate(id);
    }

    pub(crate) fn toplevel_destroyed(&mut self, id: &ObjectId) {
        if let Some(ShellSurface {
            handle: ShellHandle::Xdg { toplevel, .. },
            ..
        }) = self.shell_mut(id)
        {
            *toplevel = None;
        }
    }

    fn activate(&mut self, id: &ObjectId) {
        if let Some(prev) = self.focus.clone() {
            if &prev != id {
                let deactivated = match self.shell_mut(&prev) {
                    Some(shell) if shell.is_xdg_toplevel() => {
                        shell.state.activated = false;
                        true
                    }
                    _ => false,
                };
                if deactivated {
                    self.queue_configure(&prev);
                }
                self.leave_surface(&prev);
            }
        }
        self.focus = Some(id.clone());
        self.stack.retain(|s| s != id);
        self.stack.push(id.clone());
    }

    pub(crate) fn attach(&mut self, id: &ObjectId, buffer: Option<WlBuffer>) {
        if let Some(rec) = self.surfaces.get_mut(id) {
            rec.pending_buffer = buffer;
        }
    }

    pub(crate) fn add_frame_callback(&mut self, id: &ObjectId, callback: WlCallback) {
        if let Some(rec) = self.surfaces.get_mut(id) {
            rec.textures.add_frame_callback(callback);
        }
    }

    pub(crate) fn commit(&mut self, id: &ObjectId) {
        let Some(rec) = self.surfaces.get_mut(id) else {
            return;
        };
        let buffer = rec.pending_buffer.take();
        let out = rec.textures.commit(self.gpu.as_mut(), buffer);

        let initial = match rec.shell.as_mut() {
            Some(shell) if shell.is_xdg_toplevel() && !shell.initial_configure_sent => {
                if self.fullscreen {
                    shell.state.fullscreen = true;
                    shell.size = (self.output.width, self.output.height);
                }
                shell.state.activated = self.focus.as_ref() == Some(id);
                shell.initial_configure_sent = true;
                true
            }
            _ => false,
        };
        if initial {
            self.queue_configure(id);
        }
        finish(out, monotonic_ms());
    }

    pub(crate) fn set_fullscreen(&mut self, id: &ObjectId, on: bool) {
        let size = self.output_size();
        if let Some(shell) = self.shell_mut(id) {
            shell.state.fullscreen = on;
            shell.size = if on || shell.state.maximized { size } else { (0, 0) };
            self.queue_configure(id);
        }
    }

    pub(crate) fn set_maximized(&mut self, id: &ObjectId, on: bool) {
        let size = self.output_size();
        if let Some(shell) = self.shell_mut(id) {
            shell.state.maximized = on;
            shell.size = if on || shell.state.fullscreen { size } else { (0, 0) };
            self.queue_configure(id);
        }
    }

    fn output_size(&self) -> (i32, i32) {
        (self.output.width, self.output.height)
    }

    /// Tear down a surface: free its textures, hand back its buffers and
    /// move focus to the next surface down if it had it.
    pub(crate) fn destroy_surface(&mut self, id: &ObjectId) {
        let Some(mut rec) = self.surfaces.remove(id) else {
            return;
        };
        let out = rec.textures.release(self.gpu.as_mut());
        release_buffers(out.released);
        // Callbacks of a dead surface never fire; they die with their client
        drop(out.callbacks);

        self.stack.retain(|s| s != id);
        self.pending_configures.retain(|s| s != id);

        if self.focus.as_ref() == Some(id) {
            self.focus = self.stack.last().cloned();
            if let Some(top) = self.focus.clone() {
                debug!("focus moves to {}", top);
                let mut configure = false;
                if let Some(rec) = self.surfaces.get_mut(&top) {
                    rec.pointer_focused = false;
                    if let Some(shell) = rec.shell.as_mut().filter(|s| s.is_xdg_toplevel()) {
                        shell.state.activated = true;
                        configure = true;
                    }
                }
                if configure {
                    self.queue_configure(&top);
                }
            }
        }
    }

    /// Deliver a configure once the current dispatch is over
    pub fn queue_configure(&mut self, id: &ObjectId) {
        if !self.pending_configures.contains(id) {
            self.pending_configures.push(id.clone());
        }
    }

    pub fn has_pending_configures(&self) -> bool {
        !self.pending_configures.is_empty()
    }

    pub fn flush_configures(&mut self) {
        for id in mem::take(&mut self.pending_configures) {
            let serial = self.next_serial();
            if let Some(shell) = self.shell_mut(&id) {
                shell.send_configure(serial);
            }
        }
    }

    /// Forget clients whose connection went away
    pub fn reap_clients(&mut self) {
        let gone = mem::take(&mut *self.disconnected.lock());
        for client in gone {
            if self.clients.remove(&client).is_some() {
                trace!("dropped seat objects of {:?}", client);
            }
        }
    }

    /// Any surface with an upload in flight
    pub fn has_writing(&self) -> bool {
        self.surfaces.values().any(|rec| rec.textures.is_writing())
    }

    /// Poll every pending fence once. True if any surface got a new image.
    pub fn poll_textures(&mut self) -> bool {
        let now = monotonic_ms();
        let mut promoted = false;
        for rec in self.surfaces.values_mut() {
            if let Some(out) = rec.textures.poll(self.gpu.as_mut()) {
                promoted = true;
                finish(out, now);
            }
        }
        promoted
    }

    /// What to composite, bottom first
    pub fn drawables(&self) -> Vec<(TextureId, Rect)> {
        self.stack
            .iter()
            .filter_map(|id| self.surfaces.get(id))
            .filter_map(|rec| rec.textures.drawable())
            .map(|(texture, (width, height))| {
                (
                    texture,
                    Rect {
                        x: 0,
                        y: 0,
                        width,
                        height,
                    },
                )
            })
            .collect()
    }

    pub fn has_unbound_callbacks(&self) -> bool {
        self.surfaces
            .values()
            .any(|rec| rec.textures.has_unbound_callbacks())
    }

    /// Fire callbacks that were committed without a buffer
    pub fn fire_unbound_callbacks(&mut self) {
        let now = monotonic_ms();
        for rec in self.surfaces.values_mut() {
            for callback in rec.textures.take_unbound_callbacks() {
                if callback.is_alive() {
                    callback.done(now);
                }
            }
        }
    }
}

fn release_buffers(buffers: Vec<WlBuffer>) {
    for buffer in buffers {
        if buffer.is_alive() {
            buffer.release();
        }
    }
}

fn finish(out: Promotion<WlBuffer, WlCallback>, now: u32) {
    release_buffers(out.released);
    for callback in out.callbacks {
        if callback.is_alive() {
            callback.done(now);
        }
    }
}

/// Milliseconds on the monotonic clock, wrapping
pub fn monotonic_ms() -> u32 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    (ts.tv_sec as u64)
        .wrapping_mul(1000)
        .wrapping_add(ts.tv_nsec as u64 / 1_000_000) as u32
}

/// Advertise every global. `dmabuf` adds `zwp_linux_dmabuf_v1` when the GPU
/// can import client dmabufs.
pub fn create_globals(dh: &DisplayHandle, dmabuf: bool) {
    dh.create_global::<CompositorState, WlCompositor, _>(4, ());
    dh.create_global::<CompositorState, WlShm, _>(1, ());
    dh.create_global::<CompositorState, WlOutput, _>(3, ());
    dh.create_global::<CompositorState, WlShell, _>(1, ());
    dh.create_global::<CompositorState, XdgWmBase, _>(1, ());
    dh.create_global::<CompositorState, WlSeat, _>(6, ());
    if dmabuf {
        dh.create_global::<CompositorState, ZwpLinuxDmabufV1, _>(3, ());
    }
    info!(
        "Globals: wl_compositor v4, wl_shm v1, wl_output v3, wl_shell v1, xdg_wm_base v1, wl_seat v6{}",
        if dmabuf { ", zwp_linux_dmabuf_v1 v3" } else { "" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xdg_states_are_native_endian_u32s() {
        let state = WindowState {
            fullscreen: true,
            activated: true,
            ..WindowState::default()
        };
        let bytes = state.xdg_states();
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(
            words,
            vec![
                xdg_toplevel::State::Fullscreen as u32,
                xdg_toplevel::State::Activated as u32
            ]
        );
        assert!(WindowState::default().xdg_states().is_empty());
    }

    #[test]
    fn output_info_refresh_is_millihertz() {
        let info = OutputInfo::new(800, 600, 60);
        assert_eq!((info.width, info.height, info.refresh_mhz), (800, 600, 60_000));
    }

    #[test]
    fn monotonic_clock_moves_forward() {
        let a = monotonic_ms();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = monotonic_ms();
        assert!(b.wrapping_sub(a) >= 5);
    }
}
