//! Legacy wl_shell

use log::trace;
use wayland_server::backend::ObjectId;
use wayland_server::protocol::wl_shell::{self, WlShell};
use wayland_server::protocol::wl_shell_surface::{self, WlShellSurface};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};

use super::{CompositorState, ShellHandle};

impl GlobalDispatch<WlShell, ()> for CompositorState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<WlShell>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl Dispatch<WlShell, ()> for CompositorState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &WlShell,
        request: wl_shell::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_shell::Request::GetShellSurface { id, surface } = request {
            let surface_id = surface.id();
            if state.has_role(&surface_id) {
                resource.post_error(wl_shell::Error::Role, "surface already has a role");
                return;
            }
            let shell_surface = data_init.init(id, surface_id.clone());
            state.grant_role(&surface_id, ShellHandle::Shell(shell_surface));
        }
    }
}

impl Dispatch<WlShellSurface, ObjectId> for CompositorState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &WlShellSurface,
        request: wl_shell_surface::Request,
        surface: &ObjectId,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_shell_surface::Request::Pong { serial } => trace!("pong {}", serial),
            wl_shell_surface::Request::SetToplevel => trace!("{} set_toplevel", surface),
            wl_shell_surface::Request::SetFullscreen { .. } => state.set_fullscreen(surface, true),
            wl_shell_surface::Request::SetMaximized { .. } => state.set_maximized(surface, true),
            wl_shell_surface::Request::SetTitle { title } => {
                if let Some(shell) = state.shell_mut(surface) {
                    shell.title = Some(title);
                }
            }
            wl_shell_surface::Request::SetClass { class_ } => {
                if let Some(shell) = state.shell_mut(surface) {
                    shell.app_id = Some(class_);
                }
            }
            other => trace!("{}: ignored {:?}", surface, other),
        }
    }
}
