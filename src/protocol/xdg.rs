//! xdg_wm_base, xdg_surface and xdg_toplevel
//!
//! Popups are not supported: they are created and immediately dismissed.

use log::{debug, trace};
use wayland_protocols::xdg::shell::server::xdg_popup::{self, XdgPopup};
use wayland_protocols::xdg::shell::server::xdg_positioner::{self, XdgPositioner};
use wayland_protocols::xdg::shell::server::xdg_surface::{self, XdgSurface};
use wayland_protocols::xdg::shell::server::xdg_toplevel::{self, XdgToplevel};
use wayland_protocols::xdg::shell::server::xdg_wm_base::{self, XdgWmBase};
use wayland_server::backend::{ClientId, ObjectId};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};

use super::{CompositorState, ShellHandle};
use crate::render::Rect;

impl GlobalDispatch<XdgWmBase, ()> for CompositorState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<XdgWmBase>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl Dispatch<XdgWmBase, ()> for CompositorState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &XdgWmBase,
        request: xdg_wm_base::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_wm_base::Request::CreatePositioner { id } => {
                data_init.init(id, ());
            }
            xdg_wm_base::Request::GetXdgSurface { id, surface } => {
                let surface_id = surface.id();
                if state.has_role(&surface_id) {
                    resource.post_error(xdg_wm_base::Error::Role, "surface already has a role");
                    return;
                }
                let xdg_surface = data_init.init(id, surface_id.clone());
                state.grant_role(
                    &surface_id,
                    ShellHandle::Xdg {
                        surface: xdg_surface,
                        toplevel: None,
                    },
                );
            }
            xdg_wm_base::Request::Pong { serial } => trace!("pong {}", serial),
            _ => {}
        }
    }
}

impl Dispatch<XdgPositioner, ()> for CompositorState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &XdgPositioner,
        _request: xdg_positioner::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}

impl Dispatch<XdgSurface, ObjectId> for CompositorState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &XdgSurface,
        request: xdg_surface::Request,
        surface: &ObjectId,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_surface::Request::GetToplevel { id } => {
                let toplevel = data_init.init(id, surface.clone());
                state.set_toplevel(surface, toplevel);
            }
            xdg_surface::Request::GetPopup { id, .. } => {
                let popup = data_init.init(id, ());
                popup.popup_done();
            }
            xdg_surface::Request::SetWindowGeometry {
                x,
                y,
                width,
                height,
            } => {
                if let Some(shell) = state.shell_mut(surface) {
                    shell.geometry = Some(Rect {
                        x,
                        y,
                        width,
                        height,
                    });
                }
            }
            xdg_surface::Request::AckConfigure { serial } => {
                if let Some(shell) = state.shell_mut(surface) {
                    debug!("ack_configure {}", serial);
                    shell.acked_configure = Some(serial);
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<XdgToplevel, ObjectId> for CompositorState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &XdgToplevel,
        request: xdg_toplevel::Request,
        surface: &ObjectId,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            xdg_toplevel::Request::SetTitle { title } => {
                if let Some(shell) = state.shell_mut(surface) {
                    shell.title = Some(title);
                }
            }
            xdg_toplevel::Request::SetAppId { app_id } => {
                if let Some(shell) = state.shell_mut(surface) {
                    shell.app_id = Some(app_id);
                }
            }
            xdg_toplevel::Request::SetMinSize { width, height } => {
                if let Some(shell) = state.shell_mut(surface) {
                    shell.min_size = (width, height);
                }
            }
            xdg_toplevel::Request::SetMaxSize { width, height } => {
                if let Some(shell) = state.shell_mut(surface) {
                    shell.max_size = (width, height);
                }
            }
            xdg_toplevel::Request::SetFullscreen { .. } => state.set_fullscreen(surface, true),
            xdg_toplevel::Request::UnsetFullscreen => state.set_fullscreen(surface, false),
            xdg_toplevel::Request::SetMaximized => state.set_maximized(surface, true),
            xdg_toplevel::Request::UnsetMaximized => state.set_maximized(surface, false),
            xdg_toplevel::Request::Destroy => {}
            other => trace!("{}: ignored {:?}", surface, other),
        }
    }

    fn destroyed(state: &mut Self, _client: ClientId, _resource: &XdgToplevel, surface: &ObjectId) {
        state.toplevel_destroyed(surface);
    }
}

impl Dispatch<XdgPopup, ()> for CompositorState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &XdgPopup,
        _request: xdg_popup::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}
