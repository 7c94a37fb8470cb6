//! wl_compositor, wl_surface, wl_region and wl_callback

use log::{debug, trace};
use parking_lot::Mutex;
use wayland_server::backend::ClientId;
use wayland_server::protocol::wl_callback::{self, WlCallback};
use wayland_server::protocol::wl_compositor::{self, WlCompositor};
use wayland_server::protocol::wl_region::{self, WlRegion};
use wayland_server::protocol::wl_surface::{self, WlSurface};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource};

use super::CompositorState;
use crate::render::Rect;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionOp {
    Add(Rect),
    Subtract(Rect),
}

/// Rectangles recorded on a wl_region, in request order
#[derive(Debug, Default)]
pub struct RegionData {
    pub ops: Mutex<Vec<RegionOp>>,
}

impl GlobalDispatch<WlCompositor, ()> for CompositorState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<WlCompositor>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        data_init.init(resource, ());
    }
}

impl Dispatch<WlCompositor, ()> for CompositorState {
    fn request(
        state: &mut Self,
        _client: &Client,
        _resource: &WlCompositor,
        request: wl_compositor::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_compositor::Request::CreateSurface { id } => {
                let surface = data_init.init(id, ());
                state.add_surface(surface);
            }
            wl_compositor::Request::CreateRegion { id } => {
                data_init.init(id, RegionData::default());
            }
            _ => {}
        }
    }
}

impl Dispatch<WlSurface, ()> for CompositorState {
    fn request(
        state: &mut Self,
        _client: &Client,
        resource: &WlSurface,
        request: wl_surface::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        let id = resource.id();
        match request {
            wl_surface::Request::Attach { buffer, x, y } => {
                if x != 0 || y != 0 {
                    trace!("attach offset {},{} ignored", x, y);
                }
                state.attach(&id, buffer);
            }
            wl_surface::Request::Frame { callback } => {
                let callback = data_init.init(callback, ());
                state.add_frame_callback(&id, callback);
            }
            wl_surface::Request::Commit => state.commit(&id),
            wl_surface::Request::Destroy => {}
            wl_surface::Request::Damage { .. }
            | wl_surface::Request::DamageBuffer { .. }
            | wl_surface::Request::SetOpaqueRegion { .. }
            | wl_surface::Request::SetInputRegion { .. }
            | wl_surface::Request::SetBufferTransform { .. }
            | wl_surface::Request::SetBufferScale { .. } => {
                trace!("{}: {:?}", id, request);
            }
            _ => debug!("unhandled wl_surface request"),
        }
    }

    fn destroyed(state: &mut Self, _client: ClientId, resource: &WlSurface, _data: &()) {
        state.destroy_surface(&resource.id());
    }
}

impl Dispatch<WlCallback, ()> for CompositorState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &WlCallback,
        _request: wl_callback::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}

impl Dispatch<WlRegion, RegionData> for CompositorState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &WlRegion,
        request: wl_region::Request,
        data: &RegionData,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_region::Request::Add {
                x,
                y,
                width,
                height,
            } => data.ops.lock().push(RegionOp::Add(Rect {
                x,
                y,
                width,
                height,
            })),
            wl_region::Request::Subtract {
                x,
                y,
                width,
                height,
            } => data.ops.lock().push(RegionOp::Subtract(Rect {
                x,
                y,
                width,
                height,
            })),
            _ => {}
        }
    }
}
