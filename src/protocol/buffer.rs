//! Client buffers: wl_shm pools and linux-dmabuf
//!
//! Every `wl_buffer` carries a [`BufferData`] describing where its pixels
//! live; the texture pipeline reads them through [`PixelSource`].

use log::{debug, trace, warn};
use memmap2::{Mmap, MmapOptions};
use parking_lot::{Mutex, RwLock};
use std::cell::Cell;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::{Arc, Once};
use wayland_protocols::wp::linux_dmabuf::zv1::server::zwp_linux_buffer_params_v1::{
    self, ZwpLinuxBufferParamsV1,
};
use wayland_protocols::wp::linux_dmabuf::zv1::server::zwp_linux_dmabuf_v1::{
    self, ZwpLinuxDmabufV1,
};
use wayland_server::protocol::wl_buffer::{self, WlBuffer};
use wayland_server::protocol::wl_shm::{self, WlShm};
use wayland_server::protocol::wl_shm_pool::{self, WlShmPool};
use wayland_server::{Client, DataInit, Dispatch, DisplayHandle, GlobalDispatch, New, Resource, WEnum};

use super::CompositorState;
use crate::pipeline::{ClientImage, DmabufImage, PixelSource, ShmFormat, ShmImage};

pub const DRM_FORMAT_ARGB8888: u32 = 0x3432_5241;
pub const DRM_FORMAT_XRGB8888: u32 = 0x3432_5258;
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

const DMABUF_FORMATS: [u32; 2] = [DRM_FORMAT_ARGB8888, DRM_FORMAT_XRGB8888];

/// Map a wire shm format to one the pipeline uploads
pub fn shm_format(format: wl_shm::Format) -> Option<ShmFormat> {
    match format {
        wl_shm::Format::Argb8888 => Some(ShmFormat::Argb8888),
        wl_shm::Format::Xrgb8888 => Some(ShmFormat::Xrgb8888),
        wl_shm::Format::Rgb565 => Some(ShmFormat::Rgb565),
        _ => None,
    }
}

/// A client memory pool, remapped on resize
#[derive(Debug)]
pub struct ShmPool {
    fd: OwnedFd,
    map: RwLock<Mmap>,
}

impl ShmPool {
    fn map(fd: &OwnedFd, size: usize) -> std::io::Result<Mmap> {
        unsafe { MmapOptions::new().len(size).map(fd) }
    }

    pub fn new(fd: OwnedFd, size: usize) -> std::io::Result<Self> {
        let map = Self::map(&fd, size)?;
        Ok(Self {
            fd,
            map: RwLock::new(map),
        })
    }

    pub fn size(&self) -> usize {
        self.map.read().len()
    }

    /// Grow the mapping. Pools never shrink.
    pub fn resize(&self, size: usize) -> std::io::Result<()> {
        let map = Self::map(&self.fd, size)?;
        *self.map.write() = map;
        Ok(())
    }

    /// Read the pool. The client owns the file and may truncate it at any
    /// time; touching a page past the new end raises SIGBUS. While `f` runs
    /// such a fault swaps the mapping for zero pages, `f` completes on
    /// garbage and the access reports [`ShmAccessError`].
    pub fn access<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, ShmAccessError> {
        install_sigbus_handler();
        let map = self.map.read();
        let guarded = PoolAccess {
            base: map.as_ptr() as usize,
            len: map.len(),
            faulted: false,
        };
        let outer = POOL_ACCESS.with(|cell| cell.replace(guarded));
        let out = f(&map);
        let done = POOL_ACCESS.with(|cell| cell.replace(outer));
        if done.faulted {
            Err(ShmAccessError)
        } else {
            Ok(out)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client truncated its shm pool")]
pub struct ShmAccessError;

#[derive(Debug, Clone, Copy)]
struct PoolAccess {
    base: usize,
    len: usize,
    faulted: bool,
}

thread_local! {
    static POOL_ACCESS: Cell<PoolAccess> = const {
        Cell::new(PoolAccess {
            base: 0,
            len: 0,
            faulted: false,
        })
    };
}

fn install_sigbus_handler() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_sigbus as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGBUS, &action, std::ptr::null_mut()) != 0 {
            warn!(
                "Failed to install the SIGBUS handler: {}",
                std::io::Error::last_os_error()
            );
        }
    });
}

extern "C" fn on_sigbus(_signal: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    let addr = unsafe { (*info).si_addr() } as usize;
    let handled = POOL_ACCESS
        .try_with(|cell| {
            let mut access = cell.get();
            if access.len == 0 || addr < access.base || addr >= access.base + access.len {
                return false;
            }
            let zeroes = unsafe {
                libc::mmap(
                    access.base as *mut libc::c_void,
                    access.len,
                    libc::PROT_READ,
                    libc::MAP_PRIVATE | libc::MAP_FIXED | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if zeroes == libc::MAP_FAILED {
                return false;
            }
            access.faulted = true;
            cell.set(access);
            true
        })
        .unwrap_or(false);

    if !handled {
        // Not a pool fault: let the retried access take the default action
        unsafe {
            libc::signal(libc::SIGBUS, libc::SIG_DFL);
        }
    }
}

#[derive(Debug)]
pub struct ShmBuffer {
    pub pool: Arc<ShmPool>,
    pub offset: usize,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub format: ShmFormat,
}

#[derive(Debug)]
pub struct DmabufBuffer {
    pub fd: OwnedFd,
    pub width: i32,
    pub height: i32,
    pub fourcc: u32,
    pub offset: u32,
    pub stride: u32,
    pub modifier: u64,
}

/// User data of every wl_buffer
#[derive(Debug)]
pub enum BufferData {
    Shm(ShmBuffer),
    Dmabuf(DmabufBuffer),
}

impl PixelSource for WlBuffer {
    fn with_image<R>(&self, f: impl FnOnce(&ClientImage<'_>) -> R) -> Option<R> {
        match self.data::<BufferData>()? {
            BufferData::Shm(shm) => {
                let result = shm.pool.access(|map| {
                    let data = map.get(shm.offset..).unwrap_or(&[]);
                    f(&ClientImage::Shm(ShmImage {
                        data,
                        width: shm.width,
                        height: shm.height,
                        stride: shm.stride,
                        format: shm.format,
                    }))
                });
                match result {
                    Ok(out) => Some(out),
                    Err(e) => {
                        warn!("{}: {}", self.id(), e);
                        self.post_error(wl_shm::Error::InvalidFd, "error accessing SHM buffer");
                        None
                    }
                }
            }
            BufferData::Dmabuf(dmabuf) => Some(f(&ClientImage::Dmabuf(DmabufImage {
                fd: dmabuf.fd.as_fd(),
                width: dmabuf.width,
                height: dmabuf.height,
                fourcc: dmabuf.fourcc,
                offset: dmabuf.offset,
                stride: dmabuf.stride,
                modifier: dmabuf.modifier,
            }))),
        }
    }
}

/// Check a create_buffer request against the pool. Returns the offset as
/// an index into the mapping.
fn check_shm_layout(
    pool_size: usize,
    offset: i32,
    width: i32,
    height: i32,
    stride: i32,
    format: ShmFormat,
) -> Option<usize> {
    if offset < 0 || width <= 0 || height <= 0 || stride <= 0 {
        return None;
    }
    let min_stride = (width as i64) * format.bytes_per_pixel() as i64;
    if (stride as i64) < min_stride {
        return None;
    }
    let end = offset as i64 + stride as i64 * height as i64;
    if end > pool_size as i64 {
        return None;
    }
    Some(offset as usize)
}

impl GlobalDispatch<WlShm, ()> for CompositorState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<WlShm>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let shm = data_init.init(resource, ());
        shm.format(wl_shm::Format::Argb8888);
        shm.format(wl_shm::Format::Xrgb8888);
        shm.format(wl_shm::Format::Rgb565);
    }
}

impl Dispatch<WlShm, ()> for CompositorState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        resource: &WlShm,
        request: wl_shm::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        if let wl_shm::Request::CreatePool { id, fd, size } = request {
            if size <= 0 {
                resource.post_error(wl_shm::Error::InvalidStride, format!("invalid pool size {}", size));
                return;
            }
            match ShmPool::new(fd, size as usize) {
                Ok(pool) => {
                    data_init.init(id, Arc::new(pool));
                }
                Err(e) => {
                    warn!("Failed to map shm pool: {}", e);
                    resource.post_error(wl_shm::Error::InvalidFd, format!("mmap failed: {}", e));
                }
            }
        }
    }
}

impl Dispatch<WlShmPool, Arc<ShmPool>> for CompositorState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        resource: &WlShmPool,
        request: wl_shm_pool::Request,
        pool: &Arc<ShmPool>,
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        match request {
            wl_shm_pool::Request::CreateBuffer {
                id,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let format = match format {
                    WEnum::Value(f) => shm_format(f),
                    WEnum::Unknown(_) => None,
                };
                let Some(format) = format else {
                    resource.post_error(wl_shm::Error::InvalidFormat, "unsupported format");
                    return;
                };
                let Some(offset) =
                    check_shm_layout(pool.size(), offset, width, height, stride, format)
                else {
                    resource.post_error(
                        wl_shm::Error::InvalidStride,
                        format!(
                            "buffer {}x{} stride {} offset {} outside the pool",
                            width, height, stride, offset
                        ),
                    );
                    return;
                };
                data_init.init(
                    id,
                    BufferData::Shm(ShmBuffer {
                        pool: pool.clone(),
                        offset,
                        width,
                        height,
                        stride,
                        format,
                    }),
                );
            }
            wl_shm_pool::Request::Resize { size } => {
                if size <= 0 || (size as usize) < pool.size() {
                    resource.post_error(wl_shm::Error::InvalidStride, "shrinking pool invalid");
                    return;
                }
                if let Err(e) = pool.resize(size as usize) {
                    warn!("Failed to remap shm pool: {}", e);
                    resource.post_error(wl_shm::Error::InvalidFd, format!("mmap failed: {}", e));
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<WlBuffer, BufferData> for CompositorState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &WlBuffer,
        _request: wl_buffer::Request,
        _data: &BufferData,
        _dhandle: &DisplayHandle,
        _data_init: &mut DataInit<'_, Self>,
    ) {
    }
}

struct Plane {
    fd: OwnedFd,
    offset: u32,
    stride: u32,
    modifier: u64,
}

/// State of one zwp_linux_buffer_params_v1
#[derive(Default)]
pub struct DmabufParams {
    inner: Mutex<ParamsInner>,
}

#[derive(Default)]
struct ParamsInner {
    plane: Option<Plane>,
    used: bool,
}

impl DmabufParams {
    /// Validate and consume the params. Errors are posted on `params`.
    fn build(
        &self,
        params: &ZwpLinuxBufferParamsV1,
        width: i32,
        height: i32,
        format: u32,
    ) -> Option<BufferData> {
        use zwp_linux_buffer_params_v1::Error;

        let mut inner = self.inner.lock();
        if inner.used {
            params.post_error(Error::AlreadyUsed, "params already used");
            return None;
        }
        inner.used = true;
        let Some(plane) = inner.plane.take() else {
            params.post_error(Error::Incomplete, "no plane added");
            return None;
        };
        if width <= 0 || height <= 0 {
            params.post_error(Error::InvalidDimensions, format!("{}x{}", width, height));
            return None;
        }
        if !DMABUF_FORMATS.contains(&format) {
            params.post_error(Error::InvalidFormat, format!("format {:#010x}", format));
            return None;
        }
        Some(BufferData::Dmabuf(DmabufBuffer {
            fd: plane.fd,
            width,
            height,
            fourcc: format,
            offset: plane.offset,
            stride: plane.stride,
            modifier: plane.modifier,
        }))
    }
}

impl GlobalDispatch<ZwpLinuxDmabufV1, ()> for CompositorState {
    fn bind(
        _state: &mut Self,
        _handle: &DisplayHandle,
        _client: &Client,
        resource: New<ZwpLinuxDmabufV1>,
        _global_data: &(),
        data_init: &mut DataInit<'_, Self>,
    ) {
        let dmabuf = data_init.init(resource, ());
        for format in DMABUF_FORMATS {
            dmabuf.format(format);
            if dmabuf.version() >= 3 {
                dmabuf.modifier(
                    format,
                    (DRM_FORMAT_MOD_LINEAR >> 32) as u32,
                    DRM_FORMAT_MOD_LINEAR as u32,
                );
            }
        }
    }
}

impl Dispatch<ZwpLinuxDmabufV1, ()> for CompositorState {
    fn request(
        _state: &mut Self,
        _client: &Client,
        _resource: &ZwpLinuxDmabufV1,
        request: zwp_linux_dmabuf_v1::Request,
        _data: &(),
        _dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        if let zwp_linux_dmabuf_v1::Request::CreateParams { params_id } = request {
            data_init.init(params_id, DmabufParams::default());
        }
    }
}

impl Dispatch<ZwpLinuxBufferParamsV1, DmabufParams> for CompositorState {
    fn request(
        _state: &mut Self,
        client: &Client,
        resource: &ZwpLinuxBufferParamsV1,
        request: zwp_linux_buffer_params_v1::Request,
        data: &DmabufParams,
        dhandle: &DisplayHandle,
        data_init: &mut DataInit<'_, Self>,
    ) {
        use zwp_linux_buffer_params_v1::Error;

        match request {
            zwp_linux_buffer_params_v1::Request::Add {
                fd,
                plane_idx,
                offset,
                stride,
                modifier_hi,
                modifier_lo,
            } => {
                let mut inner = data.inner.lock();
                if inner.used {
                    resource.post_error(Error::AlreadyUsed, "params already used");
                } else if plane_idx != 0 {
                    resource.post_error(Error::PlaneIdx, "only single-plane buffers are supported");
                } else if inner.plane.is_some() {
                    resource.post_error(Error::PlaneSet, "plane 0 already set");
                } else {
                    inner.plane = Some(Plane {
                        fd,
                        offset,
                        stride,
                        modifier: (u64::from(modifier_hi) << 32) | u64::from(modifier_lo),
                    });
                }
            }
            zwp_linux_buffer_params_v1::Request::Create {
                width,
                height,
                format,
                flags,
            } => {
                trace!("dmabuf create flags {:?}", flags);
                let Some(buffer) = data.build(resource, width, height, format) else {
                    return;
                };
                match client.create_resource::<WlBuffer, BufferData, CompositorState>(
                    dhandle, 1, buffer,
                ) {
                    Ok(buffer) => {
                        debug!("dmabuf buffer {}x{} created", width, height);
                        resource.created(&buffer);
                    }
                    Err(_) => resource.failed(),
                }
            }
            zwp_linux_buffer_params_v1::Request::CreateImmed {
                buffer_id,
                width,
                height,
                format,
                flags,
            } => {
                trace!("dmabuf create_immed flags {:?}", flags);
                if let Some(buffer) = data.build(resource, width, height, format) {
                    data_init.init(buffer_id, buffer);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn shm_formats_map_to_pipeline_formats() {
        assert_eq!(shm_format(wl_shm::Format::Xrgb8888), Some(ShmFormat::Xrgb8888));
        assert_eq!(shm_format(wl_shm::Format::Argb8888), Some(ShmFormat::Argb8888));
        assert_eq!(shm_format(wl_shm::Format::Rgb565), Some(ShmFormat::Rgb565));
        assert_eq!(shm_format(wl_shm::Format::Nv12), None);
    }

    #[test]
    fn shm_layout_must_fit_in_pool() {
        let f = ShmFormat::Xrgb8888;
        assert_eq!(check_shm_layout(64 * 64 * 4, 0, 64, 64, 256, f), Some(0));
        // One byte short
        assert_eq!(check_shm_layout(64 * 64 * 4 - 1, 0, 64, 64, 256, f), None);
        // Stride narrower than a row
        assert_eq!(check_shm_layout(1 << 20, 0, 64, 64, 255, f), None);
        assert_eq!(check_shm_layout(1 << 20, -4, 64, 64, 256, f), None);
        assert_eq!(check_shm_layout(1 << 20, 0, 0, 64, 256, f), None);
        assert_eq!(check_shm_layout(1 << 20, 4096, 16, 16, 64, f), Some(4096));
        assert_eq!(
            check_shm_layout(64 * 2 * 8, 0, 64, 8, 128, ShmFormat::Rgb565),
            Some(0)
        );
    }

    #[test]
    fn pool_grows_on_resize() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[7u8; 4096]).unwrap();
        let pool = ShmPool::new(OwnedFd::from(file.try_clone().unwrap()), 1024).unwrap();
        assert_eq!(pool.size(), 1024);
        pool.resize(4096).unwrap();
        assert_eq!(pool.size(), 4096);
        assert_eq!(pool.map.read()[4095], 7);
    }

    #[test]
    fn truncated_pool_reports_a_fault_instead_of_crashing() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(8192).unwrap();
        let pool = ShmPool::new(OwnedFd::from(file.try_clone().unwrap()), 8192).unwrap();
        assert_eq!(pool.access(|map| map[4096]), Ok(0));

        file.set_len(0).unwrap();
        assert_eq!(pool.access(|map| map[4096]), Err(ShmAccessError));

        // The mapping now holds zero pages
        assert_eq!(pool.access(|map| map[4096]), Ok(0));
    }

    #[test]
    fn access_window_closes_when_done() {
        let file = tempfile::tempfile().unwrap();
        file.set_len(4096).unwrap();
        let pool = ShmPool::new(OwnedFd::from(file), 4096).unwrap();
        let inside = pool.access(|map| {
            let access = POOL_ACCESS.with(Cell::get);
            (access.base == map.as_ptr() as usize, access.len)
        });
        assert_eq!(inside, Ok((true, 4096)));
        let after = POOL_ACCESS.with(Cell::get);
        assert_eq!((after.base, after.len, after.faulted), (0, 0, false));
    }
}
