//! DRM/KMS output backend
//!
//! Opens the card, resolves one connector to a CRTC and mode, owns the GBM
//! scanout surface and presents its front buffer with `SetCrtc` on the first
//! frame and page flips afterwards.

pub mod flip;
pub mod topology;

use drm::control::{
    connector, crtc, framebuffer, Device as ControlDevice, Event, Mode, PageFlipFlags,
};
use drm::{Device, DriverCapability};
use gbm::{AsRaw, BufferObject, BufferObjectFlags, Format as GbmFormat};
use log::{debug, info, warn};
use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use self::flip::{EvictOnDrop, FlipChain, FramebufferCache};
use self::topology::{ConnectorInfo, CrtcReservations, EncoderInfo, ModeInfo, Topology};

#[derive(Debug, Error)]
pub enum DrmError {
    #[error("cannot open '{path}': {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("failed to create GBM {what}: {source}")]
    Gbm { what: &'static str, source: io::Error },
    #[error("failed to read mode-setting resources: {0}")]
    Resources(io::Error),
    #[error("connector index {0} is not connected or has no modes")]
    NoConnector(usize),
    #[error("no usable CRTC for connector {0}")]
    NoCrtc(u32),
    #[error("connector {0} reports no modes")]
    NoMode(u32),
    #[error("no front buffer available on the scanout surface")]
    NoFrontBuffer,
    #[error("failed to register framebuffer: {0}")]
    Framebuffer(io::Error),
    #[error("mode set failed: {0}")]
    Modeset(io::Error),
    #[error("page flip already pending")]
    Busy,
    #[error("page flip failed: {0}")]
    PageFlip(io::Error),
    #[error("failed to read DRM events: {0}")]
    Events(io::Error),
}

impl DrmError {
    /// Whether the output is unusable after this error. A refused or failed
    /// flip only loses one frame; everything else means scanout never starts
    /// or can no longer continue.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DrmError::Busy | DrmError::PageFlip(_) | DrmError::Events(_)
        )
    }
}

/// A DRM device node
#[derive(Debug)]
pub struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

impl Card {
    pub fn open(path: &Path) -> Result<Self, DrmError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|source| DrmError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Card(file))
    }
}

/// The resolved output: connector, encoder and CRTC plus the chosen mode
#[derive(Debug, Clone)]
pub struct ModesetDevice {
    pub connector: connector::Handle,
    pub connector_index: usize,
    pub crtc: crtc::Handle,
    pub encoder_id: u32,
    pub mode: Mode,
    pub width: u32,
    pub height: u32,
}

/// Userdata on each scanout buffer; destroying the buffer retires its
/// framebuffer
type ScanoutGuard = EvictOnDrop<usize>;

pub struct DrmBackend {
    gbm: gbm::Device<Card>,
    surface: gbm::Surface<ScanoutGuard>,
    output: ModesetDevice,
    async_flip: bool,
    crtc_set: bool,
    framebuffers: FramebufferCache<usize, framebuffer::Handle>,
    chain: FlipChain<BufferObject<ScanoutGuard>>,
}

impl std::fmt::Debug for DrmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrmBackend")
            .field("output", &self.output)
            .field("async_flip", &self.async_flip)
            .field("framebuffers", &self.framebuffers.len())
            .finish()
    }
}

fn find_handle<H: Copy + Into<u32>>(handles: &[H], id: u32) -> Option<H> {
    handles.iter().copied().find(|h| (*h).into() == id)
}

impl DrmBackend {
    /// Open `device`, pick the connector at `connector_index` and create a
    /// scanout surface. `requested` is the windowed size, if any; without
    /// one the connector's first mode decides the output size.
    pub fn open(
        device: &Path,
        connector_index: usize,
        requested: Option<(u32, u32)>,
    ) -> Result<Self, DrmError> {
        let card = Card::open(device)?;
        let gbm = gbm::Device::new(card).map_err(|source| DrmError::Gbm {
            what: "device",
            source,
        })?;
        info!("🖥️ Opened DRM device {}", device.display());

        // Only the master may call SetCrtc
        if let Err(e) = gbm.acquire_master_lock() {
            warn!("Could not become DRM master: {}", e);
        }

        let async_flip = matches!(
            gbm.get_driver_capability(DriverCapability::ASyncPageFlip),
            Ok(1)
        );
        if async_flip {
            info!("Async page flip is supported by this driver");
        } else {
            info!("Async page flip is not supported by this driver");
        }

        let output = Self::resolve_output(&gbm, connector_index, requested)?;
        info!(
            "====> conn({}), encd({}), crtc({}) {}x{}@{}",
            u32::from(output.connector),
            output.encoder_id,
            u32::from(output.crtc),
            output.width,
            output.height,
            output.mode.vrefresh()
        );

        let surface = gbm
            .create_surface::<ScanoutGuard>(
                output.width,
                output.height,
                GbmFormat::Argb8888,
                BufferObjectFlags::SCANOUT | BufferObjectFlags::RENDERING,
            )
            .map_err(|source| DrmError::Gbm {
                what: "surface",
                source,
            })?;

        Ok(Self {
            gbm,
            surface,
            output,
            async_flip,
            crtc_set: false,
            framebuffers: FramebufferCache::new(),
            chain: FlipChain::new(),
        })
    }

    fn snapshot(card: &impl ControlDevice) -> Result<(Topology, Vec<connector::Info>, Vec<crtc::Handle>), DrmError> {
        let res = card.resource_handles().map_err(DrmError::Resources)?;

        let mut infos = Vec::new();
        let mut connectors = Vec::new();
        for &handle in res.connectors() {
            let info = card
                .get_connector(handle, false)
                .map_err(DrmError::Resources)?;
            connectors.push(ConnectorInfo {
                id: handle.into(),
                connected: info.state() == connector::State::Connected,
                modes: info
                    .modes()
                    .iter()
                    .map(|m| {
                        let (width, height) = m.size();
                        ModeInfo {
                            width,
                            height,
                            vrefresh: m.vrefresh(),
                        }
                    })
                    .collect(),
                current_encoder: info.current_encoder().map(Into::into),
                encoders: info.encoders().iter().map(|&e| e.into()).collect(),
            });
            infos.push(info);
        }

        let mut encoders = Vec::new();
        for &handle in res.encoders() {
            match card.get_encoder(handle) {
                Ok(enc) => encoders.push(EncoderInfo {
                    id: handle.into(),
                    crtc: enc.crtc().map(Into::into),
                    possible_crtcs: res
                        .filter_crtcs(enc.possible_crtcs())
                        .into_iter()
                        .map(Into::into)
                        .collect(),
                }),
                Err(e) => warn!("cannot retrieve encoder {}: {}", u32::from(handle), e),
            }
        }

        let crtcs = res.crtcs().to_vec();
        let topology = Topology {
            connectors,
            encoders,
            crtcs: crtcs.iter().map(|&c| c.into()).collect(),
        };
        Ok((topology, infos, crtcs))
    }

    fn resolve_output(
        card: &impl ControlDevice,
        connector_index: usize,
        requested: Option<(u32, u32)>,
    ) -> Result<ModesetDevice, DrmError> {
        let (topology, infos, crtcs) = Self::snapshot(card)?;

        for (i, conn) in topology.connectors.iter().enumerate() {
            if conn.is_usable() {
                let marker = if i == connector_index { "*" } else { "" };
                info!("connector[{}] id({}) modes({}){}", i, conn.id, conn.modes.len(), marker);
            }
        }

        let conn = topology
            .connectors
            .get(connector_index)
            .filter(|c| c.is_usable())
            .ok_or(DrmError::NoConnector(connector_index))?;
        let mode_index = topology::select_mode(&conn.modes, requested)
            .ok_or(DrmError::NoMode(conn.id))?;

        let mut reservations = CrtcReservations::new();
        let choice = topology
            .find_crtc(connector_index, &mut reservations)
            .ok_or(DrmError::NoCrtc(conn.id))?;
        let crtc = find_handle(&crtcs, choice.crtc).ok_or(DrmError::NoCrtc(conn.id))?;

        let info = &infos[connector_index];
        let mode = info.modes()[mode_index];
        let (w, h) = mode.size();

        Ok(ModesetDevice {
            connector: info.handle(),
            connector_index,
            crtc,
            encoder_id: choice.encoder,
            mode,
            width: u32::from(w),
            height: u32::from(h),
        })
    }

    /// Output size in pixels
    pub fn size(&self) -> (u32, u32) {
        (self.output.width, self.output.height)
    }

    pub fn output(&self) -> &ModesetDevice {
        &self.output
    }

    /// Native display handle for the GPU context
    pub fn gbm_device_ptr(&self) -> *mut c_void {
        self.gbm.as_raw() as *mut c_void
    }

    /// Native window handle for the GPU context
    pub fn gbm_surface_ptr(&self) -> *mut c_void {
        self.surface.as_raw() as *mut c_void
    }

    /// Scan out the buffer the GPU context just finished.
    ///
    /// Must be called after the context swapped its buffers. With `vsync`
    /// this blocks until the flip completes. [`DrmError::Busy`] means the
    /// previous flip is still pending and the frame was dropped.
    pub fn present(&mut self, vsync: bool) -> Result<(), DrmError> {
        self.remove_dead_framebuffers();

        // SAFETY: called only after eglSwapBuffers on this surface
        let mut bo =
            unsafe { self.surface.lock_front_buffer() }.map_err(|_| DrmError::NoFrontBuffer)?;

        let key = bo.as_raw() as usize;
        let card = &self.gbm;
        let fb = self.framebuffers.get_or_try_insert::<io::Error>(key, || {
            let fb = card.add_framebuffer(&bo, 24, 32)?;
            info!("registered framebuffer {} for scanout buffer {:#x}", u32::from(fb), key);
            Ok(fb)
        });
        let fb = fb.map_err(DrmError::Framebuffer)?;
        if matches!(bo.userdata(), Ok(None)) {
            match bo.set_userdata(self.framebuffers.evict_on_drop(key)) {
                Ok(previous) => previous.into_iter().for_each(EvictOnDrop::disarm),
                Err(e) => debug!("cannot tag scanout buffer {:#x}: {}", key, e),
            }
        }

        if !self.crtc_set {
            self.gbm
                .set_crtc(
                    self.output.crtc,
                    Some(fb),
                    (0, 0),
                    &[self.output.connector],
                    Some(self.output.mode),
                )
                .map_err(DrmError::Modeset)?;
            self.crtc_set = true;
        } else {
            let mut flags = PageFlipFlags::empty();
            if vsync {
                flags |= PageFlipFlags::EVENT;
            } else if self.async_flip {
                flags |= PageFlipFlags::ASYNC;
            }

            match self.gbm.page_flip(self.output.crtc, fb, flags, None) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    debug!("page flip busy, dropping frame");
                    return Err(DrmError::Busy);
                }
                Err(e) => return Err(DrmError::PageFlip(e)),
            }

            if vsync {
                self.wait_for_flip()?;
            }
        }

        // Returning the buffer object to the surface makes it reusable
        drop(self.chain.schedule(bo));
        Ok(())
    }

    /// Unregister framebuffers whose scanout buffers GBM has destroyed
    fn remove_dead_framebuffers(&mut self) {
        for fb in self.framebuffers.reap() {
            debug!("removing framebuffer {} of a destroyed buffer", u32::from(fb));
            if let Err(e) = self.gbm.destroy_framebuffer(fb) {
                debug!("failed to remove framebuffer {}: {}", u32::from(fb), e);
            }
        }
    }

    fn wait_for_flip(&self) -> Result<(), DrmError> {
        loop {
            let events = self.gbm.receive_events().map_err(DrmError::Events)?;
            for event in events {
                if let Event::PageFlip(flip) = event {
                    if flip.crtc == self.output.crtc {
                        return Ok(());
                    }
                }
            }
        }
    }
}

impl Drop for DrmBackend {
    fn drop(&mut self) {
        drop(self.chain.take_all());
        for fb in self.framebuffers.drain() {
            if let Err(e) = self.gbm.destroy_framebuffer(fb) {
                debug!("failed to remove framebuffer {}: {}", u32::from(fb), e);
            }
        }
        if let Err(e) = self.gbm.release_master_lock() {
            debug!("failed to drop DRM master: {}", e);
        }
    }
}
