//! Output composition
//!
//! [`Presenter`] is what the frame scheduler draws through. [`KmsOutput`]
//! implements it on top of an EGL context rendering into the DRM backend's
//! scanout surface.

pub mod gles;

use anyhow::{Context, Result};
use log::{info, warn};

use crate::drm::{DrmBackend, DrmError};
use crate::egl::EglState;
use crate::pipeline::TextureId;

use self::gles::{GlesTextures, QuadRenderer};

/// A rectangle in output pixels, origin at the top left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapStatus {
    Presented,
    /// The display was still busy with the previous frame; try again later
    Busy,
    /// The flip failed but the output is still usable
    Dropped,
}

impl SwapStatus {
    /// Classify the outcome of handing a frame to the display. Only errors
    /// that leave the output unusable come back as `Err`.
    pub fn from_present(result: Result<(), DrmError>) -> Result<Self, DrmError> {
        match result {
            Ok(()) => Ok(SwapStatus::Presented),
            Err(DrmError::Busy) => Ok(SwapStatus::Busy),
            Err(e) if !e.is_fatal() => {
                warn!("Frame dropped: {}", e);
                Ok(SwapStatus::Dropped)
            }
            Err(e) => Err(e),
        }
    }
}

pub trait Presenter {
    /// Output size in pixels
    fn size(&self) -> (u32, u32);

    /// Clear the back buffer
    fn begin_frame(&mut self);

    fn draw_texture(&mut self, texture: TextureId, dst: Rect, flip_y: bool);

    /// Finish the frame and hand it to the display
    fn swap(&mut self, vsync: bool) -> Result<SwapStatus>;
}

/// EGL + GLES rendering into a DRM/KMS scanout surface
pub struct KmsOutput {
    // Field order is drop order: GL objects before the context, the context
    // before the GBM surface it renders into
    quad: QuadRenderer,
    egl: EglState,
    drm: DrmBackend,
}

impl KmsOutput {
    /// Bring up the display path. Also returns the texture backend bound to
    /// the new context.
    pub fn new(drm: DrmBackend) -> Result<(Self, GlesTextures)> {
        let egl = EglState::new(drm.gbm_device_ptr(), drm.gbm_surface_ptr())
            .context("Failed to create the EGL context")?;
        gles::load_gl(&egl);
        // Page flips pace the output, not EGL
        egl.set_swap_interval(0);

        let (w, h) = egl.surface_size();
        info!("🎨 EGL surface {}x{}", w, h);

        let quad = QuadRenderer::new().context("Failed to build the quad renderer")?;
        let textures = GlesTextures::new(&egl);
        if textures.supports_dmabuf() {
            info!("dmabuf import enabled");
        }

        Ok((Self { quad, egl, drm }, textures))
    }

    pub fn drm(&self) -> &DrmBackend {
        &self.drm
    }
}

impl Presenter for KmsOutput {
    fn size(&self) -> (u32, u32) {
        self.drm.size()
    }

    fn begin_frame(&mut self) {
        let (w, h) = self.drm.size();
        unsafe {
            gl::Viewport(0, 0, w as i32, h as i32);
            gl::ClearColor(0.0, 0.0, 0.0, 1.0);
            gl::Clear(gl::COLOR_BUFFER_BIT);
        }
    }

    fn draw_texture(&mut self, texture: TextureId, dst: Rect, flip_y: bool) {
        self.quad.draw(texture, dst, self.drm.size(), flip_y);
    }

    fn swap(&mut self, vsync: bool) -> Result<SwapStatus> {
        self.egl.swap_buffers()?;
        Ok(SwapStatus::from_present(self.drm.present(vsync))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn os_error(code: i32) -> io::Error {
        io::Error::from_raw_os_error(code)
    }

    #[test]
    fn flip_failures_only_drop_the_frame() {
        assert_eq!(SwapStatus::from_present(Ok(())).unwrap(), SwapStatus::Presented);
        assert_eq!(
            SwapStatus::from_present(Err(DrmError::Busy)).unwrap(),
            SwapStatus::Busy
        );
        assert_eq!(
            SwapStatus::from_present(Err(DrmError::PageFlip(os_error(libc::EINVAL)))).unwrap(),
            SwapStatus::Dropped
        );
        assert_eq!(
            SwapStatus::from_present(Err(DrmError::Events(os_error(libc::EIO)))).unwrap(),
            SwapStatus::Dropped
        );
    }

    #[test]
    fn scanout_failures_are_fatal() {
        let fatal = [
            DrmError::Modeset(os_error(libc::EINVAL)),
            DrmError::NoFrontBuffer,
            DrmError::Framebuffer(os_error(libc::ENOSPC)),
        ];
        for e in fatal {
            assert!(e.is_fatal(), "{} should be fatal", e);
            assert!(SwapStatus::from_present(Err(e)).is_err());
        }
    }
}
