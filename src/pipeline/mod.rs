//! Per-surface texture pipeline
//!
//! Every surface owns two texture slots. A commit uploads (or imports) the
//! client buffer into the *current* slot and stamps a GPU fence after it; the
//! slot is then `Writing`. Once the fence has signalled the slot becomes
//! `Complete` and is what gets drawn, the other slot is freed for the next
//! commit, the previously displayed client buffer is handed back for release
//! and the frame callbacks that rode along with the commit become due.
//!
//! Slot status only ever moves `Free -> Writing -> Complete -> Free`.

pub mod headless;

use log::{trace, warn};
use std::mem;
use std::os::fd::BorrowedFd;
use thiserror::Error;

pub type TextureId = u32;
pub type FenceId = u64;
pub type ImageId = u64;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unsupported buffer format {0:#010x}")]
    UnsupportedFormat(u32),
    #[error("buffer contents out of bounds ({needed} bytes needed, {available} mapped)")]
    OutOfBounds { needed: usize, available: usize },
    #[error("texture allocation failed")]
    TextureAllocation,
    #[error("fence creation failed")]
    Fence,
    #[error("dmabuf import failed: {0}")]
    Import(String),
}

/// Shared-memory pixel formats the pipeline can upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShmFormat {
    Argb8888,
    Xrgb8888,
    Rgb565,
}

impl ShmFormat {
    /// Bytes per pixel
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ShmFormat::Argb8888 | ShmFormat::Xrgb8888 => 4,
            ShmFormat::Rgb565 => 2,
        }
    }

    /// GL format and pixel type for `glTexImage2D`
    pub fn gl_format(self) -> (u32, u32) {
        match self {
            // GL_BGRA_EXT shares its value with desktop GL_BGRA
            ShmFormat::Argb8888 | ShmFormat::Xrgb8888 => (gl::BGRA, gl::UNSIGNED_BYTE),
            ShmFormat::Rgb565 => (gl::RGB, gl::UNSIGNED_SHORT_5_6_5),
        }
    }
}

/// CPU-visible client pixels
#[derive(Debug)]
pub struct ShmImage<'a> {
    pub data: &'a [u8],
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub format: ShmFormat,
}

impl ShmImage<'_> {
    /// Row length in pixels, including padding
    pub fn pitch(&self) -> i32 {
        self.stride / self.format.bytes_per_pixel() as i32
    }

    /// Check that `height` rows of `stride` bytes fit in the mapping
    pub fn validate(&self) -> Result<(), PipelineError> {
        let needed = (self.stride.max(0) as usize) * (self.height.max(0) as usize);
        if needed > self.data.len() {
            return Err(PipelineError::OutOfBounds {
                needed,
                available: self.data.len(),
            });
        }
        Ok(())
    }
}

/// A single-plane GPU buffer shared by the client
#[derive(Debug)]
pub struct DmabufImage<'a> {
    pub fd: BorrowedFd<'a>,
    pub width: i32,
    pub height: i32,
    pub fourcc: u32,
    pub offset: u32,
    pub stride: u32,
    pub modifier: u64,
}

#[derive(Debug)]
pub enum ClientImage<'a> {
    Shm(ShmImage<'a>),
    Dmabuf(DmabufImage<'a>),
}

impl ClientImage<'_> {
    pub fn size(&self) -> (i32, i32) {
        match self {
            ClientImage::Shm(s) => (s.width, s.height),
            ClientImage::Dmabuf(d) => (d.width, d.height),
        }
    }
}

/// A client buffer whose pixels can be read when a slot frees up
pub trait PixelSource {
    /// Run `f` with the buffer's current contents. `None` if the buffer no
    /// longer has backing storage.
    fn with_image<R>(&self, f: impl FnOnce(&ClientImage<'_>) -> R) -> Option<R>;
}

/// GPU operations the pipeline needs. Implementations must be used from the
/// thread the GPU context is current on.
pub trait TextureBackend {
    fn create_texture(&mut self) -> Result<TextureId, PipelineError>;
    fn delete_texture(&mut self, texture: TextureId);

    /// Copy shared-memory pixels into `texture`
    fn upload_shm(&mut self, texture: TextureId, image: &ShmImage<'_>) -> Result<(), PipelineError>;

    /// Bind a dmabuf to `texture` without copying. The returned image must
    /// stay alive while the texture may be sampled.
    fn import_dmabuf(
        &mut self,
        texture: TextureId,
        image: &DmabufImage<'_>,
    ) -> Result<ImageId, PipelineError>;
    fn destroy_image(&mut self, image: ImageId);

    /// Insert a fence after all commands issued so far
    fn insert_fence(&mut self) -> Result<FenceId, PipelineError>;
    /// Non-blocking; true once the fence has signalled
    fn poll_fence(&mut self, fence: FenceId) -> bool;
    fn delete_fence(&mut self, fence: FenceId);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Free,
    Writing,
    Complete,
}

/// A committed buffer together with the frame callbacks committed with it
#[derive(Debug)]
struct Commit<B, C> {
    buffer: B,
    callbacks: Vec<C>,
}

/// Work handed back to the protocol layer
#[derive(Debug)]
pub struct Promotion<B, C> {
    /// Client buffers the compositor no longer reads from
    pub released: Vec<B>,
    /// Frame callbacks that are now due, oldest first
    pub callbacks: Vec<C>,
}

impl<B, C> Default for Promotion<B, C> {
    fn default() -> Self {
        Self {
            released: Vec::new(),
            callbacks: Vec::new(),
        }
    }
}

impl<B, C> Promotion<B, C> {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.callbacks.is_empty()
    }

    fn merge(&mut self, other: Promotion<B, C>) {
        self.released.extend(other.released);
        self.callbacks.extend(other.callbacks);
    }
}

/// The double-buffered texture state of one surface.
///
/// `B` is the client buffer handle and `C` a frame callback handle; the
/// pipeline only moves them around and hands them back when they are due.
#[derive(Debug)]
pub struct SurfaceTextures<B, C> {
    textures: Option<[TextureId; 2]>,
    images: [Option<ImageId>; 2],
    sizes: [(i32, i32); 2],
    status: [SlotStatus; 2],
    current: usize,
    updated: usize,
    fence: Option<FenceId>,

    frame_callbacks: Vec<C>,
    queued: Option<Commit<B, C>>,
    writing: Option<Commit<B, C>>,
    displayed: Option<B>,
    unbound_callbacks: Vec<C>,
}

impl<B, C> Default for SurfaceTextures<B, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B, C> SurfaceTextures<B, C> {
    pub fn new() -> Self {
        Self {
            textures: None,
            images: [None, None],
            sizes: [(0, 0); 2],
            status: [SlotStatus::Free; 2],
            current: 0,
            updated: 1,
            fence: None,
            frame_callbacks: Vec::new(),
            queued: None,
            writing: None,
            displayed: None,
            unbound_callbacks: Vec::new(),
        }
    }

    pub fn status(&self) -> [SlotStatus; 2] {
        self.status
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    pub fn updated_slot(&self) -> usize {
        self.updated
    }

    pub fn is_writing(&self) -> bool {
        self.status[self.current] == SlotStatus::Writing
    }

    /// Texture and size to draw, if a slot is complete
    pub fn drawable(&self) -> Option<(TextureId, (i32, i32))> {
        if self.status[self.updated] != SlotStatus::Complete {
            return None;
        }
        self.textures
            .map(|t| (t[self.updated], self.sizes[self.updated]))
    }

    /// Size of the image on screen, or (0, 0)
    pub fn size(&self) -> (i32, i32) {
        if self.status[self.updated] == SlotStatus::Complete {
            self.sizes[self.updated]
        } else {
            (0, 0)
        }
    }

    /// Queue a callback for the next commit
    pub fn add_frame_callback(&mut self, callback: C) {
        self.frame_callbacks.push(callback);
    }

    /// Callbacks committed with no buffer while nothing was pending. They are
    /// due on the next redraw.
    pub fn take_unbound_callbacks(&mut self) -> Vec<C> {
        mem::take(&mut self.unbound_callbacks)
    }

    pub fn has_unbound_callbacks(&self) -> bool {
        !self.unbound_callbacks.is_empty()
    }
}

impl<B: PixelSource, C> SurfaceTextures<B, C> {
    /// Apply a commit. `buffer` is the buffer attached since the last commit.
    ///
    /// The upload starts right away when the current slot is free; otherwise
    /// the commit waits until [`poll`](Self::poll) frees it. A commit that is
    /// still waiting when a newer one arrives is superseded and its buffer
    /// released.
    pub fn commit<G>(&mut self, gpu: &mut G, buffer: Option<B>) -> Promotion<B, C>
    where
        G: TextureBackend + ?Sized,
    {
        let mut callbacks = mem::take(&mut self.frame_callbacks);
        let mut out = Promotion::default();

        match buffer {
            Some(buffer) => {
                if let Some(old) = self.queued.take() {
                    trace!("superseding a commit that never reached the GPU");
                    out.released.push(old.buffer);
                    let mut merged = old.callbacks;
                    merged.append(&mut callbacks);
                    callbacks = merged;
                }
                self.queued = Some(Commit { buffer, callbacks });
                out.merge(self.start_upload(gpu));
            }
            None => {
                if let Some(q) = self.queued.as_mut() {
                    q.callbacks.append(&mut callbacks);
                } else if let Some(w) = self.writing.as_mut() {
                    w.callbacks.append(&mut callbacks);
                } else {
                    self.unbound_callbacks.append(&mut callbacks);
                }
            }
        }
        out
    }

    fn start_upload<G>(&mut self, gpu: &mut G) -> Promotion<B, C>
    where
        G: TextureBackend + ?Sized,
    {
        let mut out = Promotion::default();
        if self.status[self.current] != SlotStatus::Free {
            return out;
        }
        let Some(commit) = self.queued.take() else {
            return out;
        };

        match self.upload(gpu, &commit.buffer) {
            Ok(()) => {
                self.status[self.current] = SlotStatus::Writing;
                self.writing = Some(commit);
            }
            Err(e) => {
                // Nothing will ever show this buffer; let the client have it back
                warn!("dropping commit: {}", e);
                out.released.push(commit.buffer);
                self.unbound_callbacks.extend(commit.callbacks);
            }
        }
        out
    }

    fn upload<G>(&mut self, gpu: &mut G, buffer: &B) -> Result<(), PipelineError>
    where
        G: TextureBackend + ?Sized,
    {
        let textures = match self.textures {
            Some(t) => t,
            None => {
                let first = gpu.create_texture()?;
                let second = match gpu.create_texture() {
                    Ok(t) => t,
                    Err(e) => {
                        gpu.delete_texture(first);
                        return Err(e);
                    }
                };
                self.textures = Some([first, second]);
                [first, second]
            }
        };
        let slot = self.current;
        let texture = textures[slot];

        let result = buffer.with_image(
            |image| -> Result<(Option<ImageId>, (i32, i32)), PipelineError> {
                let imported = match image {
                    ClientImage::Shm(shm) => {
                        shm.validate()?;
                        gpu.upload_shm(texture, shm)?;
                        None
                    }
                    ClientImage::Dmabuf(dmabuf) => Some(gpu.import_dmabuf(texture, dmabuf)?),
                };
                Ok((imported, image.size()))
            },
        );

        let (image, size) = match result {
            Some(r) => r?,
            None => return Err(PipelineError::Import("buffer has no storage".into())),
        };
        self.sizes[slot] = size;

        // The slot is free, so the previous image bound to it is unused
        if let Some(old) = mem::replace(&mut self.images[slot], image) {
            gpu.destroy_image(old);
        }

        self.fence = Some(gpu.insert_fence()?);
        Ok(())
    }

    /// Check the pending fence without blocking. When it has signalled the
    /// written slot becomes the one drawn and any waiting commit starts
    /// uploading into the slot that was just freed.
    pub fn poll<G>(&mut self, gpu: &mut G) -> Option<Promotion<B, C>>
    where
        G: TextureBackend + ?Sized,
    {
        if !self.is_writing() {
            return None;
        }
        let fence = self.fence?;
        if !gpu.poll_fence(fence) {
            return None;
        }
        gpu.delete_fence(fence);
        self.fence = None;

        self.updated = self.current;
        self.current = (self.current + 1) % 2;
        self.status[self.current] = SlotStatus::Free;
        self.status[self.updated] = SlotStatus::Complete;

        let mut out = Promotion::default();
        if let Some(commit) = self.writing.take() {
            out.released.extend(self.displayed.replace(commit.buffer));
            out.callbacks = commit.callbacks;
        }
        out.merge(self.start_upload(gpu));
        Some(out)
    }

    /// Free all GPU resources. Returns buffers still held and callbacks that
    /// will never fire.
    pub fn release<G>(&mut self, gpu: &mut G) -> Promotion<B, C>
    where
        G: TextureBackend + ?Sized,
    {
        if let Some(fence) = self.fence.take() {
            gpu.delete_fence(fence);
        }
        for image in self.images.iter_mut().filter_map(Option::take) {
            gpu.destroy_image(image);
        }
        if let Some(textures) = self.textures.take() {
            for t in textures {
                gpu.delete_texture(t);
            }
        }
        self.status = [SlotStatus::Free; 2];

        let mut out = Promotion::default();
        for commit in [self.queued.take(), self.writing.take()].into_iter().flatten() {
            out.released.push(commit.buffer);
            out.callbacks.extend(commit.callbacks);
        }
        out.released.extend(self.displayed.take());
        out.callbacks.append(&mut self.frame_callbacks);
        out.callbacks.append(&mut self.unbound_callbacks);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::headless::HeadlessBackend;
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Buf {
        id: u32,
        format: ShmFormat,
        pixels: Vec<u8>,
    }

    fn xrgb(id: u32) -> Buf {
        Buf {
            id,
            format: ShmFormat::Xrgb8888,
            pixels: vec![0xff; 64 * 64 * 4],
        }
    }

    impl PixelSource for Buf {
        fn with_image<R>(&self, f: impl FnOnce(&ClientImage<'_>) -> R) -> Option<R> {
            let bpp = self.format.bytes_per_pixel() as i32;
            Some(f(&ClientImage::Shm(ShmImage {
                data: &self.pixels,
                width: 64,
                height: 64,
                stride: 64 * bpp,
                format: self.format,
            })))
        }
    }

    type Textures = SurfaceTextures<Buf, &'static str>;

    fn ids(bufs: &[Buf]) -> Vec<u32> {
        bufs.iter().map(|b| b.id).collect()
    }

    #[test]
    fn first_commit_goes_writing_then_complete() {
        let mut gpu = HeadlessBackend::with_latency(2);
        let mut tex = Textures::new();

        let out = tex.commit(&mut gpu, Some(xrgb(1)));
        assert!(out.is_empty());
        assert_eq!(tex.status(), [SlotStatus::Writing, SlotStatus::Free]);
        assert!(tex.drawable().is_none());

        assert!(tex.poll(&mut gpu).is_none());
        let out = tex.poll(&mut gpu).expect("fence signalled");
        assert_eq!(tex.status(), [SlotStatus::Complete, SlotStatus::Free]);
        assert_eq!(tex.updated_slot(), 0);
        assert_eq!(tex.current_slot(), 1);
        // Nothing was on screen before, so nothing is released yet
        assert!(out.released.is_empty());
        assert_eq!(tex.size(), (64, 64));
        assert!(tex.drawable().is_some());
        assert_eq!(gpu.live_fences(), 0);
    }

    #[test]
    fn previous_buffer_is_released_when_superseded() {
        let mut gpu = HeadlessBackend::immediate();
        let mut tex = Textures::new();

        tex.commit(&mut gpu, Some(xrgb(1)));
        assert!(tex.poll(&mut gpu).unwrap().released.is_empty());

        tex.commit(&mut gpu, Some(xrgb(2)));
        assert_eq!(tex.status(), [SlotStatus::Complete, SlotStatus::Writing]);
        let out = tex.poll(&mut gpu).unwrap();
        assert_eq!(ids(&out.released), vec![1]);
        assert_eq!(tex.status(), [SlotStatus::Free, SlotStatus::Complete]);
    }

    #[test]
    fn slots_cycle_in_order() {
        let mut gpu = HeadlessBackend::immediate();
        let mut tex = Textures::new();
        let mut history = vec![tex.status()];

        for id in 0..6 {
            tex.commit(&mut gpu, Some(xrgb(id)));
            history.push(tex.status());
            tex.poll(&mut gpu);
            history.push(tex.status());
        }

        for slot in 0..2 {
            for pair in history.windows(2) {
                let (a, b) = (pair[0][slot], pair[1][slot]);
                let allowed = a == b
                    || matches!(
                        (a, b),
                        (SlotStatus::Free, SlotStatus::Writing)
                            | (SlotStatus::Writing, SlotStatus::Complete)
                            | (SlotStatus::Complete, SlotStatus::Free)
                    );
                assert!(allowed, "slot {} went {:?} -> {:?}", slot, a, b);
            }
        }
    }

    #[test]
    fn drawable_is_never_a_writing_slot() {
        let mut gpu = HeadlessBackend::with_latency(3);
        let mut tex = Textures::new();
        for id in 0..5 {
            tex.commit(&mut gpu, Some(xrgb(id)));
            for _ in 0..4 {
                if let Some((t, _)) = tex.drawable() {
                    let slot = tex.updated_slot();
                    assert_eq!(tex.status()[slot], SlotStatus::Complete);
                    assert!(gpu.texture_exists(t));
                }
                tex.poll(&mut gpu);
            }
        }
    }

    #[test]
    fn callbacks_fire_in_commit_order() {
        let mut gpu = HeadlessBackend::with_latency(1);
        let mut tex = Textures::new();

        tex.add_frame_callback("a");
        tex.commit(&mut gpu, Some(xrgb(1)));
        tex.add_frame_callback("b");
        // Slot still writing: this commit waits
        tex.commit(&mut gpu, Some(xrgb(2)));

        let first = tex.poll(&mut gpu).unwrap();
        assert_eq!(first.callbacks, vec!["a"]);
        // The waiting commit started on the freed slot
        assert!(tex.is_writing());

        let second = tex.poll(&mut gpu).unwrap();
        assert_eq!(second.callbacks, vec!["b"]);
        assert_eq!(ids(&second.released), vec![1]);
    }

    #[test]
    fn callbacks_wait_for_their_own_buffer() {
        let mut gpu = HeadlessBackend::with_latency(5);
        let mut tex = Textures::new();

        tex.add_frame_callback("a");
        tex.commit(&mut gpu, Some(xrgb(1)));
        for _ in 0..4 {
            assert!(tex.poll(&mut gpu).is_none());
        }
        assert_eq!(tex.poll(&mut gpu).unwrap().callbacks, vec!["a"]);
    }

    #[test]
    fn newer_waiting_commit_supersedes_older() {
        let mut gpu = HeadlessBackend::with_latency(1);
        let mut tex = Textures::new();

        tex.commit(&mut gpu, Some(xrgb(1)));
        tex.add_frame_callback("b");
        assert!(tex.commit(&mut gpu, Some(xrgb(2))).is_empty());
        tex.add_frame_callback("c");
        let out = tex.commit(&mut gpu, Some(xrgb(3)));
        assert_eq!(ids(&out.released), vec![2]);

        tex.poll(&mut gpu).unwrap();
        let out = tex.poll(&mut gpu).unwrap();
        assert_eq!(out.callbacks, vec!["b", "c"]);
    }

    #[test]
    fn bufferless_commit_rides_with_pending_upload() {
        let mut gpu = HeadlessBackend::with_latency(1);
        let mut tex = Textures::new();

        tex.commit(&mut gpu, Some(xrgb(1)));
        tex.add_frame_callback("x");
        tex.commit(&mut gpu, None);
        assert_eq!(tex.poll(&mut gpu).unwrap().callbacks, vec!["x"]);

        // With nothing in flight the callback is due on the next redraw
        tex.add_frame_callback("y");
        tex.commit(&mut gpu, None);
        assert!(tex.has_unbound_callbacks());
        assert_eq!(tex.take_unbound_callbacks(), vec!["y"]);
    }

    #[test]
    fn textures_are_allocated_once() {
        let mut gpu = HeadlessBackend::immediate();
        let mut tex = Textures::new();
        for id in 0..4 {
            tex.commit(&mut gpu, Some(xrgb(id)));
            tex.poll(&mut gpu);
        }
        assert_eq!(gpu.created_textures(), 2);
        assert_eq!(gpu.uploads(), 4);
    }

    #[test]
    fn short_buffer_is_rejected_and_released() {
        let mut gpu = HeadlessBackend::immediate();
        let mut tex = Textures::new();
        let mut buf = xrgb(9);
        buf.pixels.truncate(100);

        tex.add_frame_callback("z");
        let out = tex.commit(&mut gpu, Some(buf));
        assert_eq!(ids(&out.released), vec![9]);
        assert_eq!(tex.status(), [SlotStatus::Free, SlotStatus::Free]);
        assert_eq!(tex.take_unbound_callbacks(), vec!["z"]);
        assert_eq!(gpu.live_fences(), 0);
    }

    #[test]
    fn release_frees_gpu_resources() {
        let mut gpu = HeadlessBackend::with_latency(3);
        let mut tex = Textures::new();
        tex.commit(&mut gpu, Some(xrgb(1)));
        tex.add_frame_callback("late");

        let out = tex.release(&mut gpu);
        assert_eq!(ids(&out.released), vec![1]);
        assert_eq!(out.callbacks, vec!["late"]);
        assert_eq!(gpu.live_textures(), 0);
        assert_eq!(gpu.live_fences(), 0);
        assert_eq!(tex.status(), [SlotStatus::Free, SlotStatus::Free]);
    }

    #[test]
    fn gl_formats() {
        assert_eq!(ShmFormat::Xrgb8888.gl_format(), (gl::BGRA, gl::UNSIGNED_BYTE));
        assert_eq!(ShmFormat::Argb8888.gl_format(), (gl::BGRA, gl::UNSIGNED_BYTE));
        assert_eq!(
            ShmFormat::Rgb565.gl_format(),
            (gl::RGB, gl::UNSIGNED_SHORT_5_6_5)
        );
        let img = ShmImage {
            data: &[0; 16],
            width: 3,
            height: 1,
            stride: 16,
            format: ShmFormat::Xrgb8888,
        };
        assert_eq!(img.pitch(), 4);
        assert!(img.validate().is_ok());
    }
}
