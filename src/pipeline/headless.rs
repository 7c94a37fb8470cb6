//! A GPU-less texture backend
//!
//! Keeps textures as byte vectors and signals fences after a configurable
//! number of polls. Used to drive the compositor without a display, and by
//! the tests.

use super::{DmabufImage, FenceId, ImageId, PipelineError, ShmImage, TextureBackend, TextureId};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct HeadlessBackend {
    latency: u32,
    next_id: u64,
    textures: HashMap<TextureId, Vec<u8>>,
    fences: HashMap<FenceId, u32>,
    images: HashMap<ImageId, TextureId>,
    created_textures: usize,
    uploads: usize,
}

impl HeadlessBackend {
    /// Fences signal on the first poll
    pub fn immediate() -> Self {
        Self::with_latency(0)
    }

    /// Fences signal on the `polls`-th poll (the first poll when `polls` <= 1)
    pub fn with_latency(polls: u32) -> Self {
        Self {
            latency: polls,
            ..Self::default()
        }
    }

    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn texture_exists(&self, texture: TextureId) -> bool {
        self.textures.contains_key(&texture)
    }

    /// Bytes last uploaded into `texture`
    pub fn texture_data(&self, texture: TextureId) -> Option<&[u8]> {
        self.textures.get(&texture).map(Vec::as_slice)
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_fences(&self) -> usize {
        self.fences.len()
    }

    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    pub fn created_textures(&self) -> usize {
        self.created_textures
    }

    pub fn uploads(&self) -> usize {
        self.uploads
    }
}

impl TextureBackend for HeadlessBackend {
    fn create_texture(&mut self) -> Result<TextureId, PipelineError> {
        let id = u32::try_from(self.next()).map_err(|_| PipelineError::TextureAllocation)?;
        self.textures.insert(id, Vec::new());
        self.created_textures += 1;
        Ok(id)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        self.textures.remove(&texture);
    }

    fn upload_shm(&mut self, texture: TextureId, image: &ShmImage<'_>) -> Result<(), PipelineError> {
        let len = (image.stride.max(0) as usize) * (image.height.max(0) as usize);
        let slot = self
            .textures
            .get_mut(&texture)
            .ok_or(PipelineError::TextureAllocation)?;
        slot.clear();
        slot.extend_from_slice(&image.data[..len.min(image.data.len())]);
        self.uploads += 1;
        Ok(())
    }

    fn import_dmabuf(
        &mut self,
        texture: TextureId,
        _image: &DmabufImage<'_>,
    ) -> Result<ImageId, PipelineError> {
        if !self.textures.contains_key(&texture) {
            return Err(PipelineError::TextureAllocation);
        }
        let id = self.next();
        self.images.insert(id, texture);
        self.uploads += 1;
        Ok(id)
    }

    fn destroy_image(&mut self, image: ImageId) {
        self.images.remove(&image);
    }

    fn insert_fence(&mut self) -> Result<FenceId, PipelineError> {
        let id = self.next();
        self.fences.insert(id, 0);
        Ok(id)
    }

    fn poll_fence(&mut self, fence: FenceId) -> bool {
        match self.fences.get_mut(&fence) {
            Some(polls) => {
                *polls += 1;
                *polls >= self.latency
            }
            None => false,
        }
    }

    fn delete_fence(&mut self, fence: FenceId) {
        self.fences.remove(&fence);
    }
}
