//! GLES texture backend and textured-quad renderer
//!
//! Both assume the GL function pointers were loaded with [`load_gl`] and
//! that the context is current on the calling thread.

use crate::egl::{self, EglState, ImageFns};
use crate::pipeline::{
    DmabufImage, FenceId, ImageId, PipelineError, ShmImage, TextureBackend, TextureId,
};
use bytemuck::{Pod, Zeroable};
use log::{debug, warn};
use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::os::fd::AsRawFd;
use std::ptr;

use super::Rect;

const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

type EglImageTargetTexture2DOesFn = unsafe extern "C" fn(u32, *mut c_void);

/// Load GL entry points through EGL
pub fn load_gl(egl: &EglState) {
    gl::load_with(|name| egl.get_proc_address(name));
}

/// Texture uploads, dmabuf imports and fences on a GLES 3 context
pub struct GlesTextures {
    image_fns: Option<ImageFns>,
    image_target: Option<EglImageTargetTexture2DOesFn>,
    fences: HashMap<FenceId, gl::types::GLsync>,
    images: HashMap<ImageId, egl::EglImage>,
    next_id: u64,
}

impl GlesTextures {
    pub fn new(egl: &EglState) -> Self {
        let image_fns = match egl.image_fns() {
            Ok(fns) => Some(fns),
            Err(e) => {
                warn!("dmabuf import unavailable: {}", e);
                None
            }
        };
        let target = egl.get_proc_address("glEGLImageTargetTexture2DOES");
        let image_target = if target.is_null() {
            None
        } else {
            // SAFETY: the extension entry point has this signature
            Some(unsafe {
                std::mem::transmute::<*const c_void, EglImageTargetTexture2DOesFn>(target)
            })
        };
        Self {
            image_fns,
            image_target,
            fences: HashMap::new(),
            images: HashMap::new(),
            next_id: 0,
        }
    }

    /// Whether client dmabufs can be imported
    pub fn supports_dmabuf(&self) -> bool {
        self.image_fns.is_some() && self.image_target.is_some()
    }

    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl TextureBackend for GlesTextures {
    fn create_texture(&mut self) -> Result<TextureId, PipelineError> {
        let mut tex = 0;
        unsafe {
            gl::GenTextures(1, &mut tex);
            if tex == 0 {
                return Err(PipelineError::TextureAllocation);
            }
            gl::BindTexture(gl::TEXTURE_2D, tex);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MIN_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_MAG_FILTER, gl::LINEAR as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_S, gl::CLAMP_TO_EDGE as i32);
            gl::TexParameteri(gl::TEXTURE_2D, gl::TEXTURE_WRAP_T, gl::CLAMP_TO_EDGE as i32);
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
        Ok(tex)
    }

    fn delete_texture(&mut self, texture: TextureId) {
        unsafe { gl::DeleteTextures(1, &texture) };
    }

    fn upload_shm(&mut self, texture: TextureId, image: &ShmImage<'_>) -> Result<(), PipelineError> {
        let (format, ty) = image.format.gl_format();
        unsafe {
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl::PixelStorei(gl::UNPACK_ROW_LENGTH, image.pitch());
            gl::TexImage2D(
                gl::TEXTURE_2D,
                0,
                format as i32,
                image.width,
                image.height,
                0,
                format,
                ty,
                image.data.as_ptr() as *const c_void,
            );
            gl::PixelStorei(gl::UNPACK_ROW_LENGTH, 0);
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
        Ok(())
    }

    fn import_dmabuf(
        &mut self,
        texture: TextureId,
        image: &DmabufImage<'_>,
    ) -> Result<ImageId, PipelineError> {
        let (Some(fns), Some(target)) = (self.image_fns, self.image_target) else {
            return Err(PipelineError::Import("EGL dmabuf import not supported".into()));
        };

        let mut attribs = vec![
            egl::EGL_ATTR_WIDTH,
            image.width,
            egl::EGL_ATTR_HEIGHT,
            image.height,
            egl::EGL_LINUX_DRM_FOURCC_EXT,
            image.fourcc as i32,
            egl::EGL_DMA_BUF_PLANE0_FD_EXT,
            image.fd.as_raw_fd(),
            egl::EGL_DMA_BUF_PLANE0_OFFSET_EXT,
            image.offset as i32,
            egl::EGL_DMA_BUF_PLANE0_PITCH_EXT,
            image.stride as i32,
        ];
        if image.modifier != DRM_FORMAT_MOD_INVALID {
            attribs.extend_from_slice(&[
                egl::EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT,
                (image.modifier & 0xffff_ffff) as i32,
                egl::EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT,
                (image.modifier >> 32) as i32,
            ]);
        }
        attribs.push(egl::EGL_ATTR_NONE);

        let egl_image = fns.create_dmabuf_image(&attribs).ok_or_else(|| {
            PipelineError::Import(format!(
                "eglCreateImageKHR rejected {}x{} fourcc {:#010x}",
                image.width, image.height, image.fourcc
            ))
        })?;

        unsafe {
            gl::BindTexture(gl::TEXTURE_2D, texture);
            target(gl::TEXTURE_2D, egl_image);
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }

        let id = self.next();
        self.images.insert(id, egl_image);
        Ok(id)
    }

    fn destroy_image(&mut self, image: ImageId) {
        if let (Some(egl_image), Some(fns)) = (self.images.remove(&image), self.image_fns) {
            fns.destroy_image(egl_image);
        }
    }

    fn insert_fence(&mut self) -> Result<FenceId, PipelineError> {
        let sync = unsafe { gl::FenceSync(gl::SYNC_GPU_COMMANDS_COMPLETE, 0) };
        if sync.is_null() {
            return Err(PipelineError::Fence);
        }
        let id = self.next();
        self.fences.insert(id, sync);
        Ok(id)
    }

    fn poll_fence(&mut self, fence: FenceId) -> bool {
        let Some(&sync) = self.fences.get(&fence) else {
            return false;
        };
        let result = unsafe { gl::ClientWaitSync(sync, gl::SYNC_FLUSH_COMMANDS_BIT, 0) };
        matches!(result, gl::ALREADY_SIGNALED | gl::CONDITION_SATISFIED)
    }

    fn delete_fence(&mut self, fence: FenceId) {
        if let Some(sync) = self.fences.remove(&fence) {
            unsafe { gl::DeleteSync(sync) };
        }
    }
}

impl Drop for GlesTextures {
    fn drop(&mut self) {
        for (_, sync) in self.fences.drain() {
            unsafe { gl::DeleteSync(sync) };
        }
        if let Some(fns) = self.image_fns {
            for (_, image) in self.images.drain() {
                fns.destroy_image(image);
            }
        }
    }
}

const VERTEX_SHADER: &str = r#"
attribute vec2 a_pos;
attribute vec2 a_uv;
varying vec2 v_uv;
void main() {
    gl_Position = vec4(a_pos, 0.0, 1.0);
    v_uv = a_uv;
}
"#;

const FRAGMENT_SHADER: &str = r#"
precision mediump float;
varying vec2 v_uv;
uniform sampler2D u_tex;
void main() {
    gl_FragColor = texture2D(u_tex, v_uv);
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct Vertex {
    pos: [f32; 2],
    uv: [f32; 2],
}

/// Draws one texture into a pixel rectangle of the current framebuffer
pub struct QuadRenderer {
    program: u32,
    vbo: u32,
    a_pos: u32,
    a_uv: u32,
    u_tex: i32,
}

fn compile(kind: u32, source: &str) -> anyhow::Result<u32> {
    let src = CString::new(source)?;
    unsafe {
        let shader = gl::CreateShader(kind);
        gl::ShaderSource(shader, 1, &src.as_ptr(), ptr::null());
        gl::CompileShader(shader);
        let mut ok = 0;
        gl::GetShaderiv(shader, gl::COMPILE_STATUS, &mut ok);
        if ok == 0 {
            let mut log = vec![0u8; 1024];
            let mut len = 0;
            gl::GetShaderInfoLog(shader, log.len() as i32, &mut len, log.as_mut_ptr().cast());
            gl::DeleteShader(shader);
            log.truncate(len.max(0) as usize);
            anyhow::bail!("shader compile failed: {}", String::from_utf8_lossy(&log));
        }
        Ok(shader)
    }
}

impl QuadRenderer {
    pub fn new() -> anyhow::Result<Self> {
        let vs = compile(gl::VERTEX_SHADER, VERTEX_SHADER)?;
        let fs = compile(gl::FRAGMENT_SHADER, FRAGMENT_SHADER)?;
        unsafe {
            let program = gl::CreateProgram();
            gl::AttachShader(program, vs);
            gl::AttachShader(program, fs);
            gl::LinkProgram(program);
            gl::DeleteShader(vs);
            gl::DeleteShader(fs);
            let mut ok = 0;
            gl::GetProgramiv(program, gl::LINK_STATUS, &mut ok);
            if ok == 0 {
                gl::DeleteProgram(program);
                anyhow::bail!("quad program failed to link");
            }

            let a_pos = gl::GetAttribLocation(program, b"a_pos\0".as_ptr().cast());
            let a_uv = gl::GetAttribLocation(program, b"a_uv\0".as_ptr().cast());
            let u_tex = gl::GetUniformLocation(program, b"u_tex\0".as_ptr().cast());
            if a_pos < 0 || a_uv < 0 {
                gl::DeleteProgram(program);
                anyhow::bail!("quad program is missing vertex attributes");
            }

            let mut vbo = 0;
            gl::GenBuffers(1, &mut vbo);
            debug!("quad renderer ready (program {}, vbo {})", program, vbo);

            Ok(Self {
                program,
                vbo,
                a_pos: a_pos as u32,
                a_uv: a_uv as u32,
                u_tex,
            })
        }
    }

    /// Draw `texture` into `dst`, given in pixels of a `viewport`-sized
    /// framebuffer with the origin at the top left.
    pub fn draw(&self, texture: TextureId, dst: Rect, viewport: (u32, u32), flip_y: bool) {
        let vertices = quad_vertices(dst, viewport, flip_y);
        let stride = std::mem::size_of::<Vertex>() as i32;
        unsafe {
            gl::UseProgram(self.program);
            gl::ActiveTexture(gl::TEXTURE0);
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl::Uniform1i(self.u_tex, 0);

            gl::BindBuffer(gl::ARRAY_BUFFER, self.vbo);
            let bytes: &[u8] = bytemuck::cast_slice(&vertices);
            gl::BufferData(
                gl::ARRAY_BUFFER,
                bytes.len() as isize,
                bytes.as_ptr().cast(),
                gl::STREAM_DRAW,
            );
            gl::EnableVertexAttribArray(self.a_pos);
            gl::VertexAttribPointer(self.a_pos, 2, gl::FLOAT, gl::FALSE, stride, ptr::null());
            gl::EnableVertexAttribArray(self.a_uv);
            gl::VertexAttribPointer(
                self.a_uv,
                2,
                gl::FLOAT,
                gl::FALSE,
                stride,
                (2 * std::mem::size_of::<f32>()) as *const c_void,
            );

            gl::DrawArrays(gl::TRIANGLE_STRIP, 0, 4);

            gl::DisableVertexAttribArray(self.a_pos);
            gl::DisableVertexAttribArray(self.a_uv);
            gl::BindBuffer(gl::ARRAY_BUFFER, 0);
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
    }
}

impl Drop for QuadRenderer {
    fn drop(&mut self) {
        unsafe {
            gl::DeleteBuffers(1, &self.vbo);
            gl::DeleteProgram(self.program);
        }
    }
}

fn quad_vertices(dst: Rect, viewport: (u32, u32), flip_y: bool) -> [Vertex; 4] {
    let (vw, vh) = (viewport.0.max(1) as f32, viewport.1.max(1) as f32);
    let x0 = dst.x as f32 / vw * 2.0 - 1.0;
    let x1 = (dst.x + dst.width) as f32 / vw * 2.0 - 1.0;
    let y0 = 1.0 - dst.y as f32 / vh * 2.0;
    let y1 = 1.0 - (dst.y + dst.height) as f32 / vh * 2.0;
    let (v_top, v_bottom) = if flip_y { (1.0, 0.0) } else { (0.0, 1.0) };
    [
        Vertex { pos: [x0, y0], uv: [0.0, v_top] },
        Vertex { pos: [x0, y1], uv: [0.0, v_bottom] },
        Vertex { pos: [x1, y0], uv: [1.0, v_top] },
        Vertex { pos: [x1, y1], uv: [1.0, v_bottom] },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_screen_quad_covers_clip_space() {
        let v = quad_vertices(
            Rect {
                x: 0,
                y: 0,
                width: 800,
                height: 600,
            },
            (800, 600),
            false,
        );
        assert_eq!(v[0].pos, [-1.0, 1.0]);
        assert_eq!(v[3].pos, [1.0, -1.0]);
        // Top of the image samples the first row
        assert_eq!(v[0].uv, [0.0, 0.0]);
    }

    #[test]
    fn flip_swaps_texture_rows() {
        let rect = Rect {
            x: 100,
            y: 150,
            width: 200,
            height: 150,
        };
        let v = quad_vertices(rect, (400, 300), true);
        assert_eq!(v[0].pos, [-0.5, 0.0]);
        assert_eq!(v[3].pos, [0.5, -1.0]);
        assert_eq!(v[0].uv, [0.0, 1.0]);
        assert_eq!(v[1].uv, [0.0, 0.0]);
    }
}
