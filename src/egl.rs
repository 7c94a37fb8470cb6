//! EGL context on a GBM surface
//!
//! libEGL is loaded at runtime. The context is made current on the thread
//! that creates it; every GL call must happen on that thread.

use libloading::Library;
use log::{debug, info};
use std::ffi::{c_void, CStr, CString};
use std::ptr;
use thiserror::Error;

pub type EglDisplay = *mut c_void;
pub type EglConfig = *mut c_void;
pub type EglContext = *mut c_void;
pub type EglSurface = *mut c_void;
pub type EglImage = *mut c_void;
type EglInt = i32;
type EglBoolean = u32;

const EGL_FALSE: EglBoolean = 0;
const EGL_NONE: EglInt = 0x3038;
const EGL_RED_SIZE: EglInt = 0x3024;
const EGL_GREEN_SIZE: EglInt = 0x3023;
const EGL_BLUE_SIZE: EglInt = 0x3022;
const EGL_ALPHA_SIZE: EglInt = 0x3021;
const EGL_SURFACE_TYPE: EglInt = 0x3033;
const EGL_WINDOW_BIT: EglInt = 0x0004;
const EGL_RENDERABLE_TYPE: EglInt = 0x3040;
const EGL_OPENGL_ES3_BIT: EglInt = 0x0040;
const EGL_NATIVE_VISUAL_ID: EglInt = 0x302E;
const EGL_CONTEXT_MAJOR_VERSION: EglInt = 0x3098;
const EGL_OPENGL_ES_API: u32 = 0x30A0;
const EGL_WIDTH: EglInt = 0x3057;
const EGL_HEIGHT: EglInt = 0x3056;
const EGL_PLATFORM_GBM_KHR: u32 = 0x31D7;
const EGL_EXTENSIONS: EglInt = 0x3055;
const EGL_VENDOR: EglInt = 0x3053;
const EGL_VERSION: EglInt = 0x3054;
const GBM_FORMAT_ARGB8888: EglInt = 0x3432_5241;

pub const EGL_LINUX_DMA_BUF_EXT: u32 = 0x3270;
pub const EGL_LINUX_DRM_FOURCC_EXT: EglInt = 0x3271;
pub const EGL_DMA_BUF_PLANE0_FD_EXT: EglInt = 0x3272;
pub const EGL_DMA_BUF_PLANE0_OFFSET_EXT: EglInt = 0x3273;
pub const EGL_DMA_BUF_PLANE0_PITCH_EXT: EglInt = 0x3274;
pub const EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT: EglInt = 0x3443;
pub const EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT: EglInt = 0x3444;
pub const EGL_ATTR_WIDTH: EglInt = EGL_WIDTH;
pub const EGL_ATTR_HEIGHT: EglInt = EGL_HEIGHT;
pub const EGL_ATTR_NONE: EglInt = EGL_NONE;

#[derive(Debug, Error)]
pub enum EglError {
    #[error("failed to load libEGL: {0}")]
    Load(#[from] libloading::Error),
    #[error("{call} failed (error {code:#x})")]
    Call { call: &'static str, code: i32 },
    #[error("no EGL config matches the scanout format")]
    NoConfig,
    #[error("EGL extension {0} is not available")]
    MissingExtension(&'static str),
}

type GetPlatformDisplayFn = unsafe extern "C" fn(u32, *mut c_void, *const isize) -> EglDisplay;
type GetDisplayFn = unsafe extern "C" fn(*mut c_void) -> EglDisplay;
type InitializeFn = unsafe extern "C" fn(EglDisplay, *mut EglInt, *mut EglInt) -> EglBoolean;
type TerminateFn = unsafe extern "C" fn(EglDisplay) -> EglBoolean;
type BindApiFn = unsafe extern "C" fn(u32) -> EglBoolean;
type ChooseConfigFn = unsafe extern "C" fn(
    EglDisplay,
    *const EglInt,
    *mut EglConfig,
    EglInt,
    *mut EglInt,
) -> EglBoolean;
type GetConfigAttribFn =
    unsafe extern "C" fn(EglDisplay, EglConfig, EglInt, *mut EglInt) -> EglBoolean;
type CreateContextFn =
    unsafe extern "C" fn(EglDisplay, EglConfig, EglContext, *const EglInt) -> EglContext;
type DestroyContextFn = unsafe extern "C" fn(EglDisplay, EglContext) -> EglBoolean;
type CreateWindowSurfaceFn =
    unsafe extern "C" fn(EglDisplay, EglConfig, *mut c_void, *const EglInt) -> EglSurface;
type DestroySurfaceFn = unsafe extern "C" fn(EglDisplay, EglSurface) -> EglBoolean;
type MakeCurrentFn =
    unsafe extern "C" fn(EglDisplay, EglSurface, EglSurface, EglContext) -> EglBoolean;
type SwapBuffersFn = unsafe extern "C" fn(EglDisplay, EglSurface) -> EglBoolean;
type SwapIntervalFn = unsafe extern "C" fn(EglDisplay, EglInt) -> EglBoolean;
type QuerySurfaceFn =
    unsafe extern "C" fn(EglDisplay, EglSurface, EglInt, *mut EglInt) -> EglBoolean;
type QueryStringFn = unsafe extern "C" fn(EglDisplay, EglInt) -> *const i8;
type GetProcAddressFn = unsafe extern "C" fn(*const i8) -> *const c_void;
type GetErrorFn = unsafe extern "C" fn() -> EglInt;
type CreateImageKhrFn =
    unsafe extern "C" fn(EglDisplay, EglContext, u32, *mut c_void, *const EglInt) -> EglImage;
type DestroyImageKhrFn = unsafe extern "C" fn(EglDisplay, EglImage) -> EglBoolean;

struct EglFns {
    get_display: GetDisplayFn,
    initialize: InitializeFn,
    terminate: TerminateFn,
    bind_api: BindApiFn,
    choose_config: ChooseConfigFn,
    get_config_attrib: GetConfigAttribFn,
    create_context: CreateContextFn,
    destroy_context: DestroyContextFn,
    create_window_surface: CreateWindowSurfaceFn,
    destroy_surface: DestroySurfaceFn,
    make_current: MakeCurrentFn,
    swap_buffers: SwapBuffersFn,
    swap_interval: SwapIntervalFn,
    query_surface: QuerySurfaceFn,
    query_string: QueryStringFn,
    get_proc_address: GetProcAddressFn,
    get_error: GetErrorFn,
}

impl EglFns {
    /// # Safety
    /// The symbols must have the EGL 1.4 signatures declared above.
    unsafe fn load(lib: &Library) -> Result<Self, EglError> {
        Ok(Self {
            get_display: *lib.get(b"eglGetDisplay\0")?,
            initialize: *lib.get(b"eglInitialize\0")?,
            terminate: *lib.get(b"eglTerminate\0")?,
            bind_api: *lib.get(b"eglBindAPI\0")?,
            choose_config: *lib.get(b"eglChooseConfig\0")?,
            get_config_attrib: *lib.get(b"eglGetConfigAttrib\0")?,
            create_context: *lib.get(b"eglCreateContext\0")?,
            destroy_context: *lib.get(b"eglDestroyContext\0")?,
            create_window_surface: *lib.get(b"eglCreateWindowSurface\0")?,
            destroy_surface: *lib.get(b"eglDestroySurface\0")?,
            make_current: *lib.get(b"eglMakeCurrent\0")?,
            swap_buffers: *lib.get(b"eglSwapBuffers\0")?,
            swap_interval: *lib.get(b"eglSwapInterval\0")?,
            query_surface: *lib.get(b"eglQuerySurface\0")?,
            query_string: *lib.get(b"eglQueryString\0")?,
            get_proc_address: *lib.get(b"eglGetProcAddress\0")?,
            get_error: *lib.get(b"eglGetError\0")?,
        })
    }
}

/// Entry points for importing client dmabufs as EGL images
#[derive(Clone, Copy)]
pub struct ImageFns {
    display: EglDisplay,
    create_image: CreateImageKhrFn,
    destroy_image: DestroyImageKhrFn,
}

impl ImageFns {
    /// Create an image from a `EGL_LINUX_DMA_BUF_EXT` attribute list
    /// terminated by `EGL_NONE`.
    pub fn create_dmabuf_image(&self, attribs: &[EglInt]) -> Option<EglImage> {
        // SAFETY: attribs is EGL_NONE terminated; no client buffer for dmabuf targets
        let image = unsafe {
            (self.create_image)(
                self.display,
                ptr::null_mut(),
                EGL_LINUX_DMA_BUF_EXT,
                ptr::null_mut(),
                attribs.as_ptr(),
            )
        };
        (!image.is_null()).then_some(image)
    }

    pub fn destroy_image(&self, image: EglImage) {
        // SAFETY: image was created on this display
        unsafe {
            (self.destroy_image)(self.display, image);
        }
    }
}

/// An initialized display with a current GLES 3 context rendering into a
/// window surface.
pub struct EglState {
    fns: EglFns,
    display: EglDisplay,
    context: EglContext,
    surface: EglSurface,
    extensions: String,
    _lib: Library,
}

impl EglState {
    /// Initialize EGL on a GBM device and make a context current on a
    /// window surface created from `native_window`.
    pub fn new(native_display: *mut c_void, native_window: *mut c_void) -> Result<Self, EglError> {
        // SAFETY: loading the system EGL library runs no initialisers we depend on
        let lib = unsafe { Library::new("libEGL.so.1")? };
        let fns = unsafe { EglFns::load(&lib)? };

        let display = unsafe { Self::platform_display(&lib, &fns, native_display) };
        if display.is_null() {
            return Err(EglError::Call {
                call: "eglGetDisplay",
                code: 0,
            });
        }

        let (mut major, mut minor) = (0, 0);
        if unsafe { (fns.initialize)(display, &mut major, &mut minor) } == EGL_FALSE {
            return Err(Self::error(&fns, "eglInitialize"));
        }
        info!("EGL {}.{} initialized", major, minor);

        let query = |name| unsafe {
            let s = (fns.query_string)(display, name);
            if s.is_null() {
                String::new()
            } else {
                CStr::from_ptr(s).to_string_lossy().into_owned()
            }
        };
        debug!("EGL_VENDOR: {}", query(EGL_VENDOR));
        debug!("EGL_VERSION: {}", query(EGL_VERSION));
        let extensions = query(EGL_EXTENSIONS);

        if unsafe { (fns.bind_api)(EGL_OPENGL_ES_API) } == EGL_FALSE {
            return Err(Self::error(&fns, "eglBindAPI"));
        }

        let config = Self::choose_config(&fns, display)?;

        let ctx_attribs = [EGL_CONTEXT_MAJOR_VERSION, 3, EGL_NONE];
        let context =
            unsafe { (fns.create_context)(display, config, ptr::null_mut(), ctx_attribs.as_ptr()) };
        if context.is_null() {
            return Err(Self::error(&fns, "eglCreateContext"));
        }

        let surface =
            unsafe { (fns.create_window_surface)(display, config, native_window, ptr::null()) };
        if surface.is_null() {
            return Err(Self::error(&fns, "eglCreateWindowSurface"));
        }

        if unsafe { (fns.make_current)(display, surface, surface, context) } == EGL_FALSE {
            return Err(Self::error(&fns, "eglMakeCurrent"));
        }

        Ok(Self {
            fns,
            display,
            context,
            surface,
            extensions,
            _lib: lib,
        })
    }

    unsafe fn platform_display(lib: &Library, fns: &EglFns, native: *mut c_void) -> EglDisplay {
        let platform: Result<libloading::Symbol<GetPlatformDisplayFn>, _> =
            lib.get(b"eglGetPlatformDisplay\0");
        if let Ok(get_platform_display) = platform {
            let dpy = get_platform_display(EGL_PLATFORM_GBM_KHR, native, ptr::null());
            if !dpy.is_null() {
                return dpy;
            }
        }
        (fns.get_display)(native)
    }

    fn choose_config(fns: &EglFns, display: EglDisplay) -> Result<EglConfig, EglError> {
        let attribs = [
            EGL_SURFACE_TYPE,
            EGL_WINDOW_BIT,
            EGL_RED_SIZE,
            8,
            EGL_GREEN_SIZE,
            8,
            EGL_BLUE_SIZE,
            8,
            EGL_ALPHA_SIZE,
            8,
            EGL_RENDERABLE_TYPE,
            EGL_OPENGL_ES3_BIT,
            EGL_NONE,
        ];
        let mut configs = [ptr::null_mut(); 64];
        let mut count = 0;
        let ok = unsafe {
            (fns.choose_config)(
                display,
                attribs.as_ptr(),
                configs.as_mut_ptr(),
                configs.len() as EglInt,
                &mut count,
            )
        };
        if ok == EGL_FALSE {
            return Err(Self::error(fns, "eglChooseConfig"));
        }

        // The window surface must match the GBM surface format
        configs[..count.max(0) as usize]
            .iter()
            .copied()
            .find(|&config| {
                let mut visual = 0;
                let ok = unsafe {
                    (fns.get_config_attrib)(display, config, EGL_NATIVE_VISUAL_ID, &mut visual)
                };
                ok != EGL_FALSE && visual == GBM_FORMAT_ARGB8888
            })
            .ok_or(EglError::NoConfig)
    }

    fn error(fns: &EglFns, call: &'static str) -> EglError {
        EglError::Call {
            call,
            code: unsafe { (fns.get_error)() },
        }
    }

    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.split_whitespace().any(|e| e == name)
    }

    /// Resolve a GL or EGL entry point; null when unknown
    pub fn get_proc_address(&self, name: &str) -> *const c_void {
        match CString::new(name) {
            Ok(cname) => unsafe { (self.fns.get_proc_address)(cname.as_ptr()) },
            Err(_) => ptr::null(),
        }
    }

    /// dmabuf import entry points, if the driver supports them
    pub fn image_fns(&self) -> Result<ImageFns, EglError> {
        if !self.has_extension("EGL_EXT_image_dma_buf_import") {
            return Err(EglError::MissingExtension("EGL_EXT_image_dma_buf_import"));
        }
        let create = self.get_proc_address("eglCreateImageKHR");
        let destroy = self.get_proc_address("eglDestroyImageKHR");
        if create.is_null() || destroy.is_null() {
            return Err(EglError::MissingExtension("EGL_KHR_image_base"));
        }
        // SAFETY: non-null pointers returned for these names have these signatures
        unsafe {
            Ok(ImageFns {
                display: self.display,
                create_image: std::mem::transmute::<*const c_void, CreateImageKhrFn>(create),
                destroy_image: std::mem::transmute::<*const c_void, DestroyImageKhrFn>(destroy),
            })
        }
    }

    /// Size of the current draw surface
    pub fn surface_size(&self) -> (i32, i32) {
        let (mut w, mut h) = (0, 0);
        unsafe {
            (self.fns.query_surface)(self.display, self.surface, EGL_WIDTH, &mut w);
            (self.fns.query_surface)(self.display, self.surface, EGL_HEIGHT, &mut h);
        }
        (w, h)
    }

    pub fn set_swap_interval(&self, interval: i32) {
        unsafe {
            (self.fns.swap_interval)(self.display, interval);
        }
    }

    pub fn swap_buffers(&self) -> Result<(), EglError> {
        if unsafe { (self.fns.swap_buffers)(self.display, self.surface) } == EGL_FALSE {
            return Err(Self::error(&self.fns, "eglSwapBuffers"));
        }
        Ok(())
    }
}

impl Drop for EglState {
    fn drop(&mut self) {
        unsafe {
            (self.fns.make_current)(
                self.display,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
            );
            (self.fns.destroy_surface)(self.display, self.surface);
            (self.fns.destroy_context)(self.display, self.context);
            (self.fns.terminate)(self.display);
        }
    }
}
