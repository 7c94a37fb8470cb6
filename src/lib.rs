//! # kmsbox
//!
//! A minimal Wayland compositor that takes buffers from unmodified clients,
//! turns them into GPU textures and scans the result out directly through
//! DRM/KMS, with input from libinput routed to the focused client.
//!
//! ## Architecture
//!
//! - `drm`: connector/CRTC resolution, GBM scanout surface, page flips
//! - `egl`: EGL context on the GBM surface, dmabuf image import
//! - `render`: the [`render::Presenter`] seam and the GLES quad renderer
//! - `pipeline`: per-surface double-buffered textures guarded by GPU fences
//! - `protocol`: the Wayland globals and the compositor state they mutate
//! - `input`: udev device discovery and the libinput thread
//! - `scheduler`: the main loop
//! - `config`: layered configuration
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kmsbox::CompositorConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = CompositorConfig::from_env(None)?;
//!     kmsbox::scheduler::run(&config)
//! }
//! ```

pub mod config;
pub mod drm;
pub mod egl;
pub mod input;
pub mod pipeline;
pub mod protocol;
pub mod render;
pub mod scheduler;

pub use config::CompositorConfig;
pub use protocol::CompositorState;
pub use scheduler::FrameScheduler;

pub use anyhow::{Context, Error, Result};

/// Version information for kmsbox
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
