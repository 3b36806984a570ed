//! `wgpu` implementation of the backend seam.
//!
//! - `context` owns instance/device/surface wiring and rebuilds swapchain
//!   state when the window resizes.
//! - `pipeline` turns a reflected program interface into bind group layouts,
//!   uniform buffers and a compute or display pipeline.
//! - `backend` implements [`crate::backend::GpuBackend`] on top of both.

mod backend;
mod context;
mod pipeline;

pub use backend::WgpuBackend;
pub(crate) use context::GpuContext;
