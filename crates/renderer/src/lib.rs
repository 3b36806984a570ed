//! Renderer crate for the compute-shader sandbox.
//!
//! A scene names GPU resources, compute programs that read and write them,
//! a dispatch schedule and one display program that puts a texture on the
//! window. Every frame runs the same pipeline:
//!
//! ```text
//!   reload queue ─┐
//!                 ▼
//!   FramePipeline::render_frame
//!     ├─ apply reloads (frame boundary)
//!     ├─ snapshot parameters + builtins
//!     ├─ ensure resources for the current surface size
//!     ├─ dispatch each scheduled program ──▶ pass barrier
//!     ├─ frame barrier
//!     └─ present display texture
//! ```
//!
//! Everything above the [`GpuBackend`] seam is backend agnostic:
//! [`HeadlessBackend`] records commands for tests and dry runs, while
//! [`WgpuBackend`] drives a real device from the window thread owned by
//! [`WindowRuntime`], which also hands pointer input back to the caller as
//! [`InputEvent`]s. A frame whose inputs are incomplete is skipped and the
//! previous image stays on screen; program failures land on the
//! [`DiagnosticsBoard`] instead of stopping the loop.

mod backend;
mod compile;
mod diagnostics;
mod dispatch;
mod error;
mod frame;
mod gpu;
mod input;
mod params;
mod program;
mod reload;
mod resources;
mod runtime;
mod types;
mod uniforms;
mod window;

use anyhow::Result;
use tracing::info;

pub use backend::{
    BarrierScope, BoundResource, Command, DispatchCommand, GpuBackend, HeadlessBackend,
    PresentCommand, Presentation, UniformUpload,
};
pub use compile::{
    build_interface, builtin_display_program, read_source, BindingKind, BindingSlot,
    LinkedStage, ProgramInterface, ProgramKind, ScalarType, ShaderLanguage, StorageAccessMode,
    TextureDimension, UniformBlock, UniformMember, UniformType, DISPLAY_SHADER_WGSL,
    MAX_BIND_GROUPS,
};
pub use diagnostics::{DiagnosticsBoard, ProgramStatus};
pub use dispatch::{DispatchReport, DispatchScheduler, PlannedDispatch};
pub use error::{
    BackendError, CompileError, CompilePhase, DispatchError, ParameterError, ResourceError,
    SceneError,
};
pub use frame::{FrameOutcome, FramePhase, FramePipeline, FrameReport, PipelineHandles, SkipReason};
pub use gpu::WgpuBackend;
pub use input::InputEvent;
pub use params::{ParamSnapshot, ParamType, ParamValue, ParamView, Parameter, ParameterStore};
pub use program::{Program, ProgramCache};
pub use reload::{reload_channel, ReloadHandle, ReloadQueue, ReloadRequest};
pub use resources::{Resource, ResourceManager};
pub use runtime::{
    BoxedTimeSource, FixedTimeSource, SteppedTimeSource, SystemTimeSource, TimeSample, TimeSource,
};
pub use types::{
    DisplaySpec, ProgramHandle, ProgramId, ProgramSpec, RendererConfig, ResourceDesc,
    ResourceFormat, ResourceHandle, ResourceId, ResourceKind, ResourceSize, SceneDescription,
    SceneResource, ShaderStage, SourceOrigin, StageSource, TextureFormat, DISPLAY_PROGRAM,
};
pub use uniforms::pack_block;
pub use window::WindowRuntime;

/// Entry point that owns the configuration for one interactive session.
pub struct Renderer {
    config: RendererConfig,
}

impl Renderer {
    pub fn new(config: RendererConfig) -> Self {
        Self { config }
    }

    /// Starts the render thread without blocking.
    ///
    /// The returned runtime exposes parameter and reload handles; dropping it
    /// closes the window.
    pub fn spawn(self) -> Result<WindowRuntime> {
        info!(
            width = self.config.surface_size.0,
            height = self.config.surface_size.1,
            programs = self.config.scene.programs.len(),
            "starting renderer"
        );
        WindowRuntime::spawn(self.config)
    }

    /// Opens the window and blocks until it is closed.
    pub fn run(self) -> Result<()> {
        self.spawn()?.wait()
    }
}
