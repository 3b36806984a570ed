use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use scheduler::{Extent3, FrameSchedule};

use crate::params::ParamValue;

/// Name of a GPU resource as declared by the scene and referenced by shaders.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        ResourceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        ResourceId::new(value)
    }
}

/// Name of a shader program held by the program cache.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgramId(pub String);

impl ProgramId {
    pub fn new(id: impl Into<String>) -> Self {
        ProgramId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProgramId {
    fn from(value: &str) -> Self {
        ProgramId::new(value)
    }
}

/// Id under which the display program is cached.
pub const DISPLAY_PROGRAM: &str = "__display";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Buffer => f.write_str("buffer"),
            ResourceKind::Texture => f.write_str("texture"),
        }
    }
}

/// Texel formats usable both as storage images and display sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba32Float,
    Rgba16Float,
    Rgba8Unorm,
    R32Float,
}

impl TextureFormat {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::Rgba32Float => 16,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba8Unorm | TextureFormat::R32Float => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceFormat {
    Texture(TextureFormat),
    /// Structured storage buffer; `stride` bytes per element.
    Buffer { stride: u32 },
}

impl ResourceFormat {
    pub fn kind(self) -> ResourceKind {
        match self {
            ResourceFormat::Texture(_) => ResourceKind::Texture,
            ResourceFormat::Buffer { .. } => ResourceKind::Buffer,
        }
    }
}

/// Allocation request handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceDesc {
    pub kind: ResourceKind,
    /// Texel dimensions for textures; `x` is the element count for buffers.
    pub dims: Extent3,
    pub format: ResourceFormat,
}

impl ResourceDesc {
    pub fn byte_len(&self) -> u64 {
        let elements = u64::from(self.dims.x) * u64::from(self.dims.y) * u64::from(self.dims.z);
        let per_element = match self.format {
            ResourceFormat::Texture(format) => format.bytes_per_texel(),
            ResourceFormat::Buffer { stride } => stride,
        };
        elements * u64::from(per_element)
    }
}

/// Opaque backend handle for an allocated buffer or texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceHandle(pub u64);

/// Opaque backend handle for a linked pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgramHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ShaderStage {
    Compute,
    Vertex,
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderStage::Compute => f.write_str("compute"),
            ShaderStage::Vertex => f.write_str("vertex"),
            ShaderStage::Fragment => f.write_str("fragment"),
        }
    }
}

/// Where a stage's source text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOrigin {
    Path(PathBuf),
    /// In-memory source; `name` only feeds diagnostics and language detection.
    Inline { name: String, text: Arc<str> },
}

impl SourceOrigin {
    pub fn display_name(&self) -> String {
        match self {
            SourceOrigin::Path(path) => path.display().to_string(),
            SourceOrigin::Inline { name, .. } => name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSource {
    pub stage: ShaderStage,
    pub origin: SourceOrigin,
    /// Entry point name; defaults to the module's single entry for the stage.
    pub entry: Option<String>,
}

/// Everything the program cache needs to (re)build one program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    pub id: ProgramId,
    pub stages: Vec<StageSource>,
}

impl ProgramSpec {
    pub fn compute(id: impl Into<String>, path: impl Into<PathBuf>, entry: Option<String>) -> Self {
        Self {
            id: ProgramId::new(id),
            stages: vec![StageSource {
                stage: ShaderStage::Compute,
                origin: SourceOrigin::Path(path.into()),
                entry,
            }],
        }
    }

    /// Source files watched for hot reload.
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.stages.iter().filter_map(|stage| match &stage.origin {
            SourceOrigin::Path(path) => Some(path),
            SourceOrigin::Inline { .. } => None,
        })
    }
}

/// Declared size of a scene resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceSize {
    Fixed(Extent3),
    /// Tracks the presentation surface in physical pixels.
    Surface,
}

#[derive(Debug, Clone)]
pub struct SceneResource {
    pub id: ResourceId,
    pub size: ResourceSize,
    pub format: ResourceFormat,
    /// Bytes uploaded whenever the resource is (re)allocated.
    pub initial: Option<Arc<[u8]>>,
}

impl SceneResource {
    pub fn kind(&self) -> ResourceKind {
        self.format.kind()
    }

    pub fn dims(&self, surface: (u32, u32)) -> Extent3 {
        match self.size {
            ResourceSize::Fixed(dims) => dims,
            ResourceSize::Surface => Extent3::new(surface.0.max(1), surface.1.max(1), 1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DisplaySpec {
    pub texture: ResourceId,
    /// Custom vertex/fragment sources replacing the built-in blit.
    pub program: Option<ProgramSpec>,
}

/// A fully resolved scene ready to drive the frame pipeline.
#[derive(Debug, Clone)]
pub struct SceneDescription {
    pub title: String,
    pub resources: Vec<SceneResource>,
    pub programs: Vec<ProgramSpec>,
    /// Initial parameter values, written to the store before the first frame.
    pub parameters: Vec<(String, ParamValue)>,
    pub display: DisplaySpec,
    pub schedule: FrameSchedule<ParamValue>,
}

impl SceneDescription {
    pub fn resource(&self, id: &str) -> Option<&SceneResource> {
        self.resources.iter().find(|resource| resource.id.as_str() == id)
    }

    pub fn program(&self, id: &ProgramId) -> Option<&ProgramSpec> {
        self.programs.iter().find(|program| &program.id == id)
    }
}

/// Immutable configuration passed to the window runtime at start-up.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Initial window size in physical pixels.
    pub surface_size: (u32, u32),
    pub title: String,
    /// Prefer tear-free presentation over latency.
    pub vsync: bool,
    pub scene: SceneDescription,
}
