//! Shader front end: parses WGSL or GLSL through naga, validates the module,
//! and reflects the interface the rest of the pipeline relies on (work-group
//! size, binding slots, uniform block layouts).

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use scheduler::WorkGroupSize;
use wgpu::naga;

use crate::error::{CompileError, CompilePhase};
use crate::types::{
    ProgramId, ProgramSpec, ShaderStage, SourceOrigin, StageSource, TextureFormat, DISPLAY_PROGRAM,
};

/// Bind groups a program may use.
pub const MAX_BIND_GROUPS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderLanguage {
    Wgsl,
    Glsl,
}

impl ShaderLanguage {
    pub fn detect(name: &str) -> Option<Self> {
        let extension = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
        match extension.as_str() {
            "wgsl" => Some(ShaderLanguage::Wgsl),
            "glsl" | "comp" | "vert" | "frag" => Some(ShaderLanguage::Glsl),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureDimension {
    D1,
    D2,
    D3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageAccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    Uniform {
        size: u32,
    },
    Storage {
        read_only: bool,
    },
    StorageTexture {
        format: TextureFormat,
        access: StorageAccessMode,
        dimension: TextureDimension,
    },
    SampledTexture {
        dimension: TextureDimension,
    },
    Sampler,
}

impl BindingKind {
    /// Whether a dispatch binding this slot may change the bound resource.
    pub fn writes(&self) -> bool {
        match self {
            BindingKind::Storage { read_only } => !read_only,
            BindingKind::StorageTexture { access, .. } => *access != StorageAccessMode::ReadOnly,
            _ => false,
        }
    }
}

/// A resource slot resolved from the shader at link time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSlot {
    pub name: String,
    /// Other names the slot answers to, e.g. a GLSL block name.
    pub aliases: Vec<String>,
    pub group: u32,
    pub binding: u32,
    pub kind: BindingKind,
    pub stages: Vec<ShaderStage>,
}

impl BindingSlot {
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.aliases.iter().any(|alias| alias == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Float,
    Sint,
    Uint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformType {
    Scalar(ScalarType),
    Vector(u8, ScalarType),
    Matrix { columns: u8, rows: u8 },
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformMember {
    pub name: String,
    pub offset: u32,
    pub ty: UniformType,
}

/// Layout of one uniform buffer, filled from parameters by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBlock {
    pub group: u32,
    pub binding: u32,
    pub size: u32,
    pub members: Vec<UniformMember>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    Compute { workgroup: WorkGroupSize },
    Display,
}

/// A stage that passed validation, kept as source for the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedStage {
    pub stage: ShaderStage,
    pub language: ShaderLanguage,
    pub source: Arc<str>,
    pub entry: String,
}

/// Result of compiling and linking every stage of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramInterface {
    pub kind: ProgramKind,
    pub stages: Vec<LinkedStage>,
    pub bindings: Vec<BindingSlot>,
    pub uniforms: Vec<UniformBlock>,
    pub log: String,
}

struct CompiledStage {
    linked: LinkedStage,
    workgroup: [u32; 3],
    bindings: Vec<BindingSlot>,
    uniforms: Vec<UniformBlock>,
}

/// Reads a stage's source text.
pub fn read_source(program: &ProgramId, source: &StageSource) -> Result<Arc<str>, CompileError> {
    match &source.origin {
        SourceOrigin::Inline { text, .. } => Ok(Arc::clone(text)),
        SourceOrigin::Path(path) => std::fs::read_to_string(path)
            .map(Arc::from)
            .map_err(|err| {
                CompileError::new(program, Some(source.stage), CompilePhase::Read, err.to_string())
                    .with_source(path.display().to_string())
            }),
    }
}

/// Compiles, reflects and links the given sources.
pub fn build_interface(
    spec: &ProgramSpec,
    texts: &[Arc<str>],
) -> Result<ProgramInterface, CompileError> {
    let mut compiled = Vec::with_capacity(spec.stages.len());
    for (source, text) in spec.stages.iter().zip(texts) {
        compiled.push(compile_stage(&spec.id, source, text)?);
    }
    link(&spec.id, compiled)
}

fn compile_stage(
    program: &ProgramId,
    source: &StageSource,
    text: &Arc<str>,
) -> Result<CompiledStage, CompileError> {
    let name = source.origin.display_name();
    let error = |phase: CompilePhase, message: String| {
        CompileError::new(program, Some(source.stage), phase, message).with_source(name.clone())
    };

    let language = ShaderLanguage::detect(&name).ok_or_else(|| {
        error(
            CompilePhase::Read,
            "unrecognised shader extension; expected .wgsl, .comp, .vert, .frag or .glsl".into(),
        )
    })?;

    let module = match language {
        ShaderLanguage::Wgsl => naga::front::wgsl::parse_str(text).map_err(|err| {
            let base = error(CompilePhase::Parse, err.message().to_string());
            match err.location(text) {
                Some(location) => base.at(location.line_number, location.line_position),
                None => base,
            }
        })?,
        ShaderLanguage::Glsl => {
            let mut frontend = naga::front::glsl::Frontend::default();
            let options = naga::front::glsl::Options::from(naga_stage(source.stage));
            frontend.parse(&options, text).map_err(|parse| {
                let message = parse
                    .errors
                    .iter()
                    .map(|err| err.kind.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                let base = error(CompilePhase::Parse, message);
                match parse.errors.first() {
                    Some(first) => {
                        let location = first.meta.location(text);
                        base.at(location.line_number, location.line_position)
                    }
                    None => base,
                }
            })?
        }
    };

    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|err| {
        let base = error(CompilePhase::Validate, error_chain(err.as_inner()));
        match err.location(text) {
            Some(location) => base.at(location.line_number, location.line_position),
            None => base,
        }
    })?;

    let entry_index = select_entry(&module, source.stage, source.entry.as_deref())
        .map_err(|message| error(CompilePhase::Link, message))?;
    let entry = &module.entry_points[entry_index];
    let usage = info.get_entry_point(entry_index);

    let mut bindings = Vec::new();
    let mut uniforms = Vec::new();
    for (handle, global) in module.global_variables.iter() {
        if usage[handle].is_empty() {
            continue;
        }
        let Some(resource) = &global.binding else {
            continue;
        };
        let ty = &module.types[global.ty];
        let name = global
            .name
            .clone()
            .or_else(|| ty.name.clone())
            .unwrap_or_else(|| format!("group{}_binding{}", resource.group, resource.binding));
        let mut aliases = Vec::new();
        if let Some(type_name) = &ty.name {
            if *type_name != name {
                aliases.push(type_name.clone());
            }
        }

        let kind = binding_kind(&module, global, &ty.inner)
            .map_err(|message| error(CompilePhase::Link, format!("binding '{name}': {message}")))?;
        if let BindingKind::Uniform { size } = kind {
            uniforms.push(UniformBlock {
                group: resource.group,
                binding: resource.binding,
                size,
                members: uniform_members(&module, &name, &ty.inner),
            });
        }
        bindings.push(BindingSlot {
            name,
            aliases,
            group: resource.group,
            binding: resource.binding,
            kind,
            stages: vec![source.stage],
        });
    }

    Ok(CompiledStage {
        linked: LinkedStage {
            stage: source.stage,
            language,
            source: Arc::clone(text),
            entry: entry.name.clone(),
        },
        workgroup: entry.workgroup_size,
        bindings,
        uniforms,
    })
}

fn link(program: &ProgramId, stages: Vec<CompiledStage>) -> Result<ProgramInterface, CompileError> {
    let link_error = |message: &str| CompileError::new(program, None, CompilePhase::Link, message);

    let stage_list: Vec<ShaderStage> = stages.iter().map(|stage| stage.linked.stage).collect();
    let kind = match stage_list.as_slice() {
        [ShaderStage::Compute] => {
            let workgroup = WorkGroupSize(stages[0].workgroup);
            if workgroup.0.contains(&0) {
                return Err(link_error("compute entry point declares an empty work-group size"));
            }
            ProgramKind::Compute { workgroup }
        }
        [ShaderStage::Vertex, ShaderStage::Fragment] | [ShaderStage::Fragment, ShaderStage::Vertex] => {
            ProgramKind::Display
        }
        _ => {
            return Err(link_error(
                "a program is either one compute stage or a vertex and fragment pair",
            ))
        }
    };

    let mut slots: BTreeMap<(u32, u32), BindingSlot> = BTreeMap::new();
    let mut blocks: BTreeMap<(u32, u32), UniformBlock> = BTreeMap::new();
    let mut linked = Vec::with_capacity(stages.len());
    for stage in stages {
        for slot in stage.bindings {
            if slot.group >= MAX_BIND_GROUPS {
                return Err(link_error(&format!(
                    "binding '{}' uses group {}; at most {MAX_BIND_GROUPS} groups are available",
                    slot.name, slot.group
                )));
            }
            match slots.get_mut(&(slot.group, slot.binding)) {
                Some(existing) if existing.kind != slot.kind => {
                    return Err(link_error(&format!(
                        "@group({}) @binding({}) is declared with different types across stages",
                        slot.group, slot.binding
                    )));
                }
                Some(existing) => {
                    for name in slot.names() {
                        if !existing.answers_to(name) {
                            existing.aliases.push(name.to_string());
                        }
                    }
                    existing.stages.extend(slot.stages);
                }
                None => {
                    slots.insert((slot.group, slot.binding), slot);
                }
            }
        }
        for block in stage.uniforms {
            blocks.entry((block.group, block.binding)).or_insert(block);
        }
        linked.push(stage.linked);
    }

    let bindings: Vec<BindingSlot> = slots.into_values().collect();
    let uniforms: Vec<UniformBlock> = blocks.into_values().collect();
    let log = interface_log(&kind, &linked, &bindings, &uniforms);
    Ok(ProgramInterface {
        kind,
        stages: linked,
        bindings,
        uniforms,
        log,
    })
}

fn select_entry(
    module: &naga::Module,
    stage: ShaderStage,
    requested: Option<&str>,
) -> Result<usize, String> {
    let wanted = naga_stage(stage);
    let candidates: Vec<usize> = module
        .entry_points
        .iter()
        .enumerate()
        .filter(|(_, entry)| entry.stage == wanted)
        .map(|(index, _)| index)
        .collect();
    match requested {
        Some(name) => candidates
            .into_iter()
            .find(|index| module.entry_points[*index].name == name)
            .ok_or_else(|| format!("no {stage} entry point named '{name}'")),
        None => match candidates.as_slice() {
            [index] => Ok(*index),
            [] => Err(format!("no {stage} entry point")),
            _ => Err(format!(
                "several {stage} entry points; name one with `entry`"
            )),
        },
    }
}

fn binding_kind(
    module: &naga::Module,
    global: &naga::GlobalVariable,
    inner: &naga::TypeInner,
) -> Result<BindingKind, String> {
    match global.space {
        naga::AddressSpace::Uniform => Ok(BindingKind::Uniform {
            size: inner.size(module.to_ctx()),
        }),
        naga::AddressSpace::Storage { access } => Ok(BindingKind::Storage {
            read_only: !access.contains(naga::StorageAccess::STORE),
        }),
        naga::AddressSpace::Handle => match inner {
            naga::TypeInner::Sampler { .. } => Ok(BindingKind::Sampler),
            naga::TypeInner::Image {
                dim,
                arrayed,
                class,
            } => {
                if *arrayed {
                    return Err("arrayed textures are not supported".into());
                }
                let dimension = match dim {
                    naga::ImageDimension::D1 => TextureDimension::D1,
                    naga::ImageDimension::D2 => TextureDimension::D2,
                    naga::ImageDimension::D3 => TextureDimension::D3,
                    naga::ImageDimension::Cube => {
                        return Err("cube textures are not supported".into())
                    }
                };
                match class {
                    naga::ImageClass::Storage { format, access } => {
                        let format = match format {
                            naga::StorageFormat::Rgba32Float => TextureFormat::Rgba32Float,
                            naga::StorageFormat::Rgba16Float => TextureFormat::Rgba16Float,
                            naga::StorageFormat::Rgba8Unorm => TextureFormat::Rgba8Unorm,
                            naga::StorageFormat::R32Float => TextureFormat::R32Float,
                            other => return Err(format!("storage format {other:?} is not supported")),
                        };
                        let load = access.contains(naga::StorageAccess::LOAD);
                        let store = access.contains(naga::StorageAccess::STORE);
                        let access = match (load, store) {
                            (true, true) => StorageAccessMode::ReadWrite,
                            (false, true) => StorageAccessMode::WriteOnly,
                            _ => StorageAccessMode::ReadOnly,
                        };
                        Ok(BindingKind::StorageTexture {
                            format,
                            access,
                            dimension,
                        })
                    }
                    naga::ImageClass::Sampled { multi: false, .. } => {
                        Ok(BindingKind::SampledTexture { dimension })
                    }
                    _ => Err("multisampled and depth textures are not supported".into()),
                }
            }
            _ => Err("unsupported handle type".into()),
        },
        other => Err(format!("address space {other:?} cannot be bound")),
    }
}

fn uniform_members(module: &naga::Module, name: &str, inner: &naga::TypeInner) -> Vec<UniformMember> {
    match inner {
        naga::TypeInner::Struct { members, .. } => members
            .iter()
            .filter_map(|member| {
                Some(UniformMember {
                    name: member.name.clone()?,
                    offset: member.offset,
                    ty: uniform_type(&module.types[member.ty].inner),
                })
            })
            .collect(),
        other => vec![UniformMember {
            name: name.to_string(),
            offset: 0,
            ty: uniform_type(other),
        }],
    }
}

fn uniform_type(inner: &naga::TypeInner) -> UniformType {
    let scalar = |scalar: &naga::Scalar| -> Option<ScalarType> {
        if scalar.width != 4 {
            return None;
        }
        match scalar.kind {
            naga::ScalarKind::Float => Some(ScalarType::Float),
            naga::ScalarKind::Sint => Some(ScalarType::Sint),
            naga::ScalarKind::Uint => Some(ScalarType::Uint),
            _ => None,
        }
    };
    match inner {
        naga::TypeInner::Scalar(s) => scalar(s).map_or(UniformType::Unsupported, UniformType::Scalar),
        naga::TypeInner::Vector { size, scalar: s } => scalar(s)
            .map_or(UniformType::Unsupported, |kind| UniformType::Vector(*size as u8, kind)),
        naga::TypeInner::Matrix {
            columns,
            rows,
            scalar: s,
        } if scalar(s) == Some(ScalarType::Float) => UniformType::Matrix {
            columns: *columns as u8,
            rows: *rows as u8,
        },
        _ => UniformType::Unsupported,
    }
}

fn naga_stage(stage: ShaderStage) -> naga::ShaderStage {
    match stage {
        ShaderStage::Compute => naga::ShaderStage::Compute,
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
    }
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let _ = write!(message, ": {cause}");
        source = cause.source();
    }
    message
}

fn interface_log(
    kind: &ProgramKind,
    stages: &[LinkedStage],
    bindings: &[BindingSlot],
    uniforms: &[UniformBlock],
) -> String {
    let mut log = String::new();
    for stage in stages {
        let _ = writeln!(log, "{} entry '{}' ({:?})", stage.stage, stage.entry, stage.language);
    }
    if let ProgramKind::Compute { workgroup } = kind {
        let _ = writeln!(log, "work-group size {:?}", workgroup.0);
    }
    for slot in bindings {
        let _ = writeln!(
            log,
            "@group({}) @binding({}) {} {:?}",
            slot.group, slot.binding, slot.name, slot.kind
        );
    }
    for block in uniforms {
        let names: Vec<&str> = block.members.iter().map(|member| member.name.as_str()).collect();
        let _ = writeln!(
            log,
            "uniform block @group({}) @binding({}) {} bytes: {}",
            block.group,
            block.binding,
            block.size,
            names.join(", ")
        );
    }
    log
}

/// Full-screen blit used when a scene does not supply display shaders.
///
/// Texels are fetched without filtering so the image shows exactly what the
/// compute passes wrote.
pub const DISPLAY_SHADER_WGSL: &str = r"
@group(0) @binding(0) var display_texture: texture_2d<f32>;

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> VertexOutput {
    var positions = array<vec2<f32>, 3>(
        vec2<f32>(-1.0, -3.0),
        vec2<f32>(3.0, 1.0),
        vec2<f32>(-1.0, 1.0),
    );
    let pos = positions[index];
    var out: VertexOutput;
    out.position = vec4<f32>(pos, 0.0, 1.0);
    out.uv = vec2<f32>(pos.x * 0.5 + 0.5, 0.5 - pos.y * 0.5);
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    let size = vec2<f32>(textureDimensions(display_texture));
    let texel = vec2<i32>(clamp(in.uv * size, vec2<f32>(0.0), size - vec2<f32>(1.0)));
    return vec4<f32>(textureLoad(display_texture, texel, 0).rgb, 1.0);
}
";

/// Program spec for the built-in display blit.
pub fn builtin_display_program() -> ProgramSpec {
    let text: Arc<str> = Arc::from(DISPLAY_SHADER_WGSL);
    let origin = SourceOrigin::Inline {
        name: "builtin_display.wgsl".into(),
        text,
    };
    ProgramSpec {
        id: ProgramId::new(DISPLAY_PROGRAM),
        stages: vec![
            StageSource {
                stage: ShaderStage::Vertex,
                origin: origin.clone(),
                entry: Some("vs_main".into()),
            },
            StageSource {
                stage: ShaderStage::Fragment,
                origin,
                entry: Some("fs_main".into()),
            },
        ],
    }
}
