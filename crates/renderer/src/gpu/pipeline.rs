use std::borrow::Cow;
use std::num::NonZeroU64;

use wgpu::naga::ShaderStage as NagaStage;

use crate::compile::{
    BindingKind, BindingSlot, LinkedStage, ProgramInterface, ProgramKind, ShaderLanguage,
    StorageAccessMode, TextureDimension,
};
use crate::error::BackendError;
use crate::types::{ProgramId, ShaderStage, TextureFormat};

pub(crate) enum PipelineKind {
    Compute(wgpu::ComputePipeline),
    Display(wgpu::RenderPipeline),
}

pub(crate) struct UniformSlot {
    pub group: u32,
    pub binding: u32,
    pub buffer: wgpu::Buffer,
}

/// GPU objects behind one linked program.
pub(crate) struct LinkedPipeline {
    pub id: ProgramId,
    pub kind: PipelineKind,
    /// One layout per group index, including empty groups below the highest used.
    pub layouts: Vec<wgpu::BindGroupLayout>,
    pub slots: Vec<BindingSlot>,
    pub uniforms: Vec<UniformSlot>,
    pub sampler: wgpu::Sampler,
}

impl LinkedPipeline {
    pub fn uniform_buffer(&self, group: u32, binding: u32) -> Option<&wgpu::Buffer> {
        self.uniforms
            .iter()
            .find(|slot| slot.group == group && slot.binding == binding)
            .map(|slot| &slot.buffer)
    }
}

pub(crate) fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
    }
}

fn view_dimension(dimension: TextureDimension) -> wgpu::TextureViewDimension {
    match dimension {
        TextureDimension::D1 => wgpu::TextureViewDimension::D1,
        TextureDimension::D2 => wgpu::TextureViewDimension::D2,
        TextureDimension::D3 => wgpu::TextureViewDimension::D3,
    }
}

fn visibility(stages: &[ShaderStage]) -> wgpu::ShaderStages {
    stages
        .iter()
        .fold(wgpu::ShaderStages::NONE, |acc, stage| {
            acc | match stage {
                ShaderStage::Compute => wgpu::ShaderStages::COMPUTE,
                ShaderStage::Vertex => wgpu::ShaderStages::VERTEX,
                ShaderStage::Fragment => wgpu::ShaderStages::FRAGMENT,
            }
        })
}

fn binding_type(kind: BindingKind) -> wgpu::BindingType {
    match kind {
        BindingKind::Uniform { size } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: NonZeroU64::new(u64::from(size)),
        },
        BindingKind::Storage { read_only } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::StorageTexture {
            format,
            access,
            dimension,
        } => wgpu::BindingType::StorageTexture {
            access: match access {
                StorageAccessMode::ReadOnly => wgpu::StorageTextureAccess::ReadOnly,
                StorageAccessMode::WriteOnly => wgpu::StorageTextureAccess::WriteOnly,
                StorageAccessMode::ReadWrite => wgpu::StorageTextureAccess::ReadWrite,
            },
            format: texture_format(format),
            view_dimension: view_dimension(dimension),
        },
        // Float32 textures are not filterable without an optional feature.
        BindingKind::SampledTexture { dimension } => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: view_dimension(dimension),
            multisampled: false,
        },
        BindingKind::Sampler => wgpu::BindingType::Sampler(wgpu::SamplerBindingType::NonFiltering),
    }
}

fn layout_entries(slots: &[BindingSlot], group: u32) -> Vec<wgpu::BindGroupLayoutEntry> {
    slots
        .iter()
        .filter(|slot| slot.group == group)
        .map(|slot| wgpu::BindGroupLayoutEntry {
            binding: slot.binding,
            visibility: visibility(&slot.stages),
            ty: binding_type(slot.kind),
            count: None,
        })
        .collect()
}

fn shader_module(device: &wgpu::Device, id: &ProgramId, stage: &LinkedStage) -> wgpu::ShaderModule {
    let label = format!("{id} {} shader", stage.stage);
    let source = match stage.language {
        ShaderLanguage::Wgsl => wgpu::ShaderSource::Wgsl(Cow::Owned(stage.source.to_string())),
        ShaderLanguage::Glsl => wgpu::ShaderSource::Glsl {
            shader: Cow::Owned(stage.source.to_string()),
            stage: match stage.stage {
                ShaderStage::Compute => NagaStage::Compute,
                ShaderStage::Vertex => NagaStage::Vertex,
                ShaderStage::Fragment => NagaStage::Fragment,
            },
            defines: &[],
        },
    };
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(&label),
        source,
    })
}

fn find_stage(interface: &ProgramInterface, wanted: ShaderStage) -> Result<&LinkedStage, BackendError> {
    interface
        .stages
        .iter()
        .find(|stage| stage.stage == wanted)
        .ok_or_else(|| BackendError::Pipeline(format!("program has no {wanted} stage")))
}

/// Builds layouts, uniform buffers and the pipeline for `interface`.
///
/// Runs inside a validation error scope so a rejected pipeline surfaces as
/// an error instead of reaching the uncaptured-error handler.
pub(crate) fn create_pipeline(
    device: &wgpu::Device,
    surface_format: wgpu::TextureFormat,
    id: &ProgramId,
    interface: &ProgramInterface,
) -> Result<LinkedPipeline, BackendError> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let built = build_pipeline(device, surface_format, id, interface);
    let rejected = pollster::block_on(device.pop_error_scope());
    match (built, rejected) {
        (Err(err), _) => Err(err),
        (Ok(_), Some(err)) => Err(BackendError::Pipeline(err.to_string())),
        (Ok(pipeline), None) => Ok(pipeline),
    }
}

fn build_pipeline(
    device: &wgpu::Device,
    surface_format: wgpu::TextureFormat,
    id: &ProgramId,
    interface: &ProgramInterface,
) -> Result<LinkedPipeline, BackendError> {
    let group_count = interface
        .bindings
        .iter()
        .map(|slot| slot.group + 1)
        .max()
        .unwrap_or(0);
    let layouts: Vec<wgpu::BindGroupLayout> = (0..group_count)
        .map(|group| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&format!("{id} group {group}")),
                entries: &layout_entries(&interface.bindings, group),
            })
        })
        .collect();
    let layout_refs: Vec<&wgpu::BindGroupLayout> = layouts.iter().collect();
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(&format!("{id} pipeline layout")),
        bind_group_layouts: &layout_refs,
        push_constant_ranges: &[],
    });

    let uniforms = interface
        .uniforms
        .iter()
        .map(|block| UniformSlot {
            group: block.group,
            binding: block.binding,
            buffer: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some(&format!("{id} uniforms {}.{}", block.group, block.binding)),
                size: u64::from(block.size.max(16)).next_multiple_of(16),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
        })
        .collect();

    // Unfiltered texel fetches; the sampler exists only for shaders that declare one.
    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some(&format!("{id} sampler")),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Nearest,
        min_filter: wgpu::FilterMode::Nearest,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    });

    let kind = match interface.kind {
        ProgramKind::Compute { .. } => {
            let stage = find_stage(interface, ShaderStage::Compute)?;
            let module = shader_module(device, id, stage);
            PipelineKind::Compute(device.create_compute_pipeline(
                &wgpu::ComputePipelineDescriptor {
                    label: Some(&format!("{id} compute pipeline")),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some(&stage.entry),
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                },
            ))
        }
        ProgramKind::Display => {
            let vertex = find_stage(interface, ShaderStage::Vertex)?;
            let fragment = find_stage(interface, ShaderStage::Fragment)?;
            let vertex_module = shader_module(device, id, vertex);
            let fragment_module = shader_module(device, id, fragment);
            PipelineKind::Display(device.create_render_pipeline(
                &wgpu::RenderPipelineDescriptor {
                    label: Some(&format!("{id} display pipeline")),
                    layout: Some(&pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &vertex_module,
                        entry_point: Some(&vertex.entry),
                        buffers: &[],
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                    },
                    primitive: wgpu::PrimitiveState {
                        topology: wgpu::PrimitiveTopology::TriangleList,
                        strip_index_format: None,
                        front_face: wgpu::FrontFace::Ccw,
                        cull_mode: None,
                        polygon_mode: wgpu::PolygonMode::Fill,
                        unclipped_depth: false,
                        conservative: false,
                    },
                    depth_stencil: None,
                    multisample: wgpu::MultisampleState::default(),
                    fragment: Some(wgpu::FragmentState {
                        module: &fragment_module,
                        entry_point: Some(&fragment.entry),
                        targets: &[Some(wgpu::ColorTargetState {
                            format: surface_format,
                            blend: None,
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                        compilation_options: wgpu::PipelineCompilationOptions::default(),
                    }),
                    multiview: None,
                    cache: None,
                },
            ))
        }
    };

    Ok(LinkedPipeline {
        id: id.clone(),
        kind,
        layouts,
        slots: interface.bindings.clone(),
        uniforms,
        sampler,
    })
}
