use std::collections::HashMap;

use scheduler::GroupLimits;
use tracing::{debug, trace, warn};
use wgpu::util::DeviceExt;
use winit::dpi::PhysicalSize;

use crate::backend::{
    BarrierScope, BoundResource, DispatchCommand, GpuBackend, PresentCommand, UniformUpload,
};
use crate::compile::{BindingKind, ProgramInterface};
use crate::error::BackendError;
use crate::types::{
    ProgramHandle, ProgramId, ResourceDesc, ResourceFormat, ResourceHandle, ResourceId,
};

use super::context::GpuContext;
use super::pipeline::{create_pipeline, texture_format, LinkedPipeline, PipelineKind};

enum GpuResource {
    Buffer {
        buffer: wgpu::Buffer,
        desc: ResourceDesc,
    },
    Texture {
        texture: wgpu::Texture,
        view: wgpu::TextureView,
        desc: ResourceDesc,
    },
}

impl GpuResource {
    fn desc(&self) -> &ResourceDesc {
        match self {
            GpuResource::Buffer { desc, .. } | GpuResource::Texture { desc, .. } => desc,
        }
    }
}

/// [`GpuBackend`] over a real `wgpu` device and window surface.
///
/// Compute passes and copies are recorded into one encoder per frame; the
/// frame barrier submits it and waits for the queue to drain, so at most one
/// compute frame is ever in flight.
pub struct WgpuBackend {
    context: GpuContext,
    next_handle: u64,
    resources: HashMap<ResourceHandle, GpuResource>,
    programs: HashMap<ProgramHandle, LinkedPipeline>,
    encoder: Option<wgpu::CommandEncoder>,
}

impl WgpuBackend {
    pub(crate) fn new(context: GpuContext) -> Self {
        context.device.on_uncaptured_error(Box::new(|err| {
            tracing::error!(error = %err, "uncaptured GPU error");
        }));
        Self {
            context,
            next_handle: 1,
            resources: HashMap::new(),
            programs: HashMap::new(),
            encoder: None,
        }
    }

    pub fn set_vsync(&mut self, enabled: bool) {
        self.context.set_vsync(enabled);
    }

    fn issue_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn check_limits(&self, desc: &ResourceDesc) -> Result<(), BackendError> {
        let limits = &self.context.limits;
        let dims = desc.dims;
        let fits = match desc.format {
            ResourceFormat::Buffer { .. } => {
                desc.byte_len() <= limits.max_buffer_size
                    && desc.byte_len() <= u64::from(limits.max_storage_buffer_binding_size)
            }
            ResourceFormat::Texture(_) if dims.z > 1 => [dims.x, dims.y, dims.z]
                .iter()
                .all(|axis| *axis <= limits.max_texture_dimension_3d),
            ResourceFormat::Texture(_) => {
                dims.x <= limits.max_texture_dimension_2d && dims.y <= limits.max_texture_dimension_2d
            }
        };
        if fits {
            Ok(())
        } else {
            Err(BackendError::Allocation(format!(
                "{:?} ({} bytes) exceeds device limits",
                dims.as_array(),
                desc.byte_len()
            )))
        }
    }

    fn create_resource(&self, id: &ResourceId, desc: &ResourceDesc) -> GpuResource {
        let device = &self.context.device;
        match desc.format {
            ResourceFormat::Buffer { .. } => GpuResource::Buffer {
                buffer: device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(id.as_str()),
                    size: desc.byte_len().max(4).next_multiple_of(4),
                    usage: wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::COPY_SRC
                        | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                }),
                desc: *desc,
            },
            ResourceFormat::Texture(format) => {
                let texture = device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(id.as_str()),
                    size: extent(desc),
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: if desc.dims.z > 1 {
                        wgpu::TextureDimension::D3
                    } else {
                        wgpu::TextureDimension::D2
                    },
                    format: texture_format(format),
                    usage: wgpu::TextureUsages::STORAGE_BINDING
                        | wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_SRC
                        | wgpu::TextureUsages::COPY_DST,
                    view_formats: &[],
                });
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                GpuResource::Texture {
                    texture,
                    view,
                    desc: *desc,
                }
            }
        }
    }

    fn program(&self, handle: ProgramHandle) -> Result<&LinkedPipeline, BackendError> {
        self.programs
            .get(&handle)
            .ok_or(BackendError::UnknownHandle(handle.0))
    }

    /// One bind group per layout of `program`, filled from `bindings`.
    fn bind_groups(
        &self,
        program: &LinkedPipeline,
        bindings: &[BoundResource],
    ) -> Result<Vec<wgpu::BindGroup>, BackendError> {
        let mut groups = Vec::with_capacity(program.layouts.len());
        for (group, layout) in program.layouts.iter().enumerate() {
            let group = group as u32;
            let mut entries = Vec::new();
            for slot in program.slots.iter().filter(|slot| slot.group == group) {
                let resource = match slot.kind {
                    BindingKind::Uniform { .. } => program
                        .uniform_buffer(slot.group, slot.binding)
                        .ok_or_else(|| {
                            BackendError::Pipeline(format!(
                                "no uniform buffer for {}.{}",
                                slot.group, slot.binding
                            ))
                        })?
                        .as_entire_binding(),
                    BindingKind::Sampler => wgpu::BindingResource::Sampler(&program.sampler),
                    _ => {
                        let bound = bindings
                            .iter()
                            .find(|bound| bound.group == slot.group && bound.binding == slot.binding)
                            .ok_or_else(|| {
                                BackendError::Pipeline(format!(
                                    "program '{}' slot '{}' is unbound",
                                    program.id, slot.name
                                ))
                            })?;
                        match self.resources.get(&bound.resource) {
                            Some(GpuResource::Buffer { buffer, .. }) => buffer.as_entire_binding(),
                            Some(GpuResource::Texture { view, .. }) => {
                                wgpu::BindingResource::TextureView(view)
                            }
                            None => return Err(BackendError::UnknownHandle(bound.resource.0)),
                        }
                    }
                };
                entries.push(wgpu::BindGroupEntry {
                    binding: slot.binding,
                    resource,
                });
            }
            groups.push(
                self.context
                    .device
                    .create_bind_group(&wgpu::BindGroupDescriptor {
                        label: Some(&format!("{} group {group}", program.id)),
                        layout,
                        entries: &entries,
                    }),
            );
        }
        Ok(groups)
    }
}

fn extent(desc: &ResourceDesc) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: desc.dims.x,
        height: desc.dims.y,
        depth_or_array_layers: desc.dims.z,
    }
}

/// Copies each upload through a staging buffer so every pass sees its own values.
fn stage_uniforms(
    device: &wgpu::Device,
    encoder: &mut wgpu::CommandEncoder,
    program: &LinkedPipeline,
    uploads: &[UniformUpload],
) {
    for upload in uploads {
        let Some(target) = program.uniform_buffer(upload.group, upload.binding) else {
            continue;
        };
        let mut bytes = upload.bytes.clone();
        bytes.resize(bytes.len().next_multiple_of(4), 0);
        if bytes.is_empty() {
            continue;
        }
        let staging = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("uniform staging"),
            contents: &bytes,
            usage: wgpu::BufferUsages::COPY_SRC,
        });
        encoder.copy_buffer_to_buffer(&staging, 0, target, 0, bytes.len() as u64);
    }
}

impl GpuBackend for WgpuBackend {
    fn allocate(
        &mut self,
        id: &ResourceId,
        desc: &ResourceDesc,
    ) -> Result<ResourceHandle, BackendError> {
        self.check_limits(desc)?;
        let device = &self.context.device;
        device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let resource = self.create_resource(id, desc);
        let invalid = pollster::block_on(self.context.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.context.device.pop_error_scope());
        if let Some(err) = invalid.or(out_of_memory) {
            return Err(BackendError::Allocation(err.to_string()));
        }
        let handle = ResourceHandle(self.issue_handle());
        self.resources.insert(handle, resource);
        trace!(resource = %id, handle = handle.0, bytes = desc.byte_len(), "allocated");
        Ok(handle)
    }

    fn release(&mut self, handle: ResourceHandle) {
        match self.resources.remove(&handle) {
            Some(GpuResource::Buffer { buffer, .. }) => buffer.destroy(),
            Some(GpuResource::Texture { texture, .. }) => texture.destroy(),
            None => {}
        }
    }

    fn write(&mut self, handle: ResourceHandle, bytes: &[u8]) -> Result<(), BackendError> {
        let resource = self
            .resources
            .get(&handle)
            .ok_or(BackendError::UnknownHandle(handle.0))?;
        if bytes.len() as u64 > resource.desc().byte_len() {
            return Err(BackendError::Allocation(format!(
                "write of {} bytes exceeds resource size {}",
                bytes.len(),
                resource.desc().byte_len()
            )));
        }
        match resource {
            GpuResource::Buffer { buffer, .. } => {
                let mut padded = bytes.to_vec();
                padded.resize(bytes.len().next_multiple_of(4), 0);
                self.context.queue.write_buffer(buffer, 0, &padded);
            }
            GpuResource::Texture { texture, desc, .. } => {
                let ResourceFormat::Texture(format) = desc.format else {
                    return Err(BackendError::Device("texture without texel format".into()));
                };
                let bytes_per_row = desc.dims.x * format.bytes_per_texel();
                self.context.queue.write_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    bytes,
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(bytes_per_row),
                        rows_per_image: Some(desc.dims.y),
                    },
                    extent(desc),
                );
            }
        }
        Ok(())
    }

    fn link(
        &mut self,
        id: &ProgramId,
        interface: &ProgramInterface,
    ) -> Result<ProgramHandle, BackendError> {
        let pipeline = create_pipeline(
            &self.context.device,
            self.context.surface_format,
            id,
            interface,
        )?;
        let handle = ProgramHandle(self.issue_handle());
        self.programs.insert(handle, pipeline);
        Ok(handle)
    }

    fn destroy_program(&mut self, handle: ProgramHandle) {
        self.programs.remove(&handle);
    }

    fn dispatch(&mut self, command: &DispatchCommand) -> Result<(), BackendError> {
        let program = self
            .programs
            .get(&command.program)
            .ok_or(BackendError::UnknownHandle(command.program.0))?;
        let PipelineKind::Compute(pipeline) = &program.kind else {
            return Err(BackendError::Pipeline(format!(
                "program '{}' is not a compute pipeline",
                program.id
            )));
        };
        let groups = self.bind_groups(program, &command.bindings)?;
        let device = &self.context.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("compute frame"),
            })
        });
        stage_uniforms(device, encoder, program, &command.uniforms);

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(program.id.as_str()),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        for (index, group) in groups.iter().enumerate() {
            pass.set_bind_group(index as u32, group, &[]);
        }
        let [x, y, z] = command.groups;
        pass.dispatch_workgroups(x, y, z);
        Ok(())
    }

    fn copy(&mut self, from: ResourceHandle, to: ResourceHandle) -> Result<(), BackendError> {
        let source = self
            .resources
            .get(&from)
            .ok_or(BackendError::UnknownHandle(from.0))?;
        let target = self
            .resources
            .get(&to)
            .ok_or(BackendError::UnknownHandle(to.0))?;
        if source.desc() != target.desc() {
            return Err(BackendError::Device(
                "copy between resources of different shape".into(),
            ));
        }
        let device = &self.context.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("compute frame"),
            })
        });
        match (source, target) {
            (
                GpuResource::Buffer { buffer: src, desc },
                GpuResource::Buffer { buffer: dst, .. },
            ) => {
                encoder.copy_buffer_to_buffer(src, 0, dst, 0, desc.byte_len().next_multiple_of(4));
            }
            (
                GpuResource::Texture {
                    texture: src, desc, ..
                },
                GpuResource::Texture { texture: dst, .. },
            ) => {
                encoder.copy_texture_to_texture(
                    src.as_image_copy(),
                    dst.as_image_copy(),
                    extent(desc),
                );
            }
            _ => {
                return Err(BackendError::Device(
                    "copy between a buffer and a texture".into(),
                ))
            }
        }
        Ok(())
    }

    fn barrier(&mut self, scope: BarrierScope) -> Result<(), BackendError> {
        match scope {
            // wgpu orders passes recorded on one encoder; nothing to flush.
            BarrierScope::Pass => Ok(()),
            BarrierScope::Frame => {
                let Some(encoder) = self.encoder.take() else {
                    return Ok(());
                };
                self.context.queue.submit(Some(encoder.finish()));
                self.context
                    .device
                    .poll(wgpu::PollType::Wait)
                    .map(|_| ())
                    .map_err(|err| BackendError::Device(err.to_string()))
            }
        }
    }

    fn abort_frame(&mut self) {
        // Dropping an unfinished encoder discards everything recorded on it.
        if self.encoder.take().is_some() {
            debug!("discarded partially recorded frame");
        }
    }

    fn present(&mut self, command: Option<&PresentCommand>) -> Result<(), BackendError> {
        let frame = match self.context.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                warn!("surface lost or outdated; reconfiguring");
                self.context.reconfigure();
                return Ok(());
            }
            Err(wgpu::SurfaceError::Timeout) => {
                warn!("timed out acquiring surface texture");
                return Ok(());
            }
            Err(err) => return Err(BackendError::Surface(err.to_string())),
        };
        let view = frame
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        let draw = match command {
            Some(command) => {
                let program = self.program(command.program)?;
                let PipelineKind::Display(pipeline) = &program.kind else {
                    return Err(BackendError::Pipeline(format!(
                        "program '{}' is not a display pipeline",
                        program.id
                    )));
                };
                Some((program, pipeline, self.bind_groups(program, &command.bindings)?))
            }
            None => None,
        };

        let device = &self.context.device;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("display"),
        });
        if let (Some(command), Some((program, _, _))) = (command, &draw) {
            stage_uniforms(device, &mut encoder, program, &command.uniforms);
        }
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("display pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            if let Some((_, pipeline, groups)) = &draw {
                render_pass.set_pipeline(pipeline);
                for (index, group) in groups.iter().enumerate() {
                    render_pass.set_bind_group(index as u32, group, &[]);
                }
                render_pass.draw(0..3, 0..1);
            }
        }
        self.context.queue.submit(Some(encoder.finish()));
        frame.present();
        Ok(())
    }

    fn group_limits(&self) -> GroupLimits {
        self.context.group_limits()
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.context.size.width, self.context.size.height)
    }

    fn resize(&mut self, size: (u32, u32)) {
        self.context.resize(PhysicalSize::new(size.0, size.1));
    }
}
