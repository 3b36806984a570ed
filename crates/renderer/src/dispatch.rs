use std::sync::Arc;

use scheduler::{group_counts, Extent3, GroupLimits};
use tracing::trace;

use crate::backend::{BarrierScope, BoundResource, DispatchCommand, GpuBackend, UniformUpload};
use crate::compile::BindingKind;
use crate::error::DispatchError;
use crate::params::ParamView;
use crate::program::Program;
use crate::resources::{Resource, ResourceManager};
use crate::types::{ProgramId, ResourceFormat, ResourceId, ResourceKind};
use crate::uniforms::pack_block;

/// Outcome of one compute dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub program: ProgramId,
    pub generation: u64,
    pub extent: Extent3,
    pub groups: [u32; 3],
}

/// A dispatch whose bindings, uniforms and group counts are fully resolved.
#[derive(Debug, Clone)]
pub struct PlannedDispatch {
    pub command: DispatchCommand,
    pub report: DispatchReport,
}

/// Turns a program plus resources into GPU work.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchScheduler {
    limits: GroupLimits,
}

impl DispatchScheduler {
    pub fn new(limits: GroupLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> GroupLimits {
        self.limits
    }

    /// Resolves a dispatch without touching the GPU.
    ///
    /// Group counts round up so the grid covers `extent`. Binding slots come
    /// from the program as cached at link time.
    pub fn plan(
        &self,
        id: &ProgramId,
        program: Option<&Arc<Program>>,
        resources: &ResourceManager,
        extent: Extent3,
        params: &ParamView<'_>,
    ) -> Result<PlannedDispatch, DispatchError> {
        let program = program.ok_or_else(|| DispatchError::ProgramUnavailable(id.clone()))?;
        let workgroup = program
            .workgroup()
            .ok_or_else(|| DispatchError::NotCompute(id.clone()))?;
        let groups = group_counts(extent, workgroup, self.limits).map_err(|source| {
            DispatchError::Groups {
                program: id.clone(),
                source,
            }
        })?;

        let bindings = bind_resources(program, resources, None)?;
        let uniforms = upload_uniforms(program, params);

        Ok(PlannedDispatch {
            command: DispatchCommand {
                program: program.handle,
                groups,
                bindings,
                uniforms,
            },
            report: DispatchReport {
                program: id.clone(),
                generation: program.generation,
                extent,
                groups,
            },
        })
    }

    /// Issues a planned dispatch followed by a pass barrier.
    pub fn submit<B: GpuBackend + ?Sized>(
        &self,
        backend: &mut B,
        planned: PlannedDispatch,
    ) -> Result<DispatchReport, DispatchError> {
        trace!(
            program = %planned.report.program,
            groups = ?planned.report.groups,
            "dispatch"
        );
        backend.dispatch(&planned.command)?;
        backend.barrier(BarrierScope::Pass)?;
        Ok(planned.report)
    }

    /// Plans and submits in one go.
    pub fn dispatch<B: GpuBackend + ?Sized>(
        &self,
        backend: &mut B,
        id: &ProgramId,
        program: Option<&Arc<Program>>,
        resources: &ResourceManager,
        extent: Extent3,
        params: &ParamView<'_>,
    ) -> Result<DispatchReport, DispatchError> {
        let planned = self.plan(id, program, resources, extent, params)?;
        self.submit(backend, planned)
    }
}

/// Matches each resource slot of `program` to a resource by name.
///
/// Sampled-texture slots that name no resource fall back to `fallback`,
/// which is how the display program finds the texture to show.
pub(crate) fn bind_resources(
    program: &Program,
    resources: &ResourceManager,
    fallback: Option<&Resource>,
) -> Result<Vec<BoundResource>, DispatchError> {
    let mut bound = Vec::new();
    for slot in program.resource_slots() {
        let found = slot.names().find_map(|name| resources.find(name));
        let resource = match (found, slot.kind, fallback) {
            (Some(resource), _, _) => resource,
            (None, BindingKind::SampledTexture { .. }, Some(fallback)) => fallback,
            (None, _, _) => return Err(DispatchError::NotFound(ResourceId::new(&slot.name))),
        };

        let expected = match slot.kind {
            BindingKind::Storage { .. } => ResourceKind::Buffer,
            _ => ResourceKind::Texture,
        };
        if resource.kind != expected {
            return Err(DispatchError::BindingMismatch {
                program: program.id.clone(),
                slot: slot.name.clone(),
                expected,
                found: resource.kind,
            });
        }
        if let BindingKind::StorageTexture { format, .. } = slot.kind {
            if resource.format != ResourceFormat::Texture(format) {
                return Err(DispatchError::FormatMismatch {
                    program: program.id.clone(),
                    slot: slot.name.clone(),
                    expected: format,
                    found: resource.format,
                });
            }
        }

        bound.push(BoundResource {
            group: slot.group,
            binding: slot.binding,
            kind: slot.kind,
            resource: resource.handle,
        });
    }
    Ok(bound)
}

pub(crate) fn upload_uniforms(program: &Program, params: &ParamView<'_>) -> Vec<UniformUpload> {
    program
        .uniforms
        .iter()
        .map(|block| UniformUpload {
            group: block.group,
            binding: block.binding,
            bytes: pack_block(block, params),
        })
        .collect()
}
