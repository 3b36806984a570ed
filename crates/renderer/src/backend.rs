//! The seam between the frame pipeline and the GPU.
//!
//! [`GpuBackend`] is implemented by the `wgpu` device wrapper used for the
//! window and by [`HeadlessBackend`], which records commands and tracks
//! abstract resource contents so the pipeline can run without a GPU.

use std::collections::{HashMap, HashSet};

use scheduler::GroupLimits;

use crate::compile::{BindingKind, ProgramInterface};
use crate::error::BackendError;
use crate::types::{ProgramHandle, ProgramId, ResourceDesc, ResourceHandle, ResourceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierScope {
    /// Between two passes of the same frame.
    Pass,
    /// End of the compute phase; all writes are complete and visible.
    Frame,
}

/// A resource attached to a program slot for one dispatch or present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundResource {
    pub group: u32,
    pub binding: u32,
    pub kind: BindingKind,
    pub resource: ResourceHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformUpload {
    pub group: u32,
    pub binding: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchCommand {
    pub program: ProgramHandle,
    pub groups: [u32; 3],
    pub bindings: Vec<BoundResource>,
    pub uniforms: Vec<UniformUpload>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentCommand {
    pub program: ProgramHandle,
    pub bindings: Vec<BoundResource>,
    pub uniforms: Vec<UniformUpload>,
}

pub trait GpuBackend {
    fn allocate(&mut self, id: &ResourceId, desc: &ResourceDesc)
        -> Result<ResourceHandle, BackendError>;
    fn release(&mut self, handle: ResourceHandle);
    fn write(&mut self, handle: ResourceHandle, bytes: &[u8]) -> Result<(), BackendError>;
    /// Creates the pipeline objects for a validated program.
    fn link(
        &mut self,
        id: &ProgramId,
        interface: &ProgramInterface,
    ) -> Result<ProgramHandle, BackendError>;
    fn destroy_program(&mut self, handle: ProgramHandle);
    fn dispatch(&mut self, command: &DispatchCommand) -> Result<(), BackendError>;
    fn copy(&mut self, from: ResourceHandle, to: ResourceHandle) -> Result<(), BackendError>;
    fn barrier(&mut self, scope: BarrierScope) -> Result<(), BackendError>;
    /// Discards the dispatches and copies recorded since the last frame
    /// barrier. Resources keep the contents they had before the frame.
    fn abort_frame(&mut self);
    /// Draws the display pass; `None` clears the surface.
    fn present(&mut self, command: Option<&PresentCommand>) -> Result<(), BackendError>;
    fn group_limits(&self) -> GroupLimits;
    fn surface_size(&self) -> (u32, u32);
    /// Follows a window resize; surface-sized resources are re-ensured next frame.
    fn resize(&mut self, size: (u32, u32));
}

/// Everything the headless backend was asked to do, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Allocate {
        id: ResourceId,
        handle: ResourceHandle,
    },
    Release(ResourceHandle),
    Write {
        handle: ResourceHandle,
        len: usize,
    },
    Link {
        id: ProgramId,
        handle: ProgramHandle,
    },
    DestroyProgram(ProgramHandle),
    Dispatch {
        program: ProgramHandle,
        groups: [u32; 3],
    },
    Copy {
        from: ResourceHandle,
        to: ResourceHandle,
    },
    Barrier(BarrierScope),
    AbortFrame,
    Present(Option<ProgramHandle>),
}

/// What a headless present showed: the content token of every texture read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presentation {
    pub program: Option<ProgramHandle>,
    pub textures: Vec<(ResourceHandle, u64)>,
}

#[derive(Debug, Clone)]
struct HeadlessResource {
    desc: ResourceDesc,
    content: u64,
}

/// Device stand-in that records commands instead of executing them.
///
/// Each write, dispatch and copy assigns a fresh content token to the
/// resources it modifies, which lets tests tell whether a presented texture
/// holds new or stale data.
#[derive(Debug)]
pub struct HeadlessBackend {
    next_handle: u64,
    next_content: u64,
    resources: HashMap<ResourceHandle, HeadlessResource>,
    programs: HashMap<ProgramHandle, ProgramId>,
    commands: Vec<Command>,
    presented: Vec<Presentation>,
    fail_allocations: HashSet<ResourceId>,
    fail_links: HashSet<ProgramId>,
    fail_dispatches: HashSet<ProgramId>,
    /// Content tokens as they were before the first command of the open frame.
    frame_start: Option<HashMap<ResourceHandle, u64>>,
    surface: (u32, u32),
    limits: GroupLimits,
}

impl HeadlessBackend {
    pub fn new(surface: (u32, u32)) -> Self {
        Self {
            next_handle: 1,
            next_content: 1,
            resources: HashMap::new(),
            programs: HashMap::new(),
            commands: Vec::new(),
            presented: Vec::new(),
            fail_allocations: HashSet::new(),
            fail_links: HashSet::new(),
            fail_dispatches: HashSet::new(),
            frame_start: None,
            surface,
            limits: GroupLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: GroupLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn set_surface_size(&mut self, size: (u32, u32)) {
        self.surface = size;
    }

    /// Makes every later allocation of `id` fail.
    pub fn fail_allocation_of(&mut self, id: impl Into<String>) {
        self.fail_allocations.insert(ResourceId::new(id));
    }

    /// Makes every later link of `id` fail.
    pub fn fail_link_of(&mut self, id: impl Into<String>) {
        self.fail_links.insert(ProgramId::new(id));
    }

    /// Makes every later dispatch of a program linked as `id` fail.
    pub fn fail_dispatch_of(&mut self, id: impl Into<String>) {
        self.fail_dispatches.insert(ProgramId::new(id));
    }

    pub fn clear_failures(&mut self) {
        self.fail_allocations.clear();
        self.fail_links.clear();
        self.fail_dispatches.clear();
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.commands)
    }

    pub fn presented(&self) -> &[Presentation] {
        &self.presented
    }

    pub fn content(&self, handle: ResourceHandle) -> Option<u64> {
        self.resources.get(&handle).map(|resource| resource.content)
    }

    pub fn desc(&self, handle: ResourceHandle) -> Option<&ResourceDesc> {
        self.resources.get(&handle).map(|resource| &resource.desc)
    }

    pub fn live_resources(&self) -> usize {
        self.resources.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    pub fn program_id(&self, handle: ProgramHandle) -> Option<&ProgramId> {
        self.programs.get(&handle)
    }

    fn issue_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn fresh_content(&mut self) -> u64 {
        let content = self.next_content;
        self.next_content += 1;
        content
    }

    fn resource_mut(&mut self, handle: ResourceHandle) -> Result<&mut HeadlessResource, BackendError> {
        self.resources
            .get_mut(&handle)
            .ok_or(BackendError::UnknownHandle(handle.0))
    }

    fn check_program(&self, handle: ProgramHandle) -> Result<(), BackendError> {
        if self.programs.contains_key(&handle) {
            Ok(())
        } else {
            Err(BackendError::UnknownHandle(handle.0))
        }
    }

    fn open_frame(&mut self) {
        if self.frame_start.is_none() {
            let tokens = self
                .resources
                .iter()
                .map(|(handle, resource)| (*handle, resource.content))
                .collect();
            self.frame_start = Some(tokens);
        }
    }

    fn check_bindings(&self, bindings: &[BoundResource]) -> Result<(), BackendError> {
        for bound in bindings {
            if !self.resources.contains_key(&bound.resource) {
                return Err(BackendError::UnknownHandle(bound.resource.0));
            }
        }
        Ok(())
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new((640, 360))
    }
}

impl GpuBackend for HeadlessBackend {
    fn allocate(
        &mut self,
        id: &ResourceId,
        desc: &ResourceDesc,
    ) -> Result<ResourceHandle, BackendError> {
        if self.fail_allocations.contains(id) {
            return Err(BackendError::Allocation(format!(
                "injected failure for '{id}' ({} bytes)",
                desc.byte_len()
            )));
        }
        let handle = ResourceHandle(self.issue_handle());
        let content = self.fresh_content();
        self.resources.insert(
            handle,
            HeadlessResource {
                desc: *desc,
                content,
            },
        );
        self.commands.push(Command::Allocate {
            id: id.clone(),
            handle,
        });
        Ok(handle)
    }

    fn release(&mut self, handle: ResourceHandle) {
        if self.resources.remove(&handle).is_some() {
            self.commands.push(Command::Release(handle));
        }
    }

    fn write(&mut self, handle: ResourceHandle, bytes: &[u8]) -> Result<(), BackendError> {
        let content = self.fresh_content();
        let resource = self.resource_mut(handle)?;
        if bytes.len() as u64 > resource.desc.byte_len() {
            return Err(BackendError::Allocation(format!(
                "write of {} bytes exceeds resource size {}",
                bytes.len(),
                resource.desc.byte_len()
            )));
        }
        resource.content = content;
        self.commands.push(Command::Write {
            handle,
            len: bytes.len(),
        });
        Ok(())
    }

    fn link(
        &mut self,
        id: &ProgramId,
        _interface: &ProgramInterface,
    ) -> Result<ProgramHandle, BackendError> {
        if self.fail_links.contains(id) {
            return Err(BackendError::Pipeline(format!("injected link failure for '{id}'")));
        }
        let handle = ProgramHandle(self.issue_handle());
        self.programs.insert(handle, id.clone());
        self.commands.push(Command::Link {
            id: id.clone(),
            handle,
        });
        Ok(handle)
    }

    fn destroy_program(&mut self, handle: ProgramHandle) {
        if self.programs.remove(&handle).is_some() {
            self.commands.push(Command::DestroyProgram(handle));
        }
    }

    fn dispatch(&mut self, command: &DispatchCommand) -> Result<(), BackendError> {
        self.check_program(command.program)?;
        self.check_bindings(&command.bindings)?;
        if let Some(id) = self.programs.get(&command.program) {
            if self.fail_dispatches.contains(id) {
                return Err(BackendError::Device(format!(
                    "injected dispatch failure for '{id}'"
                )));
            }
        }
        self.open_frame();
        for bound in &command.bindings {
            if bound.kind.writes() {
                let content = self.fresh_content();
                self.resource_mut(bound.resource)?.content = content;
            }
        }
        self.commands.push(Command::Dispatch {
            program: command.program,
            groups: command.groups,
        });
        Ok(())
    }

    fn copy(&mut self, from: ResourceHandle, to: ResourceHandle) -> Result<(), BackendError> {
        let source = self
            .resources
            .get(&from)
            .ok_or(BackendError::UnknownHandle(from.0))?
            .clone();
        if !self.resources.contains_key(&to) {
            return Err(BackendError::UnknownHandle(to.0));
        }
        self.open_frame();
        let target = self.resource_mut(to)?;
        if target.desc != source.desc {
            return Err(BackendError::Device(
                "copy between resources of different shape".into(),
            ));
        }
        target.content = source.content;
        self.commands.push(Command::Copy { from, to });
        Ok(())
    }

    fn barrier(&mut self, scope: BarrierScope) -> Result<(), BackendError> {
        if scope == BarrierScope::Frame {
            self.frame_start = None;
        }
        self.commands.push(Command::Barrier(scope));
        Ok(())
    }

    fn abort_frame(&mut self) {
        if let Some(tokens) = self.frame_start.take() {
            for (handle, content) in tokens {
                if let Some(resource) = self.resources.get_mut(&handle) {
                    resource.content = content;
                }
            }
        }
        self.commands.push(Command::AbortFrame);
    }

    fn present(&mut self, command: Option<&PresentCommand>) -> Result<(), BackendError> {
        let presentation = match command {
            Some(command) => {
                self.check_program(command.program)?;
                self.check_bindings(&command.bindings)?;
                let textures = command
                    .bindings
                    .iter()
                    .filter(|bound| matches!(bound.kind, BindingKind::SampledTexture { .. }))
                    .filter_map(|bound| {
                        self.content(bound.resource)
                            .map(|content| (bound.resource, content))
                    })
                    .collect();
                Presentation {
                    program: Some(command.program),
                    textures,
                }
            }
            None => Presentation {
                program: None,
                textures: Vec::new(),
            },
        };
        self.commands
            .push(Command::Present(presentation.program));
        self.presented.push(presentation);
        Ok(())
    }

    fn group_limits(&self) -> GroupLimits {
        self.limits
    }

    fn surface_size(&self) -> (u32, u32) {
        self.surface
    }

    fn resize(&mut self, size: (u32, u32)) {
        self.set_surface_size(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{ProgramKind, StorageAccessMode, TextureDimension};
    use crate::types::{ResourceFormat, ResourceKind, TextureFormat};
    use scheduler::Extent3;

    fn texture(width: u32, height: u32) -> ResourceDesc {
        ResourceDesc {
            kind: ResourceKind::Texture,
            dims: Extent3::new(width, height, 1),
            format: ResourceFormat::Texture(TextureFormat::Rgba32Float),
        }
    }

    fn empty_interface() -> ProgramInterface {
        ProgramInterface {
            kind: ProgramKind::Display,
            stages: Vec::new(),
            bindings: Vec::new(),
            uniforms: Vec::new(),
            log: String::new(),
        }
    }

    #[test]
    fn copy_transfers_content_token() {
        let mut backend = HeadlessBackend::default();
        let a = backend.allocate(&"A".into(), &texture(4, 4)).unwrap();
        let b = backend.allocate(&"B".into(), &texture(4, 4)).unwrap();
        backend.write(a, &[0u8; 16]).unwrap();
        assert_ne!(backend.content(a), backend.content(b));
        backend.copy(a, b).unwrap();
        assert_eq!(backend.content(a), backend.content(b));
    }

    #[test]
    fn copy_rejects_shape_mismatch() {
        let mut backend = HeadlessBackend::default();
        let a = backend.allocate(&"A".into(), &texture(4, 4)).unwrap();
        let b = backend.allocate(&"B".into(), &texture(8, 4)).unwrap();
        assert!(backend.copy(a, b).is_err());
    }

    #[test]
    fn released_handles_are_unknown() {
        let mut backend = HeadlessBackend::default();
        let a = backend.allocate(&"A".into(), &texture(2, 2)).unwrap();
        backend.release(a);
        assert_eq!(backend.write(a, &[0u8; 4]), Err(BackendError::UnknownHandle(a.0)));
        assert_eq!(backend.live_resources(), 0);
    }

    #[test]
    fn abort_frame_restores_contents_from_before_the_frame() {
        let mut backend = HeadlessBackend::default();
        let a = backend.allocate(&"A".into(), &texture(4, 4)).unwrap();
        let b = backend.allocate(&"B".into(), &texture(4, 4)).unwrap();
        let paint = backend.link(&"Paint".into(), &empty_interface()).unwrap();
        let storage = |resource| BoundResource {
            group: 0,
            binding: 0,
            kind: BindingKind::StorageTexture {
                format: TextureFormat::Rgba32Float,
                access: StorageAccessMode::WriteOnly,
                dimension: TextureDimension::D2,
            },
            resource,
        };
        let before = (backend.content(a), backend.content(b));

        backend
            .dispatch(&DispatchCommand {
                program: paint,
                groups: [1, 1, 1],
                bindings: vec![storage(a)],
                uniforms: Vec::new(),
            })
            .unwrap();
        backend.copy(a, b).unwrap();
        assert_ne!(backend.content(a), before.0);
        backend.abort_frame();
        assert_eq!((backend.content(a), backend.content(b)), before);
        assert_eq!(backend.commands().last(), Some(&Command::AbortFrame));
    }

    #[test]
    fn injected_dispatch_failure_leaves_contents() {
        let mut backend = HeadlessBackend::default();
        let a = backend.allocate(&"A".into(), &texture(4, 4)).unwrap();
        let fade = backend.link(&"Fade".into(), &empty_interface()).unwrap();
        backend.fail_dispatch_of("Fade");
        let before = backend.content(a);
        let result = backend.dispatch(&DispatchCommand {
            program: fade,
            groups: [1, 1, 1],
            bindings: Vec::new(),
            uniforms: Vec::new(),
        });
        assert!(matches!(result, Err(BackendError::Device(_))));
        assert_eq!(backend.content(a), before);
        backend.clear_failures();
        assert!(backend
            .dispatch(&DispatchCommand {
                program: fade,
                groups: [1, 1, 1],
                bindings: Vec::new(),
                uniforms: Vec::new(),
            })
            .is_ok());
    }

    #[test]
    fn injected_allocation_failure() {
        let mut backend = HeadlessBackend::default();
        backend.fail_allocation_of("Huge");
        assert!(matches!(
            backend.allocate(&"Huge".into(), &texture(2, 2)),
            Err(BackendError::Allocation(_))
        ));
    }
}
