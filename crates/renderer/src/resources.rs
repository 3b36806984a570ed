use std::collections::HashMap;
use std::thread::{self, ThreadId};

use scheduler::Extent3;
use tracing::{debug, warn};

use crate::backend::GpuBackend;
use crate::error::ResourceError;
use crate::types::{ResourceDesc, ResourceFormat, ResourceHandle, ResourceId, ResourceKind};

/// A live GPU allocation owned by the [`ResourceManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub dims: Extent3,
    pub format: ResourceFormat,
    pub handle: ResourceHandle,
    /// Increments on every (re)allocation of any resource.
    pub serial: u64,
}

impl Resource {
    pub fn desc(&self) -> ResourceDesc {
        ResourceDesc {
            kind: self.kind,
            dims: self.dims,
            format: self.format,
        }
    }

    fn matches(&self, kind: ResourceKind, dims: Extent3, format: ResourceFormat) -> bool {
        self.kind == kind && self.dims == dims && self.format == format
    }
}

/// Owns every buffer and texture handle. Only the rendering thread that
/// created the manager may call into it.
#[derive(Debug)]
pub struct ResourceManager {
    entries: HashMap<ResourceId, Resource>,
    owner: ThreadId,
    serial: u64,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            owner: thread::current().id(),
            serial: 0,
        }
    }

    /// Returns the resource for `id`, allocating it on first use or when its
    /// shape changed. The replacement is allocated before the previous handle
    /// is released, so a failed reallocation leaves the old resource in place.
    pub fn ensure<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        id: &ResourceId,
        kind: ResourceKind,
        dims: Extent3,
        format: ResourceFormat,
    ) -> Result<Resource, ResourceError> {
        self.assert_owner();
        if let Some(existing) = self.entries.get(id) {
            if existing.matches(kind, dims, format) {
                return Ok(existing.clone());
            }
        }

        let failure = |reason: String| ResourceError::AllocationFailure {
            id: id.clone(),
            reason,
        };
        if format.kind() != kind {
            return Err(failure(format!("{kind} cannot use format {format:?}")));
        }
        if dims.is_empty() {
            return Err(failure(format!("dimensions {:?} are empty", dims.as_array())));
        }

        let desc = ResourceDesc { kind, dims, format };
        let handle = backend.allocate(id, &desc).map_err(|err| {
            warn!(resource = %id, error = %err, "resource allocation failed");
            failure(err.to_string())
        })?;
        if let Some(previous) = self.entries.remove(id) {
            debug!(
                resource = %id,
                old = ?previous.dims.as_array(),
                new = ?dims.as_array(),
                "reallocating resource"
            );
            backend.release(previous.handle);
        }
        self.serial += 1;
        let resource = Resource {
            id: id.clone(),
            kind,
            dims,
            format,
            handle,
            serial: self.serial,
        };
        self.entries.insert(id.clone(), resource.clone());
        Ok(resource)
    }

    /// Frees the handle for `id`; unknown ids are ignored.
    pub fn release<B: GpuBackend + ?Sized>(&mut self, backend: &mut B, id: &ResourceId) {
        self.assert_owner();
        if let Some(resource) = self.entries.remove(id) {
            backend.release(resource.handle);
        }
    }

    pub fn get(&self, id: &ResourceId) -> Result<&Resource, ResourceError> {
        self.entries
            .get(id)
            .ok_or_else(|| ResourceError::NotFound(id.clone()))
    }

    pub fn find(&self, name: &str) -> Option<&Resource> {
        self.entries.get(&ResourceId::new(name))
    }

    pub fn release_all<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        self.assert_owner();
        for (_, resource) in self.entries.drain() {
            backend.release(resource.handle);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn assert_owner(&self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "resource manager used off the rendering thread"
        );
    }
}
