//! Shader program cache with atomic replacement on reload.
//!
//! A [`Program`] is immutable once linked. Reloading builds a complete new
//! program and swaps the `Arc` in the cache; frames that already hold the old
//! `Arc` keep using it, and the old pipeline is destroyed at a later frame
//! boundary once nothing references it.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use scheduler::WorkGroupSize;
use tracing::{debug, info, warn};

use crate::backend::GpuBackend;
use crate::compile::{self, BindingKind, BindingSlot, ProgramKind, UniformBlock};
use crate::diagnostics::{DiagnosticsBoard, ProgramStatus};
use crate::error::{CompileError, CompilePhase};
use crate::types::{ProgramHandle, ProgramId, ProgramSpec};

#[derive(Debug)]
pub struct Program {
    pub id: ProgramId,
    pub handle: ProgramHandle,
    pub kind: ProgramKind,
    /// Binding slots resolved at link time.
    pub bindings: Vec<BindingSlot>,
    pub uniforms: Vec<UniformBlock>,
    pub log: String,
    pub generation: u64,
    source_hash: u64,
}

impl Program {
    pub fn workgroup(&self) -> Option<WorkGroupSize> {
        match self.kind {
            ProgramKind::Compute { workgroup } => Some(workgroup),
            ProgramKind::Display => None,
        }
    }

    pub fn slot(&self, name: &str) -> Option<&BindingSlot> {
        self.bindings.iter().find(|slot| slot.answers_to(name))
    }

    /// Slots that take a scene resource (everything but uniforms and samplers).
    pub fn resource_slots(&self) -> impl Iterator<Item = &BindingSlot> {
        self.bindings.iter().filter(|slot| {
            !matches!(
                slot.kind,
                BindingKind::Uniform { .. } | BindingKind::Sampler
            )
        })
    }
}

pub struct ProgramCache {
    programs: HashMap<ProgramId, Arc<Program>>,
    specs: HashMap<ProgramId, ProgramSpec>,
    stale: HashSet<ProgramId>,
    retired: Vec<Arc<Program>>,
    generation: u64,
    diagnostics: DiagnosticsBoard,
}

impl ProgramCache {
    pub fn new(diagnostics: DiagnosticsBoard) -> Self {
        Self {
            programs: HashMap::new(),
            specs: HashMap::new(),
            stale: HashSet::new(),
            retired: Vec::new(),
            generation: 0,
            diagnostics,
        }
    }

    pub fn diagnostics(&self) -> &DiagnosticsBoard {
        &self.diagnostics
    }

    /// Builds `spec` and makes it the active program for its id.
    ///
    /// Unchanged sources return the active program unless the id was
    /// invalidated. On failure the previous program stays active and the
    /// error is also posted to the diagnostics board.
    pub fn load<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        spec: &ProgramSpec,
    ) -> Result<Arc<Program>, CompileError> {
        self.specs.insert(spec.id.clone(), spec.clone());
        match self.build(backend, spec) {
            Ok(program) => Ok(program),
            Err(err) => {
                warn!(
                    program = %spec.id,
                    phase = %err.phase,
                    line = err.line,
                    "shader build failed: {}",
                    err.message
                );
                self.diagnostics.record(
                    &spec.id,
                    ProgramStatus::Failed {
                        error: err.clone(),
                        active_generation: self.programs.get(&spec.id).map(|p| p.generation),
                    },
                );
                Err(err)
            }
        }
    }

    /// Rebuilds `id` from the sources it was last loaded with.
    pub fn reload<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        id: &ProgramId,
    ) -> Result<Arc<Program>, CompileError> {
        let spec = self.specs.get(id).cloned().ok_or_else(|| {
            CompileError::new(id, None, CompilePhase::Read, "program was never loaded")
        })?;
        self.load(backend, &spec)
    }

    /// Forces the next `load` of `id` to recompile even if sources are unchanged.
    pub fn invalidate(&mut self, id: &ProgramId) {
        self.stale.insert(id.clone());
    }

    pub fn get(&self, id: &ProgramId) -> Option<Arc<Program>> {
        self.programs.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ProgramId> {
        self.specs.keys()
    }

    pub fn spec(&self, id: &ProgramId) -> Option<&ProgramSpec> {
        self.specs.get(id)
    }

    /// Destroys replaced programs no longer referenced outside the cache.
    pub fn collect_retired<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) -> usize {
        let mut destroyed = 0;
        self.retired.retain(|program| {
            if Arc::strong_count(program) == 1 {
                debug!(program = %program.id, generation = program.generation, "destroying retired program");
                backend.destroy_program(program.handle);
                destroyed += 1;
                false
            } else {
                true
            }
        });
        destroyed
    }

    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    pub fn destroy_all<B: GpuBackend + ?Sized>(&mut self, backend: &mut B) {
        for (_, program) in self.programs.drain() {
            backend.destroy_program(program.handle);
        }
        for program in self.retired.drain(..) {
            backend.destroy_program(program.handle);
        }
    }

    fn build<B: GpuBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        spec: &ProgramSpec,
    ) -> Result<Arc<Program>, CompileError> {
        let texts = spec
            .stages
            .iter()
            .map(|stage| compile::read_source(&spec.id, stage))
            .collect::<Result<Vec<_>, _>>()?;

        let source_hash = source_hash(spec, &texts);

        if let Some(current) = self.programs.get(&spec.id) {
            if current.source_hash == source_hash && !self.stale.contains(&spec.id) {
                debug!(program = %spec.id, "sources unchanged; keeping active program");
                let current = Arc::clone(current);
                self.diagnostics.record(
                    &spec.id,
                    ProgramStatus::Ready {
                        generation: current.generation,
                        log: current.log.clone(),
                    },
                );
                return Ok(current);
            }
        }

        let interface = compile::build_interface(spec, &texts)?;
        let handle = backend.link(&spec.id, &interface).map_err(|err| {
            CompileError::new(&spec.id, None, CompilePhase::Link, err.to_string())
        })?;

        self.generation += 1;
        let program = Arc::new(Program {
            id: spec.id.clone(),
            handle,
            kind: interface.kind,
            bindings: interface.bindings,
            uniforms: interface.uniforms,
            log: interface.log,
            generation: self.generation,
            source_hash,
        });
        if let Some(previous) = self.programs.insert(spec.id.clone(), Arc::clone(&program)) {
            self.retired.push(previous);
        }
        self.stale.remove(&spec.id);
        info!(program = %spec.id, generation = program.generation, "program linked");
        self.diagnostics.record(
            &spec.id,
            ProgramStatus::Ready {
                generation: program.generation,
                log: program.log.clone(),
            },
        );
        Ok(program)
    }
}

fn source_hash(spec: &ProgramSpec, texts: &[Arc<str>]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for (stage, text) in spec.stages.iter().zip(texts) {
        stage.stage.hash(&mut hasher);
        stage.entry.hash(&mut hasher);
        stage.origin.display_name().hash(&mut hasher);
        text.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use std::fs;
    use std::path::Path;

    const GOOD: &str = r"
@group(0) @binding(0) var<storage, read_write> Data: array<f32>;

@compute @workgroup_size(32)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    Data[id.x] = Data[id.x] * 0.5;
}
";

    const GOOD_V2: &str = r"
@group(0) @binding(0) var<storage, read_write> Data: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    Data[id.x] = Data[id.x] + 1.0;
}
";

    fn write(path: &Path, text: &str) {
        fs::write(path, text).unwrap();
    }

    #[test]
    fn failed_reload_keeps_previous_program() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.wgsl");
        write(&path, GOOD);
        let mut backend = HeadlessBackend::default();
        let mut cache = ProgramCache::new(DiagnosticsBoard::new());
        let spec = ProgramSpec::compute("Data", &path, None);

        let first = cache.load(&mut backend, &spec).unwrap();
        write(&path, "@compute fn main( {");
        let err = cache.load(&mut backend, &spec).unwrap_err();
        assert!(!err.message.is_empty());
        let active = cache.get(&spec.id).unwrap();
        assert!(Arc::ptr_eq(&first, &active));
        assert!(matches!(
            cache.diagnostics().status(&spec.id),
            Some(ProgramStatus::Failed {
                active_generation: Some(1),
                ..
            })
        ));
    }

    #[test]
    fn unchanged_source_is_not_recompiled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.wgsl");
        write(&path, GOOD);
        let mut backend = HeadlessBackend::default();
        let mut cache = ProgramCache::new(DiagnosticsBoard::new());
        let spec = ProgramSpec::compute("Data", &path, None);

        let first = cache.load(&mut backend, &spec).unwrap();
        let second = cache.load(&mut backend, &spec).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.live_programs(), 1);

        cache.invalidate(&spec.id);
        let third = cache.load(&mut backend, &spec).unwrap();
        assert_eq!(third.generation, first.generation + 1);
    }

    #[test]
    fn replacement_is_atomic_and_old_program_retires() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.wgsl");
        write(&path, GOOD);
        let mut backend = HeadlessBackend::default();
        let mut cache = ProgramCache::new(DiagnosticsBoard::new());
        let spec = ProgramSpec::compute("Data", &path, None);

        let old = cache.load(&mut backend, &spec).unwrap();
        write(&path, GOOD_V2);
        let new = cache.reload(&mut backend, &spec.id).unwrap();
        assert_eq!(old.workgroup(), Some(WorkGroupSize([32, 1, 1])));
        assert_eq!(new.workgroup(), Some(WorkGroupSize([64, 1, 1])));

        // An in-flight holder keeps the old pipeline alive.
        assert_eq!(cache.collect_retired(&mut backend), 0);
        assert_eq!(backend.live_programs(), 2);
        drop(old);
        assert_eq!(cache.collect_retired(&mut backend), 1);
        assert_eq!(backend.live_programs(), 1);
    }

    #[test]
    fn link_failure_is_reported_as_compile_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.wgsl");
        write(&path, GOOD);
        let mut backend = HeadlessBackend::default();
        backend.fail_link_of("Data");
        let mut cache = ProgramCache::new(DiagnosticsBoard::new());
        let err = cache
            .load(&mut backend, &ProgramSpec::compute("Data", &path, None))
            .unwrap_err();
        assert_eq!(err.phase, CompilePhase::Link);
        assert!(cache.get(&ProgramId::new("Data")).is_none());
    }

    #[test]
    fn reload_of_unknown_program_fails() {
        let mut backend = HeadlessBackend::default();
        let mut cache = ProgramCache::new(DiagnosticsBoard::new());
        assert!(cache.reload(&mut backend, &ProgramId::new("nope")).is_err());
    }
}
