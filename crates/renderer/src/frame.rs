//! Per-frame orchestration.
//!
//! Every frame walks `Idle -> SnapshotTaken -> Dispatched -> Barriered ->
//! Presented`. Reload requests are applied before the snapshot, so a program
//! swap only ever takes effect at a frame boundary. When a program or resource
//! needed by the frame is unavailable the compute phase is skipped entirely
//! and the display pass shows whatever the resources held before. A frame
//! whose compute work fails partway is aborted the same way.

use std::collections::HashMap;
use std::sync::Arc;

use scheduler::{ExtentSource, Step};
use tracing::{debug, trace, warn};

use crate::backend::{BarrierScope, GpuBackend, PresentCommand};
use crate::compile::builtin_display_program;
use crate::diagnostics::DiagnosticsBoard;
use crate::dispatch::{bind_resources, upload_uniforms, DispatchReport, DispatchScheduler, PlannedDispatch};
use crate::error::{BackendError, CompileError, DispatchError, ResourceError, SceneError};
use crate::params::{ParamSnapshot, ParamValue, ParamView, ParameterStore};
use crate::program::{Program, ProgramCache};
use crate::reload::{reload_channel, ReloadHandle, ReloadQueue, ReloadRequest};
use crate::resources::ResourceManager;
use crate::runtime::{BoxedTimeSource, SystemTimeSource};
use crate::types::{
    ProgramId, ResourceHandle, ResourceId, ResourceKind, SceneDescription, DISPLAY_PROGRAM,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FramePhase {
    Idle,
    SnapshotTaken,
    Dispatched,
    Barriered,
    Presented,
}

/// Why the compute phase of a frame did not run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Rendered { dispatches: Vec<DispatchReport> },
    Skipped(SkipReason),
    /// The backend rejected work after the compute phase had started.
    Failed(DispatchError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    pub index: u64,
    pub phases: Vec<FramePhase>,
    pub outcome: FrameOutcome,
    /// Programs rebuilt at the start of this frame, with their new generation.
    pub reloaded: Vec<(ProgramId, u64)>,
    pub reload_errors: Vec<CompileError>,
    pub present_error: Option<BackendError>,
}

impl FrameReport {
    pub fn is_rendered(&self) -> bool {
        matches!(self.outcome, FrameOutcome::Rendered { .. })
    }
}

/// Transient state for one frame, dropped after presentation.
struct FrameState {
    index: u64,
    snapshot: ParamSnapshot,
    builtins: [(&'static str, ParamValue); 3],
    /// Programs pinned for the whole frame.
    programs: HashMap<ProgramId, Arc<Program>>,
}

impl FrameState {
    fn view<'a>(&'a self, overrides: &'a [(String, ParamValue)]) -> ParamView<'a> {
        ParamView {
            overrides,
            snapshot: &self.snapshot,
            builtins: &self.builtins,
        }
    }
}

enum PlannedStep {
    Dispatch(PlannedDispatch),
    Copy {
        from: ResourceHandle,
        to: ResourceHandle,
    },
}

/// What the GUI actor needs to drive a pipeline owned by the rendering actor.
#[derive(Debug, Clone)]
pub struct PipelineHandles {
    pub parameters: ParameterStore,
    pub reloads: ReloadHandle,
    pub diagnostics: DiagnosticsBoard,
}

pub struct FramePipeline<B: GpuBackend> {
    backend: B,
    resources: ResourceManager,
    programs: ProgramCache,
    parameters: ParameterStore,
    scheduler: DispatchScheduler,
    scene: SceneDescription,
    reload_handle: ReloadHandle,
    reloads: ReloadQueue,
    time: BoxedTimeSource,
    /// Allocation serial each resource was last seeded at.
    seeded: HashMap<ResourceId, u64>,
    phase: FramePhase,
    frame_index: u64,
}

impl<B: GpuBackend> FramePipeline<B> {
    /// Validates the scene and builds every program.
    ///
    /// Compile failures are not fatal: they land on the diagnostics board and
    /// the affected frames are skipped until a reload succeeds.
    pub fn new(mut backend: B, scene: SceneDescription) -> Result<Self, SceneError> {
        let display_texture = scene
            .resource(scene.display.texture.as_str())
            .ok_or_else(|| SceneError::UnknownDisplayTexture(scene.display.texture.clone()))?;
        if display_texture.kind() != ResourceKind::Texture {
            return Err(SceneError::DisplayNotTexture(scene.display.texture.clone()));
        }
        scene.schedule.validate(
            |name| scene.program(&ProgramId::new(name)).is_some(),
            |name| scene.resource(name).is_some(),
        )?;

        let parameters = ParameterStore::new();
        for (name, value) in &scene.parameters {
            parameters.set(name, *value)?;
        }

        let mut programs = ProgramCache::new(DiagnosticsBoard::new());
        for spec in &scene.programs {
            if programs.load(&mut backend, spec).is_err() {
                debug!(program = %spec.id, "starting without program");
            }
        }
        let mut display = scene
            .display
            .program
            .clone()
            .unwrap_or_else(builtin_display_program);
        display.id = ProgramId::new(DISPLAY_PROGRAM);
        if programs.load(&mut backend, &display).is_err() {
            warn!("display program failed to build; frames will clear the surface");
        }

        let scheduler = DispatchScheduler::new(backend.group_limits());
        let (reload_handle, reloads) = reload_channel();
        Ok(Self {
            backend,
            resources: ResourceManager::new(),
            programs,
            parameters,
            scheduler,
            scene,
            reload_handle,
            reloads,
            time: Box::new(SystemTimeSource::new()),
            seeded: HashMap::new(),
            phase: FramePhase::Idle,
            frame_index: 0,
        })
    }

    pub fn with_time_source(mut self, time: BoxedTimeSource) -> Self {
        self.time = time;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn programs(&self) -> &ProgramCache {
        &self.programs
    }

    /// Shared store the GUI actor writes into.
    pub fn parameters(&self) -> ParameterStore {
        self.parameters.clone()
    }

    pub fn diagnostics(&self) -> DiagnosticsBoard {
        self.programs.diagnostics().clone()
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        self.reload_handle.clone()
    }

    pub fn handles(&self) -> PipelineHandles {
        PipelineHandles {
            parameters: self.parameters(),
            reloads: self.reload_handle(),
            diagnostics: self.diagnostics(),
        }
    }

    pub fn scene(&self) -> &SceneDescription {
        &self.scene
    }

    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn resize(&mut self, size: (u32, u32)) {
        debug!(width = size.0, height = size.1, "surface resized");
        self.backend.resize(size);
    }

    /// Runs one frame to completion, from reloads to presentation.
    pub fn render_frame(&mut self) -> FrameReport {
        let mut phases = vec![FramePhase::Idle];
        self.phase = FramePhase::Idle;
        let (reloaded, reload_errors) = self.apply_reloads();

        let frame = self.begin_frame();
        self.enter(&mut phases, FramePhase::SnapshotTaken);

        let planned = self
            .prepare_resources()
            .and_then(|()| self.plan_steps(&frame).map_err(SkipReason::from));

        let outcome = match planned {
            Err(reason) => {
                warn!(frame = frame.index, reason = %reason, "skipping compute; presenting previous contents");
                FrameOutcome::Skipped(reason)
            }
            Ok(steps) => match self.submit(steps) {
                Err(err) => {
                    // Earlier passes of this frame must not reach the screen.
                    self.backend.abort_frame();
                    warn!(frame = frame.index, error = %err, "compute submission failed; frame discarded");
                    FrameOutcome::Failed(err)
                }
                Ok(dispatches) => {
                    self.enter(&mut phases, FramePhase::Dispatched);
                    let barrier = self.backend.barrier(BarrierScope::Frame);
                    self.enter(&mut phases, FramePhase::Barriered);
                    match barrier {
                        Ok(()) => FrameOutcome::Rendered { dispatches },
                        Err(err) => {
                            warn!(frame = frame.index, error = %err, "frame barrier failed");
                            FrameOutcome::Failed(err.into())
                        }
                    }
                }
            },
        };

        let present_error = self.present(&frame).err();
        if let Some(err) = &present_error {
            warn!(frame = frame.index, error = %err, "present failed");
        }
        self.enter(&mut phases, FramePhase::Presented);

        let index = frame.index;
        drop(frame);
        self.programs.collect_retired(&mut self.backend);
        self.phase = FramePhase::Idle;
        self.frame_index += 1;

        FrameReport {
            index,
            phases,
            outcome,
            reloaded,
            reload_errors,
            present_error,
        }
    }

    /// Releases every resource and program, handing the backend back.
    pub fn into_backend(mut self) -> B {
        self.resources.release_all(&mut self.backend);
        self.programs.destroy_all(&mut self.backend);
        self.backend
    }

    fn enter(&mut self, phases: &mut Vec<FramePhase>, phase: FramePhase) {
        trace!(frame = self.frame_index, ?phase, "frame phase");
        self.phase = phase;
        phases.push(phase);
    }

    fn apply_reloads(&mut self) -> (Vec<(ProgramId, u64)>, Vec<CompileError>) {
        let requests = self.reloads.drain();
        let mut ids: Vec<ProgramId> = if requests.contains(&ReloadRequest::All) {
            self.programs.ids().cloned().collect()
        } else {
            requests
                .into_iter()
                .filter_map(|request| match request {
                    ReloadRequest::Program(id) => Some(id),
                    ReloadRequest::All => None,
                })
                .collect()
        };
        ids.sort();

        let mut reloaded = Vec::new();
        let mut errors = Vec::new();
        for id in ids {
            if self.programs.spec(&id).is_none() {
                warn!(program = %id, "reload requested for unknown program");
                continue;
            }
            self.programs.invalidate(&id);
            match self.programs.reload(&mut self.backend, &id) {
                Ok(program) => reloaded.push((id, program.generation)),
                Err(err) => errors.push(err),
            }
        }
        (reloaded, errors)
    }

    fn begin_frame(&mut self) -> FrameState {
        let sample = self.time.sample();
        let snapshot = self.parameters.snapshot();
        let programs = self
            .programs
            .ids()
            .filter_map(|id| self.programs.get(id).map(|program| (id.clone(), program)))
            .collect();
        FrameState {
            index: self.frame_index,
            snapshot,
            builtins: [
                ("Time", ParamValue::Float(sample.seconds)),
                ("DeltaTime", ParamValue::Float(sample.delta)),
                ("Frame", ParamValue::Uint(sample.frame_index as u32)),
            ],
            programs,
        }
    }

    /// Ensures every declared resource and uploads seed data after (re)allocation.
    fn prepare_resources(&mut self) -> Result<(), SkipReason> {
        let surface = self.backend.surface_size();
        for declared in &self.scene.resources {
            let resource = self.resources.ensure(
                &mut self.backend,
                &declared.id,
                declared.kind(),
                declared.dims(surface),
                declared.format,
            )?;
            if self.seeded.get(&declared.id) == Some(&resource.serial) {
                continue;
            }
            if let Some(bytes) = &declared.initial {
                self.backend.write(resource.handle, bytes).map_err(|err| {
                    ResourceError::AllocationFailure {
                        id: declared.id.clone(),
                        reason: format!("initial upload failed: {err}"),
                    }
                })?;
                debug!(resource = %declared.id, bytes = bytes.len(), "seeded resource");
            }
            self.seeded.insert(declared.id.clone(), resource.serial);
        }
        Ok(())
    }

    fn plan_steps(&self, frame: &FrameState) -> Result<Vec<PlannedStep>, DispatchError> {
        let mut planned = Vec::with_capacity(self.scene.schedule.steps().len());
        for step in self.scene.schedule.steps() {
            match step {
                Step::Dispatch {
                    program,
                    extent,
                    overrides,
                } => {
                    let id = ProgramId::new(program.as_str());
                    let extent = match extent {
                        ExtentSource::Fixed(extent) => *extent,
                        ExtentSource::Resource(name) => self
                            .resources
                            .find(name)
                            .map(|resource| resource.dims)
                            .ok_or_else(|| DispatchError::NotFound(ResourceId::new(name.as_str())))?,
                    };
                    let dispatch = self.scheduler.plan(
                        &id,
                        frame.programs.get(&id),
                        &self.resources,
                        extent,
                        &frame.view(overrides),
                    )?;
                    planned.push(PlannedStep::Dispatch(dispatch));
                }
                Step::Copy { from, to } => {
                    let lookup = |name: &str| {
                        self.resources
                            .find(name)
                            .ok_or_else(|| DispatchError::NotFound(ResourceId::new(name)))
                    };
                    let source = lookup(from.as_str())?;
                    let target = lookup(to.as_str())?;
                    if source.desc() != target.desc() {
                        return Err(DispatchError::CopyMismatch {
                            from: source.id.clone(),
                            to: target.id.clone(),
                        });
                    }
                    planned.push(PlannedStep::Copy {
                        from: source.handle,
                        to: target.handle,
                    });
                }
            }
        }
        Ok(planned)
    }

    fn submit(&mut self, steps: Vec<PlannedStep>) -> Result<Vec<DispatchReport>, DispatchError> {
        let mut reports = Vec::new();
        for step in steps {
            match step {
                PlannedStep::Dispatch(planned) => {
                    reports.push(self.scheduler.submit(&mut self.backend, planned)?);
                }
                PlannedStep::Copy { from, to } => self.backend.copy(from, to)?,
            }
        }
        Ok(reports)
    }

    fn present(&mut self, frame: &FrameState) -> Result<(), BackendError> {
        let display = ProgramId::new(DISPLAY_PROGRAM);
        let texture = self.resources.find(self.scene.display.texture.as_str());
        let command = match (frame.programs.get(&display), texture) {
            (Some(program), Some(texture)) => {
                match bind_resources(program, &self.resources, Some(texture)) {
                    Ok(bindings) => Some(PresentCommand {
                        program: program.handle,
                        bindings,
                        uniforms: upload_uniforms(program, &frame.view(&[])),
                    }),
                    Err(err) => {
                        warn!(error = %err, "display program cannot bind its inputs");
                        None
                    }
                }
            }
            _ => None,
        };
        self.backend.present(command.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Command, HeadlessBackend};
    use crate::runtime::SteppedTimeSource;
    use crate::types::{
        DisplaySpec, ProgramSpec, ResourceFormat, ResourceSize, SceneResource, TextureFormat,
    };
    use scheduler::{Extent3, FrameSchedule};
    use std::fs;
    use std::path::Path;

    const PAINT: &str = r"
@group(0) @binding(0) var Trail: texture_storage_2d<rgba32float, write>;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    textureStore(Trail, vec2<i32>(id.xy), vec4<f32>(1.0));
}
";

    const PAINT_WIDE: &str = r"
@group(0) @binding(0) var Trail: texture_storage_2d<rgba32float, write>;

@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    textureStore(Trail, vec2<i32>(id.xy), vec4<f32>(0.5));
}
";

    const FADE: &str = r"
@group(0) @binding(0) var Trail: texture_storage_2d<rgba32float, write>;

@compute @workgroup_size(8, 8)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    textureStore(Trail, vec2<i32>(id.xy), vec4<f32>(0.25));
}
";

    const BROKEN: &str = "@compute fn main( {";

    fn texture(id: &str, size: ResourceSize) -> SceneResource {
        SceneResource {
            id: ResourceId::new(id),
            size,
            format: ResourceFormat::Texture(TextureFormat::Rgba32Float),
            initial: None,
        }
    }

    fn paint_step() -> Step<ParamValue> {
        Step::Dispatch {
            program: "Paint".into(),
            extent: ExtentSource::Resource("Trail".into()),
            overrides: Vec::new(),
        }
    }

    fn scene(dir: &Path, source: &str, steps: Vec<Step<ParamValue>>) -> SceneDescription {
        let path = dir.join("paint.wgsl");
        fs::write(&path, source).unwrap();
        SceneDescription {
            title: "test".into(),
            resources: vec![
                texture("Trail", ResourceSize::Fixed(Extent3::new(64, 64, 1))),
                texture("Scratch", ResourceSize::Surface),
            ],
            programs: vec![ProgramSpec::compute("Paint", path, None)],
            parameters: Vec::new(),
            display: DisplaySpec {
                texture: ResourceId::new("Trail"),
                program: None,
            },
            schedule: FrameSchedule::new(steps),
        }
    }

    fn pipeline(scene: SceneDescription) -> FramePipeline<HeadlessBackend> {
        FramePipeline::new(HeadlessBackend::default(), scene)
            .unwrap()
            .with_time_source(Box::new(SteppedTimeSource::new(1.0 / 60.0)))
    }

    fn last_presented_token(pipeline: &FramePipeline<HeadlessBackend>) -> u64 {
        let presentation = pipeline.backend().presented().last().unwrap();
        assert_eq!(presentation.textures.len(), 1);
        presentation.textures[0].1
    }

    #[test]
    fn rendered_frame_walks_every_phase() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(scene(dir.path(), PAINT, vec![paint_step()]));
        let report = pipeline.render_frame();
        assert_eq!(
            report.phases,
            vec![
                FramePhase::Idle,
                FramePhase::SnapshotTaken,
                FramePhase::Dispatched,
                FramePhase::Barriered,
                FramePhase::Presented,
            ]
        );
        let FrameOutcome::Rendered { dispatches } = &report.outcome else {
            panic!("frame was not rendered: {:?}", report.outcome);
        };
        assert_eq!(dispatches[0].groups, [8, 8, 1]);
        assert_eq!(pipeline.phase(), FramePhase::Idle);

        let commands = pipeline.backend_mut().take_commands();
        let position = |wanted: fn(&Command) -> bool| commands.iter().position(wanted).unwrap();
        let dispatch = position(|c| matches!(c, Command::Dispatch { .. }));
        let pass = position(|c| matches!(c, Command::Barrier(BarrierScope::Pass)));
        let frame = position(|c| matches!(c, Command::Barrier(BarrierScope::Frame)));
        let present = position(|c| matches!(c, Command::Present(Some(_))));
        assert!(dispatch < pass && pass < frame && frame < present);
    }

    #[test]
    fn unavailable_program_skips_to_present_with_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(scene(dir.path(), BROKEN, vec![paint_step()]));
        assert_eq!(pipeline.diagnostics().failures().len(), 1);

        let report = pipeline.render_frame();
        assert_eq!(
            report.phases,
            vec![FramePhase::Idle, FramePhase::SnapshotTaken, FramePhase::Presented]
        );
        assert_eq!(
            report.outcome,
            FrameOutcome::Skipped(SkipReason::Dispatch(DispatchError::ProgramUnavailable(
                ProgramId::new("Paint")
            )))
        );
        let trail = pipeline.resources().find("Trail").unwrap().handle;
        let before = pipeline.backend().content(trail).unwrap();
        assert_eq!(last_presented_token(&pipeline), before);

        pipeline.render_frame();
        assert_eq!(last_presented_token(&pipeline), before);
        assert!(!pipeline
            .backend()
            .commands()
            .iter()
            .any(|command| matches!(command, Command::Dispatch { .. } | Command::Barrier(_))));
    }

    #[test]
    fn allocation_failure_presents_last_good_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(scene(dir.path(), PAINT, vec![paint_step()]));
        assert!(pipeline.render_frame().is_rendered());
        let good = last_presented_token(&pipeline);

        pipeline.backend_mut().fail_allocation_of("Scratch");
        pipeline.resize((800, 600));
        let report = pipeline.render_frame();
        assert!(matches!(
            report.outcome,
            FrameOutcome::Skipped(SkipReason::Resource(ResourceError::AllocationFailure { .. }))
        ));
        assert_eq!(
            report.phases,
            vec![FramePhase::Idle, FramePhase::SnapshotTaken, FramePhase::Presented]
        );
        assert_eq!(last_presented_token(&pipeline), good);

        pipeline.backend_mut().clear_failures();
        assert!(pipeline.render_frame().is_rendered());
        assert_ne!(last_presented_token(&pipeline), good);
        let scratch = pipeline.resources().find("Scratch").unwrap();
        assert_eq!(scratch.dims, Extent3::new(800, 600, 1));
    }

    #[test]
    fn failed_reallocation_of_display_texture_keeps_it_on_screen() {
        let dir = tempfile::tempdir().unwrap();
        let mut scene = scene(dir.path(), PAINT, vec![paint_step()]);
        scene.display.texture = ResourceId::new("Scratch");
        let mut pipeline = pipeline(scene);
        assert!(pipeline.render_frame().is_rendered());
        let good = last_presented_token(&pipeline);

        pipeline.backend_mut().fail_allocation_of("Scratch");
        pipeline.resize((800, 600));
        let report = pipeline.render_frame();
        assert!(matches!(report.outcome, FrameOutcome::Skipped(_)));
        let presentation = pipeline.backend().presented().last().unwrap();
        assert!(presentation.program.is_some());
        assert_eq!(last_presented_token(&pipeline), good);

        pipeline.backend_mut().clear_failures();
        assert!(pipeline.render_frame().is_rendered());
        let scratch = pipeline.resources().find("Scratch").unwrap();
        assert_eq!(scratch.dims, Extent3::new(800, 600, 1));
    }

    #[test]
    fn failed_dispatch_mid_frame_discards_earlier_passes() {
        let dir = tempfile::tempdir().unwrap();
        let fade = dir.path().join("fade.wgsl");
        fs::write(&fade, FADE).unwrap();
        let mut scene = scene(
            dir.path(),
            PAINT,
            vec![
                paint_step(),
                Step::Dispatch {
                    program: "Fade".into(),
                    extent: ExtentSource::Resource("Trail".into()),
                    overrides: Vec::new(),
                },
            ],
        );
        scene.programs.push(ProgramSpec::compute("Fade", fade, None));
        let mut pipeline = pipeline(scene);
        assert!(pipeline.render_frame().is_rendered());
        let good = last_presented_token(&pipeline);

        pipeline.backend_mut().take_commands();
        pipeline.backend_mut().fail_dispatch_of("Fade");
        let report = pipeline.render_frame();
        assert!(matches!(report.outcome, FrameOutcome::Failed(_)));
        assert_eq!(
            report.phases,
            vec![FramePhase::Idle, FramePhase::SnapshotTaken, FramePhase::Presented]
        );
        assert_eq!(last_presented_token(&pipeline), good);
        let commands = pipeline.backend_mut().take_commands();
        assert!(commands.contains(&Command::AbortFrame));
        assert!(!commands.contains(&Command::Barrier(BarrierScope::Frame)));

        pipeline.backend_mut().clear_failures();
        assert!(pipeline.render_frame().is_rendered());
        assert_ne!(last_presented_token(&pipeline), good);
    }

    #[test]
    fn reload_takes_effect_at_frame_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(scene(
            dir.path(),
            PAINT,
            vec![paint_step(), paint_step()],
        ));
        let generations = |report: &FrameReport| match &report.outcome {
            FrameOutcome::Rendered { dispatches } => dispatches
                .iter()
                .map(|dispatch| (dispatch.generation, dispatch.groups))
                .collect::<Vec<_>>(),
            other => panic!("unexpected outcome {other:?}"),
        };

        let first = pipeline.render_frame();
        let original = pipeline.programs().get(&ProgramId::new("Paint")).unwrap().generation;
        assert_eq!(generations(&first), vec![(original, [8, 8, 1]); 2]);

        fs::write(dir.path().join("paint.wgsl"), PAINT_WIDE).unwrap();
        assert!(pipeline.reload_handle().reload("Paint"));
        // Queued, not applied.
        let active = pipeline.programs().get(&ProgramId::new("Paint")).unwrap();
        assert_eq!(active.generation, original);
        drop(active);

        let second = pipeline.render_frame();
        let (id, generation) = second.reloaded[0].clone();
        assert_eq!(id, ProgramId::new("Paint"));
        assert!(generation > original);
        assert_eq!(generations(&second), vec![(generation, [4, 4, 1]); 2]);
        // The retired program is destroyed once the frame is over.
        assert_eq!(pipeline.programs().retired_len(), 0);
        assert_eq!(pipeline.backend().live_programs(), 2);
    }

    #[test]
    fn failed_reload_keeps_rendering_previous_program() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(scene(dir.path(), PAINT, vec![paint_step()]));
        pipeline.render_frame();
        fs::write(dir.path().join("paint.wgsl"), BROKEN).unwrap();
        pipeline.reload_handle().reload_all();
        let report = pipeline.render_frame();
        assert!(report.is_rendered());
        assert_eq!(report.reload_errors.len(), 1);
        assert_eq!(report.reload_errors[0].program, ProgramId::new("Paint"));
    }

    #[test]
    fn copy_between_different_shapes_skips_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(scene(
            dir.path(),
            PAINT,
            vec![
                paint_step(),
                Step::Copy {
                    from: "Trail".into(),
                    to: "Scratch".into(),
                },
            ],
        ));
        let report = pipeline.render_frame();
        assert_eq!(
            report.outcome,
            FrameOutcome::Skipped(SkipReason::Dispatch(DispatchError::CopyMismatch {
                from: ResourceId::new("Trail"),
                to: ResourceId::new("Scratch"),
            }))
        );
    }

    #[test]
    fn seed_data_is_uploaded_once_per_allocation() {
        let dir = tempfile::tempdir().unwrap();
        let mut scene = scene(dir.path(), PAINT, vec![paint_step()]);
        scene.resources.push(SceneResource {
            id: ResourceId::new("Agents"),
            size: ResourceSize::Fixed(Extent3::new(4, 1, 1)),
            format: ResourceFormat::Buffer { stride: 24 },
            initial: Some(Arc::from(vec![0u8; 96])),
        });
        let mut pipeline = pipeline(scene);
        pipeline.render_frame();
        pipeline.render_frame();
        let writes = pipeline
            .backend()
            .commands()
            .iter()
            .filter(|command| matches!(command, Command::Write { len: 96, .. }))
            .count();
        assert_eq!(writes, 1);
    }

    #[test]
    fn scene_parameters_seed_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut scene = scene(dir.path(), PAINT, vec![paint_step()]);
        scene.parameters = vec![("Decay".into(), ParamValue::Float(0.9))];
        let pipeline = pipeline(scene);
        assert_eq!(pipeline.parameters().get("Decay"), Some(ParamValue::Float(0.9)));
    }

    #[test]
    fn display_must_name_a_declared_texture() {
        let dir = tempfile::tempdir().unwrap();
        let mut scene = scene(dir.path(), PAINT, vec![paint_step()]);
        scene.display.texture = ResourceId::new("Nowhere");
        assert_eq!(
            FramePipeline::new(HeadlessBackend::default(), scene).err(),
            Some(SceneError::UnknownDisplayTexture(ResourceId::new("Nowhere")))
        );
    }

    #[test]
    fn into_backend_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(scene(dir.path(), PAINT, vec![paint_step()]));
        pipeline.render_frame();
        let backend = pipeline.into_backend();
        assert_eq!(backend.live_resources(), 0);
        assert_eq!(backend.live_programs(), 0);
    }
}
