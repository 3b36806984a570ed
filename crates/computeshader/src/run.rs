use anyhow::{anyhow, bail, Context, Result};
use renderer::{
    FrameOutcome, FramePipeline, FrameReport, HeadlessBackend, ProgramStatus, Renderer,
    RendererConfig, SteppedTimeSource,
};
use serde::Serialize;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{CheckArgs, Cli, Command, RunArgs};
use crate::paths::AppPaths;
use crate::scene::{load_scene, LoadedScene};
use crate::watch;

const DEFAULT_FILTER: &str = "info,wgpu_core=error,wgpu_hal=error,naga=error,winit=error";

pub fn run(cli: Cli) -> Result<()> {
    initialise_tracing();
    let paths = AppPaths::discover()?;
    match cli.command {
        Some(Command::Check(args)) => check(&paths, args),
        None => run_window(&paths, cli.run),
    }
}

fn initialise_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    // Stdout is reserved for `check` reports.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_window(paths: &AppPaths, args: RunArgs) -> Result<()> {
    let name = args.scene.as_deref().ok_or_else(|| {
        anyhow!(
            "no scene given; pass a scene file or a name under {}",
            paths.config_dir().join("scenes").display()
        )
    })?;
    let scene_path = paths.resolve_scene(name)?;
    let scene = load_scene(&scene_path, &args.scene_args)?;
    info!(scene = %scene.path.display(), title = %scene.description.title, "loaded scene");

    let watch_targets = scene.watch_targets();
    let watch_enabled = scene.watch && !args.no_watch;
    let debounce = scene.debounce;
    let LoadedScene {
        description,
        window_size,
        camera,
        ..
    } = scene;

    let runtime = Renderer::new(RendererConfig {
        surface_size: window_size,
        title: description.title.clone(),
        vsync: args.vsync,
        scene: description,
    })
    .spawn()
    .context("failed to start renderer")?;

    let _watcher = if watch_enabled {
        match watch::spawn(watch_targets, debounce, runtime.handles().reloads.clone()) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "hot reload disabled");
                None
            }
        }
    } else {
        info!("source watching disabled; press R to reload");
        None
    };

    for failure in runtime.handles().diagnostics.failures() {
        warn!(%failure, "program unavailable until its source is fixed");
    }

    if let Some(mut camera) = camera {
        info!("drag to orbit the camera, scroll to zoom");
        let parameters = &runtime.handles().parameters;
        // Ends when the window closes and drops its sender.
        for event in runtime.input().iter() {
            if camera.apply(&event) {
                camera
                    .publish(parameters)
                    .context("camera parameters were redeclared")?;
                debug!(
                    latitude = camera.latitude(),
                    longitude = camera.longitude(),
                    distance = camera.distance(),
                    "camera moved"
                );
            }
        }
    }

    runtime.wait()
}

#[derive(Debug, Serialize)]
struct CheckReport {
    scene: String,
    programs: Vec<ProgramSummary>,
    frames: Vec<FrameSummary>,
}

#[derive(Debug, Serialize)]
struct ProgramSummary {
    id: String,
    ready: bool,
    generation: Option<u64>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct FrameSummary {
    index: u64,
    outcome: String,
    dispatches: Vec<DispatchSummary>,
}

#[derive(Debug, Serialize)]
struct DispatchSummary {
    program: String,
    extent: [u32; 3],
    groups: [u32; 3],
}

impl CheckReport {
    fn passed(&self) -> bool {
        self.programs.iter().all(|program| program.ready)
            && !self.frames.is_empty()
            && self.frames.iter().all(|frame| frame.outcome == "rendered")
    }

    fn print_text(&self) {
        println!("scene {}", self.scene);
        for program in &self.programs {
            match (&program.error, program.generation) {
                (Some(error), _) => println!("  program {}: FAILED\n    {error}", program.id),
                (None, Some(generation)) => {
                    println!("  program {}: ready (generation {generation})", program.id)
                }
                (None, None) => println!("  program {}: ready", program.id),
            }
        }
        for frame in &self.frames {
            println!("  frame {}: {}", frame.index, frame.outcome);
            for dispatch in &frame.dispatches {
                let [gx, gy, gz] = dispatch.groups;
                let [ex, ey, ez] = dispatch.extent;
                println!(
                    "    {} extent {ex}x{ey}x{ez} -> groups {gx}x{gy}x{gz}",
                    dispatch.program
                );
            }
        }
    }
}

fn summarise_frame(report: &FrameReport) -> FrameSummary {
    let (outcome, dispatches) = match &report.outcome {
        FrameOutcome::Rendered { dispatches } => ("rendered".to_string(), dispatches.as_slice()),
        FrameOutcome::Skipped(reason) => (format!("skipped: {reason}"), &[][..]),
        FrameOutcome::Failed(err) => (format!("failed: {err}"), &[][..]),
    };
    FrameSummary {
        index: report.index,
        outcome,
        dispatches: dispatches
            .iter()
            .map(|dispatch| DispatchSummary {
                program: dispatch.program.to_string(),
                extent: dispatch.extent.as_array(),
                groups: dispatch.groups,
            })
            .collect(),
    }
}

/// Compiles every program and runs frames without a window or GPU.
fn check(paths: &AppPaths, args: CheckArgs) -> Result<()> {
    let scene_path = paths.resolve_scene(&args.scene)?;
    let scene = load_scene(&scene_path, &args.scene_args)?;
    let backend = HeadlessBackend::new(scene.window_size);
    let mut pipeline = FramePipeline::new(backend, scene.description)
        .map_err(|err| anyhow!("scene cannot be rendered: {err}"))?
        .with_time_source(Box::new(SteppedTimeSource::new(1.0 / 60.0)));

    let frames = (0..args.frames)
        .map(|_| summarise_frame(&pipeline.render_frame()))
        .collect();
    let programs = pipeline
        .diagnostics()
        .snapshot()
        .into_iter()
        .map(|(id, status)| match status {
            ProgramStatus::Ready { generation, .. } => ProgramSummary {
                id: id.to_string(),
                ready: true,
                generation: Some(generation),
                error: None,
            },
            ProgramStatus::Failed { error, .. } => ProgramSummary {
                id: id.to_string(),
                ready: false,
                generation: None,
                error: Some(error.to_string()),
            },
        })
        .collect();

    let report = CheckReport {
        scene: scene_path.display().to_string(),
        programs,
        frames,
    };
    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to serialise report")?
        );
    } else {
        report.print_text();
    }

    if !report.passed() {
        bail!("scene check failed for {}", scene_path.display());
    }
    Ok(())
}
