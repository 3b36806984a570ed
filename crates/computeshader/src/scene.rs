//! Turns a parsed scene file into the renderer's [`SceneDescription`].
//!
//! Paths are resolved relative to the scene file, parameter literals are
//! converted to their declared types, and seeded buffers get their initial
//! bytes here so the renderer never sees a recipe. Seeds are spread over the
//! display texture's size as it will be when the window first opens.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use renderer::{
    DisplaySpec, ParamType, ParamValue, ProgramId, ProgramSpec, ResourceFormat, ResourceId,
    ResourceSize, SceneDescription, SceneResource, ShaderStage, SourceOrigin, StageSource,
    TextureFormat, DISPLAY_PROGRAM,
};
use sceneconfig::{
    ParamKind, ParamLiteral, ParameterConfig, SceneConfig, TextureFormatName,
};
use scheduler::{Extent3, FrameSchedule};

use crate::camera::OrbitCamera;
use crate::cli::SceneArgs;
use crate::seed::seed_buffer;

/// A scene ready to hand to the renderer, plus what the binary itself needs.
#[derive(Debug, Clone)]
pub struct LoadedScene {
    pub path: PathBuf,
    pub description: SceneDescription,
    pub window_size: (u32, u32),
    pub watch: bool,
    pub debounce: Duration,
    /// Present when the scene declares a `[camera]`.
    pub camera: Option<OrbitCamera>,
}

impl LoadedScene {
    /// Source files per program, including display overrides.
    pub fn watch_targets(&self) -> Vec<(ProgramId, PathBuf)> {
        let display = self.description.display.program.iter();
        self.description
            .programs
            .iter()
            .chain(display)
            .flat_map(|spec| spec.paths().map(move |path| (spec.id.clone(), path.clone())))
            .collect()
    }
}

pub fn load_scene(path: &Path, args: &SceneArgs) -> Result<LoadedScene> {
    let config = SceneConfig::from_path(path)
        .with_context(|| format!("failed to load scene {}", path.display()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let window_size = args
        .size
        .unwrap_or((config.window.width, config.window.height));

    let display_dims = config
        .textures
        .get(&config.display.texture)
        .and_then(|texture| config.texture_dims(texture))
        .map(|[width, height, _]| (width, height));
    let display_area = display_dims.unwrap_or(window_size);

    let resources = resources(&config, [display_area.0, display_area.1], args.seed);
    let programs = config
        .programs
        .iter()
        .map(|(name, program)| {
            ProgramSpec::compute(name.as_str(), base.join(&program.compute), program.entry.clone())
        })
        .collect();
    let mut parameters = parameters(&config, &args.overrides)?;
    let camera = config
        .camera
        .map(|camera| OrbitCamera::new(camera, display_area, display_dims.is_none()));
    if let Some(camera) = &camera {
        for (name, value) in camera.parameters() {
            match parameters.iter_mut().find(|(existing, _)| existing == name) {
                Some(slot) => slot.1 = value,
                None => parameters.push((name.to_string(), value)),
            }
        }
    }

    let schedule = FrameSchedule::from_scene(&config)
        .try_map_overrides(|name, literal| override_value(&config, name, &literal))
        .context("invalid step parameter")?;

    let display = DisplaySpec {
        texture: ResourceId::new(config.display.texture.as_str()),
        program: match (&config.display.vertex, &config.display.fragment) {
            (Some(vertex), Some(fragment)) => Some(ProgramSpec {
                id: ProgramId::new(DISPLAY_PROGRAM),
                stages: vec![
                    stage(ShaderStage::Vertex, base.join(vertex)),
                    stage(ShaderStage::Fragment, base.join(fragment)),
                ],
            }),
            _ => None,
        },
    };

    Ok(LoadedScene {
        path: path.to_path_buf(),
        description: SceneDescription {
            title: config.title.clone(),
            resources,
            programs,
            parameters,
            display,
            schedule,
        },
        window_size,
        watch: config.reload.watch,
        debounce: config.reload.debounce,
        camera,
    })
}

fn stage(stage: ShaderStage, path: PathBuf) -> StageSource {
    StageSource {
        stage,
        origin: SourceOrigin::Path(path),
        entry: None,
    }
}

fn resources(config: &SceneConfig, seed_area: [u32; 2], seed: u64) -> Vec<SceneResource> {
    let mut resources = Vec::with_capacity(config.textures.len() + config.buffers.len());
    for (name, texture) in &config.textures {
        let size = match config.texture_dims(texture) {
            Some(dims) => ResourceSize::Fixed(Extent3::from_slice(&dims)),
            None => ResourceSize::Surface,
        };
        resources.push(SceneResource {
            id: ResourceId::new(name.as_str()),
            size,
            format: ResourceFormat::Texture(texture_format(config.texture_format(texture))),
            initial: None,
        });
    }
    // One stream per buffer, so adding a buffer leaves the others' contents alone.
    for (index, (name, buffer)) in config.buffers.iter().enumerate() {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(index as u64));
        let initial = seed_buffer(buffer, seed_area, &mut rng).map(Arc::from);
        resources.push(SceneResource {
            id: ResourceId::new(name.as_str()),
            size: ResourceSize::Fixed(Extent3::new(buffer.count, 1, 1)),
            format: ResourceFormat::Buffer {
                stride: buffer.stride,
            },
            initial,
        });
    }
    resources
}

fn parameters(
    config: &SceneConfig,
    overrides: &[(String, String)],
) -> Result<Vec<(String, ParamValue)>> {
    let mut values = Vec::with_capacity(config.parameters.len());
    for (name, parameter) in &config.parameters {
        let kind = param_type(parameter.kind);
        let value = ParamValue::from_components(kind, &parameter.default.components())
            .ok_or_else(|| anyhow!("parameter '{name}' default is not a valid {kind}"))?;
        values.push((name.clone(), value));
    }

    let mut seen = BTreeSet::new();
    for (name, raw) in overrides {
        let parameter = config.parameters.get(name).ok_or_else(|| {
            let known = config.parameters.keys().cloned().collect::<Vec<_>>().join(", ");
            anyhow!("unknown parameter '{name}' (declared: {known})")
        })?;
        if !seen.insert(name.as_str()) {
            bail!("parameter '{name}' is set more than once");
        }
        let value = ParamValue::parse(param_type(parameter.kind), raw)
            .with_context(|| format!("invalid value for parameter '{name}'"))?;
        check_range(name, parameter, &value)?;
        if let Some(slot) = values.iter_mut().find(|(existing, _)| existing == name) {
            slot.1 = value;
        }
    }
    Ok(values)
}

fn check_range(name: &str, parameter: &ParameterConfig, value: &ParamValue) -> Result<()> {
    for component in value.components() {
        if let Some(min) = parameter.min {
            if component < min {
                bail!("parameter '{name}' value {component} is below its minimum {min}");
            }
        }
        if let Some(max) = parameter.max {
            if component > max {
                bail!("parameter '{name}' value {component} is above its maximum {max}");
            }
        }
    }
    Ok(())
}

/// Per-step overrides take the declared type, or one inferred from the literal.
fn override_value(
    config: &SceneConfig,
    name: &str,
    literal: &ParamLiteral,
) -> Result<ParamValue, String> {
    let kind = match config.parameters.get(name) {
        Some(parameter) => param_type(parameter.kind),
        None => infer_type(literal)?,
    };
    ParamValue::from_components(kind, &literal.components())
        .ok_or_else(|| format!("expected a {kind} value"))
}

fn infer_type(literal: &ParamLiteral) -> Result<ParamType, String> {
    match literal {
        ParamLiteral::Integer(value) if *value >= 0 => Ok(ParamType::Uint),
        ParamLiteral::Integer(_) => Ok(ParamType::Int),
        ParamLiteral::Float(_) => Ok(ParamType::Float),
        ParamLiteral::List(values) => match values.len() {
            2 => Ok(ParamType::Vec2),
            3 => Ok(ParamType::Vec3),
            4 => Ok(ParamType::Vec4),
            16 => Ok(ParamType::Mat4),
            other => Err(format!("cannot infer a type for a list of {other} values")),
        },
    }
}

fn param_type(kind: ParamKind) -> ParamType {
    match kind {
        ParamKind::Float => ParamType::Float,
        ParamKind::Int => ParamType::Int,
        ParamKind::Uint => ParamType::Uint,
        ParamKind::Vec2 => ParamType::Vec2,
        ParamKind::Vec3 => ParamType::Vec3,
        ParamKind::Vec4 => ParamType::Vec4,
        ParamKind::Color => ParamType::Color,
        ParamKind::Mat4 => ParamType::Mat4,
    }
}

fn texture_format(name: TextureFormatName) -> TextureFormat {
    match name {
        TextureFormatName::Rgba32Float => TextureFormat::Rgba32Float,
        TextureFormatName::Rgba16Float => TextureFormat::Rgba16Float,
        TextureFormatName::Rgba8Unorm => TextureFormat::Rgba8Unorm,
        TextureFormatName::R32Float => TextureFormat::R32Float,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler::{ExtentSource, Step};
    use std::fs;
    use tempfile::TempDir;

    const GRAVITY: &str = r#"
version = 1
title = "Gravity"

[window]
width = 1280
height = 720

[defaults]
texture_size = [800, 600]

[textures.Canvas]
size = "surface"

[textures.History]
size = [256, 128]
format = "rgba8unorm"

[buffers.Bodies]
stride = 20
count = 128
seed = { kind = "bodies", central_mass = 5000.0 }

[buffers.Scratch]
stride = 16
count = 8

[programs.gravity]
compute = "shaders/gravity.wgsl"
entry = "main"

[parameters.Gravity]
type = "float"
default = 100.0
min = 0.0
max = 1000.0

[parameters.Tint]
type = "color"
default = [1.0, 1.0, 1.0, 1.0]

[parameters.Steps]
type = "uint"
default = 1

[[steps]]
kind = "dispatch"
program = "gravity"
extent = "Bodies"
params = { Stage = 0, Steps = 2 }

[[steps]]
kind = "dispatch"
program = "gravity"
extent = [128]
params = { Stage = 1, Gravity = 2 }

[display]
texture = "Canvas"
vertex = "shaders/display.wgsl"
fragment = "shaders/display.wgsl"

[reload]
watch = false
debounce = "50ms"
"#;

    fn write_scene(body: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gravity.toml");
        fs::write(&path, body).unwrap();
        (dir, path)
    }

    fn args() -> SceneArgs {
        SceneArgs::default()
    }

    fn resource<'a>(scene: &'a LoadedScene, name: &str) -> &'a SceneResource {
        scene.description.resource(name).unwrap()
    }

    #[test]
    fn resolves_sources_relative_to_the_scene() {
        let (dir, path) = write_scene(GRAVITY);
        let scene = load_scene(&path, &args()).unwrap();

        let program = &scene.description.programs[0];
        assert_eq!(program.id, ProgramId::new("gravity"));
        assert_eq!(program.stages[0].entry.as_deref(), Some("main"));
        assert_eq!(
            program.stages[0].origin,
            SourceOrigin::Path(dir.path().join("shaders/gravity.wgsl"))
        );

        let display = scene.description.display.program.as_ref().unwrap();
        assert_eq!(display.id, ProgramId::new(DISPLAY_PROGRAM));
        assert_eq!(display.stages.len(), 2);
        assert_eq!(scene.watch_targets().len(), 3);
        assert!(!scene.watch);
        assert_eq!(scene.debounce, Duration::from_millis(50));
    }

    #[test]
    fn maps_resource_sizes_and_formats() {
        let (_dir, path) = write_scene(GRAVITY);
        let scene = load_scene(&path, &args()).unwrap();

        assert_eq!(resource(&scene, "Canvas").size, ResourceSize::Surface);
        let history = resource(&scene, "History");
        assert_eq!(history.size, ResourceSize::Fixed(Extent3::new(256, 128, 1)));
        assert_eq!(
            history.format,
            ResourceFormat::Texture(TextureFormat::Rgba8Unorm)
        );

        let bodies = resource(&scene, "Bodies");
        assert_eq!(bodies.size, ResourceSize::Fixed(Extent3::new(128, 1, 1)));
        assert_eq!(bodies.format, ResourceFormat::Buffer { stride: 20 });
        assert_eq!(bodies.initial.as_ref().unwrap().len(), 128 * 20);
        assert!(resource(&scene, "Scratch").initial.is_none());
    }

    fn first_body(scene: &LoadedScene) -> (f32, f32, f32) {
        let bytes = resource(scene, "Bodies").initial.clone().unwrap();
        let x: f32 = bytemuck::pod_read_unaligned(&bytes[0..4]);
        let y: f32 = bytemuck::pod_read_unaligned(&bytes[4..8]);
        let mass: f32 = bytemuck::pod_read_unaligned(&bytes[16..20]);
        (x, y, mass)
    }

    #[test]
    fn bodies_are_centred_in_the_displayed_texture() {
        let (_dir, path) = write_scene(GRAVITY);
        // Canvas follows the surface, so the window size decides.
        let scene = load_scene(&path, &args()).unwrap();
        assert_eq!(first_body(&scene), (640.0, 360.0, 5000.0));

        let resized = SceneArgs {
            size: Some((400, 200)),
            ..SceneArgs::default()
        };
        let scene = load_scene(&path, &resized).unwrap();
        assert_eq!(first_body(&scene), (200.0, 100.0, 5000.0));

        let (_dir, path) = write_scene(&GRAVITY.replace(
            "[display]\ntexture = \"Canvas\"",
            "[display]\ntexture = \"History\"",
        ));
        let scene = load_scene(&path, &args()).unwrap();
        assert_eq!(first_body(&scene), (128.0, 64.0, 5000.0));
    }

    #[test]
    fn camera_seeds_its_parameters() {
        let (_dir, path) = write_scene(GRAVITY);
        assert!(load_scene(&path, &args()).unwrap().camera.is_none());

        let (_dir, path) = write_scene(&format!("{GRAVITY}\n[camera]\ndistance = 4.0\n"));
        let scene = load_scene(&path, &args()).unwrap();
        let camera = scene.camera.as_ref().unwrap();
        assert_eq!(camera.distance(), 4.0);
        let parameters = &scene.description.parameters;
        for (name, value) in camera.parameters() {
            assert!(parameters.contains(&(name.to_string(), value)), "{name} missing");
        }
    }

    #[test]
    fn seed_controls_buffer_contents() {
        let (_dir, path) = write_scene(GRAVITY);
        let seeded = |seed| {
            let args = SceneArgs {
                seed,
                ..SceneArgs::default()
            };
            resource(&load_scene(&path, &args).unwrap(), "Bodies")
                .initial
                .clone()
                .unwrap()
        };
        assert_eq!(seeded(1), seeded(1));
        assert_ne!(seeded(1), seeded(2));
    }

    #[test]
    fn size_flag_overrides_window() {
        let (_dir, path) = write_scene(GRAVITY);
        assert_eq!(load_scene(&path, &args()).unwrap().window_size, (1280, 720));
        let args = SceneArgs {
            size: Some((640, 360)),
            ..SceneArgs::default()
        };
        assert_eq!(load_scene(&path, &args).unwrap().window_size, (640, 360));
    }

    #[test]
    fn parameters_start_from_defaults_and_overrides() {
        let (_dir, path) = write_scene(GRAVITY);
        let args = SceneArgs {
            overrides: vec![("Tint".into(), "0.5, 0.25, 0, 1".into())],
            ..SceneArgs::default()
        };
        let scene = load_scene(&path, &args).unwrap();
        let parameters = &scene.description.parameters;

        assert!(parameters.contains(&("Gravity".to_string(), ParamValue::Float(100.0))));
        assert!(parameters.contains(&("Steps".to_string(), ParamValue::Uint(1))));
        assert!(parameters.contains(&(
            "Tint".to_string(),
            ParamValue::Color([0.5, 0.25, 0.0, 1.0])
        )));
    }

    #[test]
    fn rejects_bad_overrides() {
        let (_dir, path) = write_scene(GRAVITY);
        let attempt = |name: &str, value: &str| {
            let args = SceneArgs {
                overrides: vec![(name.to_string(), value.to_string())],
                ..SceneArgs::default()
            };
            load_scene(&path, &args).unwrap_err().to_string()
        };

        assert!(attempt("Missing", "1").contains("unknown parameter"));
        assert!(attempt("Gravity", "fast").contains("invalid value"));
        assert!(attempt("Gravity", "5000").contains("maximum"));
        assert!(attempt("Gravity", "-1").contains("minimum"));
    }

    #[test]
    fn step_overrides_use_declared_or_inferred_types() {
        let (_dir, path) = write_scene(GRAVITY);
        let scene = load_scene(&path, &args()).unwrap();
        let steps = scene.description.schedule.steps();

        let Step::Dispatch {
            extent, overrides, ..
        } = &steps[0]
        else {
            panic!("expected dispatch");
        };
        assert_eq!(extent, &ExtentSource::Resource("Bodies".into()));
        assert!(overrides.contains(&("Stage".to_string(), ParamValue::Uint(0))));
        assert!(overrides.contains(&("Steps".to_string(), ParamValue::Uint(2))));

        let Step::Dispatch {
            extent, overrides, ..
        } = &steps[1]
        else {
            panic!("expected dispatch");
        };
        assert_eq!(extent, &ExtentSource::Fixed(Extent3::new(128, 1, 1)));
        // Declared float, even though the literal is an integer.
        assert!(overrides.contains(&("Gravity".to_string(), ParamValue::Float(2.0))));
    }

    #[test]
    fn missing_scene_file_reports_path() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.toml");
        let message = format!("{:#}", load_scene(&missing, &args()).unwrap_err());
        assert!(message.contains("absent.toml"));
    }
}
