//! Scene description for the compute-shader sandbox.
//!
//! A scene is a TOML document naming the GPU resources a simulation needs,
//! the compute programs that update them, the tunable parameters exposed to
//! the GUI, the ordered per-frame steps, and the texture presented on screen.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read scene file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse scene: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid scene: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SceneConfig {
    pub version: u32,
    #[serde(default = "default_title")]
    pub title: String,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub textures: BTreeMap<String, TextureConfig>,
    #[serde(default)]
    pub buffers: BTreeMap<String, BufferConfig>,
    #[serde(default)]
    pub programs: BTreeMap<String, ProgramConfig>,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterConfig>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    pub display: DisplayConfig,
    #[serde(default)]
    pub camera: Option<CameraConfig>,
    #[serde(default)]
    pub reload: ReloadConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct WindowConfig {
    #[serde(default = "default_window_width")]
    pub width: u32,
    #[serde(default = "default_window_height")]
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_window_width(),
            height: default_window_height(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(default = "default_texture_size")]
    pub texture_size: [u32; 2],
    #[serde(default)]
    pub format: TextureFormatName,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            texture_size: default_texture_size(),
            format: TextureFormatName::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TextureFormatName {
    #[default]
    Rgba32Float,
    Rgba16Float,
    Rgba8Unorm,
    R32Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeKeyword {
    /// Track the window's physical size.
    Surface,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TextureSize {
    Keyword(SizeKeyword),
    Dims(Vec<u32>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TextureConfig {
    #[serde(default)]
    pub size: Option<TextureSize>,
    #[serde(default)]
    pub format: Option<TextureFormatName>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BufferConfig {
    /// Bytes per element.
    pub stride: u32,
    /// Number of elements.
    pub count: u32,
    #[serde(default)]
    pub seed: Option<SeedConfig>,
}

impl BufferConfig {
    pub fn byte_len(&self) -> u64 {
        u64::from(self.stride) * u64::from(self.count)
    }
}

/// Recipe for the initial contents of a storage buffer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum SeedConfig {
    Zeroed,
    Constant {
        values: Vec<f32>,
    },
    /// Slime agents: `[x, y, heading, r, g, b]` per element.
    Agents {
        #[serde(default)]
        palette: AgentPalette,
        #[serde(default)]
        color: Option<[f32; 3]>,
        #[serde(default = "default_agent_spread")]
        spread: f32,
        #[serde(default)]
        area: Option<[u32; 2]>,
    },
    /// Gravity bodies: `[x, y, vx, vy, mass]` per element.
    Bodies {
        #[serde(default = "default_central_mass")]
        central_mass: f32,
        #[serde(default)]
        area: Option<[u32; 2]>,
    },
}

pub const AGENT_STRIDE: u32 = 6 * 4;
pub const BODY_STRIDE: u32 = 5 * 4;

impl SeedConfig {
    /// Element stride the recipe produces, if it dictates one.
    pub fn required_stride(&self) -> Option<u32> {
        match self {
            SeedConfig::Zeroed => None,
            SeedConfig::Constant { values } => Some(values.len() as u32 * 4),
            SeedConfig::Agents { .. } => Some(AGENT_STRIDE),
            SeedConfig::Bodies { .. } => Some(BODY_STRIDE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentPalette {
    #[default]
    Hue,
    Saturation,
    Rainbow,
    Gradient,
    Random,
    Solid,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProgramConfig {
    pub compute: PathBuf,
    #[serde(default)]
    pub entry: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DisplayConfig {
    pub texture: String,
    #[serde(default)]
    pub vertex: Option<PathBuf>,
    #[serde(default)]
    pub fragment: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Float,
    Int,
    Uint,
    Vec2,
    Vec3,
    Vec4,
    Color,
    Mat4,
}

impl ParamKind {
    pub fn arity(self) -> usize {
        match self {
            ParamKind::Float | ParamKind::Int | ParamKind::Uint => 1,
            ParamKind::Vec2 => 2,
            ParamKind::Vec3 => 3,
            ParamKind::Vec4 | ParamKind::Color => 4,
            ParamKind::Mat4 => 16,
        }
    }
}

/// A number or list of numbers as written in TOML.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ParamLiteral {
    Integer(i64),
    Float(f64),
    List(Vec<f64>),
}

impl ParamLiteral {
    pub fn components(&self) -> Vec<f64> {
        match self {
            ParamLiteral::Integer(value) => vec![*value as f64],
            ParamLiteral::Float(value) => vec![*value],
            ParamLiteral::List(values) => values.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterConfig {
    #[serde(rename = "type")]
    pub kind: ParamKind,
    pub default: ParamLiteral,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ExtentConfig {
    Resource(String),
    Fixed(Vec<u32>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase", deny_unknown_fields)]
pub enum StepConfig {
    Dispatch {
        program: String,
        extent: ExtentConfig,
        #[serde(default)]
        params: BTreeMap<String, ParamLiteral>,
    },
    Copy {
        from: String,
        to: String,
    },
}

/// Orbit camera steered with the mouse. Angles are in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CameraConfig {
    #[serde(default = "default_fov")]
    pub fov_degrees: f32,
    #[serde(default = "default_near")]
    pub near: f32,
    #[serde(default = "default_far")]
    pub far: f32,
    #[serde(default = "default_distance")]
    pub distance: f32,
    #[serde(default = "default_min_distance")]
    pub min_distance: f32,
    #[serde(default = "default_max_distance")]
    pub max_distance: f32,
    #[serde(default)]
    pub latitude: f32,
    #[serde(default)]
    pub longitude: f32,
    #[serde(default)]
    pub target: [f32; 3],
    /// Degrees turned per pixel dragged.
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f32,
    /// Distance moved per scroll line.
    #[serde(default = "default_sensitivity")]
    pub zoom_step: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            fov_degrees: default_fov(),
            near: default_near(),
            far: default_far(),
            distance: default_distance(),
            min_distance: default_min_distance(),
            max_distance: default_max_distance(),
            latitude: 0.0,
            longitude: 0.0,
            target: [0.0; 3],
            sensitivity: default_sensitivity(),
            zoom_step: default_sensitivity(),
        }
    }
}

/// Latitude is kept inside this many degrees of the equator.
pub const MAX_LATITUDE: f32 = 85.0;

/// Parameters the camera publishes, with the type each must be declared as.
pub const CAMERA_PARAMETERS: [(&str, ParamKind); 3] = [
    ("CameraPosition", ParamKind::Vec3),
    ("InvProjection", ParamKind::Mat4),
    ("InvView", ParamKind::Mat4),
];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ReloadConfig {
    #[serde(default = "default_watch")]
    pub watch: bool,
    #[serde(default = "default_debounce", deserialize_with = "deserialize_duration")]
    pub debounce: Duration,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            watch: default_watch(),
            debounce: default_debounce(),
        }
    }
}

/// Where a named resource came from in the scene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResourceRef<'a> {
    Texture(&'a TextureConfig),
    Buffer(&'a BufferConfig),
}

fn default_title() -> String {
    "Compute Shader".to_string()
}

fn default_window_width() -> u32 {
    1600
}

fn default_window_height() -> u32 {
    900
}

fn default_texture_size() -> [u32; 2] {
    [1920, 1080]
}

fn default_agent_spread() -> f32 {
    256.0
}

fn default_central_mass() -> f32 {
    10_000.0
}

fn default_fov() -> f32 {
    45.0
}

fn default_near() -> f32 {
    0.1
}

fn default_far() -> f32 {
    100.0
}

fn default_distance() -> f32 {
    3.0
}

fn default_min_distance() -> f32 {
    2.0
}

fn default_max_distance() -> f32 {
    100.0
}

fn default_sensitivity() -> f32 {
    1.0
}

fn default_watch() -> bool {
    true
}

fn default_debounce() -> Duration {
    Duration::from_millis(250)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs_f64(v))
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl SceneConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: SceneConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn resource(&self, name: &str) -> Option<ResourceRef<'_>> {
        if let Some(texture) = self.textures.get(name) {
            return Some(ResourceRef::Texture(texture));
        }
        self.buffers.get(name).map(ResourceRef::Buffer)
    }

    /// Texture dimensions, or `None` when the texture follows the surface.
    pub fn texture_dims(&self, texture: &TextureConfig) -> Option<[u32; 3]> {
        match &texture.size {
            None => {
                let [width, height] = self.defaults.texture_size;
                Some([width, height, 1])
            }
            Some(TextureSize::Keyword(SizeKeyword::Surface)) => None,
            Some(TextureSize::Dims(dims)) => Some([
                dims.first().copied().unwrap_or(1),
                dims.get(1).copied().unwrap_or(1),
                dims.get(2).copied().unwrap_or(1),
            ]),
        }
    }

    pub fn texture_format(&self, texture: &TextureConfig) -> TextureFormatName {
        texture.format.unwrap_or(self.defaults.format)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported scene version {}; expected 1",
                self.version
            )));
        }

        if self.window.width == 0 || self.window.height == 0 {
            return Err(ConfigError::Invalid(
                "window width and height must be greater than zero".into(),
            ));
        }

        if self.defaults.texture_size.contains(&0) {
            return Err(ConfigError::Invalid(
                "defaults.texture_size must be greater than zero".into(),
            ));
        }

        if self.programs.is_empty() {
            return Err(ConfigError::Invalid(
                "scene must define at least one compute program".into(),
            ));
        }

        for (name, texture) in &self.textures {
            validate_name("texture", name)?;
            if self.buffers.contains_key(name) {
                return Err(ConfigError::Invalid(format!(
                    "'{name}' is declared both as a texture and a buffer"
                )));
            }
            if let Some(TextureSize::Dims(dims)) = &texture.size {
                if !(2..=3).contains(&dims.len()) || dims.contains(&0) {
                    return Err(ConfigError::Invalid(format!(
                        "texture '{name}' size must be \"surface\" or 2-3 non-zero dimensions"
                    )));
                }
            }
        }

        for (name, buffer) in &self.buffers {
            validate_name("buffer", name)?;
            if buffer.stride == 0 || buffer.stride % 4 != 0 {
                return Err(ConfigError::Invalid(format!(
                    "buffer '{name}' stride must be a non-zero multiple of 4"
                )));
            }
            if buffer.count == 0 {
                return Err(ConfigError::Invalid(format!(
                    "buffer '{name}' count must be greater than zero"
                )));
            }
            if let Some(seed) = &buffer.seed {
                if let SeedConfig::Constant { values } = seed {
                    if values.is_empty() {
                        return Err(ConfigError::Invalid(format!(
                            "buffer '{name}' constant seed needs at least one value"
                        )));
                    }
                }
                if let Some(required) = seed.required_stride() {
                    if required != buffer.stride {
                        return Err(ConfigError::Invalid(format!(
                            "buffer '{name}' stride {} does not match its seed layout ({required} bytes)",
                            buffer.stride
                        )));
                    }
                }
            }
        }

        for (name, program) in &self.programs {
            validate_name("program", name)?;
            if program.compute.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "program '{name}' must name a compute shader source"
                )));
            }
        }

        for (name, parameter) in &self.parameters {
            validate_name("parameter", name)?;
            let arity = parameter.default.components().len();
            if arity != parameter.kind.arity() {
                return Err(ConfigError::Invalid(format!(
                    "parameter '{name}' default has {arity} component(s); {:?} expects {}",
                    parameter.kind,
                    parameter.kind.arity()
                )));
            }
            if let (Some(min), Some(max)) = (parameter.min, parameter.max) {
                if min > max {
                    return Err(ConfigError::Invalid(format!(
                        "parameter '{name}' min must not exceed max"
                    )));
                }
            }
        }

        for (index, step) in self.steps.iter().enumerate() {
            self.validate_step(index, step)?;
        }

        match self.resource(&self.display.texture) {
            Some(ResourceRef::Texture(_)) => {}
            Some(ResourceRef::Buffer(_)) => {
                return Err(ConfigError::Invalid(format!(
                    "display target '{}' must be a texture",
                    self.display.texture
                )));
            }
            None => {
                return Err(ConfigError::Invalid(format!(
                    "display references unknown texture '{}'",
                    self.display.texture
                )));
            }
        }

        if self.display.vertex.is_some() != self.display.fragment.is_some() {
            return Err(ConfigError::Invalid(
                "display vertex and fragment overrides must be given together".into(),
            ));
        }

        if let Some(camera) = &self.camera {
            self.validate_camera(camera)?;
        }

        Ok(())
    }

    fn validate_camera(&self, camera: &CameraConfig) -> Result<(), ConfigError> {
        let invalid = |message: &str| Err(ConfigError::Invalid(format!("camera {message}")));
        if !(camera.fov_degrees > 0.0 && camera.fov_degrees < 180.0) {
            return invalid("fov_degrees must lie strictly between 0 and 180");
        }
        if !(camera.near > 0.0 && camera.far > camera.near) {
            return invalid("needs 0 < near < far");
        }
        if !(camera.min_distance > 0.0 && camera.min_distance <= camera.max_distance) {
            return invalid("needs 0 < min_distance <= max_distance");
        }
        if !(camera.min_distance..=camera.max_distance).contains(&camera.distance) {
            return invalid("distance must lie between min_distance and max_distance");
        }
        if camera.latitude.abs() > MAX_LATITUDE {
            return invalid("latitude must lie within 85 degrees of the equator");
        }
        for (name, kind) in CAMERA_PARAMETERS {
            if let Some(declared) = self.parameters.get(name) {
                if declared.kind != kind {
                    return Err(ConfigError::Invalid(format!(
                        "parameter '{name}' is written by the camera and must be {kind:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn validate_step(&self, index: usize, step: &StepConfig) -> Result<(), ConfigError> {
        match step {
            StepConfig::Dispatch {
                program, extent, ..
            } => {
                if !self.programs.contains_key(program) {
                    return Err(ConfigError::Invalid(format!(
                        "step {index} dispatches unknown program '{program}'"
                    )));
                }
                match extent {
                    ExtentConfig::Resource(name) => {
                        if self.resource(name).is_none() {
                            return Err(ConfigError::Invalid(format!(
                                "step {index} takes its extent from unknown resource '{name}'"
                            )));
                        }
                    }
                    ExtentConfig::Fixed(dims) => {
                        if !(1..=3).contains(&dims.len()) || dims.contains(&0) {
                            return Err(ConfigError::Invalid(format!(
                                "step {index} extent must have 1-3 non-zero dimensions"
                            )));
                        }
                    }
                }
            }
            StepConfig::Copy { from, to } => {
                if from == to {
                    return Err(ConfigError::Invalid(format!(
                        "step {index} copies '{from}' onto itself"
                    )));
                }
                let (source, target) = match (self.resource(from), self.resource(to)) {
                    (Some(source), Some(target)) => (source, target),
                    (None, _) => {
                        return Err(ConfigError::Invalid(format!(
                            "step {index} copies from unknown resource '{from}'"
                        )));
                    }
                    (_, None) => {
                        return Err(ConfigError::Invalid(format!(
                            "step {index} copies into unknown resource '{to}'"
                        )));
                    }
                };
                let same_kind = matches!(
                    (source, target),
                    (ResourceRef::Texture(_), ResourceRef::Texture(_))
                        | (ResourceRef::Buffer(_), ResourceRef::Buffer(_))
                );
                if !same_kind {
                    return Err(ConfigError::Invalid(format!(
                        "step {index} copies between a texture and a buffer"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn validate_name(kind: &str, name: &str) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{kind} name may not be empty")));
    }
    Ok(())
}
