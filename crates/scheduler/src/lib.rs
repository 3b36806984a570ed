//! Frame planning: the ordered compute/copy steps a scene runs every frame and
//! the work-group arithmetic used to dispatch them.

use std::collections::BTreeSet;

use sceneconfig::{ExtentConfig, ParamLiteral, SceneConfig, StepConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error("work-group size must be non-zero on every axis, got {0:?}")]
    EmptyWorkGroup([u32; 3]),
    #[error("extent {extent:?} needs {groups:?} work-groups, exceeding the limit of {limit} per axis")]
    TooManyGroups {
        extent: [u32; 3],
        groups: [u32; 3],
        limit: u32,
    },
    #[error("step {step} references unknown {kind} '{name}'")]
    UnknownReference {
        step: usize,
        kind: &'static str,
        name: String,
    },
    #[error("step {step} has an invalid parameter override '{name}': {reason}")]
    InvalidOverride {
        step: usize,
        name: String,
        reason: String,
    },
}

/// Size of the grid a dispatch covers, in invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Extent3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Pads missing axes with 1.
    pub fn from_slice(dims: &[u32]) -> Self {
        Self {
            x: dims.first().copied().unwrap_or(1),
            y: dims.get(1).copied().unwrap_or(1),
            z: dims.get(2).copied().unwrap_or(1),
        }
    }

    pub fn as_array(self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    pub fn is_empty(self) -> bool {
        self.x == 0 || self.y == 0 || self.z == 0
    }
}

/// Local work-group size declared by a compiled compute program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkGroupSize(pub [u32; 3]);

impl WorkGroupSize {
    pub fn invocations(self) -> u32 {
        self.0.iter().product()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupLimits {
    pub max_per_dimension: u32,
}

impl Default for GroupLimits {
    fn default() -> Self {
        Self {
            max_per_dimension: 65_535,
        }
    }
}

/// Number of work-groups needed to cover `extent`, rounding up on every axis.
pub fn group_counts(
    extent: Extent3,
    local: WorkGroupSize,
    limits: GroupLimits,
) -> Result<[u32; 3], ScheduleError> {
    if local.0.contains(&0) {
        return Err(ScheduleError::EmptyWorkGroup(local.0));
    }
    let dims = extent.as_array();
    let groups = [
        dims[0].div_ceil(local.0[0]),
        dims[1].div_ceil(local.0[1]),
        dims[2].div_ceil(local.0[2]),
    ];
    if groups.iter().any(|count| *count > limits.max_per_dimension) {
        return Err(ScheduleError::TooManyGroups {
            extent: dims,
            groups,
            limit: limits.max_per_dimension,
        });
    }
    Ok(groups)
}

/// Where a dispatch step takes its extent from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtentSource {
    Fixed(Extent3),
    /// Dimensions of a named resource, resolved each frame so surface-sized
    /// textures track resizes.
    Resource(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step<P> {
    Dispatch {
        program: String,
        extent: ExtentSource,
        overrides: Vec<(String, P)>,
    },
    Copy {
        from: String,
        to: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameSchedule<P> {
    steps: Vec<Step<P>>,
}

impl<P> Default for FrameSchedule<P> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<P> FrameSchedule<P> {
    pub fn new(steps: Vec<Step<P>>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step<P>] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Programs dispatched by this schedule, deduplicated.
    pub fn programs(&self) -> BTreeSet<&str> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                Step::Dispatch { program, .. } => Some(program.as_str()),
                Step::Copy { .. } => None,
            })
            .collect()
    }

    /// Resources named by extents and copies.
    pub fn resources(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        for step in &self.steps {
            match step {
                Step::Dispatch {
                    extent: ExtentSource::Resource(name),
                    ..
                } => {
                    names.insert(name.as_str());
                }
                Step::Dispatch { .. } => {}
                Step::Copy { from, to } => {
                    names.insert(from.as_str());
                    names.insert(to.as_str());
                }
            }
        }
        names
    }

    /// Checks every reference against the supplied lookups.
    pub fn validate(
        &self,
        has_program: impl Fn(&str) -> bool,
        has_resource: impl Fn(&str) -> bool,
    ) -> Result<(), ScheduleError> {
        for (index, step) in self.steps.iter().enumerate() {
            match step {
                Step::Dispatch {
                    program, extent, ..
                } => {
                    if !has_program(program) {
                        return Err(ScheduleError::UnknownReference {
                            step: index,
                            kind: "program",
                            name: program.clone(),
                        });
                    }
                    if let ExtentSource::Resource(name) = extent {
                        if !has_resource(name) {
                            return Err(ScheduleError::UnknownReference {
                                step: index,
                                kind: "resource",
                                name: name.clone(),
                            });
                        }
                    }
                }
                Step::Copy { from, to } => {
                    for name in [from, to] {
                        if !has_resource(name) {
                            return Err(ScheduleError::UnknownReference {
                                step: index,
                                kind: "resource",
                                name: name.clone(),
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Converts per-step overrides, failing on the first rejected value.
    pub fn try_map_overrides<Q, F>(self, mut convert: F) -> Result<FrameSchedule<Q>, ScheduleError>
    where
        F: FnMut(&str, P) -> Result<Q, String>,
    {
        let mut steps = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.into_iter().enumerate() {
            let mapped = match step {
                Step::Dispatch {
                    program,
                    extent,
                    overrides,
                } => {
                    let mut converted = Vec::with_capacity(overrides.len());
                    for (name, value) in overrides {
                        let value = convert(&name, value).map_err(|reason| {
                            ScheduleError::InvalidOverride {
                                step: index,
                                name: name.clone(),
                                reason,
                            }
                        })?;
                        converted.push((name, value));
                    }
                    Step::Dispatch {
                        program,
                        extent,
                        overrides: converted,
                    }
                }
                Step::Copy { from, to } => Step::Copy { from, to },
            };
            steps.push(mapped);
        }
        Ok(FrameSchedule { steps })
    }
}

impl FrameSchedule<ParamLiteral> {
    pub fn from_scene(config: &SceneConfig) -> Self {
        let steps = config
            .steps
            .iter()
            .map(|step| match step {
                StepConfig::Dispatch {
                    program,
                    extent,
                    params,
                } => Step::Dispatch {
                    program: program.clone(),
                    extent: match extent {
                        ExtentConfig::Resource(name) => ExtentSource::Resource(name.clone()),
                        ExtentConfig::Fixed(dims) => ExtentSource::Fixed(Extent3::from_slice(dims)),
                    },
                    overrides: params
                        .iter()
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect(),
                },
                StepConfig::Copy { from, to } => Step::Copy {
                    from: from.clone(),
                    to: to.clone(),
                },
            })
            .collect();
        Self { steps }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENE: &str = r#"
version = 1

[textures.Trail]
size = [256, 128]

[textures.TrailOut]
size = [256, 128]

[programs.Agents]
compute = "agents.wgsl"

[[steps]]
kind = "dispatch"
program = "Agents"
extent = [1000]
params = { Stage = 0 }

[[steps]]
kind = "dispatch"
program = "Agents"
extent = "Trail"
params = { Stage = 1 }

[[steps]]
kind = "copy"
from = "TrailOut"
to = "Trail"

[display]
texture = "Trail"
"#;

    #[test]
    fn rounds_group_counts_up() {
        let groups = group_counts(
            Extent3::new(100, 1, 1),
            WorkGroupSize([32, 1, 1]),
            GroupLimits::default(),
        )
        .unwrap();
        assert_eq!(groups, [4, 1, 1]);
    }

    #[test]
    fn exact_multiples_do_not_overshoot() {
        let groups = group_counts(
            Extent3::new(1920, 1080, 1),
            WorkGroupSize([8, 8, 1]),
            GroupLimits::default(),
        )
        .unwrap();
        assert_eq!(groups, [240, 135, 1]);
    }

    #[test]
    fn group_counts_cover_extent_minimally() {
        for extent in 1..300u32 {
            for local in 1..40u32 {
                let [groups, _, _] = group_counts(
                    Extent3::new(extent, 1, 1),
                    WorkGroupSize([local, 1, 1]),
                    GroupLimits::default(),
                )
                .unwrap();
                assert!(groups * local >= extent);
                assert!((groups - 1) * local < extent);
            }
        }
    }

    #[test]
    fn rejects_zero_local_size() {
        let err = group_counts(
            Extent3::new(4, 4, 1),
            WorkGroupSize([8, 0, 1]),
            GroupLimits::default(),
        )
        .unwrap_err();
        assert_eq!(err, ScheduleError::EmptyWorkGroup([8, 0, 1]));
    }

    #[test]
    fn enforces_group_limit() {
        let err = group_counts(
            Extent3::new(1_000_000, 1, 1),
            WorkGroupSize([1, 1, 1]),
            GroupLimits {
                max_per_dimension: 65_535,
            },
        )
        .unwrap_err();
        assert!(matches!(err, ScheduleError::TooManyGroups { limit: 65_535, .. }));
    }

    #[test]
    fn builds_schedule_from_scene() {
        let config = SceneConfig::from_toml_str(SCENE).unwrap();
        let schedule = FrameSchedule::from_scene(&config);
        assert_eq!(schedule.steps().len(), 3);
        assert_eq!(
            schedule.programs().into_iter().collect::<Vec<_>>(),
            vec!["Agents"]
        );
        assert_eq!(
            schedule.resources().into_iter().collect::<Vec<_>>(),
            vec!["Trail", "TrailOut"]
        );
        match &schedule.steps()[0] {
            Step::Dispatch { extent, overrides, .. } => {
                assert_eq!(extent, &ExtentSource::Fixed(Extent3::new(1000, 1, 1)));
                assert_eq!(overrides[0].0, "Stage");
            }
            other => panic!("unexpected step {other:?}"),
        }
    }

    #[test]
    fn validate_reports_missing_program() {
        let schedule: FrameSchedule<()> = FrameSchedule::new(vec![Step::Dispatch {
            program: "gone".into(),
            extent: ExtentSource::Fixed(Extent3::new(1, 1, 1)),
            overrides: Vec::new(),
        }]);
        let err = schedule.validate(|_| false, |_| true).unwrap_err();
        assert!(matches!(
            err,
            ScheduleError::UnknownReference { kind: "program", .. }
        ));
    }

    #[test]
    fn override_conversion_reports_step() {
        let config = SceneConfig::from_toml_str(SCENE).unwrap();
        let err = FrameSchedule::from_scene(&config)
            .try_map_overrides(|_, value| match value {
                ParamLiteral::Integer(0) => Ok(0u32),
                _ => Err("only zero allowed".to_string()),
            })
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidOverride { step: 1, .. }));
    }
}
