use std::fmt;

use scheduler::ScheduleError;

use crate::params::ParamType;
use crate::types::{
    ProgramId, ResourceFormat, ResourceId, ResourceKind, ShaderStage, TextureFormat,
};

/// Step of the build at which a program failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilePhase {
    Read,
    Parse,
    Validate,
    Link,
}

impl fmt::Display for CompilePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilePhase::Read => f.write_str("read"),
            CompilePhase::Parse => f.write_str("parse"),
            CompilePhase::Validate => f.write_str("validation"),
            CompilePhase::Link => f.write_str("link"),
        }
    }
}

/// Shader build failure, kept as data so the previous program stays active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub program: ProgramId,
    /// `None` when the failure concerns the program as a whole.
    pub stage: Option<ShaderStage>,
    pub phase: CompilePhase,
    pub source_name: Option<String>,
    /// 1-based.
    pub line: Option<u32>,
    /// 1-based.
    pub column: Option<u32>,
    pub message: String,
}

impl CompileError {
    pub(crate) fn new(
        program: &ProgramId,
        stage: Option<ShaderStage>,
        phase: CompilePhase,
        message: impl Into<String>,
    ) -> Self {
        Self {
            program: program.clone(),
            stage,
            phase,
            source_name: None,
            line: None,
            column: None,
            message: message.into(),
        }
    }

    pub(crate) fn with_source(mut self, name: impl Into<String>) -> Self {
        self.source_name = Some(name.into());
        self
    }

    pub(crate) fn at(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "program '{}'", self.program)?;
        if let Some(stage) = self.stage {
            write!(f, " {stage} stage")?;
        }
        match (&self.source_name, self.line, self.column) {
            (Some(name), Some(line), Some(column)) => write!(f, " ({name}:{line}:{column})")?,
            (Some(name), Some(line), None) => write!(f, " ({name}:{line})")?,
            (Some(name), None, _) => write!(f, " ({name})")?,
            (None, Some(line), Some(column)) => write!(f, " (line {line}, column {column})")?,
            _ => {}
        }
        write!(f, ": {} error: {}", self.phase, self.message)
    }
}

impl std::error::Error for CompileError {}

/// Failures reported by a [`crate::backend::GpuBackend`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("unknown backend handle {0}")]
    UnknownHandle(u64),
    #[error("pipeline creation failed: {0}")]
    Pipeline(String),
    #[error("device error: {0}")]
    Device(String),
    #[error("surface error: {0}")]
    Surface(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("resource '{0}' has not been allocated")]
    NotFound(ResourceId),
    #[error("failed to allocate resource '{id}': {reason}")]
    AllocationFailure { id: ResourceId, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("program '{0}' is not linked")]
    ProgramUnavailable(ProgramId),
    #[error("program '{0}' is not a compute program")]
    NotCompute(ProgramId),
    #[error("resource '{0}' has not been allocated")]
    NotFound(ResourceId),
    #[error("program '{program}' binds '{slot}' as a {expected}, but the resource is a {found}")]
    BindingMismatch {
        program: ProgramId,
        slot: String,
        expected: ResourceKind,
        found: ResourceKind,
    },
    #[error("program '{program}' expects '{slot}' in {expected:?}, but the resource is {found:?}")]
    FormatMismatch {
        program: ProgramId,
        slot: String,
        expected: TextureFormat,
        found: ResourceFormat,
    },
    #[error("program '{program}': {source}")]
    Groups {
        program: ProgramId,
        #[source]
        source: ScheduleError,
    },
    #[error("copy from '{from}' to '{to}' needs resources of identical shape")]
    CopyMismatch { from: ResourceId, to: ResourceId },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Reasons a scene cannot drive a frame pipeline at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SceneError {
    #[error("display texture '{0}' is not declared")]
    UnknownDisplayTexture(ResourceId),
    #[error("display source '{0}' is a buffer, not a texture")]
    DisplayNotTexture(ResourceId),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Parameter(#[from] ParameterError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParameterError {
    #[error("parameter name may not be empty")]
    EmptyName,
    #[error("parameter '{name}' holds a {expected} value, refusing {found}")]
    TypeMismatch {
        name: String,
        expected: ParamType,
        found: ParamType,
    },
    #[error("cannot parse '{input}' as a {expected} value")]
    Parse { input: String, expected: ParamType },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_renders_location() {
        let err = CompileError::new(
            &ProgramId::new("Agents"),
            Some(ShaderStage::Compute),
            CompilePhase::Parse,
            "expected ';'",
        )
        .with_source("agents.wgsl")
        .at(12, 5);
        assert_eq!(
            err.to_string(),
            "program 'Agents' compute stage (agents.wgsl:12:5): parse error: expected ';'"
        );
    }

    #[test]
    fn compile_error_without_location() {
        let err = CompileError::new(
            &ProgramId::new("Blur"),
            None,
            CompilePhase::Link,
            "no compute entry point",
        );
        assert_eq!(
            err.to_string(),
            "program 'Blur': link error: no compute entry point"
        );
    }
}
