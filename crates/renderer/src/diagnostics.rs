use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::CompileError;
use crate::types::ProgramId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramStatus {
    Ready {
        generation: u64,
        log: String,
    },
    /// The last build failed; `active_generation` is the program still in use.
    Failed {
        error: CompileError,
        active_generation: Option<u64>,
    },
}

impl ProgramStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProgramStatus::Ready { .. })
    }
}

/// Per-program build status, written by the rendering thread and read by the GUI.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsBoard {
    entries: Arc<Mutex<BTreeMap<ProgramId, ProgramStatus>>>,
}

impl DiagnosticsBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, id: &ProgramId, status: ProgramStatus) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), status);
    }

    pub fn status(&self, id: &ProgramId) -> Option<ProgramStatus> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<ProgramId, ProgramStatus> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn failures(&self) -> Vec<CompileError> {
        self.snapshot()
            .into_values()
            .filter_map(|status| match status {
                ProgramStatus::Failed { error, .. } => Some(error),
                ProgramStatus::Ready { .. } => None,
            })
            .collect()
    }
}
