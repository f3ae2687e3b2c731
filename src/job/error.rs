//! Error types for job-level operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::download::EngineError;
use crate::filter::FilterError;
use crate::reconcile::ReconcileError;
use crate::state::StateError;

/// Errors that end a `start`, `resume`, `status` or `clean` call.
///
/// Per-file and per-item failures never surface here; they are recorded
/// in the state store and the returned summaries.
#[derive(Debug, Error)]
pub enum JobError {
    /// An option is out of range.
    #[error("invalid {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    /// `resume` or `status` found no job in the directory.
    #[error("no job found in {}", dir.display())]
    NoJob { dir: PathBuf },
}

impl JobError {
    #[must_use]
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }

    /// True when the state store reported corruption.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::State(err) | Self::Engine(EngineError::Store(err)) => err.is_corruption(),
            _ => false,
        }
    }
}
