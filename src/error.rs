//! Per-item deployment errors
//!
//! Each variant maps onto exactly one terminal [`DeploymentStatus`]. Only
//! [`DeploymentError::SafetyViolation`] escapes the per-item isolation
//! boundary and aborts the batch.

use std::path::PathBuf;
use thiserror::Error;

use crate::deployment::DeploymentStatus;
use crate::git::GitOperationError;

#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("mapping conflict at {path}: {reason}")]
    MappingConflict { path: PathBuf, reason: String },

    #[error("code generation failed after {attempts} attempt(s): {reason}")]
    Generation { attempts: u32, reason: String },

    #[error("tests failed: {detail}")]
    TestFailure {
        /// `None` when the tests could not be generated or run at all
        pass_rate: Option<f64>,
        detail: String,
    },

    #[error(transparent)]
    GitOperation(#[from] GitOperationError),

    #[error("circuit breaker is open")]
    CircuitBreakerOpen,

    #[error("safety violation: {0}")]
    SafetyViolation(String),

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeploymentError {
    pub fn status(&self) -> DeploymentStatus {
        match self {
            DeploymentError::Validation(_) | DeploymentError::MappingConflict { .. } => {
                DeploymentStatus::FailedValidation
            }
            DeploymentError::Generation { .. } => DeploymentStatus::FailedGeneration,
            DeploymentError::TestFailure { .. } => DeploymentStatus::FailedTests,
            DeploymentError::GitOperation(_) => DeploymentStatus::FailedGit,
            DeploymentError::CircuitBreakerOpen => DeploymentStatus::SkippedCircuitOpen,
            DeploymentError::SafetyViolation(_)
            | DeploymentError::Cancelled
            | DeploymentError::Io(_) => DeploymentStatus::RolledBack,
        }
    }

    /// Whether the whole run must stop.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, DeploymentError::SafetyViolation(_))
    }

    /// Whether this outcome counts toward the circuit breaker. Items that
    /// never reached a mutating or external phase do not.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(
            self,
            DeploymentError::Validation(_)
                | DeploymentError::MappingConflict { .. }
                | DeploymentError::CircuitBreakerOpen
                | DeploymentError::Cancelled
        )
    }
}
