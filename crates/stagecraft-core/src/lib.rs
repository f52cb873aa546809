//! Staged-mutation lifecycle engine for Stagecraft.
//!
//! This crate ties the store and runtime layers together into the
//! `StageEngine`: the create → require → apply → destroy state machine, the
//! typed `ValidationPipeline` that lets listeners veto each transition, lock
//! file drift detection, the cached status check, and a set of built-in
//! validators.

pub mod concurrency;
pub mod drift;
pub mod engine;
pub mod events;
pub mod lifecycle;
pub mod pipeline;
pub mod result;
pub mod status;
pub mod validators;

pub use concurrency::{install_signal_handler, shutdown_requested};
pub use drift::{LockFileDriftDetector, LockFileHash};
pub use engine::{Metadata, Stage, StageEngine};
pub use events::{EventKind, ValidationEvent};
pub use lifecycle::validate_transition;
pub use pipeline::{ListenerError, ValidationPipeline};
pub use result::{InvalidResult, Severity, ValidationResult};
pub use status::{CachedValidationRun, ValidationResultCache};
pub use validators::register_builtin_validators;

use stagecraft_runtime::OperationError;
use stagecraft_schema::StageId;
use stagecraft_store::{StageState, StoreError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(#[from] stagecraft_schema::ConfigError),
    #[error("invalid mutation: {0}")]
    Mutation(#[from] stagecraft_schema::MutationError),
    #[error("store error: {0}")]
    Store(StoreError),
    #[error("operation failed: {0}")]
    Operation(#[from] OperationError),
    #[error("site already has an active stage ({holder})")]
    AlreadyClaimed { holder: StageId },
    #[error("caller does not own stage {0}")]
    NotOwner(StageId),
    #[error("stage {0} does not exist")]
    StageNotFound(StageId),
    #[error("invalid stage state: cannot move from {from} to {to}")]
    InvalidStageState { from: StageState, to: StageState },
    #[error(
        "{} changed since the stage was created (expected {expected}, found {actual})",
        path.display()
    )]
    DriftDetected {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("stage validation failed:\n{}", format_results(.0))]
    StageValidation(Vec<ValidationResult>),
    #[error("apply of stage {stage_id} failed, failure marker left at {}: {source}", marker.display())]
    ApplyFailed {
        stage_id: StageId,
        marker: PathBuf,
        source: OperationError,
    },
    #[error(
        "failure marker present at {} (stage {stage_id}): {message}; repair the codebase, then clear the marker",
        path.display()
    )]
    FailureMarkerExists {
        stage_id: String,
        message: String,
        path: PathBuf,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AlreadyClaimed { holder } => CoreError::AlreadyClaimed { holder },
            StoreError::NotOwner(id) => CoreError::NotOwner(id),
            StoreError::FailureMarkerExists {
                stage_id,
                message,
                path,
            } => CoreError::FailureMarkerExists {
                stage_id,
                message,
                path,
            },
            other => CoreError::Store(other),
        }
    }
}

fn format_results(results: &[ValidationResult]) -> String {
    results
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}
