//! Operation executors for Stagecraft stages.
//!
//! The lifecycle engine never touches the codebase itself; it delegates the
//! raw primitives (copy active → staging, run a mutation inside staging,
//! commit staging → active, clean staging) to an `OperationExecutor`. This
//! crate provides the trait, the filesystem-backed `FsExecutor`, a
//! `MockExecutor` with failure injection, and executable lookup on `PATH`.

pub mod executor;
pub mod fs_executor;
pub mod mock;
pub mod prereq;
pub mod tree;

pub use executor::OperationExecutor;
pub use fs_executor::FsExecutor;
pub use mock::{ExecutorCall, MockExecutor, MockStep};
pub use prereq::{check_executables, find_executable, format_missing, MissingPrereq};

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("operation I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("'{command}' exited with {status}: {stderr}")]
    ProcessFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("'{command}' timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("injected {step} failure: {message}")]
    Injected { step: MockStep, message: String },
}

impl OperationError {
    /// Stable short name of the variant, recorded as a failure marker's cause class.
    pub fn kind_name(&self) -> &'static str {
        match self {
            OperationError::Io(_) => "io",
            OperationError::InvalidPath(_) => "invalid_path",
            OperationError::Spawn { .. } => "spawn",
            OperationError::ProcessFailed { .. } => "process_failed",
            OperationError::Timeout { .. } => "timeout",
            OperationError::Injected { .. } => "injected",
        }
    }
}
