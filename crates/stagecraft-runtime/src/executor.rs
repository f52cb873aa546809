use crate::OperationError;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The raw primitives a stage delegates to.
///
/// `exclusions` are paths relative to the tree roots that are neither copied
/// nor removed. Implementations may block for a long time; only
/// `stage_operation` is bounded by a timeout.
pub trait OperationExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// Copy the active codebase into a fresh staging directory.
    fn begin(
        &self,
        active_root: &Path,
        staging_root: &Path,
        exclusions: &[PathBuf],
    ) -> Result<(), OperationError>;

    /// Run one mutation command inside the staging directory.
    fn stage_operation(
        &self,
        command: &[String],
        staging_root: &Path,
        timeout: Duration,
    ) -> Result<std::process::Output, OperationError>;

    /// Fold the staging directory back into the active codebase.
    fn commit(
        &self,
        staging_root: &Path,
        active_root: &Path,
        exclusions: &[PathBuf],
    ) -> Result<(), OperationError>;

    fn clean(&self, staging_root: &Path) -> Result<(), OperationError>;
}
