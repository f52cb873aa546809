//! Persistent state for Stagecraft sites.
//!
//! This crate provides the storage layer: `PathResolver` for the active,
//! staging and state directory layout, a TTL-aware `KeyValueStore` (file
//! backed with `fs2` locking, or in memory), the `OwnershipLock` that gives
//! one owner exclusive use of a site's stage, checksummed `StageRecord`s, and
//! the on-disk `FailureMarker` that witnesses an interrupted apply.

pub mod kv;
pub mod layout;
pub mod lock;
pub mod marker;
pub mod ownership;
pub mod record;

pub use kv::{FileKvStore, KeyValueStore, KeyValueStoreExt, MemoryKvStore};
pub use layout::{PathResolver, STATE_FORMAT_VERSION};
pub use lock::StoreLock;
pub use marker::{FailureMarker, FailureMarkerRecord};
pub use ownership::{LockClaim, OwnershipLock};
pub use record::{StageRecord, StageRecordStore, StageState};

use stagecraft_schema::StageId;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// On Linux with ext4 `data=ordered` (the default), renames are usually
/// durable without an explicit dir fsync, but POSIX does not guarantee this.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("integrity check failed for '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("invalid key '{0}': keys must match [A-Za-z0-9_.-] and not start with '.'")]
    InvalidKey(String),
    #[error("ttl out of range: {0:?}")]
    InvalidTtl(std::time::Duration),
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("stage is already claimed (held by stage {holder})")]
    AlreadyClaimed { holder: StageId },
    #[error("caller does not own stage {0}")]
    NotOwner(StageId),
    #[error(
        "failure marker present at {} (stage {stage_id}): {message}",
        path.display()
    )]
    FailureMarkerExists {
        stage_id: String,
        message: String,
        path: PathBuf,
    },
    #[error("state format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_already_claimed() {
        let e = StoreError::AlreadyClaimed {
            holder: StageId::new("abc123"),
        };
        assert!(e.to_string().contains("abc123"));
    }

    #[test]
    fn store_error_display_not_owner() {
        let e = StoreError::NotOwner(StageId::new("s1"));
        assert!(e.to_string().contains("does not own stage s1"));
    }

    #[test]
    fn store_error_display_marker_exists() {
        let e = StoreError::FailureMarkerExists {
            stage_id: "s9".to_owned(),
            message: "apply interrupted".to_owned(),
            path: PathBuf::from("/state/default.apply-failure.json"),
        };
        let msg = e.to_string();
        assert!(msg.contains("s9"));
        assert!(msg.contains("apply interrupted"));
        assert!(msg.contains("default.apply-failure.json"));
    }

    #[test]
    fn store_error_display_invalid_key() {
        let e = StoreError::InvalidKey("../etc".to_owned());
        assert!(e.to_string().contains("../etc"));
    }

    #[test]
    fn store_error_display_version_mismatch() {
        let e = StoreError::VersionMismatch {
            expected: 2,
            found: 1,
        };
        let msg = e.to_string();
        assert!(msg.contains('2'));
        assert!(msg.contains('1'));
    }

    #[test]
    fn store_error_display_integrity_failure() {
        let e = StoreError::IntegrityFailure {
            key: "k".to_owned(),
            expected: "exp".to_owned(),
            actual: "act".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("exp"));
        assert!(msg.contains("act"));
    }
}
