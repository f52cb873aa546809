use crate::CoreError;
use serde::{Deserialize, Serialize};
use stagecraft_store::{KeyValueStore, KeyValueStoreExt, PathResolver};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Digest recorded for an absent lock file.
pub const ABSENT: &str = "absent";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockFileHash {
    pub digest: String,
    pub recorded_at: String,
}

/// Detects out-of-band changes to the active lock file between `create()`
/// and the transitions that fold the stage back.
pub struct LockFileDriftDetector {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    lock_file: PathBuf,
}

impl LockFileDriftDetector {
    pub fn new(kv: Arc<dyn KeyValueStore>, paths: &PathResolver) -> Self {
        Self {
            kv,
            key: paths.state_key("lock_file_hash"),
            lock_file: paths.active_lock_file(),
        }
    }

    /// blake3 of the file's bytes, or [`ABSENT`] when it does not exist.
    pub fn hash_file(path: &Path) -> Result<String, CoreError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(blake3::hash(&bytes).to_hex().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ABSENT.to_owned()),
            Err(e) => Err(e.into()),
        }
    }

    /// Store the current digest, replacing any earlier one.
    pub fn record(&self) -> Result<LockFileHash, CoreError> {
        let hash = LockFileHash {
            digest: Self::hash_file(&self.lock_file)?,
            recorded_at: chrono::Utc::now().to_rfc3339(),
        };
        self.kv.set_json(&self.key, &hash, None)?;
        info!(
            "recorded lock file hash {} for {}",
            &hash.digest[..12.min(hash.digest.len())],
            self.lock_file.display()
        );
        Ok(hash)
    }

    pub fn stored(&self) -> Result<Option<LockFileHash>, CoreError> {
        Ok(self.kv.get_json(&self.key)?)
    }

    /// Fail with [`CoreError::DriftDetected`] unless the lock file still
    /// matches the recorded digest. A missing record counts as drift.
    pub fn check(&self) -> Result<(), CoreError> {
        let actual = Self::hash_file(&self.lock_file)?;
        let expected = match self.stored()? {
            Some(hash) => hash.digest,
            None => ABSENT.to_owned() + " (no recorded hash)",
        };
        if expected != actual {
            return Err(CoreError::DriftDetected {
                path: self.lock_file.clone(),
                expected,
                actual,
            });
        }
        debug!("lock file unchanged since create");
        Ok(())
    }

    pub fn forget(&self) -> Result<(), CoreError> {
        self.kv.delete(&self.key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagecraft_schema::StageConfig;
    use stagecraft_store::MemoryKvStore;
    use std::fs;

    fn setup() -> (tempfile::TempDir, LockFileDriftDetector, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let paths = PathResolver::new(&StageConfig::for_active_root(dir.path().join("app")));
        fs::create_dir_all(paths.active_root()).unwrap();
        let lock = paths.active_lock_file();
        fs::write(&lock, r#"{"packages":[]}"#).unwrap();
        let detector = LockFileDriftDetector::new(Arc::new(MemoryKvStore::new()), &paths);
        (dir, detector, lock)
    }

    #[test]
    fn unchanged_file_passes() {
        let (_dir, detector, _lock) = setup();
        detector.record().unwrap();
        detector.check().unwrap();
    }

    #[test]
    fn changed_file_is_drift() {
        let (_dir, detector, lock) = setup();
        detector.record().unwrap();
        fs::write(&lock, r#"{"packages":[{"name":"acme/x"}]}"#).unwrap();
        assert!(matches!(
            detector.check(),
            Err(CoreError::DriftDetected { .. })
        ));
    }

    #[test]
    fn deleted_file_is_drift() {
        let (_dir, detector, lock) = setup();
        detector.record().unwrap();
        fs::remove_file(&lock).unwrap();
        let err = detector.check().unwrap_err();
        assert!(err.to_string().contains(ABSENT));
    }

    #[test]
    fn missing_record_is_drift() {
        let (_dir, detector, _lock) = setup();
        assert!(detector.check().is_err());
        detector.record().unwrap();
        detector.forget().unwrap();
        assert!(detector.stored().unwrap().is_none());
        assert!(detector.check().is_err());
    }

    #[test]
    fn record_overwrites() {
        let (_dir, detector, lock) = setup();
        let first = detector.record().unwrap();
        fs::write(&lock, "changed").unwrap();
        let second = detector.record().unwrap();
        assert_ne!(first.digest, second.digest);
        detector.check().unwrap();
    }

    #[test]
    fn hash_of_missing_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            LockFileDriftDetector::hash_file(&dir.path().join("nope")).unwrap(),
            ABSENT
        );
    }
}
