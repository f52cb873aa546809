use crate::{fsync_dir, StoreError};
use serde::{Deserialize, Serialize};
use stagecraft_schema::StageId;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Crash witness written before an apply starts copying into the live codebase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureMarkerRecord {
    pub stage_id: StageId,
    pub message: String,
    #[serde(default)]
    pub cause_class: Option<String>,
    #[serde(default)]
    pub cause_message: Option<String>,
    #[serde(default)]
    pub cause_trace: Option<String>,
    pub written_at: String,
}

impl FailureMarkerRecord {
    pub fn new(stage_id: &StageId, message: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.clone(),
            message: message.into(),
            cause_class: None,
            cause_message: None,
            cause_trace: None,
            written_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn has_cause(&self) -> bool {
        self.cause_class.is_some() || self.cause_message.is_some() || self.cause_trace.is_some()
    }
}

/// The single on-disk failure marker of a site.
///
/// `write` refuses to replace an existing marker: a prior crash record is
/// evidence an operator must see. While a marker exists no lifecycle
/// transition may start ([`assert_not_exists`](Self::assert_not_exists)).
pub struct FailureMarker {
    path: PathBuf,
}

impl FailureMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn write(&self, record: &FailureMarkerRecord) -> Result<(), StoreError> {
        let dir = self.parent_dir()?;
        fs::create_dir_all(&dir)?;
        let content = serde_json::to_string_pretty(record)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        match tmp.persist_noclobber(&self.path) {
            Ok(_) => {}
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(self.exists_error());
            }
            Err(e) => return Err(StoreError::Io(e.error)),
        }
        fsync_dir(&dir)?;
        info!(
            "failure marker written for stage {} at {}",
            record.stage_id,
            self.path.display()
        );
        Ok(())
    }

    pub fn read(&self) -> Result<Option<FailureMarkerRecord>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                fsync_dir(&self.parent_dir()?)?;
                debug!("failure marker cleared at {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Hard stop: fails with [`StoreError::FailureMarkerExists`] whenever a
    /// marker is present, readable or not.
    pub fn assert_not_exists(&self) -> Result<(), StoreError> {
        if self.exists() {
            return Err(self.exists_error());
        }
        Ok(())
    }

    /// Record why the interrupted apply failed.
    ///
    /// Only fills a marker that has no cause yet; stage id, message and any
    /// earlier cause are never replaced. Returns whether the cause was written.
    pub fn annotate_cause(
        &self,
        class: &str,
        message: &str,
        trace: &str,
    ) -> Result<bool, StoreError> {
        let Some(mut record) = self.read()? else {
            warn!("no failure marker to annotate at {}", self.path.display());
            return Ok(false);
        };
        if record.has_cause() {
            debug!("failure marker already carries a cause; leaving it");
            return Ok(false);
        }
        record.cause_class = Some(class.to_owned());
        record.cause_message = Some(message.to_owned());
        record.cause_trace = Some(trace.to_owned());

        let dir = self.parent_dir()?;
        let content = serde_json::to_string_pretty(&record)?;
        let mut tmp = NamedTempFile::new_in(&dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&dir)?;
        Ok(true)
    }

    fn exists_error(&self) -> StoreError {
        let (stage_id, message) = match self.read() {
            Ok(Some(record)) => (record.stage_id.into_inner(), record.message),
            Ok(None) => ("unknown".to_owned(), "marker vanished while reading".to_owned()),
            Err(e) => ("unknown".to_owned(), format!("unreadable marker: {e}")),
        };
        StoreError::FailureMarkerExists {
            stage_id,
            message,
            path: self.path.clone(),
        }
    }

    fn parent_dir(&self) -> Result<PathBuf, StoreError> {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .ok_or_else(|| {
                StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("marker path {} has no parent", self.path.display()),
                ))
            })
    }
}
