use crate::StoreError;
use serde::{Deserialize, Serialize};
use stagecraft_schema::{SiteKey, StageConfig, StageId};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Current state directory format version. Incremented on incompatible layout changes.
pub const STATE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout for one site: the live codebase, its per-stage staging
/// directories, and the state directory holding the key/value store and the
/// failure marker.
///
/// A pure function of configuration. Nothing is touched on disk until
/// [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct PathResolver {
    site: SiteKey,
    active_root: PathBuf,
    vendor_dir: PathBuf,
    lock_file: PathBuf,
    staging_root: PathBuf,
    state_dir: PathBuf,
    exclude: Vec<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateVersion {
    format_version: u32,
}

impl PathResolver {
    pub fn new(config: &StageConfig) -> Self {
        Self {
            site: config.site_key(),
            active_root: config.site.active_root.clone(),
            vendor_dir: config.site.vendor_dir.clone(),
            lock_file: config.site.lock_file.clone(),
            staging_root: config.site.staging_root.clone(),
            state_dir: config.site.state_dir.clone(),
            exclude: config.site.exclude.clone(),
        }
    }

    #[inline]
    pub fn site(&self) -> &SiteKey {
        &self.site
    }

    #[inline]
    pub fn active_root(&self) -> &Path {
        &self.active_root
    }

    #[inline]
    pub fn vendor_dir(&self) -> PathBuf {
        self.active_root.join(&self.vendor_dir)
    }

    /// Lock file path relative to a codebase root.
    #[inline]
    pub fn lock_file_name(&self) -> &Path {
        &self.lock_file
    }

    #[inline]
    pub fn active_lock_file(&self) -> PathBuf {
        self.active_root.join(&self.lock_file)
    }

    /// Parent of every staging directory belonging to this site.
    #[inline]
    pub fn staging_base(&self) -> PathBuf {
        self.staging_root.join(self.site.as_str())
    }

    #[inline]
    pub fn stage_dir(&self, stage_id: &StageId) -> PathBuf {
        self.staging_base().join(stage_id.as_str())
    }

    #[inline]
    pub fn staged_lock_file(&self, stage_id: &StageId) -> PathBuf {
        self.stage_dir(stage_id).join(&self.lock_file)
    }

    #[inline]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    #[inline]
    pub fn kv_dir(&self) -> PathBuf {
        self.state_dir.join("kv")
    }

    #[inline]
    pub fn store_lock_file(&self) -> PathBuf {
        self.kv_dir().join(".lock")
    }

    /// Fixed location of the apply failure marker. Never inside a staging directory.
    #[inline]
    pub fn failure_marker_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.apply-failure.json", self.site))
    }

    /// Key under which a piece of per-site state lives in the key/value store.
    pub fn state_key(&self, name: &str) -> String {
        format!("{}.{name}", self.site)
    }

    /// Paths, relative to a codebase root, that copies between the active
    /// root and a staging directory must neither copy nor delete.
    ///
    /// Includes the configured exclusions plus the staging root and state
    /// directory whenever they are nested inside the active root.
    pub fn exclusions(&self) -> Vec<PathBuf> {
        let mut out = self.exclude.clone();
        for nested in [&self.staging_root, &self.state_dir] {
            if let Ok(rel) = nested.strip_prefix(&self.active_root) {
                if !rel.as_os_str().is_empty() {
                    out.push(rel.to_path_buf());
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.state_dir)?;
        fs::create_dir_all(self.kv_dir())?;
        fs::create_dir_all(self.staging_base())?;

        let version_path = self.state_dir.join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StateVersion {
                format_version: STATE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            let mut tmp = NamedTempFile::new_in(&self.state_dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&version_path)
                .map_err(|e| StoreError::Io(e.error))?;
            crate::fsync_dir(&self.state_dir)?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.state_dir.join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StateVersion = serde_json::from_str(&content)?;

        if ver.format_version != STATE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STATE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}
