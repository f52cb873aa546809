use crate::types::SiteKey;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Conventional file name for a site configuration.
pub const CONFIG_FILE_NAME: &str = "stagecraft.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("site.key must match [a-z0-9_-] and be 1-64 characters, got '{0}'")]
    InvalidSiteKey(String),
    #[error("site.active_root must not be empty")]
    EmptyActiveRoot,
    #[error("site.{field} must be a relative path inside the active root, got '{value}'")]
    NotRelative { field: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("executor.program must not be empty")]
    EmptyProgram,
}

/// Parsed `stagecraft.toml`.
///
/// Paths are stored as written; [`StageConfig::resolve_relative_to`] anchors
/// relative `active_root`, `staging_root` and `state_dir` against the
/// directory the file was loaded from.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub site: SiteSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub lock: LockSection,
    #[serde(default)]
    pub status: StatusSection,
    #[serde(default)]
    pub validators: ValidatorsSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SiteSection {
    #[serde(default = "default_site_key")]
    pub key: String,
    pub active_root: PathBuf,
    #[serde(default = "default_vendor_dir")]
    pub vendor_dir: PathBuf,
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,
    #[serde(default = "default_staging_root")]
    pub staging_root: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub exclude: Vec<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExecutorSection {
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            program: default_program(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LockSection {
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StatusSection {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for StatusSection {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ValidatorsSection {
    #[serde(default = "default_min_free_mb")]
    pub min_free_mb: u64,
    #[serde(default)]
    pub required_executables: Vec<String>,
}

impl Default for ValidatorsSection {
    fn default() -> Self {
        Self {
            min_free_mb: default_min_free_mb(),
            required_executables: Vec::new(),
        }
    }
}

fn default_site_key() -> String {
    "default".to_owned()
}

fn default_vendor_dir() -> PathBuf {
    PathBuf::from("vendor")
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("composer.lock")
}

fn default_staging_root() -> PathBuf {
    std::env::temp_dir().join("stagecraft")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".stagecraft")
}

fn default_program() -> String {
    "composer".to_owned()
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_lock_ttl_secs() -> u64 {
    3600
}

fn default_cache_ttl_secs() -> u64 {
    86_400
}

fn default_min_free_mb() -> u64 {
    100
}

impl StageConfig {
    /// Minimal configuration for a codebase rooted at `active_root`, with
    /// staging and state directories placed next to it.
    pub fn for_active_root(active_root: impl Into<PathBuf>) -> Self {
        let active_root = active_root.into();
        let parent = active_root
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self {
            site: SiteSection {
                key: default_site_key(),
                active_root,
                vendor_dir: default_vendor_dir(),
                lock_file: default_lock_file(),
                staging_root: parent.join("staging"),
                state_dir: parent.join("state"),
                exclude: Vec::new(),
            },
            executor: ExecutorSection::default(),
            lock: LockSection::default(),
            status: StatusSection::default(),
            validators: ValidatorsSection::default(),
        }
    }

    /// Check field-level invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let key = &self.site.key;
        if key.is_empty()
            || key.len() > 64
            || !key
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_' || b == b'-')
        {
            return Err(ConfigError::InvalidSiteKey(key.clone()));
        }
        if self.site.active_root.as_os_str().is_empty() {
            return Err(ConfigError::EmptyActiveRoot);
        }
        ensure_relative("lock_file", &self.site.lock_file)?;
        ensure_relative("vendor_dir", &self.site.vendor_dir)?;
        for excluded in &self.site.exclude {
            ensure_relative("exclude", excluded)?;
        }
        if self.executor.program.trim().is_empty() {
            return Err(ConfigError::EmptyProgram);
        }
        if self.executor.timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration("executor.timeout_secs"));
        }
        if self.lock.ttl_secs == 0 {
            return Err(ConfigError::ZeroDuration("lock.ttl_secs"));
        }
        if self.status.cache_ttl_secs == 0 {
            return Err(ConfigError::ZeroDuration("status.cache_ttl_secs"));
        }
        Ok(())
    }

    /// Anchor relative root paths against `base`.
    #[must_use]
    pub fn resolve_relative_to(mut self, base: &Path) -> Self {
        for path in [
            &mut self.site.active_root,
            &mut self.site.staging_root,
            &mut self.site.state_dir,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        self
    }

    pub fn site_key(&self) -> SiteKey {
        SiteKey::new(self.site.key.clone())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock.ttl_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.status.cache_ttl_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.executor.timeout_secs)
    }
}

fn ensure_relative(field: &'static str, path: &Path) -> Result<(), ConfigError> {
    let escapes = path
        .components()
        .any(|c| matches!(c, std::path::Component::ParentDir));
    if path.as_os_str().is_empty() || path.is_absolute() || escapes {
        return Err(ConfigError::NotRelative {
            field,
            value: path.display().to_string(),
        });
    }
    Ok(())
}

pub fn parse_config_str(input: &str) -> Result<StageConfig, ConfigError> {
    let config: StageConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

/// Parse and validate a config file, resolving relative roots against the
/// file's directory.
pub fn parse_config_file(path: impl AsRef<Path>) -> Result<StageConfig, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let config = parse_config_str(&content)?;
    let base = path.parent().unwrap_or(Path::new("."));
    Ok(config.resolve_relative_to(base))
}
