use crate::lock::StoreLock;
use crate::{fsync_dir, StoreError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Shared string key/value store with optional per-entry expiry.
///
/// Expired entries behave exactly like absent ones for every operation.
/// [`compare_and_swap`](Self::compare_and_swap) is the single atomic
/// primitive: implementations must run its check and its write inside one
/// critical section.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Replace the live value of `key` with `new` (or delete it when `new` is
    /// `None`) only if the live value currently equals `expected`.
    ///
    /// Returns `false`, writing nothing, when the comparison fails.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// JSON helpers over any [`KeyValueStore`].
pub trait KeyValueStoreExt: KeyValueStore {
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl)
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let ok = !key.is_empty()
        && key.len() <= 128
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_owned()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

impl FileEntry {
    fn new(value: &str, ttl: Option<Duration>) -> Result<Self, StoreError> {
        let expires_at = match ttl {
            Some(ttl) => {
                let delta = chrono::Duration::from_std(ttl).map_err(|_| StoreError::InvalidTtl(ttl))?;
                Some(
                    Utc::now()
                        .checked_add_signed(delta)
                        .ok_or(StoreError::InvalidTtl(ttl))?,
                )
            }
            None => None,
        };
        Ok(Self {
            value: value.to_owned(),
            expires_at,
        })
    }

    fn is_live(&self) -> bool {
        !matches!(self.expires_at, Some(at) if Utc::now() >= at)
    }
}

/// File-backed [`KeyValueStore`]: one JSON file per key, atomic renames for
/// writes, and an exclusive [`StoreLock`] around every mutation so
/// concurrent processes sharing the directory serialize.
pub struct FileKvStore {
    dir: PathBuf,
}

impl FileKvStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn lock(&self) -> Result<StoreLock, StoreError> {
        fs::create_dir_all(&self.dir)?;
        StoreLock::acquire(&self.dir.join(".lock"))
    }

    fn read_live(&self, key: &str) -> Result<Option<FileEntry>, StoreError> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<FileEntry>(&content) {
            Ok(entry) if entry.is_live() => Ok(Some(entry)),
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("treating corrupt kv entry {} as absent: {e}", path.display());
                Ok(None)
            }
        }
    }

    fn write_entry(&self, key: &str, entry: &FileEntry) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(entry)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.entry_path(key))
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&self.dir)?;
        Ok(())
    }

    fn remove_entry(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => {
                fsync_dir(&self.dir)?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl KeyValueStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        validate_key(key)?;
        Ok(self.read_live(key)?.map(|e| e.value))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        validate_key(key)?;
        let entry = FileEntry::new(value, ttl)?;
        let _lock = self.lock()?;
        self.write_entry(key, &entry)?;
        debug!("kv set {key}");
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        validate_key(key)?;
        let _lock = self.lock()?;
        let current = self.read_live(key)?;
        if current.as_ref().map(|e| e.value.as_str()) != expected {
            debug!("kv compare_and_swap {key}: comparison failed");
            return Ok(false);
        }
        match new {
            Some(value) => self.write_entry(key, &FileEntry::new(value, ttl)?)?,
            None => self.remove_entry(key)?,
        }
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let _lock = self.lock()?;
        self.remove_entry(key)
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self) -> bool {
        !matches!(self.expires_at, Some(at) if Instant::now() >= at)
    }
}

/// In-process [`KeyValueStore`], for tests and single-process hosts.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|e| StoreError::LockFailed(format!("kv mutex poisoned: {e}")))
    }

    fn entry(value: &str, ttl: Option<Duration>) -> Result<MemoryEntry, StoreError> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                Instant::now()
                    .checked_add(ttl)
                    .ok_or(StoreError::InvalidTtl(ttl))?,
            ),
            None => None,
        };
        Ok(MemoryEntry {
            value: value.to_owned(),
            expires_at,
        })
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        validate_key(key)?;
        let entries = self.entries()?;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value.clone()))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        validate_key(key)?;
        let entry = Self::entry(value, ttl)?;
        self.entries()?.insert(key.to_owned(), entry);
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError> {
        validate_key(key)?;
        let mut entries = self.entries()?;
        let current = entries
            .get(key)
            .filter(|e| e.is_live())
            .map(|e| e.value.as_str());
        if current != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                let entry = Self::entry(value, ttl)?;
                entries.insert(key.to_owned(), entry);
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.entries()?.remove(key);
        Ok(())
    }
}
