use crate::kv::KeyValueStore;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use stagecraft_schema::{OwnerToken, SiteKey, StageId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StageState {
    Available,
    Created,
    Staged,
    Applying,
    Applied,
    Destroyed,
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageState::Available => write!(f, "available"),
            StageState::Created => write!(f, "created"),
            StageState::Staged => write!(f, "staged"),
            StageState::Applying => write!(f, "applying"),
            StageState::Applied => write!(f, "applied"),
            StageState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Persisted view of the site's current stage, stored alongside the claim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageRecord {
    pub stage_id: StageId,
    pub owner: OwnerToken,
    pub state: StageState,
    pub active_root: PathBuf,
    pub staging_root: PathBuf,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: String,
    pub updated_at: String,
    /// blake3 checksum for integrity verification. `None` before the first write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl StageRecord {
    /// Compute the checksum over the record content (excluding the checksum field itself).
    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        let json = serde_json::to_string_pretty(&copy)?;
        Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
    }
}

pub struct StageRecordStore {
    kv: Arc<dyn KeyValueStore>,
    key: String,
}

impl StageRecordStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, site: &SiteKey) -> Self {
        Self {
            kv,
            key: format!("{site}.stage"),
        }
    }

    /// Write the record with a fresh checksum. `ttl` matches the claim's so
    /// the record lapses together with it.
    pub fn put(&self, record: &StageRecord, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut with_checksum = record.clone();
        with_checksum.checksum = Some(with_checksum.compute_checksum()?);
        let content = serde_json::to_string_pretty(&with_checksum)?;
        self.kv.set(&self.key, &content, ttl)
    }

    pub fn get(&self) -> Result<Option<StageRecord>, StoreError> {
        let Some(content) = self.kv.get(&self.key)? else {
            return Ok(None);
        };
        let record: StageRecord = serde_json::from_str(&content)?;

        if let Some(ref expected) = record.checksum {
            let actual = record.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    key: self.key.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(Some(record))
    }

    pub fn remove(&self) -> Result<(), StoreError> {
        self.kv.delete(&self.key)
    }
}
