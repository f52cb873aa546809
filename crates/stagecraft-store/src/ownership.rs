use crate::kv::KeyValueStore;
use crate::StoreError;
use serde::{Deserialize, Serialize};
use stagecraft_schema::{OwnerToken, SiteKey, StageId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Number of compare-and-swap attempts before a contended claim gives up.
const CLAIM_ATTEMPTS: usize = 3;

/// The persisted claim: which stage holds the site and who drives it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockClaim {
    pub stage_id: StageId,
    pub owner: OwnerToken,
    pub claimed_at: String,
}

/// Single-writer claim over a site's stage, backed by a [`KeyValueStore`].
///
/// The claim is one key per site, written with a TTL. It lapses silently
/// when not renewed, so an abandoned stage becomes claimable again.
pub struct OwnershipLock {
    kv: Arc<dyn KeyValueStore>,
    key: String,
}

impl OwnershipLock {
    pub fn new(kv: Arc<dyn KeyValueStore>, site: &SiteKey) -> Self {
        Self {
            kv,
            key: format!("{site}.stage_lock"),
        }
    }

    /// Claim the site for `stage_id` on behalf of `owner`.
    ///
    /// Re-claiming with the same stage and owner renews the TTL. Any other
    /// live claim, including one that wins a concurrent race, yields
    /// [`StoreError::AlreadyClaimed`].
    pub fn claim(
        &self,
        stage_id: &StageId,
        owner: &OwnerToken,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        for _ in 0..CLAIM_ATTEMPTS {
            let current_raw = self.kv.get(&self.key)?;
            let claimed_at = match current_raw.as_deref().map(parse_claim).transpose()? {
                Some(existing) if existing.stage_id == *stage_id && existing.owner == *owner => {
                    existing.claimed_at
                }
                Some(existing) => {
                    return Err(StoreError::AlreadyClaimed {
                        holder: existing.stage_id,
                    })
                }
                None => chrono::Utc::now().to_rfc3339(),
            };
            let claim = LockClaim {
                stage_id: stage_id.clone(),
                owner: owner.clone(),
                claimed_at,
            };
            let new_raw = serde_json::to_string(&claim)?;
            if self.kv.compare_and_swap(
                &self.key,
                current_raw.as_deref(),
                Some(&new_raw),
                Some(ttl),
            )? {
                info!("stage {stage_id} claimed by {owner}");
                return Ok(());
            }
            debug!("claim of {stage_id} lost a race, retrying");
        }

        match self.current()? {
            Some(existing) => Err(StoreError::AlreadyClaimed {
                holder: existing.stage_id,
            }),
            None => Err(StoreError::LockFailed(format!(
                "claim of {stage_id} kept losing races"
            ))),
        }
    }

    /// Fail closed with [`StoreError::NotOwner`] unless `owner` holds a live
    /// claim on `stage_id`.
    pub fn verify(&self, stage_id: &StageId, owner: &OwnerToken) -> Result<(), StoreError> {
        match self.current()? {
            Some(claim) if claim.stage_id == *stage_id && claim.owner == *owner => Ok(()),
            _ => Err(StoreError::NotOwner(stage_id.clone())),
        }
    }

    /// Extend a claim the caller already holds.
    pub fn renew(
        &self,
        stage_id: &StageId,
        owner: &OwnerToken,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.verify(stage_id, owner)?;
        self.claim(stage_id, owner, ttl)
            .map_err(|_| StoreError::NotOwner(stage_id.clone()))
    }

    /// Drop the claim if it belongs to `stage_id`. Claims held by other
    /// stages are left alone.
    pub fn release(&self, stage_id: &StageId) -> Result<(), StoreError> {
        let Some(current_raw) = self.kv.get(&self.key)? else {
            return Ok(());
        };
        let claim = parse_claim(&current_raw)?;
        if claim.stage_id != *stage_id {
            debug!(
                "not releasing claim held by {} on behalf of {stage_id}",
                claim.stage_id
            );
            return Ok(());
        }
        if self
            .kv
            .compare_and_swap(&self.key, Some(&current_raw), None, None)?
        {
            info!("stage {stage_id} released");
        }
        Ok(())
    }

    /// The live claim, if any.
    pub fn current(&self) -> Result<Option<LockClaim>, StoreError> {
        self.kv
            .get(&self.key)?
            .as_deref()
            .map(parse_claim)
            .transpose()
    }
}

fn parse_claim(raw: &str) -> Result<LockClaim, StoreError> {
    Ok(serde_json::from_str(raw)?)
}
