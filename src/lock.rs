// Environment-scoped lease lock
//
// The lease is a record in the shared store, not an in-process flag, so a crashed run
// cannot block future runs past its expiry. Holders renew on a heartbeat while they work
// and before every status write.

use crate::clock::Clock;
use crate::store::RemoteStore;
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const LOCK_PREFIX: &str = "_locks/";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub scope: String,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Unique owner id for this process and invocation.
pub fn owner_id() -> String {
    format!("pid{}-{}", std::process::id(), Uuid::new_v4().simple())
}

#[derive(Clone)]
pub struct LeaseLock {
    store: RemoteStore,
    ttl: Duration,
    clock: Clock,
}

impl LeaseLock {
    pub fn new(store: RemoteStore, ttl: Duration, clock: Clock) -> Self {
        Self { store, ttl, clock }
    }

    fn key(scope: &str) -> String {
        format!("{}{}.lease", LOCK_PREFIX, scope)
    }

    fn expiry(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| VaultError::Configuration(format!("invalid lease ttl: {}", e)))?;
        Ok(now + ttl)
    }

    async fn read(&self, scope: &str) -> Result<Option<LeaseRecord>> {
        match self.store.read_record(&Self::key(scope)).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Current holder, if any.
    pub async fn holder(&self, scope: &str) -> Result<Option<LeaseRecord>> {
        self.read(scope).await
    }

    /// Take the lease or fail with `LockContention`. An expired lease is taken over.
    pub async fn acquire(&self, scope: &str, owner: &str) -> Result<Lease> {
        for _ in 0..3 {
            let now = self.clock.now();
            let record = LeaseRecord {
                scope: scope.to_string(),
                owner: owner.to_string(),
                acquired_at: now,
                expires_at: self.expiry(now)?,
                heartbeat_at: now,
            };

            if self
                .store
                .create_record(&Self::key(scope), serde_json::to_vec(&record)?)
                .await?
            {
                info!(scope = %scope, owner = %owner, expires_at = %record.expires_at, "Lease acquired");
                return Ok(Lease {
                    lock: self.clone(),
                    record,
                });
            }

            match self.read(scope).await? {
                None => continue,
                Some(held) if !held.is_expired(now) => {
                    return Err(VaultError::LockContention(format!(
                        "{} is held by {} until {}",
                        scope, held.owner, held.expires_at
                    )));
                }
                Some(stale) => {
                    warn!(
                        scope = %scope,
                        stale_owner = %stale.owner,
                        expired_at = %stale.expires_at,
                        "Taking over expired lease"
                    );
                    self.clear_expired(scope, owner, &stale).await?;
                }
            }
        }
        Err(VaultError::LockContention(format!("{} is contended", scope)))
    }

    /// Delete an expired lease record.
    ///
    /// The delete happens only while holding the scope's takeover claim, and only if the
    /// record is still the exact one found expired. A contender that loses the claim never
    /// deletes anything; once it wins a later claim it re-reads and sees the fresh lease.
    async fn clear_expired(&self, scope: &str, owner: &str, stale: &LeaseRecord) -> Result<()> {
        let claim_key = Self::claim_key(scope);
        let now = self.clock.now();
        let claim = TakeoverClaim {
            owner: owner.to_string(),
            claimed_at: now,
        };
        if !self.store.create_record(&claim_key, serde_json::to_vec(&claim)?).await? {
            // A claim left by a contender that died mid-takeover expires like a lease
            if let Some(data) = self.store.read_record(&claim_key).await? {
                let held: TakeoverClaim = serde_json::from_slice(&data)?;
                if self.expiry(held.claimed_at)? <= now {
                    warn!(scope = %scope, claimant = %held.owner, "Removing abandoned takeover claim");
                    self.store.delete(&claim_key).await?;
                }
            }
            debug!(scope = %scope, "Another contender is taking over the lease");
            return Ok(());
        }

        let cleared = async {
            if self.read(scope).await?.as_ref() == Some(stale) {
                self.store.delete(&Self::key(scope)).await?;
            }
            Ok::<(), VaultError>(())
        }
        .await;
        self.store.delete(&claim_key).await?;
        cleared
    }

    fn claim_key(scope: &str) -> String {
        format!("{}{}.takeover", LOCK_PREFIX, scope)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TakeoverClaim {
    owner: String,
    claimed_at: DateTime<Utc>,
}

/// A held lease. Release it on every exit path.
pub struct Lease {
    lock: LeaseLock,
    record: LeaseRecord,
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl Lease {
    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }

    /// How often a holder renews: a third of the lease duration.
    pub fn renew_interval(&self) -> Duration {
        (self.lock.ttl / 3).max(Duration::from_secs(1))
    }

    /// Extend the expiry. Fails if the lease was lost to another owner.
    pub async fn renew(&mut self) -> Result<()> {
        let scope = self.record.scope.clone();
        match self.lock.read(&scope).await? {
            Some(current) if current.owner == self.record.owner => {}
            _ => {
                return Err(VaultError::LockContention(format!(
                    "lease on {} was lost",
                    scope
                )))
            }
        }
        let now = self.lock.clock.now();
        self.record.heartbeat_at = now;
        self.record.expires_at = self.lock.expiry(now)?;
        self.lock
            .store
            .write_record(&LeaseLock::key(&scope), serde_json::to_vec(&self.record)?)
            .await?;
        debug!(scope = %scope, expires_at = %self.record.expires_at, "Lease renewed");
        Ok(())
    }

    /// Delete the lease record if we still own it.
    pub async fn release(self) -> Result<()> {
        let scope = &self.record.scope;
        match self.lock.read(scope).await? {
            Some(current) if current.owner == self.record.owner => {
                self.lock.store.delete(&LeaseLock::key(scope)).await?;
                info!(scope = %scope, owner = %self.record.owner, "Lease released");
            }
            _ => warn!(scope = %scope, "Lease already gone at release"),
        }
        Ok(())
    }
}
