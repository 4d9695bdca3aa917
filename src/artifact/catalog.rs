// Artifact catalog - JSON records under reserved prefixes of the shared store
//
//   _catalog/{artifact name}.json              artifact record (status, sizes, checksum)
//   _verifications/{artifact name}/{ts}-{id}.json  append-only verification records
//   _restores/{job id}.json                    restore jobs
//
// Nothing here is cached across calls; every read goes back to the store.

use super::naming::{parse_wal_object_name, wal_prefix, ArtifactName};
use super::types::{
    ArtifactStatus, BackupArtifact, RestoreJob, RestoreStatus, VerificationRecord, WalPosition,
    WalSegment,
};
use crate::store::{ObjectInfo, RemoteStore};
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::warn;

pub const CATALOG_PREFIX: &str = "_catalog/";
pub const VERIFICATION_PREFIX: &str = "_verifications/";
pub const RESTORE_PREFIX: &str = "_restores/";

// WAL object metadata keys
pub const WAL_SEQUENCE: &str = "sequence";
pub const WAL_FILE_NAME: &str = "file-name";
pub const WAL_START: &str = "start-position";
pub const WAL_END: &str = "end-position";
pub const WAL_LAST_COMMIT: &str = "last-commit";
pub const WAL_LAST_XID: &str = "last-xid";
pub const WAL_RAW_SIZE: &str = "raw-size";

#[derive(Clone)]
pub struct Catalog {
    store: RemoteStore,
}

impl Catalog {
    pub fn new(store: RemoteStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &RemoteStore {
        &self.store
    }

    fn record_name(artifact: &str) -> String {
        format!("{}{}.json", CATALOG_PREFIX, artifact)
    }

    async fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        match self.store.read_record(name).await? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    /// Claim an artifact name. Returns false when the name is already taken.
    pub async fn reserve(&self, artifact: &BackupArtifact) -> Result<bool> {
        self.store
            .create_record(&Self::record_name(&artifact.name), serde_json::to_vec_pretty(artifact)?)
            .await
    }

    /// Write a record. A stored record is only replaced by the same or a later status, so a
    /// record another run marked FAILED is never revived.
    pub async fn save(&self, artifact: &BackupArtifact) -> Result<()> {
        if let Some(stored) = self.load(&artifact.name).await? {
            if stored.status != artifact.status && !stored.status.can_transition_to(artifact.status) {
                return Err(VaultError::InvalidTransition(format!(
                    "{}: stored record is {}, refusing {}",
                    artifact.name, stored.status, artifact.status
                )));
            }
        }
        self.store
            .write_record(&Self::record_name(&artifact.name), serde_json::to_vec_pretty(artifact)?)
            .await
    }

    pub async fn load(&self, name: &str) -> Result<Option<BackupArtifact>> {
        self.read_json(&Self::record_name(name)).await
    }

    /// Load a record that must exist.
    pub async fn get(&self, name: &str) -> Result<BackupArtifact> {
        self.load(name)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("artifact {}", name)))
    }

    /// All records of an environment, oldest first.
    pub async fn list(&self, environment: &str) -> Result<Vec<BackupArtifact>> {
        let prefix = format!("{}{}/", CATALOG_PREFIX, environment);
        let mut named = Vec::new();
        for record in self.store.list(&prefix).await? {
            let Some(artifact_name) = record
                .strip_prefix(CATALOG_PREFIX)
                .and_then(|n| n.strip_suffix(".json"))
            else {
                continue;
            };
            let Ok(parsed) = artifact_name.parse::<ArtifactName>() else {
                warn!(record = %record, "Ignoring catalog record with foreign name");
                continue;
            };
            if let Some(artifact) = self.read_json::<BackupArtifact>(&record).await? {
                named.push((parsed, artifact));
            }
        }
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(named.into_iter().map(|(_, a)| a).collect())
    }

    /// Records visible to restore, verify, monitor and retention.
    pub async fn discoverable(&self, environment: &str) -> Result<Vec<BackupArtifact>> {
        Ok(self
            .list(environment)
            .await?
            .into_iter()
            .filter(|a| a.status.is_discoverable())
            .collect())
    }

    pub async fn latest_discoverable(&self, environment: &str) -> Result<Option<BackupArtifact>> {
        Ok(self.discoverable(environment).await?.pop())
    }

    /// Apply a status change to the stored record.
    pub async fn transition(
        &self,
        name: &str,
        status: ArtifactStatus,
        at: DateTime<Utc>,
    ) -> Result<BackupArtifact> {
        let mut artifact = self.get(name).await?;
        artifact.advance(status, at)?;
        self.save(&artifact).await?;
        Ok(artifact)
    }

    /// Append a verification record. Existing records are never overwritten.
    pub async fn append_verification(&self, record: &VerificationRecord) -> Result<()> {
        let name = format!(
            "{}{}/{}-{}.json",
            VERIFICATION_PREFIX,
            record.artifact,
            record.verified_at.format("%Y%m%dT%H%M%S%.3fZ"),
            record.id.simple()
        );
        if !self.store.create_record(&name, serde_json::to_vec_pretty(record)?).await? {
            return Err(VaultError::Conflict(format!("verification record {} exists", name)));
        }
        Ok(())
    }

    /// Verification records of an environment (or one artifact when `scope` is a full name),
    /// oldest first.
    pub async fn verifications(&self, scope: &str) -> Result<Vec<VerificationRecord>> {
        let prefix = format!("{}{}/", VERIFICATION_PREFIX, scope);
        let mut records = Vec::new();
        for name in self.store.list(&prefix).await? {
            if let Some(record) = self.read_json::<VerificationRecord>(&name).await? {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.verified_at);
        Ok(records)
    }

    pub async fn save_restore_job(&self, job: &RestoreJob) -> Result<()> {
        self.store
            .write_record(
                &format!("{}{}.json", RESTORE_PREFIX, job.id),
                serde_json::to_vec_pretty(job)?,
            )
            .await
    }

    pub async fn restore_jobs(&self) -> Result<Vec<RestoreJob>> {
        let mut jobs = Vec::new();
        for name in self.store.list(RESTORE_PREFIX).await? {
            if let Some(job) = self.read_json::<RestoreJob>(&name).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by_key(|j| j.started_at);
        Ok(jobs)
    }

    /// Artifact names referenced by RUNNING restore jobs that are still alive.
    pub async fn protected_artifacts(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<Vec<String>> {
        Ok(self
            .restore_jobs()
            .await?
            .into_iter()
            .filter(|j| j.status == RestoreStatus::Running && !j.is_abandoned(now, stale_after))
            .map(|j| j.artifact)
            .collect())
    }

    /// Close RUNNING jobs whose process died, so they stop protecting their artifact.
    pub async fn fail_abandoned_restore_jobs(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<Vec<RestoreJob>> {
        let mut failed = Vec::new();
        for mut job in self.restore_jobs().await? {
            if !job.is_abandoned(now, stale_after) {
                continue;
            }
            warn!(job = %job.id, artifact = %job.artifact, last_seen = %job.last_seen(), "Failing abandoned restore job");
            job.status = RestoreStatus::Failed;
            job.finished_at = Some(now);
            job.error_code = Some(crate::ErrorCode::InternalError);
            job.error = Some(format!("abandoned: no heartbeat since {}", job.last_seen().to_rfc3339()));
            self.save_restore_job(&job).await?;
            failed.push(job);
        }
        Ok(failed)
    }

    /// Archived WAL segments of an environment, ordered by sequence, with object names.
    pub async fn wal_segments(&self, environment: &str) -> Result<Vec<(String, WalSegment)>> {
        let mut segments = Vec::new();
        for name in self.store.list(&wal_prefix(environment)).await? {
            if parse_wal_object_name(&name).is_none() {
                continue;
            }
            let Some(info) = self.store.head(&name).await? else {
                continue;
            };
            match wal_segment_from_info(&info) {
                Ok(segment) => segments.push((name, segment)),
                Err(e) => warn!(object = %name, error = %e, "Skipping WAL object with bad metadata"),
            }
        }
        segments.sort_by_key(|(_, s)| s.sequence);
        Ok(segments)
    }
}

/// Rebuild a [`WalSegment`] from the metadata written at archive time.
pub fn wal_segment_from_info(info: &ObjectInfo) -> Result<WalSegment> {
    let get = |key: &str| {
        info.metadata
            .get(key)
            .ok_or_else(|| VaultError::Integrity(format!("{}: missing {}", info.name, key)))
    };
    let bad = |key: &str| VaultError::Integrity(format!("{}: invalid {}", info.name, key));

    Ok(WalSegment {
        sequence: get(WAL_SEQUENCE)?.parse().map_err(|_| bad(WAL_SEQUENCE))?,
        file_name: get(WAL_FILE_NAME)?.to_string(),
        start: get(WAL_START)?.parse::<WalPosition>().map_err(|_| bad(WAL_START))?,
        end: get(WAL_END)?.parse::<WalPosition>().map_err(|_| bad(WAL_END))?,
        last_commit: DateTime::parse_from_rfc3339(get(WAL_LAST_COMMIT)?)
            .map_err(|_| bad(WAL_LAST_COMMIT))?
            .with_timezone(&Utc),
        last_xid: match info.metadata.get(WAL_LAST_XID) {
            Some("") | None => None,
            Some(xid) => Some(xid.parse().map_err(|_| bad(WAL_LAST_XID))?),
        },
        size_bytes: get(WAL_RAW_SIZE)?.parse().map_err(|_| bad(WAL_RAW_SIZE))?,
    })
}
