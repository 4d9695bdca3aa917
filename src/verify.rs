// Verifier - integrity and restorability checks on stored artifacts
//
// A failed check never deletes an artifact or marks it FAILED; the fault may be in the
// verification path. It appends a record, raises an alert and returns the typed error.
// Only a full passing chain advances the artifact to VERIFIED.

use crate::artifact::{ArtifactStatus, BackupArtifact, Catalog, VerificationRecord};
use crate::clock::Clock;
use crate::config::VaultConfig;
use crate::crypto::Decryptor;
use crate::db::Database;
use crate::monitor::{dispatch, metrics, Alert, AlertKind, AlertSink, Severity};
use crate::report::{Operation, RunReport};
use crate::restore::{RestoreEngine, RestoreRequest, StagedArtifact};
use crate::{Result, VaultError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Environment name test restores are prepared under
pub const TEST_RESTORE_ENVIRONMENT: &str = "verify";

/// When to run a full test restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestRestore {
    /// When the last successful test restore is older than the cadence
    #[default]
    Auto,
    Always,
    Never,
}

/// Whether a test restore is due, given the environment's verification history.
pub fn test_restore_due(history: &[VerificationRecord], now: DateTime<Utc>, every_days: u64) -> bool {
    if every_days == 0 {
        return true;
    }
    let window = Duration::days(i64::try_from(every_days).unwrap_or(i64::MAX).min(36_500));
    !history
        .iter()
        .any(|r| r.test_restore_ok == Some(true) && r.verified_at > now - window)
}

pub struct Verifier {
    config: VaultConfig,
    catalog: Catalog,
    decryptor: Decryptor,
    database: Arc<dyn Database>,
    sink: Arc<dyn AlertSink>,
    clock: Clock,
}

impl Verifier {
    pub fn new(
        config: VaultConfig,
        catalog: Catalog,
        decryptor: Decryptor,
        database: Arc<dyn Database>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config,
            catalog,
            decryptor,
            database,
            sink,
            clock: Clock::System,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Verify the newest discoverable artifact of an environment.
    pub async fn verify_latest(&self, environment: &str, mode: TestRestore) -> Result<VerificationRecord> {
        let artifact = self
            .catalog
            .latest_discoverable(environment)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("no uploaded artifact for {}", environment)))?;
        self.verify(&artifact.name, mode).await
    }

    /// Verify one artifact and append the resulting record.
    #[instrument(skip(self), fields(artifact = %name))]
    pub async fn verify(&self, name: &str, mode: TestRestore) -> Result<VerificationRecord> {
        let artifact = self.catalog.get(name).await?;
        if !artifact.status.is_discoverable() {
            return Err(VaultError::NotFound(format!(
                "{} is {} and cannot be verified",
                name, artifact.status
            )));
        }
        let started = self.clock.now();

        let mut record = VerificationRecord {
            id: Uuid::new_v4(),
            artifact: artifact.name.clone(),
            verified_at: started,
            checksum_ok: false,
            decrypt_ok: false,
            structure_ok: false,
            test_restore_ok: None,
            error: None,
        };
        let outcome = self.check(&artifact, mode, &mut record).await;
        record.verified_at = self.clock.now();
        if let Err(e) = &outcome {
            record.error = Some(e.to_string());
        }

        self.catalog.append_verification(&record).await?;
        metrics::record_verification(&artifact.environment, outcome.is_ok());

        let mut report = RunReport::new(Operation::Verify, &artifact.environment, record.verified_at);
        report.artifact = Some(artifact.name.clone());
        report.source = Some(artifact.location.clone());
        report.size_bytes = artifact.encrypted_size;
        report.duration_ms = (record.verified_at - started).num_milliseconds().max(0) as u64;

        match outcome {
            Ok(()) => {
                self.catalog
                    .transition(&artifact.name, ArtifactStatus::Verified, record.verified_at)
                    .await?;
                info!(test_restore = ?record.test_restore_ok, "Artifact verified");
                if let Err(e) = report.save(self.catalog.store()).await {
                    warn!(error = %e, "Could not persist verification report");
                }
                Ok(record)
            }
            Err(e) => {
                error!(code = %e.code(), error = %e, "Verification failed");
                let alert = Alert::new(
                    &artifact.environment,
                    AlertKind::VerificationFailed,
                    Severity::Critical,
                    format!("verification of {} failed: {}", artifact.name, e),
                    record.verified_at,
                )
                .for_artifact(&artifact.name);
                dispatch(self.sink.as_ref(), &[alert]).await;
                report.fail(&e);
                if let Err(save_error) = report.save(self.catalog.store()).await {
                    warn!(error = %save_error, "Could not persist verification report");
                }
                Err(e)
            }
        }
    }

    async fn check(
        &self,
        artifact: &BackupArtifact,
        mode: TestRestore,
        record: &mut VerificationRecord,
    ) -> Result<()> {
        self.decryptor.check_key_ref(&artifact.key_ref)?;

        let staged = StagedArtifact::download(self.catalog.store(), artifact, &self.config.staging_dir).await?;
        staged.require_checksum(artifact)?;
        record.checksum_ok = true;

        let payload = staged.open(&self.decryptor).await?;
        let (manifest, summary) = match payload.drain().await {
            Ok(done) => done,
            Err(e @ VaultError::Decryption(_)) => return Err(e),
            Err(e) => {
                record.decrypt_ok = true;
                return Err(e);
            }
        };
        record.decrypt_ok = true;
        drop(staged);

        if manifest.environment != artifact.environment
            || manifest.wal_start != artifact.wal_start
            || manifest.label != artifact.label
        {
            return Err(VaultError::Integrity(format!(
                "{}: manifest does not match catalog record",
                artifact.name
            )));
        }
        if summary.raw_bytes != artifact.raw_size {
            return Err(VaultError::Integrity(format!(
                "{}: payload holds {} bytes, catalog records {}",
                artifact.name, summary.raw_bytes, artifact.raw_size
            )));
        }
        record.structure_ok = true;

        let due = match mode {
            TestRestore::Always => true,
            TestRestore::Never => false,
            TestRestore::Auto => {
                let every = self
                    .config
                    .environment(&artifact.environment)
                    .map(|env| env.test_restore_every_days)
                    .unwrap_or(7);
                let history = self.catalog.verifications(&artifact.environment).await?;
                test_restore_due(&history, self.clock.now(), every)
            }
        };
        if due {
            let engine = RestoreEngine::new(
                self.config.clone(),
                self.catalog.clone(),
                self.decryptor.clone(),
                self.database.clone(),
            )
            .with_clock(self.clock.clone());
            let request = RestoreRequest::full(&artifact.name, TEST_RESTORE_ENVIRONMENT).discard_after();
            match engine.restore(request).await {
                Ok(_) => record.test_restore_ok = Some(true),
                Err(e) => {
                    record.test_restore_ok = Some(false);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
