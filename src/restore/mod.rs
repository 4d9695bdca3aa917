// Restore engine - full and point-in-time recovery into isolated targets
//
//   resolve -> plan WAL -> RUNNING job -> stage + checksum -> decrypt/extract
//          -> WAL replay (cancellable) -> start -> smoke tests -> SUCCEEDED
//
// Any failure discards the target. A restored instance is left running on its isolated
// location for the operator; promotion is not this crate's business. A RUNNING job carries
// a heartbeat so that retention can tell a live restore from one whose process died.

pub mod fetch;
pub mod plan;
pub mod smoke;

pub use fetch::{PayloadReader, StagedArtifact};
pub use plan::{plan_wal_replay, ReplayPlan};
pub use smoke::run_smoke_tests;

use crate::artifact::{
    ArtifactName, BackupArtifact, Catalog, RecoveryTarget, RestoreJob, RestoreStatus,
    SmokeTestResults,
};
use crate::clock::Clock;
use crate::config::VaultConfig;
use crate::crypto::{decrypt_bytes, Decryptor};
use crate::db::{Database, RestoreTarget};
use crate::monitor::metrics::{self, Timer};
use crate::report::{Operation, RunReport};
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Operator cancellation, checked between WAL segments.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self, stage: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(VaultError::Cancelled(format!("restore cancelled during {}", stage)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RestoreRequest {
    /// Artifact name, or an environment name for its newest discoverable artifact
    pub artifact: String,
    pub recovery_target: Option<RecoveryTarget>,
    pub target_environment: String,
    /// Stop and delete the target after smoke tests (test restores)
    pub discard_after: bool,
}

impl RestoreRequest {
    pub fn full(artifact: impl Into<String>, target_environment: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
            recovery_target: None,
            target_environment: target_environment.into(),
            discard_after: false,
        }
    }

    pub fn point_in_time(
        artifact: impl Into<String>,
        target: RecoveryTarget,
        target_environment: impl Into<String>,
    ) -> Self {
        Self {
            recovery_target: Some(target),
            ..Self::full(artifact, target_environment)
        }
    }

    pub fn discard_after(mut self) -> Self {
        self.discard_after = true;
        self
    }
}

struct Restored {
    location: String,
    raw_bytes: u64,
    segments_replayed: usize,
    recovered_through: Option<DateTime<Utc>>,
    smoke: SmokeTestResults,
}

pub struct RestoreEngine {
    config: VaultConfig,
    catalog: Catalog,
    decryptor: Decryptor,
    database: Arc<dyn Database>,
    clock: Clock,
    cancel: CancelFlag,
}

impl RestoreEngine {
    pub fn new(
        config: VaultConfig,
        catalog: Catalog,
        decryptor: Decryptor,
        database: Arc<dyn Database>,
    ) -> Self {
        Self {
            config,
            catalog,
            decryptor,
            database,
            clock: Clock::System,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolve an artifact reference to a discoverable artifact.
    pub async fn resolve(&self, reference: &str) -> Result<BackupArtifact> {
        let artifact = if reference.parse::<ArtifactName>().is_ok() {
            self.catalog.get(reference).await?
        } else {
            self.catalog
                .latest_discoverable(reference)
                .await?
                .ok_or_else(|| VaultError::NotFound(format!("no restorable artifact for {}", reference)))?
        };
        if !artifact.status.is_discoverable() {
            return Err(VaultError::NotFound(format!(
                "{} is {} and cannot be restored",
                artifact.name, artifact.status
            )));
        }
        Ok(artifact)
    }

    /// Run one restore job. The job record and report are persisted whatever the outcome.
    #[instrument(skip(self, request), fields(artifact = %request.artifact, target_env = %request.target_environment))]
    pub async fn restore(&self, request: RestoreRequest) -> Result<RestoreJob> {
        crate::artifact::validate_environment(&request.target_environment)?;
        let timer = Timer::start();
        let artifact = self.resolve(&request.artifact).await?;
        self.decryptor.check_key_ref(&artifact.key_ref)?;

        let mut job = RestoreJob::new(
            &artifact.name,
            request.recovery_target,
            &request.target_environment,
            self.clock.now(),
        );
        self.catalog.save_restore_job(&job).await?;
        info!(job = %job.id, artifact = %artifact.name, target = ?request.recovery_target, "Restore started");

        let outcome = self.run(&artifact, &request, &mut job).await;
        job.finished_at = Some(self.clock.now());

        let mut report = RunReport::new(Operation::Restore, &request.target_environment, self.clock.now());
        report.source = Some(artifact.name.clone());
        report.artifact = Some(artifact.name.clone());
        report.duration_ms = timer.elapsed_ms();

        match &outcome {
            Ok(restored) => {
                job.status = RestoreStatus::Succeeded;
                job.target_location = Some(restored.location.clone());
                job.segments_replayed = restored.segments_replayed;
                job.recovered_through = restored.recovered_through;
                job.smoke_test_results = Some(restored.smoke.clone());
                report.target = Some(restored.location.clone());
                report.size_bytes = restored.raw_bytes;
                report.smoke_test_results = Some(restored.smoke.clone());
                info!(
                    job = %job.id,
                    location = %restored.location,
                    segments = restored.segments_replayed,
                    "Restore succeeded"
                );
            }
            Err(e) => {
                job.status = RestoreStatus::Failed;
                job.error_code = Some(e.code());
                job.error = Some(e.to_string());
                report.target = job.target_location.clone();
                report.smoke_test_results = job.smoke_test_results.clone();
                report.fail(e);
                error!(job = %job.id, code = %e.code(), error = %e, "Restore failed");
            }
        }

        metrics::record_restore(&request.target_environment, job.is_point_in_time(), outcome.is_ok());
        self.catalog.save_restore_job(&job).await?;
        if let Err(e) = report.save(self.catalog.store()).await {
            warn!(error = %e, "Could not persist restore report");
        }
        if let Some(dir) = &self.config.log_dir {
            if let Err(e) = report.write_log(dir).await {
                warn!(error = %e, "Could not write restore log");
            }
        }

        outcome.map(|_| job)
    }

    async fn run(
        &self,
        artifact: &BackupArtifact,
        request: &RestoreRequest,
        job: &mut RestoreJob,
    ) -> Result<Restored> {
        let replay = match &request.recovery_target {
            None => None,
            Some(target) => {
                let snapshot_at = artifact.snapshot_at.unwrap_or(artifact.started_at);
                let wal = self.catalog.wal_segments(&artifact.environment).await?;
                Some(plan_wal_replay(artifact.wal_start, snapshot_at, target, &wal)?)
            }
        };

        let mut target = self.database.prepare_target(&request.target_environment).await?;
        job.target_location = Some(target.location());
        job.heartbeat_at = Some(self.clock.now());
        self.catalog.save_restore_job(job).await?;

        match self.populate(artifact, request, replay.as_ref(), target.as_mut(), job).await {
            Ok(restored) if !request.discard_after => Ok(restored),
            Ok(restored) => {
                target.discard().await?;
                Ok(restored)
            }
            Err(e) => {
                let location = target.location();
                if let Err(discard_error) = target.discard().await {
                    error!(location = %location, error = %discard_error, "Discarding failed restore target failed");
                } else {
                    warn!(location = %location, "Restore target discarded");
                }
                Err(e)
            }
        }
    }

    async fn populate(
        &self,
        artifact: &BackupArtifact,
        request: &RestoreRequest,
        replay: Option<&ReplayPlan>,
        target: &mut dyn RestoreTarget,
        job: &mut RestoreJob,
    ) -> Result<Restored> {
        let staged = self
            .beating(
                job,
                StagedArtifact::download(self.catalog.store(), artifact, &self.config.staging_dir),
            )
            .await?;
        staged.require_checksum(artifact)?;

        let mut payload = staged.open(&self.decryptor).await?;
        while let Some(raw) = payload.next_raw().await? {
            target.write_base(&raw).await?;
            self.touch_if_due(job).await;
        }
        if let Some(manifest) = payload.manifest() {
            if manifest.wal_start != artifact.wal_start || manifest.environment != artifact.environment {
                return Err(VaultError::Integrity(format!(
                    "{}: manifest does not match catalog record",
                    artifact.name
                )));
            }
        }
        let summary = payload.finish()?;
        drop(staged);
        target.finish_base().await?;
        info!(raw_bytes = summary.raw_bytes, "Base snapshot extracted");

        let mut recovered_through = None;
        if let Some(plan) = replay {
            for (name, segment) in &plan.segments {
                self.cancel.check("WAL replay")?;
                let sealed = self.catalog.store().get_bytes(name).await?;
                let data = decrypt_bytes(&self.decryptor, &sealed).await?;
                if data.len() as u64 != segment.size_bytes {
                    return Err(VaultError::Integrity(format!(
                        "{}: expected {} bytes, decrypted {}",
                        name,
                        segment.size_bytes,
                        data.len()
                    )));
                }
                target.apply_wal(segment, &data).await?;
                job.segments_replayed += 1;
                self.touch_if_due(job).await;
                info!(sequence = segment.sequence, last_commit = %segment.last_commit, "WAL segment replayed");
            }
            recovered_through = Some(plan.recovered_through);
        }

        self.cancel.check("startup")?;
        let live = self.beating(job, target.start()).await?;
        let audit_relation = self
            .config
            .environments
            .get(&artifact.environment)
            .and_then(|env| env.audit_relation.as_deref());
        let smoke = run_smoke_tests(live.as_ref(), audit_relation).await;
        job.smoke_test_results = Some(smoke.clone());
        if !smoke.passed() {
            return Err(VaultError::SmokeTest(smoke.failures.join("; ")));
        }

        Ok(Restored {
            location: target.location(),
            raw_bytes: summary.raw_bytes,
            segments_replayed: job.segments_replayed,
            recovered_through,
            smoke,
        })
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.config.lock.ttl() / 3).max(Duration::from_secs(1))
    }

    /// Record that the job is still alive. A missed heartbeat is not fatal to the restore.
    async fn touch(&self, job: &mut RestoreJob) {
        job.heartbeat_at = Some(self.clock.now());
        if let Err(e) = self.catalog.save_restore_job(job).await {
            warn!(job = %job.id, error = %e, "Could not record restore heartbeat");
        }
    }

    async fn touch_if_due(&self, job: &mut RestoreJob) {
        if self.clock.now() - job.last_seen() >= self.config.lock.stale_after() / 3 {
            self.touch(job).await;
        }
    }

    /// Drive `work` to completion, refreshing the job heartbeat while it runs.
    async fn beating<T>(&self, job: &mut RestoreJob, work: impl Future<Output = Result<T>>) -> Result<T> {
        let interval = self.heartbeat_interval();
        tokio::pin!(work);
        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = tokio::time::sleep(interval) => self.touch(job).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(flag.check("replay").is_ok());
        clone.cancel();
        assert!(matches!(flag.check("replay"), Err(VaultError::Cancelled(_))));
    }

    #[test]
    fn test_request_builders() {
        let request = RestoreRequest::full("prod", "sandbox").discard_after();
        assert!(request.discard_after);
        assert!(request.recovery_target.is_none());
    }
}
