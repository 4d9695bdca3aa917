use crate::archive::{ArchiveEncoder, ArchiveManifest};
use crate::artifact::{
    ArtifactName, ArtifactStatus, BackupArtifact, BackupKind, Catalog,
};
use crate::clock::Clock;
use crate::config::VaultConfig;
use crate::crypto::{Encryptor, SealSummary, SealWriter};
use crate::db::Database;
use crate::lock::{owner_id, Lease, LeaseLock};
use crate::monitor::metrics::{self, Timer};
use crate::report::{Operation, RunReport};
use crate::retention::RetentionManager;
use crate::store::{ObjectMetadata, PutSource, RemoteStore, CHECKSUM_KEY};
use crate::{Result, VaultError};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, BufWriter};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const READ_CHUNK: usize = 256 * 1024;
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// Staged encrypted payload, removed on drop.
struct StagingFile(PathBuf);

impl Drop for StagingFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.0.display(), error = %e, "Could not remove staging file");
            }
        }
    }
}

pub struct BackupOrchestrator {
    pub(super) config: VaultConfig,
    pub(super) catalog: Catalog,
    pub(super) encryptor: Encryptor,
    pub(super) database: Arc<dyn Database>,
    pub(super) lock: LeaseLock,
    pub(super) clock: Clock,
    pub(super) owner: String,
}

impl BackupOrchestrator {
    pub fn new(
        config: VaultConfig,
        store: RemoteStore,
        encryptor: Encryptor,
        database: Arc<dyn Database>,
    ) -> Self {
        let clock = Clock::System;
        let lock = LeaseLock::new(store.clone(), config.lock.ttl(), clock.clone());
        Self {
            config,
            catalog: Catalog::new(store),
            encryptor,
            database,
            lock,
            clock,
            owner: owner_id(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.lock = LeaseLock::new(self.catalog.store().clone(), self.config.lock.ttl(), clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Run one backup for `environment`.
    ///
    /// Holds the environment lease for the whole run and releases it on every exit path.
    /// Returns the `UPLOADED` artifact, or the typed error that aborted the run.
    #[instrument(skip(self), fields(environment = %environment, owner = %self.owner))]
    pub async fn run_backup(&self, environment: &str) -> Result<BackupArtifact> {
        self.config.environment(environment)?;
        let timer = Timer::start();
        let mut report = RunReport::new(Operation::Backup, environment, self.clock.now());
        report.source = Some(self.database.identity());

        let mut lease = match self.lock.acquire(environment, &self.owner).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(error = %e, "Backup not started");
                report.fail(&e);
                self.finish_report(&mut report, &timer).await;
                metrics::record_backup(environment, false, timer.elapsed_secs(), None);
                return Err(e);
            }
        };

        let outcome = self.pipeline(environment, &mut lease).await;

        if let Ok(artifact) = &outcome {
            report.artifact = Some(artifact.name.clone());
            report.target = Some(artifact.location.clone());
            report.size_bytes = artifact.encrypted_size;

            let retention = RetentionManager::new(self.config.clone(), self.catalog.clone())
                .with_clock(self.clock.clone());
            match retention.prune(environment).await {
                Ok(pruned) => debug!(expired = pruned.expired.len(), "Retention pass finished"),
                Err(e) => warn!(error = %e, "Retention failed; the new artifact is unaffected"),
            }
        }

        if let Err(e) = lease.release().await {
            warn!(error = %e, "Releasing lease failed; it will expire");
        }

        match &outcome {
            Ok(artifact) => {
                info!(
                    artifact = %artifact.name,
                    encrypted_bytes = artifact.encrypted_size,
                    duration_secs = timer.elapsed_secs(),
                    "Backup uploaded"
                );
                metrics::record_backup(environment, true, timer.elapsed_secs(), Some(artifact.encrypted_size));
            }
            Err(e) => {
                error!(code = %e.code(), error = %e, "Backup failed");
                report.fail(e);
                metrics::record_backup(environment, false, timer.elapsed_secs(), None);
            }
        }
        self.finish_report(&mut report, &timer).await;
        outcome
    }

    async fn finish_report(&self, report: &mut RunReport, timer: &Timer) {
        report.timestamp = self.clock.now();
        report.duration_ms = timer.elapsed_ms();
        if let Err(e) = report.save(self.catalog.store()).await {
            warn!(error = %e, "Could not persist run report");
        }
        if let Some(dir) = &self.config.log_dir {
            if let Err(e) = report.write_log(dir).await {
                warn!(error = %e, "Could not write run log");
            }
        }
    }

    async fn pipeline(&self, environment: &str, lease: &mut Lease) -> Result<BackupArtifact> {
        self.recover_interrupted(environment).await?;
        self.database.ping().await?;

        let mut artifact = self.reserve(environment).await?;
        info!(artifact = %artifact.name, "Artifact name reserved");

        match self.stages(&mut artifact, lease).await {
            Ok(()) => Ok(artifact),
            Err(e) => {
                self.abandon(&mut artifact, &e).await;
                Err(e)
            }
        }
    }

    /// Mark records left in flight by a crashed run as FAILED and remove their objects.
    async fn recover_interrupted(&self, environment: &str) -> Result<()> {
        for stale in self.catalog.list(environment).await? {
            if !stale.status.is_in_flight() {
                continue;
            }
            warn!(artifact = %stale.name, status = %stale.status, "Recovering interrupted run");
            self.catalog.store().delete(&stale.name).await?;
            let mut failed = stale;
            failed.advance(ArtifactStatus::Failed, self.clock.now())?;
            failed.error = Some("run interrupted before upload completed".to_string());
            self.catalog.save(&failed).await?;
        }
        Ok(())
    }

    /// Claim a fresh artifact name, adding a suffix when the second is taken.
    async fn reserve(&self, environment: &str) -> Result<BackupArtifact> {
        let now = self.clock.now();
        let mut name = ArtifactName::new(environment, BackupKind::Full, now)?;
        for _ in 0..MAX_NAME_ATTEMPTS {
            let artifact = BackupArtifact::new(
                name.to_string(),
                environment,
                BackupKind::Full,
                self.encryptor.key_ref(),
                now,
            );
            let taken = self.catalog.store().head(&artifact.name).await?.is_some();
            if !taken && self.catalog.reserve(&artifact).await? {
                return Ok(artifact);
            }
            debug!(name = %name, "Artifact name taken");
            name = name.disambiguated();
        }
        Err(VaultError::Conflict(format!(
            "no free artifact name for {} at {}",
            environment,
            now.to_rfc3339()
        )))
    }

    async fn advance(&self, artifact: &mut BackupArtifact, status: ArtifactStatus) -> Result<()> {
        artifact.advance(status, self.clock.now())?;
        self.catalog.save(artifact).await
    }

    /// Record the next status only while the lease is still ours.
    async fn advance_held(
        &self,
        artifact: &mut BackupArtifact,
        status: ArtifactStatus,
        lease: &mut Lease,
    ) -> Result<()> {
        lease.renew().await?;
        self.advance(artifact, status).await
    }

    /// Drive `work` to completion, renewing the lease every third of its duration.
    /// A lost lease cancels `work`.
    pub(super) async fn holding<T>(&self, lease: &mut Lease, work: impl Future<Output = Result<T>>) -> Result<T> {
        let interval = lease.renew_interval();
        tokio::pin!(work);
        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = tokio::time::sleep(interval) => lease.renew().await?,
            }
        }
    }

    /// Capture, encrypt, upload. The lease is renewed throughout and checked before every
    /// status write; once the record is UPLOADED nothing in this function can fail it.
    async fn stages(&self, artifact: &mut BackupArtifact, lease: &mut Lease) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.staging_dir).await?;
        let staging = StagingFile(
            self.config
                .staging_dir
                .join(format!("{}.enc", Uuid::new_v4().simple())),
        );

        let seal = self
            .holding(lease, self.capture_and_encrypt(artifact, &staging.0))
            .await?;
        self.advance_held(artifact, ArtifactStatus::Captured, lease).await?;
        artifact.encrypted_size = seal.ciphertext_bytes;
        artifact.checksum = Some(seal.sha256.clone());
        self.advance_held(artifact, ArtifactStatus::Encrypted, lease).await?;

        self.holding(lease, self.upload(artifact, &staging.0)).await?;

        artifact.finished_at = Some(self.clock.now());
        artifact.location = format!("{}://{}", self.catalog.store().backend_name(), artifact.name);
        self.advance_held(artifact, ArtifactStatus::Uploaded, lease).await?;

        self.keep_local_copy(artifact, &staging.0).await;
        Ok(())
    }

    /// Stream the snapshot through the archive encoder and the sealer into `staging`.
    /// Plaintext only ever exists in memory, one chunk at a time.
    async fn capture_and_encrypt(&self, artifact: &mut BackupArtifact, staging: &Path) -> Result<SealSummary> {
        let label = format!("pitr-vault-{}", artifact.name.replace(['/', '.'], "-"));
        let mut snapshot = self.database.base_snapshot(&label).await?;
        artifact.source = snapshot.source.clone();
        artifact.label = snapshot.label.clone();
        artifact.wal_start = snapshot.wal_start;
        artifact.snapshot_at = Some(snapshot.started_at);
        info!(label = %label, wal_start = %snapshot.wal_start, "Base snapshot started");

        let manifest = ArchiveManifest::new(
            &snapshot.label,
            &artifact.environment,
            &snapshot.source,
            snapshot.wal_start,
            snapshot.started_at,
        );
        let file = tokio::fs::File::create(staging).await?;
        let mut sealer = SealWriter::new(&self.encryptor, BufWriter::new(file)).await?;
        let (mut encoder, header) = ArchiveEncoder::start(&manifest)?;
        sealer.write(&header).await?;

        let mut buffer = vec![0u8; READ_CHUNK];
        loop {
            let n = snapshot
                .reader
                .read(&mut buffer)
                .await
                .map_err(|e| VaultError::UpstreamUnreachable(format!("snapshot stream failed: {}", e)))?;
            if n == 0 {
                break;
            }
            let compressed = encoder.encode(&buffer[..n])?;
            if !compressed.is_empty() {
                sealer.write(&compressed).await?;
            }
        }
        let (tail, summary) = encoder.finish()?;
        sealer.write(&tail).await?;
        artifact.raw_size = summary.raw_bytes;

        let (writer, seal) = sealer.finish_into_inner().await?;
        writer.into_inner().sync_all().await?;
        info!(
            raw_bytes = summary.raw_bytes,
            encrypted_bytes = seal.ciphertext_bytes,
            "Snapshot archived and encrypted"
        );
        Ok(seal)
    }

    async fn upload(&self, artifact: &BackupArtifact, staging: &Path) -> Result<()> {
        let checksum = artifact
            .checksum
            .clone()
            .ok_or_else(|| VaultError::Integrity(format!("{}: no checksum recorded", artifact.name)))?;
        let metadata = ObjectMetadata::new()
            .with("environment", &artifact.environment)
            .with("backup-type", artifact.kind.as_str())
            .with("created", artifact.created_at().to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
            .with(CHECKSUM_KEY, &checksum)
            .with("key-ref", &artifact.key_ref)
            .with("wal-start", artifact.wal_start.to_string())
            .with("label", &artifact.label);

        self.catalog
            .store()
            .put(&artifact.name, PutSource::File(staging.to_path_buf()), &metadata)
            .await?;

        let stored = self
            .catalog
            .store()
            .head(&artifact.name)
            .await?
            .ok_or_else(|| VaultError::Integrity(format!("{} missing after upload", artifact.name)))?;
        if stored.size != artifact.encrypted_size || stored.metadata.checksum() != Some(checksum.as_str()) {
            return Err(VaultError::Integrity(format!(
                "{}: stored object does not match upload ({} bytes, checksum {:?})",
                artifact.name,
                stored.size,
                stored.metadata.checksum()
            )));
        }
        Ok(())
    }

    async fn keep_local_copy(&self, artifact: &BackupArtifact, staging: &Path) {
        let Some(dir) = &self.config.local_copy_dir else {
            return;
        };
        let destination = dir.join(&artifact.name);
        let copied = async {
            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(staging, &destination).await
        }
        .await;
        if let Err(e) = copied {
            warn!(path = %destination.display(), error = %e, "Local copy failed");
        }
    }

    /// Mark a failed run and remove anything it uploaded.
    async fn abandon(&self, artifact: &mut BackupArtifact, cause: &VaultError) {
        if let Err(e) = self.catalog.store().delete(&artifact.name).await {
            error!(artifact = %artifact.name, error = %e, "Could not remove partial upload");
        }
        artifact.error = Some(cause.to_string());
        artifact.finished_at = Some(self.clock.now());
        if let Err(e) = self.advance(artifact, ArtifactStatus::Failed).await {
            error!(artifact = %artifact.name, error = %e, "Could not mark artifact FAILED");
        }
    }
}
