// Retention - expiry planning and pruning
//
// Planning is a pure function of policy, clock and listings. The manager only gathers the
// listings and applies the plan. Objects are deleted before their record is marked EXPIRED,
// so a failed deletion leaves the artifact discoverable and the next pass retries it.

use crate::artifact::{ArtifactStatus, BackupArtifact, Catalog, WalSegment};
use crate::clock::Clock;
use crate::config::VaultConfig;
use crate::{Result, VaultError};
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

/// Per-environment retention windows, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Local artifact copies and run logs
    pub local_days: u32,
    /// Artifacts in the remote store
    pub remote_days: u32,
    /// Archived WAL segments
    pub wal_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            local_days: 7,
            remote_days: 30,
            wal_days: 7,
        }
    }
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.remote_days == 0 {
            return Err(VaultError::Configuration("remote_days must be positive".into()));
        }
        if self.wal_days == 0 {
            return Err(VaultError::Configuration("wal_days must be positive".into()));
        }
        Ok(())
    }
}

/// A file in a local cache directory.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalFile {
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
}

/// What one pass should delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrunePlan {
    /// Artifact names to delete and mark EXPIRED
    pub expire: Vec<String>,
    /// WAL object names
    pub delete_wal: Vec<String>,
    pub delete_local: Vec<PathBuf>,
}

impl PrunePlan {
    pub fn is_empty(&self) -> bool {
        self.expire.is_empty() && self.delete_wal.is_empty() && self.delete_local.is_empty()
    }
}

fn cutoff(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    now - Duration::days(i64::from(days))
}

/// Decide what to delete.
///
/// - Only `UPLOADED`/`VERIFIED` artifacts older than `remote_days` expire. The newest
///   discoverable artifact and anything in `protected` are kept regardless of age.
/// - WAL segments expire after `wal_days` unless a retained artifact still needs them for
///   replay (segment end beyond the oldest retained base position).
/// - Local files expire after `local_days`.
///
/// `artifacts` must be ordered oldest first, as [`Catalog::list`] returns them.
pub fn plan_prune(
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    artifacts: &[BackupArtifact],
    wal: &[(String, WalSegment)],
    local_files: &[LocalFile],
    protected: &[String],
) -> PrunePlan {
    let protected: HashSet<&str> = protected.iter().map(String::as_str).collect();
    let discoverable: Vec<&BackupArtifact> =
        artifacts.iter().filter(|a| a.status.is_discoverable()).collect();
    let newest = discoverable.last().map(|a| a.name.as_str());

    let remote_cutoff = cutoff(now, policy.remote_days);
    let expire: Vec<String> = discoverable
        .iter()
        .filter(|a| a.created_at() < remote_cutoff)
        .filter(|a| Some(a.name.as_str()) != newest)
        .filter(|a| !protected.contains(a.name.as_str()))
        .map(|a| a.name.clone())
        .collect();

    let expiring: HashSet<&str> = expire.iter().map(String::as_str).collect();
    let oldest_retained_base = discoverable
        .iter()
        .filter(|a| !expiring.contains(a.name.as_str()))
        .map(|a| a.wal_start)
        .min();

    let wal_cutoff = cutoff(now, policy.wal_days);
    let delete_wal = wal
        .iter()
        .filter(|(_, s)| s.last_commit < wal_cutoff)
        .filter(|(_, s)| oldest_retained_base.map_or(true, |base| s.end <= base))
        .map(|(name, _)| name.clone())
        .collect();

    let local_cutoff = cutoff(now, policy.local_days);
    let delete_local = local_files
        .iter()
        .filter(|f| f.modified < local_cutoff)
        .map(|f| f.path.clone())
        .collect();

    PrunePlan {
        expire,
        delete_wal,
        delete_local,
    }
}

/// Outcome of one prune pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PruneReport {
    pub environment: String,
    pub expired: Vec<String>,
    pub wal_deleted: usize,
    pub local_deleted: usize,
    /// Deletions that failed and will be retried next pass
    pub failures: Vec<String>,
}

impl PruneReport {
    pub fn deleted_anything(&self) -> bool {
        !self.expired.is_empty() || self.wal_deleted > 0 || self.local_deleted > 0
    }
}

pub struct RetentionManager {
    config: VaultConfig,
    catalog: Catalog,
    clock: Clock,
}

impl RetentionManager {
    pub fn new(config: VaultConfig, catalog: Catalog) -> Self {
        Self {
            config,
            catalog,
            clock: Clock::System,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Local directories pruned by `local_days` for an environment.
    fn local_dirs(&self, environment: &str) -> Vec<PathBuf> {
        [&self.config.local_copy_dir, &self.config.log_dir]
            .into_iter()
            .flatten()
            .map(|dir| dir.join(environment))
            .collect()
    }

    /// Apply the environment's policy. Individual deletion failures are reported, not raised.
    #[instrument(skip(self), fields(environment = %environment))]
    pub async fn prune(&self, environment: &str) -> Result<PruneReport> {
        let policy = self.config.environment(environment)?.retention;
        let now = self.clock.now();

        let artifacts = self.catalog.list(environment).await?;
        let wal = self.catalog.wal_segments(environment).await?;
        let mut local_files = Vec::new();
        for dir in self.local_dirs(environment) {
            collect_files(&dir, &mut local_files).await?;
        }
        let stale_after = self.config.lock.stale_after();
        let abandoned = self.catalog.fail_abandoned_restore_jobs(now, stale_after).await?;
        if !abandoned.is_empty() {
            warn!(jobs = abandoned.len(), "Abandoned restore jobs no longer protect their artifacts");
        }
        let protected = self.catalog.protected_artifacts(now, stale_after).await?;

        let plan = plan_prune(&policy, now, &artifacts, &wal, &local_files, &protected);
        let mut report = PruneReport {
            environment: environment.to_string(),
            ..PruneReport::default()
        };
        if plan.is_empty() {
            info!("Nothing to prune");
            return Ok(report);
        }

        let store = self.catalog.store();
        for name in &plan.expire {
            let outcome = async {
                store.delete(name).await?;
                self.catalog.transition(name, ArtifactStatus::Expired, now).await
            }
            .await;
            match outcome {
                Ok(_) => {
                    info!(artifact = %name, "Artifact expired");
                    report.expired.push(name.clone());
                }
                Err(e) => {
                    warn!(artifact = %name, error = %e, "Expiring artifact failed; will retry");
                    report.failures.push(format!("{}: {}", name, e));
                }
            }
        }

        for name in &plan.delete_wal {
            match store.delete(name).await {
                Ok(()) => report.wal_deleted += 1,
                Err(e) => {
                    warn!(object = %name, error = %e, "Deleting WAL segment failed; will retry");
                    report.failures.push(format!("{}: {}", name, e));
                }
            }
        }

        for path in &plan.delete_local {
            match tokio::fs::remove_file(path).await {
                Ok(()) => report.local_deleted += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Deleting local file failed");
                    report.failures.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        info!(
            expired = report.expired.len(),
            wal_deleted = report.wal_deleted,
            local_deleted = report.local_deleted,
            failures = report.failures.len(),
            "Prune pass complete"
        );
        Ok(report)
    }
}

fn collect_files<'a>(dir: &'a Path, out: &'a mut Vec<LocalFile>) -> BoxFuture<'a, Result<()>> {
    async move {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                collect_files(&entry.path(), out).await?;
            } else {
                out.push(LocalFile {
                    path: entry.path(),
                    modified: meta.modified()?.into(),
                });
            }
        }
        Ok(())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{BackupKind, WalPosition};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 2, 0, 0).unwrap()
    }

    fn artifact(days_ago: i64, status: ArtifactStatus, wal_start: u64) -> BackupArtifact {
        let created = now() - Duration::days(days_ago);
        let name = format!("prod/FULL/{}.archive.enc", created.format("%Y%m%d_%H%M%S"));
        let mut a = BackupArtifact::new(name, "prod", BackupKind::Full, "x25519:00", created);
        a.wal_start = WalPosition(wal_start);
        if status == ArtifactStatus::Failed {
            a.advance(ArtifactStatus::Failed, created).unwrap();
        } else {
            for s in [ArtifactStatus::Captured, ArtifactStatus::Encrypted, ArtifactStatus::Uploaded] {
                a.advance(s, created).unwrap();
            }
            a.advance(status, created).unwrap();
        }
        a
    }

    fn segment(sequence: u64, days_ago: i64) -> (String, WalSegment) {
        (
            format!("prod/wal/{:020}.wal.enc", sequence),
            WalSegment {
                sequence,
                file_name: format!("{:024X}", sequence),
                start: WalPosition(sequence * 100),
                end: WalPosition((sequence + 1) * 100),
                last_commit: now() - Duration::days(days_ago),
                last_xid: Some(sequence),
                size_bytes: 100,
            },
        )
    }

    #[test]
    fn test_expires_only_old_discoverable_artifacts() {
        let policy = RetentionPolicy::default();
        let artifacts = vec![
            artifact(45, ArtifactStatus::Verified, 0),
            artifact(40, ArtifactStatus::Failed, 0),
            artifact(35, ArtifactStatus::Uploaded, 100),
            artifact(10, ArtifactStatus::Uploaded, 500),
        ];
        let plan = plan_prune(&policy, now(), &artifacts, &[], &[], &[]);
        assert_eq!(plan.expire, vec![artifacts[0].name.clone(), artifacts[2].name.clone()]);
    }

    #[test]
    fn test_newest_artifact_survives_any_age() {
        let policy = RetentionPolicy::default();
        let artifacts = vec![
            artifact(90, ArtifactStatus::Uploaded, 0),
            artifact(60, ArtifactStatus::Verified, 100),
        ];
        let plan = plan_prune(&policy, now(), &artifacts, &[], &[], &[]);
        assert_eq!(plan.expire, vec![artifacts[0].name.clone()]);
    }

    #[test]
    fn test_protected_artifact_is_kept() {
        let policy = RetentionPolicy::default();
        let artifacts = vec![
            artifact(90, ArtifactStatus::Uploaded, 0),
            artifact(1, ArtifactStatus::Uploaded, 100),
        ];
        let plan = plan_prune(&policy, now(), &artifacts, &[], &[], &[artifacts[0].name.clone()]);
        assert!(plan.expire.is_empty());
    }

    #[test]
    fn test_wal_needed_by_retained_base_is_kept() {
        let policy = RetentionPolicy::default();
        // Retained base starts at position 300; segments 0..=2 end at or before it
        let artifacts = vec![artifact(20, ArtifactStatus::Uploaded, 300)];
        let wal: Vec<_> = (0..6).map(|s| segment(s, 20 - s as i64)).collect();
        let plan = plan_prune(&policy, now(), &artifacts, &wal, &[], &[]);
        assert_eq!(plan.delete_wal, vec![wal[0].0.clone(), wal[1].0.clone(), wal[2].0.clone()]);
    }

    #[test]
    fn test_local_files_follow_local_window() {
        let policy = RetentionPolicy {
            local_days: 3,
            ..RetentionPolicy::default()
        };
        let files = vec![
            LocalFile {
                path: PathBuf::from("/cache/prod/a"),
                modified: now() - Duration::days(4),
            },
            LocalFile {
                path: PathBuf::from("/cache/prod/b"),
                modified: now() - Duration::days(1),
            },
        ];
        let plan = plan_prune(&policy, now(), &[], &[], &files, &[]);
        assert_eq!(plan.delete_local, vec![PathBuf::from("/cache/prod/a")]);
    }

    #[test]
    fn test_plan_after_expiry_is_empty() {
        let policy = RetentionPolicy::default();
        let mut artifacts = vec![
            artifact(45, ArtifactStatus::Uploaded, 0),
            artifact(1, ArtifactStatus::Uploaded, 100),
        ];
        let plan = plan_prune(&policy, now(), &artifacts, &[], &[], &[]);
        assert_eq!(plan.expire.len(), 1);

        artifacts[0].advance(ArtifactStatus::Expired, now()).unwrap();
        assert!(plan_prune(&policy, now(), &artifacts, &[], &[], &[]).is_empty());
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetentionPolicy::default().validate().is_ok());
        let bad = RetentionPolicy {
            remote_days: 0,
            ..RetentionPolicy::default()
        };
        assert!(matches!(bad.validate(), Err(VaultError::Configuration(_))));
    }
}
