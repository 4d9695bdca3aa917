//! Persisted run and restore reports.
//!
//! Reports are the compliance audit trail. They live under `_reports/` in the shared store,
//! are written once, and retention never touches them.

use crate::artifact::SmokeTestResults;
use crate::store::RemoteStore;
use crate::{ErrorCode, Result, VaultError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

/// Reserved prefix for reports
pub const REPORT_PREFIX: &str = "_reports/";

/// Which entry point produced a report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// A backup run
    Backup,
    /// A restore job
    Restore,
    /// A verifier pass
    Verify,
    /// A WAL archiving pass
    ArchiveWal,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Backup => "backup",
            Operation::Restore => "restore",
            Operation::Verify => "verify",
            Operation::ArchiveWal => "archive-wal",
        }
    }
}

/// Outcome of an invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportStatus {
    /// Finished without error
    Succeeded,
    /// Finished with a typed error
    Failed,
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    /// Report id
    pub id: Uuid,
    /// When the invocation finished
    pub timestamp: DateTime<Utc>,
    /// Environment the invocation ran against
    pub environment: String,
    /// Entry point
    pub operation: Operation,
    /// Backup kind, e.g. `FULL`
    #[serde(rename = "type")]
    pub kind: String,
    /// Source descriptor (database identity or artifact)
    pub source: Option<String>,
    /// Target descriptor (artifact location or restore target)
    pub target: Option<String>,
    /// Artifact the invocation produced or consumed
    pub artifact: Option<String>,
    /// Payload size in bytes
    pub size_bytes: u64,
    /// Wall time in milliseconds
    pub duration_ms: u64,
    /// Final status
    pub status: ReportStatus,
    /// Typed failure code
    pub error_code: Option<ErrorCode>,
    /// Human-readable cause
    pub error: Option<String>,
    /// Post-restore checks, for restores and test restores
    pub smoke_test_results: Option<SmokeTestResults>,
}

impl RunReport {
    /// Start a report for an invocation; defaults to a successful outcome.
    pub fn new(operation: Operation, environment: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            environment: environment.into(),
            operation,
            kind: "FULL".to_string(),
            source: None,
            target: None,
            artifact: None,
            size_bytes: 0,
            duration_ms: 0,
            status: ReportStatus::Succeeded,
            error_code: None,
            error: None,
            smoke_test_results: None,
        }
    }

    /// Record a failure
    pub fn fail(&mut self, error: &VaultError) {
        self.status = ReportStatus::Failed;
        self.error_code = Some(error.code());
        self.error = Some(error.to_string());
    }

    fn object_name(&self) -> String {
        format!(
            "{}{}/{}-{}-{}.json",
            REPORT_PREFIX,
            self.environment,
            self.timestamp.format("%Y%m%dT%H%M%S%.3fZ"),
            self.operation.as_str(),
            self.id.simple()
        )
    }

    /// Persist to the shared store. Reports are never overwritten.
    pub async fn save(&self, store: &RemoteStore) -> Result<String> {
        let name = self.object_name();
        if !store.create_record(&name, serde_json::to_vec_pretty(self)?).await? {
            return Err(VaultError::Conflict(format!("report {} exists", name)));
        }
        debug!(report = %name, "Report saved");
        Ok(name)
    }

    /// Also write a copy into a local log directory, `{dir}/{environment}/`.
    pub async fn write_log(&self, dir: &Path) -> Result<()> {
        let dir = dir.join(&self.environment);
        tokio::fs::create_dir_all(&dir).await?;
        let file = dir.join(format!(
            "{}-{}.json",
            self.timestamp.format("%Y%m%dT%H%M%S"),
            self.operation.as_str()
        ));
        tokio::fs::write(file, serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }
}

/// All reports of an environment, oldest first.
pub async fn list_reports(store: &RemoteStore, environment: &str) -> Result<Vec<RunReport>> {
    let mut reports = Vec::new();
    for name in store.list(&format!("{}{}/", REPORT_PREFIX, environment)).await? {
        if let Some(data) = store.read_record(&name).await? {
            reports.push(serde_json::from_slice::<RunReport>(&data)?);
        }
    }
    reports.sort_by_key(|r| r.timestamp);
    Ok(reports)
}
