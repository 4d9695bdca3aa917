// Backup data model - artifacts, WAL segments, restore jobs and verification records

use crate::{Result, VaultError};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackupKind {
    Full,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "FULL",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "FULL" => Ok(BackupKind::Full),
            other => Err(VaultError::Configuration(format!("unknown backup kind: {}", other))),
        }
    }
}

/// Lifecycle of a [`BackupArtifact`].
///
/// Forward only: `PENDING → CAPTURED → ENCRYPTED → UPLOADED → VERIFIED → EXPIRED`.
/// `FAILED` is absorbing and reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ArtifactStatus {
    Pending,
    Captured,
    Encrypted,
    Uploaded,
    Verified,
    Expired,
    Failed,
}

impl ArtifactStatus {
    fn rank(&self) -> u8 {
        match self {
            ArtifactStatus::Pending => 0,
            ArtifactStatus::Captured => 1,
            ArtifactStatus::Encrypted => 2,
            ArtifactStatus::Uploaded => 3,
            ArtifactStatus::Verified => 4,
            ArtifactStatus::Expired => 5,
            ArtifactStatus::Failed => 6,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ArtifactStatus::Expired | ArtifactStatus::Failed)
    }

    /// Visible to restore, verify, monitor and retention.
    pub fn is_discoverable(&self) -> bool {
        matches!(self, ArtifactStatus::Uploaded | ArtifactStatus::Verified)
    }

    /// Left behind by a run that never reached `UPLOADED`.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ArtifactStatus::Pending | ArtifactStatus::Captured | ArtifactStatus::Encrypted
        )
    }

    pub fn can_transition_to(&self, next: ArtifactStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == ArtifactStatus::Failed {
            return true;
        }
        next.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactStatus::Pending => "PENDING",
            ArtifactStatus::Captured => "CAPTURED",
            ArtifactStatus::Encrypted => "ENCRYPTED",
            ArtifactStatus::Uploaded => "UPLOADED",
            ArtifactStatus::Verified => "VERIFIED",
            ArtifactStatus::Expired => "EXPIRED",
            ArtifactStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position in the write-ahead stream, rendered like a PostgreSQL LSN (`16/B374D848`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalPosition(pub u64);

impl fmt::Display for WalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for WalPosition {
    type Err = VaultError;

    fn from_str(s: &str) -> Result<Self> {
        let (hi, lo) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| VaultError::Configuration(format!("invalid WAL position: {}", s)))?;
        let hi = u64::from_str_radix(hi, 16)
            .map_err(|_| VaultError::Configuration(format!("invalid WAL position: {}", s)))?;
        let lo = u64::from_str_radix(lo, 16)
            .map_err(|_| VaultError::Configuration(format!("invalid WAL position: {}", s)))?;
        if hi > 0xFFFF_FFFF || lo > 0xFFFF_FFFF {
            return Err(VaultError::Configuration(format!("invalid WAL position: {}", s)));
        }
        Ok(WalPosition((hi << 32) | lo))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: ArtifactStatus,
    pub at: DateTime<Utc>,
}

/// One durable unit produced by one orchestrator run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupArtifact {
    pub name: String,
    pub environment: String,
    pub kind: BackupKind,
    pub source: String,
    pub label: String,
    pub wal_start: WalPosition,
    pub snapshot_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub raw_size: u64,
    pub encrypted_size: u64,
    pub checksum: Option<String>,
    pub location: String,
    pub key_ref: String,
    pub status: ArtifactStatus,
    pub history: Vec<StatusChange>,
    pub error: Option<String>,
}

impl BackupArtifact {
    pub fn new(
        name: impl Into<String>,
        environment: impl Into<String>,
        kind: BackupKind,
        key_ref: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            environment: environment.into(),
            kind,
            source: String::new(),
            label: String::new(),
            wal_start: WalPosition::default(),
            snapshot_at: None,
            started_at,
            finished_at: None,
            raw_size: 0,
            encrypted_size: 0,
            checksum: None,
            location: String::new(),
            key_ref: key_ref.into(),
            status: ArtifactStatus::Pending,
            history: vec![StatusChange {
                status: ArtifactStatus::Pending,
                at: started_at,
            }],
            error: None,
        }
    }

    /// Apply a status change, rejecting regressions and exits from terminal states.
    pub fn advance(&mut self, next: ArtifactStatus, at: DateTime<Utc>) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(VaultError::InvalidTransition(format!(
                "{}: {} -> {}",
                self.name, self.status, next
            )));
        }
        self.status = next;
        self.history.push(StatusChange { status: next, at });
        Ok(())
    }

    /// Reference time used for retention and freshness.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// One immutable chunk of the write-ahead stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalSegment {
    pub sequence: u64,
    pub file_name: String,
    pub start: WalPosition,
    pub end: WalPosition,
    pub last_commit: DateTime<Utc>,
    pub last_xid: Option<u64>,
    pub size_bytes: u64,
}

/// Where a point-in-time recovery stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RecoveryTarget {
    Time(DateTime<Utc>),
    Transaction(u64),
}

impl fmt::Display for RecoveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryTarget::Time(ts) => write!(f, "{}", ts.to_rfc3339()),
            RecoveryTarget::Transaction(xid) => write!(f, "xid:{}", xid),
        }
    }
}

impl FromStr for RecoveryTarget {
    type Err = VaultError;

    /// Accepts `xid:<n>`, RFC 3339, or `YYYY-MM-DD HH:MM:SS` (UTC).
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(xid) = s.strip_prefix("xid:") {
            return xid
                .parse::<u64>()
                .map(RecoveryTarget::Transaction)
                .map_err(|_| VaultError::Configuration(format!("invalid transaction id: {}", xid)));
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Ok(RecoveryTarget::Time(ts.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
            .map(|naive| RecoveryTarget::Time(Utc.from_utc_datetime(&naive)))
            .map_err(|_| VaultError::Configuration(format!("invalid recovery target: {}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RestoreStatus {
    Running,
    Succeeded,
    Failed,
}

/// Outcome of post-restore functional checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmokeTestResults {
    pub connectivity: bool,
    pub table_count: Option<u64>,
    pub audit_relation: Option<bool>,
    pub failures: Vec<String>,
}

impl SmokeTestResults {
    pub fn passed(&self) -> bool {
        self.connectivity && self.failures.is_empty()
    }
}

/// Ephemeral record of one restore invocation. Never mutates the artifact it reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreJob {
    pub id: Uuid,
    pub artifact: String,
    pub recovery_target: Option<RecoveryTarget>,
    pub target_environment: String,
    pub target_location: Option<String>,
    pub status: RestoreStatus,
    pub started_at: DateTime<Utc>,
    /// Refreshed by the running process while it works
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub segments_replayed: usize,
    pub recovered_through: Option<DateTime<Utc>>,
    pub smoke_test_results: Option<SmokeTestResults>,
    pub error_code: Option<crate::ErrorCode>,
    pub error: Option<String>,
}

impl RestoreJob {
    pub fn new(
        artifact: impl Into<String>,
        recovery_target: Option<RecoveryTarget>,
        target_environment: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            artifact: artifact.into(),
            recovery_target,
            target_environment: target_environment.into(),
            target_location: None,
            status: RestoreStatus::Running,
            started_at,
            heartbeat_at: Some(started_at),
            finished_at: None,
            segments_replayed: 0,
            recovered_through: None,
            smoke_test_results: None,
            error_code: None,
            error: None,
        }
    }

    pub fn is_point_in_time(&self) -> bool {
        self.recovery_target.is_some()
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.heartbeat_at.unwrap_or(self.started_at)
    }

    /// RUNNING, but the process behind it has been silent for `stale_after`.
    pub fn is_abandoned(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.status == RestoreStatus::Running && self.last_seen() + stale_after <= now
    }
}

/// Result of one verifier pass over one artifact. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: Uuid,
    pub artifact: String,
    pub verified_at: DateTime<Utc>,
    pub checksum_ok: bool,
    pub decrypt_ok: bool,
    pub structure_ok: bool,
    pub test_restore_ok: Option<bool>,
    pub error: Option<String>,
}

impl VerificationRecord {
    pub fn passed(&self) -> bool {
        self.checksum_ok
            && self.decrypt_ok
            && self.structure_ok
            && self.test_restore_ok.unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact() -> BackupArtifact {
        BackupArtifact::new(
            "prod/FULL/20250101_020000.archive.enc",
            "prod",
            BackupKind::Full,
            "x25519:00",
            Utc::now(),
        )
    }

    #[test]
    fn test_status_moves_forward_only() {
        let mut a = artifact();
        let now = Utc::now();
        a.advance(ArtifactStatus::Captured, now).unwrap();
        a.advance(ArtifactStatus::Encrypted, now).unwrap();
        a.advance(ArtifactStatus::Uploaded, now).unwrap();
        a.advance(ArtifactStatus::Verified, now).unwrap();

        let err = a.advance(ArtifactStatus::Uploaded, now).unwrap_err();
        assert!(matches!(err, VaultError::InvalidTransition(_)));
        assert_eq!(a.status, ArtifactStatus::Verified);
        assert_eq!(a.history.len(), 5);
    }

    #[test]
    fn test_failed_is_absorbing() {
        let mut a = artifact();
        let now = Utc::now();
        a.advance(ArtifactStatus::Failed, now).unwrap();
        assert!(a.advance(ArtifactStatus::Uploaded, now).is_err());
        assert!(a.advance(ArtifactStatus::Expired, now).is_err());
        assert!(!a.status.is_discoverable());
    }

    #[test]
    fn test_expired_cannot_fail() {
        assert!(!ArtifactStatus::Expired.can_transition_to(ArtifactStatus::Failed));
        assert!(ArtifactStatus::Verified.can_transition_to(ArtifactStatus::Expired));
        assert!(ArtifactStatus::Uploaded.can_transition_to(ArtifactStatus::Expired));
    }

    #[test]
    fn test_restore_job_abandonment() {
        let started = Utc.with_ymd_and_hms(2025, 1, 1, 2, 0, 0).unwrap();
        let window = chrono::Duration::hours(1);
        let mut job = RestoreJob::new("prod/FULL/20250101_020000.archive.enc", None, "sandbox", started);
        assert!(!job.is_abandoned(started + chrono::Duration::minutes(59), window));
        assert!(job.is_abandoned(started + window, window));

        job.heartbeat_at = Some(started + chrono::Duration::minutes(50));
        assert!(!job.is_abandoned(started + window, window));

        // Records written before heartbeats existed fall back to the start time
        job.heartbeat_at = None;
        assert!(job.is_abandoned(started + window, window));

        job.status = RestoreStatus::Failed;
        assert!(!job.is_abandoned(started + chrono::Duration::days(30), window));
    }

    #[test]
    fn test_wal_position_display_and_parse() {
        let pos = WalPosition((0x16 << 32) | 0xB374_D848);
        assert_eq!(pos.to_string(), "16/B374D848");
        assert_eq!("16/B374D848".parse::<WalPosition>().unwrap(), pos);
        assert!("nonsense".parse::<WalPosition>().is_err());
    }

    #[test]
    fn test_recovery_target_parsing() {
        let t: RecoveryTarget = "2025-01-01T03:30:00Z".parse().unwrap();
        assert_eq!(
            t,
            RecoveryTarget::Time(Utc.with_ymd_and_hms(2025, 1, 1, 3, 30, 0).unwrap())
        );

        let t: RecoveryTarget = "2025-01-01 03:30:00".parse().unwrap();
        assert!(matches!(t, RecoveryTarget::Time(_)));

        let t: RecoveryTarget = "xid:4711".parse().unwrap();
        assert_eq!(t, RecoveryTarget::Transaction(4711));

        assert!("yesterday".parse::<RecoveryTarget>().is_err());
    }
}
