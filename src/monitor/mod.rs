// Monitor - freshness, size deviation and store reachability
//
// Strictly observational: reads catalog records and pings the store. Nothing here can
// change an artifact, and alert delivery failures are logged, never raised.

pub mod metrics;

use crate::artifact::{BackupArtifact, Catalog};
use crate::clock::Clock;
use crate::config::VaultConfig;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    StoreUnreachable,
    NoBackup,
    StaleBackup,
    SizeDeviation,
    VerificationFailed,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::StoreUnreachable => "store_unreachable",
            AlertKind::NoBackup => "no_backup",
            AlertKind::StaleBackup => "stale_backup",
            AlertKind::SizeDeviation => "size_deviation",
            AlertKind::VerificationFailed => "verification_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub environment: String,
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub artifact: Option<String>,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        environment: &str,
        kind: AlertKind,
        severity: Severity,
        message: impl Into<String>,
        raised_at: DateTime<Utc>,
    ) -> Self {
        Self {
            environment: environment.to_string(),
            kind,
            severity,
            message: message.into(),
            artifact: None,
            raised_at,
        }
    }

    pub fn for_artifact(mut self, artifact: &str) -> Self {
        self.artifact = Some(artifact.to_string());
        self
    }
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.environment, self.kind.as_str(), self.message)
    }
}

/// External notification channel.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// Alerts as structured log events.
#[derive(Debug, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            Severity::Critical => error!(
                environment = %alert.environment,
                kind = alert.kind.as_str(),
                artifact = ?alert.artifact,
                "ALERT: {}", alert.message
            ),
            Severity::Warning => warn!(
                environment = %alert.environment,
                kind = alert.kind.as_str(),
                artifact = ?alert.artifact,
                "ALERT: {}", alert.message
            ),
        }
        Ok(())
    }
}

/// JSON lines appended to a file tailed by the paging pipeline.
#[derive(Debug)]
pub struct FileAlertSink {
    path: PathBuf,
}

impl FileAlertSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl AlertSink for FileAlertSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(alert)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Collects alerts in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryAlertSink {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn kinds(&self) -> Vec<AlertKind> {
        self.alerts.lock().iter().map(|a| a.kind).collect()
    }
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn send(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

/// Deliver alerts, counting each and logging delivery failures.
pub async fn dispatch(sink: &dyn AlertSink, alerts: &[Alert]) {
    for alert in alerts {
        metrics::record_alert(&alert.environment, alert.kind.as_str());
        if let Err(e) = sink.send(alert).await {
            error!(alert = %alert, error = %e, "Alert delivery failed");
        }
    }
}

/// Default sink for a configuration: the alerts file when set, the log otherwise.
pub fn sink_for(config: &VaultConfig) -> Arc<dyn AlertSink> {
    match &config.alerts_file {
        Some(path) => Arc::new(FileAlertSink::new(path.clone())),
        None => Arc::new(LogAlertSink),
    }
}

/// Percentage deviation of `latest` from the mean of `window`, if there is a window.
pub fn size_deviation_percent(latest: u64, window: &[u64]) -> Option<f64> {
    if window.is_empty() {
        return None;
    }
    let mean = window.iter().map(|&s| s as f64).sum::<f64>() / window.len() as f64;
    if mean <= 0.0 {
        return None;
    }
    Some(((latest as f64 - mean).abs() / mean) * 100.0)
}

/// Thresholds beyond a millennium are treated as a millennium
const MAX_THRESHOLD_HOURS: i64 = 24 * 365 * 1000;

pub struct Monitor {
    config: VaultConfig,
    catalog: Catalog,
    sink: Arc<dyn AlertSink>,
    clock: Clock,
}

impl Monitor {
    pub fn new(config: VaultConfig, catalog: Catalog, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            config,
            catalog,
            sink,
            clock: Clock::System,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Run every check and route the resulting alerts to the sink.
    #[instrument(skip(self), fields(environment = %environment))]
    pub async fn check_health(&self, environment: &str) -> Result<Vec<Alert>> {
        let env = self.config.environment(environment)?;
        let now = self.clock.now();
        let mut alerts = Vec::new();

        if let Err(e) = self.catalog.store().ping().await {
            alerts.push(Alert::new(
                environment,
                AlertKind::StoreUnreachable,
                Severity::Critical,
                format!("remote store {} unreachable: {}", self.catalog.store().backend_name(), e),
                now,
            ));
            dispatch(self.sink.as_ref(), &alerts).await;
            return Ok(alerts);
        }

        let artifacts = match self.catalog.discoverable(environment).await {
            Ok(artifacts) => artifacts,
            Err(e) => {
                alerts.push(Alert::new(
                    environment,
                    AlertKind::StoreUnreachable,
                    Severity::Critical,
                    format!("cannot read catalog: {}", e),
                    now,
                ));
                dispatch(self.sink.as_ref(), &alerts).await;
                return Ok(alerts);
            }
        };

        match artifacts.last() {
            None => alerts.push(Alert::new(
                environment,
                AlertKind::NoBackup,
                Severity::Critical,
                "no uploaded backup exists",
                now,
            )),
            Some(latest) => {
                alerts.extend(self.check_freshness(environment, latest, now, env.freshness_hours));
                let prior: Vec<u64> = artifacts[..artifacts.len() - 1]
                    .iter()
                    .rev()
                    .take(env.size_window)
                    .map(|a| a.encrypted_size)
                    .collect();
                alerts.extend(self.check_size(environment, latest, &prior, env.size_deviation_percent, now));
                alerts.extend(self.check_last_verification(environment, latest, now).await);
            }
        }

        if alerts.is_empty() {
            info!("Environment healthy");
        }
        dispatch(self.sink.as_ref(), &alerts).await;
        Ok(alerts)
    }

    fn check_freshness(
        &self,
        environment: &str,
        latest: &BackupArtifact,
        now: DateTime<Utc>,
        freshness_hours: u64,
    ) -> Option<Alert> {
        let age = now - latest.created_at();
        metrics::set_latest_age(environment, age.num_seconds());
        let hours = i64::try_from(freshness_hours).unwrap_or(i64::MAX).min(MAX_THRESHOLD_HOURS);
        let limit = chrono::Duration::hours(hours);
        (age > limit).then(|| {
            Alert::new(
                environment,
                AlertKind::StaleBackup,
                Severity::Critical,
                format!(
                    "latest backup is {}h old (threshold {}h)",
                    age.num_hours(),
                    freshness_hours
                ),
                now,
            )
            .for_artifact(&latest.name)
        })
    }

    fn check_size(
        &self,
        environment: &str,
        latest: &BackupArtifact,
        prior: &[u64],
        threshold_percent: f64,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let deviation = size_deviation_percent(latest.encrypted_size, prior)?;
        (deviation > threshold_percent).then(|| {
            Alert::new(
                environment,
                AlertKind::SizeDeviation,
                Severity::Warning,
                format!(
                    "latest backup is {} bytes, {:.1}% off the rolling average of {} artifacts (threshold {:.1}%)",
                    latest.encrypted_size,
                    deviation,
                    prior.len(),
                    threshold_percent
                ),
                now,
            )
            .for_artifact(&latest.name)
        })
    }

    async fn check_last_verification(
        &self,
        environment: &str,
        latest: &BackupArtifact,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        let records = match self.catalog.verifications(&latest.name).await {
            Ok(records) => records,
            Err(e) => {
                warn!(artifact = %latest.name, error = %e, "Cannot read verification records");
                return None;
            }
        };
        let last = records.last()?;
        (!last.passed()).then(|| {
            Alert::new(
                environment,
                AlertKind::VerificationFailed,
                Severity::Critical,
                format!(
                    "last verification failed: {}",
                    last.error.as_deref().unwrap_or("unknown cause")
                ),
                now,
            )
            .for_artifact(&latest.name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_deviation() {
        assert_eq!(size_deviation_percent(100, &[]), None);
        assert_eq!(size_deviation_percent(100, &[0, 0]), None);
        assert_eq!(size_deviation_percent(100, &[100, 100]), Some(0.0));
        let d = size_deviation_percent(40, &[100, 100, 100]).unwrap();
        assert!((d - 60.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts").join("alerts.jsonl");
        let sink = FileAlertSink::new(&path);
        let alert = Alert::new("prod", AlertKind::NoBackup, Severity::Critical, "none", Utc::now());
        sink.send(&alert).await.unwrap();
        sink.send(&alert).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Alert> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines, vec![alert.clone(), alert]);
    }
}
