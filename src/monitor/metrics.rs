//! Prometheus metrics for backup, restore and verification runs
//!
//! Registered in the default registry. Scheduled invocations are short-lived processes,
//! so `monitor` can flush the exposition to a node-exporter textfile.

use crate::Result;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, Encoder,
    HistogramVec, IntCounterVec, IntGaugeVec, TextEncoder,
};
use std::path::Path;
use std::time::Instant;

lazy_static! {
    /// Backup runs by outcome
    static ref BACKUP_RUNS: IntCounterVec = register_int_counter_vec!(
        "pitr_vault_backup_runs_total",
        "Total number of backup runs",
        &["environment", "status"]
    ).unwrap();

    /// Backup run duration
    static ref BACKUP_DURATION: HistogramVec = register_histogram_vec!(
        "pitr_vault_backup_duration_seconds",
        "Backup run duration in seconds",
        &["environment"],
        vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]
    ).unwrap();

    /// Encrypted size of the latest artifact
    static ref BACKUP_SIZE: IntGaugeVec = register_int_gauge_vec!(
        "pitr_vault_backup_size_bytes",
        "Encrypted size of the latest uploaded artifact",
        &["environment"]
    ).unwrap();

    /// Age of the newest discoverable artifact
    static ref LATEST_AGE: IntGaugeVec = register_int_gauge_vec!(
        "pitr_vault_latest_backup_age_seconds",
        "Age of the newest discoverable artifact in seconds",
        &["environment"]
    ).unwrap();

    static ref RESTORE_RUNS: IntCounterVec = register_int_counter_vec!(
        "pitr_vault_restore_runs_total",
        "Total number of restore jobs",
        &["environment", "mode", "status"]
    ).unwrap();

    static ref VERIFICATIONS: IntCounterVec = register_int_counter_vec!(
        "pitr_vault_verifications_total",
        "Total number of verifier passes",
        &["environment", "status"]
    ).unwrap();

    static ref WAL_ARCHIVED: IntCounterVec = register_int_counter_vec!(
        "pitr_vault_wal_segments_archived_total",
        "Total number of WAL segments archived",
        &["environment"]
    ).unwrap();

    static ref ALERTS: IntCounterVec = register_int_counter_vec!(
        "pitr_vault_alerts_total",
        "Total number of alerts raised",
        &["environment", "kind"]
    ).unwrap();
}

fn status_label(ok: bool) -> &'static str {
    if ok {
        "success"
    } else {
        "failure"
    }
}

pub fn record_backup(environment: &str, ok: bool, duration_secs: f64, encrypted_bytes: Option<u64>) {
    BACKUP_RUNS
        .with_label_values(&[environment, status_label(ok)])
        .inc();
    BACKUP_DURATION
        .with_label_values(&[environment])
        .observe(duration_secs);
    if let Some(bytes) = encrypted_bytes {
        BACKUP_SIZE
            .with_label_values(&[environment])
            .set(i64::try_from(bytes).unwrap_or(i64::MAX));
    }
}

pub fn record_restore(environment: &str, point_in_time: bool, ok: bool) {
    let mode = if point_in_time { "pitr" } else { "full" };
    RESTORE_RUNS
        .with_label_values(&[environment, mode, status_label(ok)])
        .inc();
}

pub fn record_verification(environment: &str, ok: bool) {
    VERIFICATIONS
        .with_label_values(&[environment, status_label(ok)])
        .inc();
}

pub fn record_wal_archived(environment: &str, segments: usize) {
    WAL_ARCHIVED
        .with_label_values(&[environment])
        .inc_by(segments as u64);
}

pub fn set_latest_age(environment: &str, age_secs: i64) {
    LATEST_AGE.with_label_values(&[environment]).set(age_secs);
}

pub fn record_alert(environment: &str, kind: &str) {
    ALERTS.with_label_values(&[environment, kind]).inc();
}

/// Text exposition of every registered metric.
pub fn gather_text() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| crate::VaultError::Io(std::io::Error::other(e.to_string())))?;
    String::from_utf8(buffer).map_err(|e| crate::VaultError::Io(std::io::Error::other(e.to_string())))
}

/// Atomically replace a textfile-collector file.
pub async fn write_textfile(path: &Path) -> Result<()> {
    let text = gather_text()?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Timer for measuring run duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    #[inline]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[inline]
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
