// Shared fixtures for the integration suites: an in-memory store with fault injection,
// a simulated database on a pinned clock, and a throwaway key pair.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use pitr_vault::artifact::Catalog;
use pitr_vault::backup::BackupOrchestrator;
use pitr_vault::clock::Clock;
use pitr_vault::config::{EnvironmentConfig, VaultConfig};
use pitr_vault::crypto::{Decryptor, Encryptor, KeyPair};
use pitr_vault::db::SimulatedDatabase;
use pitr_vault::monitor::{AlertSink, MemoryAlertSink, Monitor};
use pitr_vault::restore::RestoreEngine;
use pitr_vault::retention::RetentionManager;
use pitr_vault::retry::RetryConfig;
use pitr_vault::store::{MemoryObjectStore, ObjectStore, RemoteStore};
use pitr_vault::verify::Verifier;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

pub const AUDIT_TABLE: &str = "audit_log";

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

pub fn config_for(dir: &TempDir) -> VaultConfig {
    let environment = EnvironmentConfig {
        audit_relation: Some(AUDIT_TABLE.to_string()),
        ..EnvironmentConfig::default()
    };
    VaultConfig {
        staging_dir: dir.path().join("staging"),
        local_copy_dir: Some(dir.path().join("local")),
        log_dir: Some(dir.path().join("logs")),
        retry: RetryConfig::immediate(3),
        ..VaultConfig::default()
    }
    .with_environment("prod", environment.clone())
    .with_environment("staging", environment)
}

pub struct Harness {
    pub clock: Clock,
    pub memory: MemoryObjectStore,
    pub store: RemoteStore,
    pub catalog: Catalog,
    pub db: SimulatedDatabase,
    pub encryptor: Encryptor,
    pub decryptor: Decryptor,
    pub config: VaultConfig,
    pub alerts: Arc<MemoryAlertSink>,
    pub dir: TempDir,
}

impl Harness {
    /// Clock pinned at 2025-01-01 02:00:00 UTC.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let memory = MemoryObjectStore::new();
        Self::with_backend(dir, memory.clone(), Arc::new(memory))
    }

    pub fn with_backend(dir: TempDir, memory: MemoryObjectStore, backend: Arc<dyn ObjectStore>) -> Self {
        let clock = Clock::fixed(at(2025, 1, 1, 2, 0, 0));
        let config = config_for(&dir);
        let store = RemoteStore::new(backend, config.retry.clone());
        let keys = KeyPair::generate();
        Self {
            db: SimulatedDatabase::new("prod-db").with_clock(clock.clone()),
            catalog: Catalog::new(store.clone()),
            clock,
            memory,
            store,
            encryptor: keys.encryptor(),
            decryptor: keys.decryptor(),
            config,
            alerts: Arc::new(MemoryAlertSink::new()),
            dir,
        }
    }

    /// Create `tables` tables (the last one is the audit table), one row each.
    pub fn seed(&self, tables: usize) {
        for i in 0..tables {
            let name = if i + 1 == tables {
                AUDIT_TABLE.to_string()
            } else {
                format!("table_{}", i)
            };
            self.db.create_table(&name).unwrap();
            self.db.insert(&name, json!({ "id": i })).unwrap();
        }
    }

    pub fn orchestrator(&self) -> BackupOrchestrator {
        self.orchestrator_as("host-a")
    }

    pub fn orchestrator_as(&self, owner: &str) -> BackupOrchestrator {
        BackupOrchestrator::new(
            self.config.clone(),
            self.store.clone(),
            self.encryptor.clone(),
            Arc::new(self.db.clone()),
        )
        .with_clock(self.clock.clone())
        .with_owner(owner)
    }

    pub fn restore_engine(&self) -> RestoreEngine {
        RestoreEngine::new(
            self.config.clone(),
            self.catalog.clone(),
            self.decryptor.clone(),
            Arc::new(self.db.clone()),
        )
        .with_clock(self.clock.clone())
    }

    pub fn verifier(&self) -> Verifier {
        Verifier::new(
            self.config.clone(),
            self.catalog.clone(),
            self.decryptor.clone(),
            Arc::new(self.db.clone()),
            self.alerts.clone() as Arc<dyn AlertSink>,
        )
        .with_clock(self.clock.clone())
    }

    pub fn monitor(&self) -> Monitor {
        Monitor::new(self.config.clone(), self.catalog.clone(), self.alerts.clone() as Arc<dyn AlertSink>)
            .with_clock(self.clock.clone())
    }

    pub fn retention(&self) -> RetentionManager {
        RetentionManager::new(self.config.clone(), self.catalog.clone()).with_clock(self.clock.clone())
    }
}
