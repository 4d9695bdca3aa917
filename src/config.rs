// Vault configuration - JSON file with PITR_VAULT_* environment overrides

use crate::artifact::naming::validate_environment;
use crate::retention::RetentionPolicy;
use crate::retry::RetryConfig;
use crate::store::ServerSideEncryption;
use crate::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub store: StoreConfig,
    pub server_side_encryption: ServerSideEncryption,
    pub keys: KeyConfig,
    /// Scratch space for encrypted payloads in flight
    pub staging_dir: PathBuf,
    /// Optional local copy of every uploaded artifact, pruned by `local_days`
    pub local_copy_dir: Option<PathBuf>,
    /// Run logs pruned alongside local copies
    pub log_dir: Option<PathBuf>,
    /// JSON-lines alert sink consumed by the paging pipeline
    pub alerts_file: Option<PathBuf>,
    /// node-exporter textfile collector target
    pub metrics_textfile: Option<PathBuf>,
    pub retry: RetryConfig,
    pub lock: LockConfig,
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            server_side_encryption: ServerSideEncryption::default(),
            keys: KeyConfig::default(),
            staging_dir: std::env::temp_dir().join("pitr-vault"),
            local_copy_dir: None,
            log_dir: None,
            alerts_file: None,
            metrics_textfile: None,
            retry: RetryConfig::default(),
            lock: LockConfig::default(),
            environments: BTreeMap::new(),
        }
    }
}

impl VaultConfig {
    /// Load from a JSON file, apply environment overrides and validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            VaultError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config: VaultConfig = serde_json::from_str(&raw).map_err(|e| {
            VaultError::Configuration(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override selected settings from `PITR_VAULT_*` variables.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("PITR_VAULT_STAGING_DIR") {
            self.staging_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("PITR_VAULT_PUBLIC_KEY") {
            self.keys.public_key_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("PITR_VAULT_PRIVATE_KEY") {
            self.keys.private_key_path = Some(PathBuf::from(path));
        }
        if let Some(ttl) = lookup("PITR_VAULT_LOCK_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.lock.ttl_secs = ttl;
        }
        if let Some(path) = lookup("PITR_VAULT_ALERTS_FILE") {
            self.alerts_file = Some(PathBuf::from(path));
        }
        match &mut self.store {
            StoreConfig::Filesystem { root } => {
                if let Some(dir) = lookup("PITR_VAULT_STORE_ROOT") {
                    *root = PathBuf::from(dir);
                }
            }
            StoreConfig::S3(s3) => {
                if let Some(bucket) = lookup("PITR_VAULT_S3_BUCKET") {
                    s3.bucket = bucket;
                }
                if let Some(region) = lookup("PITR_VAULT_S3_REGION") {
                    s3.region = region;
                }
                if let Some(endpoint) = lookup("PITR_VAULT_S3_ENDPOINT") {
                    s3.endpoint_url = Some(endpoint);
                }
            }
            StoreConfig::Memory => {}
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, env) in &self.environments {
            validate_environment(name)?;
            env.validate(name)?;
        }
        if let StoreConfig::S3(s3) = &self.store {
            if s3.bucket.trim().is_empty() {
                return Err(VaultError::Configuration("s3 bucket is empty".into()));
            }
            if s3.part_concurrency == 0 {
                return Err(VaultError::Configuration("s3 part_concurrency must be positive".into()));
            }
        }
        if self.lock.ttl_secs == 0 {
            return Err(VaultError::Configuration("lock ttl must be positive".into()));
        }
        Ok(())
    }

    /// Settings of a configured environment.
    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig> {
        self.environments.get(name).ok_or_else(|| {
            VaultError::Configuration(format!("environment {:?} is not configured", name))
        })
    }

    pub fn with_environment(mut self, name: impl Into<String>, env: EnvironmentConfig) -> Self {
        self.environments.insert(name.into(), env);
        self
    }
}

/// Object store backend selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Filesystem {
        root: PathBuf,
    },
    S3(S3Settings),
}

/// S3 backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub key_prefix: String,
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub multipart_threshold_mb: u64,
    pub part_size_mb: u64,
    /// Parts uploaded at once during a multipart upload
    pub part_concurrency: usize,
    pub create_bucket: bool,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            bucket: "pitr-vault-backups".to_string(),
            region: "us-east-1".to_string(),
            key_prefix: String::new(),
            endpoint_url: None,
            force_path_style: false,
            multipart_threshold_mb: 64,
            part_size_mb: 16,
            part_concurrency: 4,
            create_bucket: false,
        }
    }
}

/// Key file locations. The backup host only ever needs the public key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub public_key_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Silence after which a RUNNING restore job counts as abandoned.
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ttl_secs.min(u64::from(u32::MAX)) as i64)
    }
}

/// Per-environment settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub database: DatabaseConfig,
    pub retention: RetentionPolicy,
    /// Latest artifact older than this raises a freshness alert
    pub freshness_hours: u64,
    /// Allowed deviation of the latest size from the rolling average
    pub size_deviation_percent: f64,
    /// Number of prior artifacts in the rolling average
    pub size_window: usize,
    /// Days between full test restores during verification
    pub test_restore_every_days: u64,
    /// Relation whose presence the restore smoke test asserts
    pub audit_relation: Option<String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            retention: RetentionPolicy::default(),
            freshness_hours: 26,
            size_deviation_percent: 50.0,
            size_window: 7,
            test_restore_every_days: 7,
            audit_relation: None,
        }
    }
}

impl EnvironmentConfig {
    fn validate(&self, name: &str) -> Result<()> {
        if self.freshness_hours == 0 {
            return Err(VaultError::Configuration(format!(
                "{}: freshness_hours must be positive",
                name
            )));
        }
        if !(self.size_deviation_percent > 0.0) {
            return Err(VaultError::Configuration(format!(
                "{}: size_deviation_percent must be positive",
                name
            )));
        }
        self.retention.validate().map_err(|e| match e {
            VaultError::Configuration(msg) => VaultError::Configuration(format!("{}: {}", name, msg)),
            other => other,
        })
    }
}

/// Database collaborator selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "snake_case")]
pub enum DatabaseConfig {
    /// In-process database for drills and tests
    Simulated { identity: String },
    Postgres(PostgresSettings),
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig::Simulated {
            identity: "simulated".to_string(),
        }
    }
}

/// PostgreSQL collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PostgresSettings {
    /// Connection URL of the production cluster
    pub url: String,
    pub pg_basebackup: PathBuf,
    pub pg_ctl: PathBuf,
    /// Directory `archive_command` copies completed segments into
    pub wal_archive_dir: PathBuf,
    /// Parent directory for isolated restore targets
    pub restore_root: PathBuf,
    /// First port restored instances may listen on; never the production port
    pub restore_port: u16,
    /// Ports from `restore_port` upward handed out to concurrent restores
    pub restore_port_span: u16,
    pub connect_timeout_secs: u64,
}

impl Default for PostgresSettings {
    fn default() -> Self {
        Self {
            url: "postgres://postgres@localhost:5432/postgres".to_string(),
            pg_basebackup: PathBuf::from("pg_basebackup"),
            pg_ctl: PathBuf::from("pg_ctl"),
            wal_archive_dir: PathBuf::from("/var/lib/postgresql/wal_archive"),
            restore_root: std::env::temp_dir().join("pitr-vault-restores"),
            restore_port: 55432,
            restore_port_span: 100,
            connect_timeout_secs: 10,
        }
    }
}
