//! # pitr-vault
//!
//! Encrypted backups, verification and point-in-time recovery for the primary relational
//! database of a regulated application.
//!
//! ## Overview
//!
//! The crate owns the backup lifecycle and nothing else. The database engine, the object store
//! and the scheduler are collaborators reached through traits:
//!
//! - [`db::Database`]: base snapshots, WAL segments, isolated restore targets, smoke checks
//! - [`store::ObjectStore`]: namespaced blob storage with server-side encryption
//!
//! Every entry point is a single sequential pipeline:
//!
//! ```text
//! backup:   lock -> snapshot -> archive -> encrypt -> upload -> record -> prune
//! verify:   download -> checksum -> decrypt -> structure -> (test restore) -> VERIFIED
//! restore:  download -> decrypt -> extract -> WAL replay -> smoke tests
//! monitor:  freshness, size deviation, store reachability
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pitr_vault::backup::BackupOrchestrator;
//! use pitr_vault::config::{EnvironmentConfig, VaultConfig};
//! use pitr_vault::db::SimulatedDatabase;
//! use pitr_vault::store::{MemoryObjectStore, RemoteStore};
//! use pitr_vault::crypto::KeyPair;
//!
//! # async fn example() -> pitr_vault::Result<()> {
//! let config = VaultConfig::default().with_environment("prod", EnvironmentConfig::default());
//! let store = RemoteStore::new(Arc::new(MemoryObjectStore::new()), config.retry.clone());
//! let keys = KeyPair::generate();
//! let database = Arc::new(SimulatedDatabase::new("prod-db"));
//!
//! let orchestrator = BackupOrchestrator::new(config, store, keys.encryptor(), database);
//! let artifact = orchestrator.run_backup("prod").await?;
//! println!("uploaded {}", artifact.name);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`artifact`]: data model, naming convention and the catalog
//! - [`store`]: remote store adapter and backends
//! - [`crypto`]: streaming public-key encryption
//! - [`archive`]: backup container format
//! - [`lock`]: environment-scoped lease lock
//! - [`backup`]: backup orchestrator and WAL archiving
//! - [`retention`]: expiry planning and pruning
//! - [`verify`]: integrity and restorability checks
//! - [`restore`]: full and point-in-time recovery
//! - [`monitor`]: health checks, alerts and metrics

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for vault operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Main error type for vault operations
#[derive(Error, Debug)]
pub enum VaultError {
    /// Network or store timeout; retried with backoff
    #[error("Transient I/O error: {0}")]
    TransientIo(String),

    /// Missing credentials, keys or settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Sealing a payload failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Malformed key reference or corrupted ciphertext
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Another run holds the environment lease
    #[error("Lock held: {0}")]
    LockContention(String),

    /// Checksum or structural mismatch
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// The requested recovery target cannot be reached with archived WAL
    #[error("Insufficient WAL: {0}")]
    InsufficientWal(String),

    /// Restore finished its I/O but functional checks failed
    #[error("Smoke test failure: {0}")]
    SmokeTest(String),

    /// Database or object store cannot be reached
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Requested artifact, segment or record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Attempted status regression or transition out of a terminal state
    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    /// Object already exists with different content
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Operator aborted the invocation
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Local filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Machine-parseable failure codes surfaced at the invocation boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Another backup run holds the lease
    LockHeld,
    /// Database or store unreachable
    UpstreamUnreachable,
    /// Encryption or decryption failed
    EncryptionFailure,
    /// Checksum, structure or test-restore failure
    VerificationFailure,
    /// PITR target not covered by WAL
    InsufficientWal,
    /// Restored instance failed smoke tests
    SmokeTestFailure,
    /// Bad or missing configuration
    ConfigurationError,
    /// Operator cancellation
    Cancelled,
    /// Anything else
    InternalError,
}

impl ErrorCode {
    /// Stable string form, identical to the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::LockHeld => "LOCK_HELD",
            ErrorCode::UpstreamUnreachable => "UPSTREAM_UNREACHABLE",
            ErrorCode::EncryptionFailure => "ENCRYPTION_FAILURE",
            ErrorCode::VerificationFailure => "VERIFICATION_FAILURE",
            ErrorCode::InsufficientWal => "INSUFFICIENT_WAL",
            ErrorCode::SmokeTestFailure => "SMOKE_TEST_FAILURE",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Process exit status for this code. Never zero.
    pub fn exit_status(&self) -> i32 {
        match self {
            ErrorCode::LockHeld => 10,
            ErrorCode::UpstreamUnreachable => 11,
            ErrorCode::EncryptionFailure => 12,
            ErrorCode::VerificationFailure => 13,
            ErrorCode::InsufficientWal => 14,
            ErrorCode::SmokeTestFailure => 15,
            ErrorCode::ConfigurationError => 16,
            ErrorCode::Cancelled => 17,
            ErrorCode::InternalError => 1,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl VaultError {
    /// Failure code reported to the scheduler and alerting pipeline
    pub fn code(&self) -> ErrorCode {
        match self {
            VaultError::LockContention(_) => ErrorCode::LockHeld,
            VaultError::TransientIo(_) | VaultError::UpstreamUnreachable(_) => {
                ErrorCode::UpstreamUnreachable
            }
            VaultError::Encryption(_) | VaultError::Decryption(_) => ErrorCode::EncryptionFailure,
            VaultError::Integrity(_) => ErrorCode::VerificationFailure,
            VaultError::InsufficientWal(_) => ErrorCode::InsufficientWal,
            VaultError::SmokeTest(_) => ErrorCode::SmokeTestFailure,
            VaultError::Configuration(_) => ErrorCode::ConfigurationError,
            VaultError::Cancelled(_) => ErrorCode::Cancelled,
            VaultError::NotFound(_)
            | VaultError::InvalidTransition(_)
            | VaultError::Conflict(_)
            | VaultError::Io(_)
            | VaultError::Serialization(_) => ErrorCode::InternalError,
        }
    }

    /// Whether the retry layer may attempt the operation again
    pub fn is_transient(&self) -> bool {
        matches!(self, VaultError::TransientIo(_))
    }
}

/// Data model, naming convention and persisted records
pub mod artifact;

/// Configuration loading and validation
pub mod config;

/// Remote store adapter and backends
pub mod store;

/// Streaming public-key encryption
pub mod crypto;

/// Backup container format
pub mod archive;

/// Environment-scoped lease lock
pub mod lock;

/// Bounded exponential backoff
pub mod retry;

/// Injectable time source
pub mod clock;

/// Database collaborator interfaces
pub mod db;

/// Backup orchestrator
pub mod backup;

/// Retention planning and pruning
pub mod retention;

/// Artifact verification
pub mod verify;

/// Full and point-in-time restore
pub mod restore;

/// Health checks, alerts and metrics
pub mod monitor;

/// Persisted run and restore reports
pub mod report;
