//! Database collaborator interfaces.
//!
//! The vault never talks to the engine directly. It needs four capabilities:
//!
//! 1. a consistent streaming base snapshot tagged with its WAL start position
//! 2. access to completed WAL segments
//! 3. an isolated restore target that can be populated, replayed and started
//! 4. a minimal query surface on the started target for smoke tests

mod postgres;
mod simulated;

pub use postgres::PostgresDatabase;
pub use simulated::{RestoredInstance, SimulatedDatabase, WalOp};

use crate::artifact::{WalPosition, WalSegment};
use crate::config::DatabaseConfig;
use crate::store::ObjectReader;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A base snapshot in flight. `reader` yields the raw snapshot bytes.
pub struct BaseSnapshot {
    pub label: String,
    pub source: String,
    pub wal_start: WalPosition,
    pub started_at: DateTime<Utc>,
    pub reader: ObjectReader,
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Stable source descriptor for reports, without credentials.
    fn identity(&self) -> String;

    /// Reachability and credentials. Failure is `UpstreamUnreachable`.
    async fn ping(&self) -> Result<()>;

    /// Start a consistent base snapshot.
    async fn base_snapshot(&self, label: &str) -> Result<BaseSnapshot>;

    /// Completed WAL segments with a sequence greater than `after`, ordered.
    async fn completed_wal_segments(&self, after: Option<u64>) -> Result<Vec<WalSegment>>;

    async fn read_wal_segment(&self, segment: &WalSegment) -> Result<Vec<u8>>;

    /// A fresh, isolated location for a restore. Never the production instance.
    async fn prepare_target(&self, target_environment: &str) -> Result<Box<dyn RestoreTarget>>;
}

/// A restore in progress. Dropped targets that were never started hold no resources
/// beyond their location; call [`RestoreTarget::discard`] to remove that too.
#[async_trait]
pub trait RestoreTarget: Send {
    fn location(&self) -> String;

    async fn write_base(&mut self, chunk: &[u8]) -> Result<()>;

    async fn finish_base(&mut self) -> Result<()>;

    /// Apply (or stage) one WAL segment. Called in sequence order.
    async fn apply_wal(&mut self, segment: &WalSegment, data: &[u8]) -> Result<()>;

    /// Bring the instance up on its isolated location.
    async fn start(&mut self) -> Result<Box<dyn LiveInstance>>;

    /// Stop and delete everything this target created.
    async fn discard(self: Box<Self>) -> Result<()>;
}

/// A started restored instance, as seen by the smoke tests.
#[async_trait]
pub trait LiveInstance: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// User tables in the restored instance.
    async fn table_count(&self) -> Result<u64>;

    async fn relation_exists(&self, name: &str) -> Result<bool>;
}

/// Build the collaborator an environment is configured with.
pub fn connect(config: &DatabaseConfig) -> Arc<dyn Database> {
    match config {
        DatabaseConfig::Simulated { identity } => Arc::new(SimulatedDatabase::new(identity.clone())),
        DatabaseConfig::Postgres(settings) => Arc::new(PostgresDatabase::new(settings.clone())),
    }
}
