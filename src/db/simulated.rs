// In-process database with a real WAL model - for drills and tests
//
// Tables are JSON rows. Every mutation is a WAL record (xid, commit time, op) appended to
// the open segment; switch_wal() closes it. Restored instances are tracked in a registry so
// callers can inspect what a restore produced and confirm discarded targets are gone.

use super::{BaseSnapshot, Database, RestoreTarget, LiveInstance};
use crate::artifact::{WalPosition, WalSegment};
use crate::clock::Clock;
use crate::{Result, VaultError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

type Tables = BTreeMap<String, Vec<Value>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalOp {
    CreateTable { name: String },
    Insert { table: String, row: Value },
    DropTable { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WalRecord {
    xid: u64,
    committed_at: DateTime<Utc>,
    op: WalOp,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotImage {
    identity: String,
    label: String,
    wal_start: WalPosition,
    tables: Tables,
}

fn apply(tables: &mut Tables, op: &WalOp) -> Result<()> {
    match op {
        WalOp::CreateTable { name } => {
            tables.entry(name.clone()).or_default();
        }
        WalOp::Insert { table, row } => {
            tables
                .get_mut(table)
                .ok_or_else(|| VaultError::NotFound(format!("table {}", table)))?
                .push(row.clone());
        }
        WalOp::DropTable { name } => {
            tables.remove(name);
        }
    }
    Ok(())
}

#[derive(Default)]
struct State {
    tables: Tables,
    open_segment: Vec<WalRecord>,
    open_start: u64,
    position: u64,
    next_xid: u64,
    next_sequence: u64,
    completed: Vec<(WalSegment, Vec<u8>)>,
}

/// A restored instance as seen by the registry.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredInstance {
    pub location: String,
    pub target_environment: String,
    pub tables: BTreeMap<String, usize>,
    pub segments_applied: Vec<u64>,
    pub running: bool,
    pub discarded: bool,
}

type Registry = Arc<Mutex<BTreeMap<String, RestoredInstance>>>;

#[derive(Clone)]
pub struct SimulatedDatabase {
    identity: String,
    state: Arc<Mutex<State>>,
    registry: Registry,
    reachable: Arc<AtomicBool>,
    clock: Clock,
}

impl SimulatedDatabase {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            state: Arc::new(Mutex::new(State {
                next_xid: 1,
                next_sequence: 1,
                ..State::default()
            })),
            registry: Arc::new(Mutex::new(BTreeMap::new())),
            reachable: Arc::new(AtomicBool::new(true)),
            clock: Clock::System,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn record(&self, op: WalOp) -> Result<u64> {
        let mut state = self.state.lock();
        apply(&mut state.tables, &op)?;
        let xid = state.next_xid;
        state.next_xid += 1;
        let record = WalRecord {
            xid,
            committed_at: self.clock.now(),
            op,
        };
        state.position += serde_json::to_vec(&record)?.len() as u64;
        state.open_segment.push(record);
        Ok(xid)
    }

    /// Returns the transaction id of the change.
    pub fn create_table(&self, name: &str) -> Result<u64> {
        self.record(WalOp::CreateTable { name: name.to_string() })
    }

    pub fn insert(&self, table: &str, row: Value) -> Result<u64> {
        self.record(WalOp::Insert {
            table: table.to_string(),
            row,
        })
    }

    pub fn drop_table(&self, name: &str) -> Result<u64> {
        self.record(WalOp::DropTable { name: name.to_string() })
    }

    /// Close the open WAL segment. `None` when nothing was written since the last switch.
    pub fn switch_wal(&self) -> Result<Option<WalSegment>> {
        let mut state = self.state.lock();
        if state.open_segment.is_empty() {
            return Ok(None);
        }
        let records = std::mem::take(&mut state.open_segment);
        let Some(last) = records.last() else {
            return Ok(None);
        };
        let data = serde_json::to_vec(&records)?;
        let sequence = state.next_sequence;
        let segment = WalSegment {
            sequence,
            file_name: format!("{:08X}{:016X}", 1, sequence),
            start: WalPosition(state.open_start),
            end: WalPosition(state.position),
            last_commit: last.committed_at,
            last_xid: Some(last.xid),
            size_bytes: data.len() as u64,
        };
        state.next_sequence += 1;
        state.open_start = state.position;
        state.completed.push((segment.clone(), data));
        debug!(sequence = sequence, end = %segment.end, "WAL segment completed");
        Ok(Some(segment))
    }

    /// Drop archived segment data, as if the archive lost it.
    pub fn lose_wal_segment(&self, sequence: u64) {
        self.state.lock().completed.retain(|(s, _)| s.sequence != sequence);
    }

    pub fn restored_instances(&self) -> Vec<RestoredInstance> {
        self.registry.lock().values().cloned().collect()
    }

    pub fn restored(&self, location: &str) -> Option<RestoredInstance> {
        self.registry.lock().get(location).cloned()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(VaultError::UpstreamUnreachable(format!("{} is not reachable", self.identity)))
        }
    }
}

#[async_trait]
impl Database for SimulatedDatabase {
    fn identity(&self) -> String {
        format!("sim://{}", self.identity)
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn base_snapshot(&self, label: &str) -> Result<BaseSnapshot> {
        self.check_reachable()?;
        // Pre-snapshot changes land in a closed segment, so replay starts at a boundary
        self.switch_wal()?;
        let (image, wal_start) = {
            let state = self.state.lock();
            let wal_start = WalPosition(state.position);
            let image = SnapshotImage {
                identity: self.identity.clone(),
                label: label.to_string(),
                wal_start,
                tables: state.tables.clone(),
            };
            (serde_json::to_vec(&image)?, wal_start)
        };
        let started_at = self.clock.now();
        tokio::task::yield_now().await;

        Ok(BaseSnapshot {
            label: label.to_string(),
            source: Database::identity(self),
            wal_start,
            started_at,
            reader: Box::pin(std::io::Cursor::new(image)),
        })
    }

    async fn completed_wal_segments(&self, after: Option<u64>) -> Result<Vec<WalSegment>> {
        self.check_reachable()?;
        let state = self.state.lock();
        Ok(state
            .completed
            .iter()
            .map(|(s, _)| s.clone())
            .filter(|s| after.map_or(true, |a| s.sequence > a))
            .collect())
    }

    async fn read_wal_segment(&self, segment: &WalSegment) -> Result<Vec<u8>> {
        self.check_reachable()?;
        self.state
            .lock()
            .completed
            .iter()
            .find(|(s, _)| s.sequence == segment.sequence)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| VaultError::NotFound(format!("WAL segment {}", segment.sequence)))
    }

    async fn prepare_target(&self, target_environment: &str) -> Result<Box<dyn RestoreTarget>> {
        let location = format!("sim://{}/{}", target_environment, Uuid::new_v4().simple());
        self.registry.lock().insert(
            location.clone(),
            RestoredInstance {
                location: location.clone(),
                target_environment: target_environment.to_string(),
                tables: BTreeMap::new(),
                segments_applied: Vec::new(),
                running: false,
                discarded: false,
            },
        );
        Ok(Box::new(SimulatedTarget {
            location,
            registry: self.registry.clone(),
            base: Vec::new(),
            tables: None,
        }))
    }
}

struct SimulatedTarget {
    location: String,
    registry: Registry,
    base: Vec<u8>,
    tables: Option<Tables>,
}

impl SimulatedTarget {
    fn publish(&self, update: impl FnOnce(&mut RestoredInstance)) {
        if let Some(instance) = self.registry.lock().get_mut(&self.location) {
            update(instance);
        }
    }

    fn tables_mut(&mut self) -> Result<&mut Tables> {
        self.tables
            .as_mut()
            .ok_or_else(|| VaultError::Integrity("base snapshot not extracted".into()))
    }
}

#[async_trait]
impl RestoreTarget for SimulatedTarget {
    fn location(&self) -> String {
        self.location.clone()
    }

    async fn write_base(&mut self, chunk: &[u8]) -> Result<()> {
        self.base.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish_base(&mut self) -> Result<()> {
        let image: SnapshotImage = serde_json::from_slice(&std::mem::take(&mut self.base))
            .map_err(|e| VaultError::Integrity(format!("snapshot image unreadable: {}", e)))?;
        self.tables = Some(image.tables);
        Ok(())
    }

    async fn apply_wal(&mut self, segment: &WalSegment, data: &[u8]) -> Result<()> {
        let records: Vec<WalRecord> = serde_json::from_slice(data)
            .map_err(|e| VaultError::Integrity(format!("WAL segment {} unreadable: {}", segment.sequence, e)))?;
        let tables = self.tables_mut()?;
        for record in &records {
            apply(tables, &record.op)?;
        }
        let sequence = segment.sequence;
        self.publish(|i| i.segments_applied.push(sequence));
        Ok(())
    }

    async fn start(&mut self) -> Result<Box<dyn LiveInstance>> {
        let tables = self.tables_mut()?.clone();
        let summary: BTreeMap<String, usize> = tables.iter().map(|(k, v)| (k.clone(), v.len())).collect();
        self.publish(|i| {
            i.tables = summary;
            i.running = true;
        });
        Ok(Box::new(SimulatedLive { tables }))
    }

    async fn discard(self: Box<Self>) -> Result<()> {
        self.publish(|i| {
            i.tables.clear();
            i.running = false;
            i.discarded = true;
        });
        Ok(())
    }
}

struct SimulatedLive {
    tables: Tables,
}

#[async_trait]
impl LiveInstance for SimulatedLive {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn table_count(&self) -> Result<u64> {
        Ok(self.tables.len() as u64)
    }

    async fn relation_exists(&self, name: &str) -> Result<bool> {
        Ok(self.tables.contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_snapshot_then_wal_replay() {
        let db = SimulatedDatabase::new("prod-db");
        db.create_table("patients").unwrap();
        db.insert("patients", json!({"id": 1})).unwrap();

        let mut snapshot = db.base_snapshot("label").await.unwrap();
        let mut image = Vec::new();
        snapshot.reader.read_to_end(&mut image).await.unwrap();

        db.insert("patients", json!({"id": 2})).unwrap();
        let segment = db.switch_wal().unwrap().unwrap();
        assert_eq!(segment.start, snapshot.wal_start);
        assert_eq!(segment.sequence, 2);

        let mut target = db.prepare_target("sandbox").await.unwrap();
        target.write_base(&image).await.unwrap();
        target.finish_base().await.unwrap();
        let data = db.read_wal_segment(&segment).await.unwrap();
        target.apply_wal(&segment, &data).await.unwrap();
        let live = target.start().await.unwrap();
        assert_eq!(live.table_count().await.unwrap(), 1);

        let location = target.location();
        assert_eq!(db.restored(&location).unwrap().tables["patients"], 2);
        target.discard().await.unwrap();
        assert!(db.restored(&location).unwrap().discarded);
    }

    #[tokio::test]
    async fn test_unreachable_snapshot() {
        let db = SimulatedDatabase::new("prod-db");
        db.set_reachable(false);
        let err = db.base_snapshot("x").await.err().unwrap();
        assert_eq!(err.code().as_str(), "UPSTREAM_UNREACHABLE");
    }

    #[test]
    fn test_empty_switch_is_noop() {
        let db = SimulatedDatabase::new("prod-db");
        assert!(db.switch_wal().unwrap().is_none());
        db.create_table("t").unwrap();
        let seg = db.switch_wal().unwrap().unwrap();
        assert_eq!(seg.file_name, "000000010000000000000001");
        assert_eq!(seg.last_xid, Some(1));
    }
}
