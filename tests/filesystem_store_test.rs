// Integration tests against the filesystem object store

mod common;

use chrono::Duration;
use common::{at, Harness, AUDIT_TABLE};
use pitr_vault::artifact::{ArtifactStatus, RecoveryTarget, RestoreStatus};
use pitr_vault::restore::RestoreRequest;
use pitr_vault::store::{FileObjectStore, MemoryObjectStore};
use pitr_vault::verify::TestRestore;
use serde_json::json;
use std::sync::Arc;

fn filesystem_harness() -> (Harness, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("store");
    let backend = Arc::new(FileObjectStore::new(root.clone()));
    (Harness::with_backend(dir, MemoryObjectStore::new(), backend), root)
}

#[tokio::test]
async fn test_backup_and_restore_through_filesystem_store() {
    let (h, root) = filesystem_harness();
    h.seed(4);

    let artifact = h.orchestrator().run_backup("prod").await.unwrap();
    assert_eq!(artifact.location, "filesystem://prod/FULL/20250101_020000.archive.enc");
    let object = root.join(&artifact.name);
    assert_eq!(std::fs::metadata(&object).unwrap().len(), artifact.encrypted_size);
    assert!(root.join(format!("{}.meta.json", artifact.name)).exists());

    // Nothing but the object, its sidecar and catalog records is left behind
    let stray: Vec<_> = std::fs::read_dir(root.join("prod").join("FULL"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".partial-"))
        .collect();
    assert!(stray.is_empty());

    h.verifier().verify(&artifact.name, TestRestore::Always).await.unwrap();
    assert_eq!(h.catalog.get(&artifact.name).await.unwrap().status, ArtifactStatus::Verified);

    let job = h
        .restore_engine()
        .restore(RestoreRequest::full("prod", "sandbox"))
        .await
        .unwrap();
    assert_eq!(job.status, RestoreStatus::Succeeded);
    let instance = h.db.restored(job.target_location.as_deref().unwrap()).unwrap();
    assert_eq!(instance.tables.len(), 4);
}

#[tokio::test]
async fn test_point_in_time_restore_through_filesystem_store() {
    let (h, _root) = filesystem_harness();
    h.seed(2);
    let orchestrator = h.orchestrator();
    let base = orchestrator.run_backup("prod").await.unwrap();

    h.clock.advance(Duration::hours(1));
    h.db.insert(AUDIT_TABLE, json!({ "event": "kept" })).unwrap();
    h.db.switch_wal().unwrap();
    h.clock.advance(Duration::hours(1));
    h.db.insert(AUDIT_TABLE, json!({ "event": "not kept" })).unwrap();
    h.db.switch_wal().unwrap();
    orchestrator.archive_wal("prod").await.unwrap();

    let target = RecoveryTarget::Time(at(2025, 1, 1, 3, 30, 0));
    let job = h
        .restore_engine()
        .restore(RestoreRequest::point_in_time(&base.name, target, "sandbox"))
        .await
        .unwrap();
    let instance = h.db.restored(job.target_location.as_deref().unwrap()).unwrap();
    assert_eq!(instance.tables[AUDIT_TABLE], 2);
}
