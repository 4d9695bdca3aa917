// Integration tests for WAL archiving and point-in-time recovery

mod common;

use common::{at, Harness, AUDIT_TABLE};
use pitr_vault::artifact::{wal_object_name, BackupArtifact, RecoveryTarget, RestoreStatus};
use pitr_vault::db::Database;
use pitr_vault::restore::{CancelFlag, RestoreRequest};
use pitr_vault::store::CHECKSUM_KEY;
use pitr_vault::ErrorCode;
use serde_json::json;

struct Timeline {
    harness: Harness,
    base: BackupArtifact,
    admitted_xid: u64,
}

/// Base backup at 02:00, then one closed WAL segment per hour:
/// 03:00 audit insert, 04:00 table_0 dropped, 05:00 another audit insert.
async fn timeline() -> Timeline {
    let harness = Harness::new();
    harness.seed(3);
    let base = harness.orchestrator().run_backup("prod").await.unwrap();

    harness.clock.set(at(2025, 1, 1, 3, 0, 0));
    let admitted_xid = harness.db.insert(AUDIT_TABLE, json!({ "event": "admitted" })).unwrap();
    harness.db.switch_wal().unwrap();

    harness.clock.set(at(2025, 1, 1, 4, 0, 0));
    harness.db.drop_table("table_0").unwrap();
    harness.db.switch_wal().unwrap();

    harness.clock.set(at(2025, 1, 1, 5, 0, 0));
    harness.db.insert(AUDIT_TABLE, json!({ "event": "discharged" })).unwrap();
    harness.db.switch_wal().unwrap();

    Timeline {
        harness,
        base,
        admitted_xid,
    }
}

#[tokio::test]
async fn test_archive_wal_is_idempotent_and_encrypted() {
    let t = timeline().await;
    let h = &t.harness;
    let orchestrator = h.orchestrator();

    let first = orchestrator.archive_wal("prod").await.unwrap();
    assert_eq!(first.archived, vec![1, 2, 3, 4]);
    assert_eq!(first.skipped, 0);

    let second = orchestrator.archive_wal("prod").await.unwrap();
    assert!(second.archived.is_empty());
    assert_eq!(second.skipped, 4);

    let segments = h.catalog.wal_segments("prod").await.unwrap();
    assert_eq!(segments.len(), 4);
    assert_eq!(segments[1].1.last_commit, at(2025, 1, 1, 3, 0, 0));
    assert_eq!(segments[1].1.start, t.base.wal_start);

    let name = wal_object_name("prod", 2);
    let sealed = h.store.get_bytes(&name).await.unwrap();
    let plain = h.db.read_wal_segment(&segments[1].1).await.unwrap();
    assert_ne!(sealed, plain);
    let info = h.store.head(&name).await.unwrap().unwrap();
    assert!(info.metadata.get(CHECKSUM_KEY).is_some());
}

#[tokio::test]
async fn test_point_in_time_restore_by_time() {
    let t = timeline().await;
    let h = &t.harness;
    h.orchestrator().archive_wal("prod").await.unwrap();

    // Between the audit insert and the accidental drop
    let target = RecoveryTarget::Time(at(2025, 1, 1, 3, 30, 0));
    let job = h
        .restore_engine()
        .restore(RestoreRequest::point_in_time(&t.base.name, target, "sandbox"))
        .await
        .expect("PITR failed");

    assert_eq!(job.status, RestoreStatus::Succeeded);
    assert_eq!(job.segments_replayed, 1);
    assert_eq!(job.recovered_through, Some(at(2025, 1, 1, 3, 0, 0)));

    let instance = h.db.restored(job.target_location.as_deref().unwrap()).unwrap();
    assert_eq!(instance.segments_applied, vec![2]);
    assert!(instance.tables.contains_key("table_0"));
    assert_eq!(instance.tables[AUDIT_TABLE], 2);
}

#[tokio::test]
async fn test_point_in_time_restore_after_drop() {
    let t = timeline().await;
    let h = &t.harness;
    h.orchestrator().archive_wal("prod").await.unwrap();

    let target = RecoveryTarget::Time(at(2025, 1, 1, 4, 30, 0));
    let job = h
        .restore_engine()
        .restore(RestoreRequest::point_in_time(&t.base.name, target, "sandbox"))
        .await
        .unwrap();

    assert_eq!(job.segments_replayed, 2);
    let instance = h.db.restored(job.target_location.as_deref().unwrap()).unwrap();
    assert!(!instance.tables.contains_key("table_0"));
    assert_eq!(instance.tables[AUDIT_TABLE], 2);
}

#[tokio::test]
async fn test_point_in_time_restore_by_transaction() {
    let t = timeline().await;
    let h = &t.harness;
    h.orchestrator().archive_wal("prod").await.unwrap();

    let target = format!("xid:{}", t.admitted_xid).parse::<RecoveryTarget>().unwrap();
    let job = h
        .restore_engine()
        .restore(RestoreRequest::point_in_time(&t.base.name, target, "sandbox"))
        .await
        .unwrap();

    let instance = h.db.restored(job.target_location.as_deref().unwrap()).unwrap();
    assert_eq!(instance.segments_applied, vec![2]);
    assert!(instance.tables.contains_key("table_0"));
}

#[tokio::test]
async fn test_target_beyond_archived_wal_is_insufficient() {
    let t = timeline().await;
    let h = &t.harness;
    h.orchestrator().archive_wal("prod").await.unwrap();

    let target = RecoveryTarget::Time(at(2025, 1, 1, 6, 0, 0));
    let error = h
        .restore_engine()
        .restore(RestoreRequest::point_in_time(&t.base.name, target, "sandbox"))
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::InsufficientWal);

    // Planned before any target was prepared
    assert!(h.db.restored_instances().is_empty());
    let jobs = h.catalog.restore_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, RestoreStatus::Failed);
    assert_eq!(jobs[0].error_code, Some(ErrorCode::InsufficientWal));
    assert!(jobs[0].target_location.is_none());
}

#[tokio::test]
async fn test_target_before_base_snapshot_is_insufficient() {
    let t = timeline().await;
    let h = &t.harness;
    h.orchestrator().archive_wal("prod").await.unwrap();

    let target = RecoveryTarget::Time(at(2025, 1, 1, 1, 0, 0));
    let error = h
        .restore_engine()
        .restore(RestoreRequest::point_in_time(&t.base.name, target, "sandbox"))
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::InsufficientWal);
}

#[tokio::test]
async fn test_missing_segment_is_insufficient() {
    let t = timeline().await;
    let h = &t.harness;
    h.db.lose_wal_segment(3);
    let report = h.orchestrator().archive_wal("prod").await.unwrap();
    assert_eq!(report.archived, vec![1, 2, 4]);

    let target = RecoveryTarget::Time(at(2025, 1, 1, 4, 30, 0));
    let error = h
        .restore_engine()
        .restore(RestoreRequest::point_in_time(&t.base.name, target, "sandbox"))
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::InsufficientWal);
    assert!(h.db.restored_instances().is_empty());
}

#[tokio::test]
async fn test_cancelled_restore_discards_target() {
    let t = timeline().await;
    let h = &t.harness;
    h.orchestrator().archive_wal("prod").await.unwrap();

    let cancel = CancelFlag::new();
    let engine = h.restore_engine().with_cancel_flag(cancel.clone());
    cancel.cancel();

    let target = RecoveryTarget::Time(at(2025, 1, 1, 4, 30, 0));
    let error = engine
        .restore(RestoreRequest::point_in_time(&t.base.name, target, "sandbox"))
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::Cancelled);

    let instances = h.db.restored_instances();
    assert_eq!(instances.len(), 1);
    assert!(instances[0].discarded);
    assert!(instances[0].segments_applied.is_empty());

    let jobs = h.catalog.restore_jobs().await.unwrap();
    assert_eq!(jobs[0].status, RestoreStatus::Failed);
    assert_eq!(jobs[0].error_code, Some(ErrorCode::Cancelled));
}
