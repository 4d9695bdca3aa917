// Integration tests for the backup pipeline and full restores
// Runs the real orchestrator against the in-memory store and the simulated database

mod common;

use bytes::Bytes;
use chrono::Duration;
use common::{at, Harness, AUDIT_TABLE};
use pitr_vault::artifact::{ArtifactStatus, BackupArtifact, BackupKind, RestoreStatus};
use pitr_vault::crypto::KeyPair;
use pitr_vault::report::{list_reports, Operation, ReportStatus};
use pitr_vault::restore::{RestoreEngine, RestoreRequest};
use pitr_vault::store::{ObjectMetadata, PutSource};
use pitr_vault::verify::TestRestore;
use pitr_vault::ErrorCode;
use std::sync::Arc;

#[tokio::test]
async fn test_backup_verify_and_full_restore() {
    let h = Harness::new();
    h.seed(5);

    let artifact = h.orchestrator().run_backup("prod").await.expect("backup failed");
    assert_eq!(artifact.name, "prod/FULL/20250101_020000.archive.enc");
    assert_eq!(artifact.status, ArtifactStatus::Uploaded);
    assert_eq!(artifact.location, "memory://prod/FULL/20250101_020000.archive.enc");
    assert_eq!(artifact.key_ref, h.encryptor.key_ref());
    assert_eq!(artifact.checksum.as_ref().map(String::len), Some(64));
    assert!(artifact.encrypted_size > 0);
    assert!(artifact.raw_size > 0);
    assert!(h.memory.contains(&artifact.name));
    assert!(h.dir.path().join("local").join(&artifact.name).exists());

    let info = h.store.head(&artifact.name).await.unwrap().unwrap();
    assert_eq!(info.metadata.get("environment"), Some("prod"));
    assert_eq!(info.metadata.get("backup-type"), Some("FULL"));
    assert_eq!(info.metadata.get("created"), Some("2025-01-01T02:00:00Z"));
    assert_eq!(info.metadata.checksum(), artifact.checksum.as_deref());

    h.clock.advance(Duration::hours(1));
    let record = h
        .verifier()
        .verify(&artifact.name, TestRestore::Never)
        .await
        .expect("verification failed");
    assert!(record.passed());
    assert_eq!(record.test_restore_ok, None);
    assert_eq!(
        h.catalog.get(&artifact.name).await.unwrap().status,
        ArtifactStatus::Verified
    );

    let job = h
        .restore_engine()
        .restore(RestoreRequest::full(&artifact.name, "sandbox"))
        .await
        .expect("restore failed");
    assert_eq!(job.status, RestoreStatus::Succeeded);
    assert_eq!(job.segments_replayed, 0);
    assert!(job.recovered_through.is_none());

    let location = job.target_location.clone().unwrap();
    assert!(location.starts_with("sim://sandbox/"));
    let instance = h.db.restored(&location).unwrap();
    assert!(instance.running);
    assert_eq!(instance.tables.len(), 5);
    assert_eq!(instance.tables[AUDIT_TABLE], 1);

    let smoke = job.smoke_test_results.unwrap();
    assert!(smoke.passed());
    assert_eq!(smoke.table_count, Some(5));
    assert_eq!(smoke.audit_relation, Some(true));

    // Restores read artifacts; they never change them
    assert_eq!(
        h.catalog.get(&artifact.name).await.unwrap().status,
        ArtifactStatus::Verified
    );
    let jobs = h.catalog.restore_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, RestoreStatus::Succeeded);
}

#[tokio::test]
async fn test_backup_writes_reports_and_run_log() {
    let h = Harness::new();
    h.seed(2);
    let artifact = h.orchestrator().run_backup("prod").await.unwrap();

    let reports = list_reports(&h.store, "prod").await.unwrap();
    let backup = reports
        .iter()
        .find(|r| r.operation == Operation::Backup)
        .expect("no backup report");
    assert_eq!(backup.status, ReportStatus::Succeeded);
    assert_eq!(backup.kind, "FULL");
    assert_eq!(backup.artifact.as_deref(), Some(artifact.name.as_str()));
    assert_eq!(backup.size_bytes, artifact.encrypted_size);
    assert_eq!(backup.source.as_deref(), Some("sim://prod-db"));

    let log = h.dir.path().join("logs").join("prod").join("20250101T020000-backup.json");
    assert!(log.exists());
}

#[tokio::test]
async fn test_same_second_backups_get_suffixes() {
    let h = Harness::new();
    h.seed(2);
    let orchestrator = h.orchestrator();

    let first = orchestrator.run_backup("prod").await.unwrap();
    let second = orchestrator.run_backup("prod").await.unwrap();
    let third = orchestrator.run_backup("prod").await.unwrap();

    assert_eq!(first.name, "prod/FULL/20250101_020000.archive.enc");
    assert_eq!(second.name, "prod/FULL/20250101_020000_1.archive.enc");
    assert_eq!(third.name, "prod/FULL/20250101_020000_2.archive.enc");

    let names: Vec<String> = h
        .catalog
        .discoverable("prod")
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(names, vec![first.name, second.name, third.name.clone()]);
    assert_eq!(h.catalog.latest_discoverable("prod").await.unwrap().unwrap().name, third.name);
}

#[tokio::test]
async fn test_concurrent_backups_one_gets_lock_held() {
    let h = Harness::new();
    h.seed(3);
    let a = h.orchestrator_as("host-a");
    let b = h.orchestrator_as("host-b");

    let (first, second) = tokio::join!(a.run_backup("prod"), b.run_backup("prod"));
    let outcomes = [first, second];

    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    let error = outcomes.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(error.code(), ErrorCode::LockHeld);

    let artifacts = h.catalog.list("prod").await.unwrap();
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].status, ArtifactStatus::Uploaded);

    let reports = list_reports(&h.store, "prod").await.unwrap();
    assert!(reports
        .iter()
        .any(|r| r.status == ReportStatus::Failed && r.error_code == Some(ErrorCode::LockHeld)));

    // The lease was released; the next run goes through
    h.clock.advance(Duration::minutes(1));
    assert!(h.orchestrator_as("host-b").run_backup("prod").await.is_ok());
}

#[tokio::test]
async fn test_interrupted_run_is_recovered() {
    let h = Harness::new();
    h.seed(2);

    // A crashed run left a CAPTURED record and a partial object behind
    let crashed_at = at(2025, 1, 1, 1, 0, 0);
    let mut stale = BackupArtifact::new(
        "prod/FULL/20250101_010000.archive.enc",
        "prod",
        BackupKind::Full,
        h.encryptor.key_ref(),
        crashed_at,
    );
    stale.advance(ArtifactStatus::Captured, crashed_at).unwrap();
    assert!(h.catalog.reserve(&stale).await.unwrap());
    h.store
        .put(
            &stale.name,
            PutSource::Bytes(Bytes::from_static(b"partial")),
            &ObjectMetadata::new(),
        )
        .await
        .unwrap();

    let artifact = h.orchestrator().run_backup("prod").await.unwrap();

    let recovered = h.catalog.get(&stale.name).await.unwrap();
    assert_eq!(recovered.status, ArtifactStatus::Failed);
    assert!(recovered.error.is_some());
    assert!(!h.memory.contains(&stale.name));

    let discoverable = h.catalog.discoverable("prod").await.unwrap();
    assert_eq!(discoverable.len(), 1);
    assert_eq!(discoverable[0].name, artifact.name);
}

#[tokio::test]
async fn test_transient_store_failures_are_retried() {
    let h = Harness::new();
    h.seed(2);
    h.memory.fail_next_operations(2);

    let artifact = h.orchestrator().run_backup("prod").await.expect("retries should absorb faults");
    assert_eq!(artifact.status, ArtifactStatus::Uploaded);
    assert!(h.memory.contains(&artifact.name));
}

#[tokio::test]
async fn test_unreachable_database_fails_without_artifact() {
    let h = Harness::new();
    h.seed(2);
    h.db.set_reachable(false);

    let error = h.orchestrator().run_backup("prod").await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::UpstreamUnreachable);
    assert!(h.catalog.discoverable("prod").await.unwrap().is_empty());

    // Lease released on the failure path
    h.db.set_reachable(true);
    h.clock.advance(Duration::minutes(5));
    let artifact = h.orchestrator().run_backup("prod").await.unwrap();
    assert_eq!(artifact.name, "prod/FULL/20250101_020500.archive.enc");
}

#[tokio::test]
async fn test_unknown_environment_is_configuration_error() {
    let h = Harness::new();
    let error = h.orchestrator().run_backup("nowhere").await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::ConfigurationError);
}

#[tokio::test]
async fn test_restore_by_environment_uses_newest_artifact() {
    let h = Harness::new();
    h.seed(2);
    let orchestrator = h.orchestrator();
    orchestrator.run_backup("prod").await.unwrap();
    h.db.create_table("added_later").unwrap();
    h.clock.advance(Duration::hours(24));
    let newest = orchestrator.run_backup("prod").await.unwrap();

    let job = h
        .restore_engine()
        .restore(RestoreRequest::full("prod", "sandbox"))
        .await
        .unwrap();
    assert_eq!(job.artifact, newest.name);
    let instance = h.db.restored(job.target_location.as_deref().unwrap()).unwrap();
    assert!(instance.tables.contains_key("added_later"));
}

#[tokio::test]
async fn test_concurrent_restores_use_separate_targets() {
    let h = Harness::new();
    h.seed(2);
    let artifact = h.orchestrator().run_backup("prod").await.unwrap();

    let engine = h.restore_engine();
    let (first, second) = tokio::join!(
        engine.restore(RestoreRequest::full(artifact.name.clone(), "sandbox")),
        engine.restore(RestoreRequest::full(artifact.name.clone(), "sandbox")),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first.id, second.id);
    assert_ne!(first.target_location, second.target_location);
    for job in [&first, &second] {
        assert_eq!(job.status, RestoreStatus::Succeeded);
        let instance = h.db.restored(job.target_location.as_deref().unwrap()).unwrap();
        assert!(instance.running);
    }
}

#[tokio::test]
async fn test_restore_with_wrong_key_is_encryption_failure() {
    let h = Harness::new();
    h.seed(2);
    let artifact = h.orchestrator().run_backup("prod").await.unwrap();

    let engine = RestoreEngine::new(
        h.config.clone(),
        h.catalog.clone(),
        KeyPair::generate().decryptor(),
        Arc::new(h.db.clone()),
    );
    let error = engine
        .restore(RestoreRequest::full(&artifact.name, "sandbox"))
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::EncryptionFailure);
    assert!(h.db.restored_instances().is_empty());
}

#[tokio::test]
async fn test_smoke_test_failure_discards_target() {
    let h = Harness::new();
    // No audit table in the source
    h.db.create_table("patients").unwrap();
    let artifact = h.orchestrator().run_backup("prod").await.unwrap();

    let error = h
        .restore_engine()
        .restore(RestoreRequest::full(&artifact.name, "sandbox"))
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::SmokeTestFailure);

    let instances = h.db.restored_instances();
    assert_eq!(instances.len(), 1);
    assert!(instances[0].discarded);
    assert!(!instances[0].running);

    let jobs = h.catalog.restore_jobs().await.unwrap();
    assert_eq!(jobs[0].status, RestoreStatus::Failed);
    assert_eq!(jobs[0].error_code, Some(ErrorCode::SmokeTestFailure));
    assert_eq!(jobs[0].smoke_test_results.as_ref().unwrap().audit_relation, Some(false));
}
