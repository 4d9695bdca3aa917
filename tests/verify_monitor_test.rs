// Integration tests for verification and health monitoring

mod common;

use chrono::Duration;
use common::{Harness, AUDIT_TABLE};
use pitr_vault::artifact::{ArtifactStatus, RestoreStatus};
use pitr_vault::monitor::AlertKind;
use pitr_vault::verify::{TestRestore, TEST_RESTORE_ENVIRONMENT};
use pitr_vault::ErrorCode;
use serde_json::json;

#[tokio::test]
async fn test_tampered_artifact_fails_verification() {
    let h = Harness::new();
    h.seed(3);
    let artifact = h.orchestrator().run_backup("prod").await.unwrap();
    assert!(h.memory.tamper(&artifact.name, (artifact.encrypted_size / 2) as usize));

    let error = h
        .verifier()
        .verify(&artifact.name, TestRestore::Never)
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::VerificationFailure);

    // A failed check never demotes or deletes the artifact
    assert_eq!(
        h.catalog.get(&artifact.name).await.unwrap().status,
        ArtifactStatus::Uploaded
    );
    assert!(h.memory.contains(&artifact.name));

    let records = h.catalog.verifications(&artifact.name).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].checksum_ok);
    assert!(!records[0].passed());
    assert!(records[0].error.is_some());

    let alerts = h.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::VerificationFailed);
    assert_eq!(alerts[0].artifact.as_deref(), Some(artifact.name.as_str()));

    // The monitor keeps reporting it until a verification passes
    let health = h.monitor().check_health("prod").await.unwrap();
    assert!(health.iter().any(|a| a.kind == AlertKind::VerificationFailed));
}

#[tokio::test]
async fn test_verification_with_test_restore() {
    let h = Harness::new();
    h.seed(3);
    let artifact = h.orchestrator().run_backup("prod").await.unwrap();

    let record = h
        .verifier()
        .verify(&artifact.name, TestRestore::Always)
        .await
        .unwrap();
    assert!(record.checksum_ok && record.decrypt_ok && record.structure_ok);
    assert_eq!(record.test_restore_ok, Some(true));
    assert_eq!(
        h.catalog.get(&artifact.name).await.unwrap().status,
        ArtifactStatus::Verified
    );

    let instances = h.db.restored_instances();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].target_environment, TEST_RESTORE_ENVIRONMENT);
    assert!(instances[0].discarded);

    let jobs = h.catalog.restore_jobs().await.unwrap();
    assert_eq!(jobs[0].status, RestoreStatus::Succeeded);
}

#[tokio::test]
async fn test_automatic_test_restore_cadence() {
    let h = Harness::new();
    h.seed(3);
    let orchestrator = h.orchestrator();
    let first = orchestrator.run_backup("prod").await.unwrap();

    let record = h.verifier().verify(&first.name, TestRestore::Auto).await.unwrap();
    assert_eq!(record.test_restore_ok, Some(true));

    h.clock.advance(Duration::days(1));
    let second = orchestrator.run_backup("prod").await.unwrap();
    let record = h.verifier().verify_latest("prod", TestRestore::Auto).await.unwrap();
    assert_eq!(record.artifact, second.name);
    assert_eq!(record.test_restore_ok, None);

    h.clock.advance(Duration::days(7));
    let third = orchestrator.run_backup("prod").await.unwrap();
    let record = h.verifier().verify(&third.name, TestRestore::Auto).await.unwrap();
    assert_eq!(record.test_restore_ok, Some(true));
}

#[tokio::test]
async fn test_failed_test_restore_fails_verification() {
    let h = Harness::new();
    // Empty source: the restored instance has no tables
    let artifact = h.orchestrator().run_backup("prod").await.unwrap();

    let error = h
        .verifier()
        .verify(&artifact.name, TestRestore::Always)
        .await
        .unwrap_err();
    assert_eq!(error.code(), ErrorCode::SmokeTestFailure);

    let records = h.catalog.verifications(&artifact.name).await.unwrap();
    assert!(records[0].checksum_ok && records[0].decrypt_ok && records[0].structure_ok);
    assert_eq!(records[0].test_restore_ok, Some(false));
    assert_eq!(
        h.catalog.get(&artifact.name).await.unwrap().status,
        ArtifactStatus::Uploaded
    );
    assert_eq!(h.alerts.kinds(), vec![AlertKind::VerificationFailed]);
}

#[tokio::test]
async fn test_verify_latest_without_backups() {
    let h = Harness::new();
    let error = h.verifier().verify_latest("prod", TestRestore::Never).await.unwrap_err();
    assert_eq!(error.code(), ErrorCode::InternalError);
}

#[tokio::test]
async fn test_monitor_reports_missing_backup() {
    let h = Harness::new();
    let alerts = h.monitor().check_health("prod").await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::NoBackup);
    assert_eq!(h.alerts.kinds(), vec![AlertKind::NoBackup]);
}

#[tokio::test]
async fn test_monitor_freshness() {
    let h = Harness::new();
    h.seed(2);
    h.orchestrator().run_backup("prod").await.unwrap();

    h.clock.advance(Duration::hours(25));
    assert!(h.monitor().check_health("prod").await.unwrap().is_empty());

    h.clock.advance(Duration::hours(2));
    let alerts = h.monitor().check_health("prod").await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::StaleBackup);
    assert!(alerts[0].artifact.is_some());
}

#[tokio::test]
async fn test_monitor_size_deviation() {
    let h = Harness::new();
    h.seed(2);
    let orchestrator = h.orchestrator();
    for _ in 0..3 {
        orchestrator.run_backup("prod").await.unwrap();
        h.clock.advance(Duration::hours(1));
    }
    assert!(h.monitor().check_health("prod").await.unwrap().is_empty());

    for i in 0..2000 {
        h.db
            .insert(AUDIT_TABLE, json!({ "id": i, "event": uuid::Uuid::new_v4().to_string() }))
            .unwrap();
    }
    orchestrator.run_backup("prod").await.unwrap();

    let alerts = h.monitor().check_health("prod").await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::SizeDeviation);
}

#[tokio::test]
async fn test_monitor_store_unreachable() {
    let h = Harness::new();
    h.seed(2);
    h.orchestrator().run_backup("prod").await.unwrap();
    h.memory.set_unreachable(true);

    let alerts = h.monitor().check_health("prod").await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::StoreUnreachable);
}
