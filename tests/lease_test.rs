// Integration tests for lease ownership across long backup runs

mod common;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use common::Harness;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use pitr_vault::artifact::{ArtifactStatus, BackupArtifact};
use pitr_vault::backup::BackupOrchestrator;
use pitr_vault::store::{
    MemoryObjectStore, ObjectInfo, ObjectMetadata, ObjectReader, ObjectStore, RemoteStore,
    ServerSideEncryption,
};
use pitr_vault::ErrorCode;
use std::sync::Arc;

/// Memory store that runs a hook just before the first artifact upload lands.
struct SlowUploadStore {
    inner: MemoryObjectStore,
    before_upload: Mutex<Option<BoxFuture<'static, ()>>>,
}

impl SlowUploadStore {
    fn new(inner: MemoryObjectStore) -> Self {
        Self {
            inner,
            before_upload: Mutex::new(None),
        }
    }

    fn on_upload(&self, hook: BoxFuture<'static, ()>) {
        *self.before_upload.lock() = Some(hook);
    }
}

#[async_trait]
impl ObjectStore for SlowUploadStore {
    fn backend_name(&self) -> &str {
        self.inner.backend_name()
    }

    async fn put_object(
        &self,
        name: &str,
        body: ObjectReader,
        metadata: &ObjectMetadata,
        sse: &ServerSideEncryption,
    ) -> pitr_vault::Result<u64> {
        if name.ends_with(".archive.enc") && !name.starts_with('_') {
            let hook = self.before_upload.lock().take();
            if let Some(hook) = hook {
                hook.await;
            }
        }
        self.inner.put_object(name, body, metadata, sse).await
    }

    async fn put_if_absent(
        &self,
        name: &str,
        body: Bytes,
        metadata: &ObjectMetadata,
        sse: &ServerSideEncryption,
    ) -> pitr_vault::Result<bool> {
        self.inner.put_if_absent(name, body, metadata, sse).await
    }

    async fn get_object(&self, name: &str) -> pitr_vault::Result<ObjectReader> {
        self.inner.get_object(name).await
    }

    async fn head_object(&self, name: &str) -> pitr_vault::Result<Option<ObjectInfo>> {
        self.inner.head_object(name).await
    }

    async fn list_objects(&self, prefix: &str) -> pitr_vault::Result<Vec<String>> {
        self.inner.list_objects(prefix).await
    }

    async fn delete_object(&self, name: &str) -> pitr_vault::Result<()> {
        self.inner.delete_object(name).await
    }

    async fn ping(&self) -> pitr_vault::Result<()> {
        self.inner.ping().await
    }
}

fn slow_harness() -> (Harness, Arc<SlowUploadStore>) {
    let memory = MemoryObjectStore::new();
    let slow = Arc::new(SlowUploadStore::new(memory.clone()));
    let harness = Harness::with_backend(tempfile::tempdir().unwrap(), memory, slow.clone());
    (harness, slow)
}

#[tokio::test]
async fn test_run_outliving_its_lease_never_publishes() {
    let (h, slow) = slow_harness();
    h.seed(3);

    // While the first upload is in flight the lease runs out and another host takes over
    let other = BackupOrchestrator::new(
        h.config.clone(),
        RemoteStore::new(Arc::new(h.memory.clone()), h.config.retry.clone()),
        h.encryptor.clone(),
        Arc::new(h.db.clone()),
    )
    .with_clock(h.clock.clone())
    .with_owner("host-b");
    let clock = h.clock.clone();
    let other_outcome: Arc<Mutex<Option<pitr_vault::Result<BackupArtifact>>>> = Arc::default();
    let slot = other_outcome.clone();
    slow.on_upload(
        async move {
            clock.advance(Duration::hours(2));
            let outcome = other.run_backup("prod").await;
            *slot.lock() = Some(outcome);
        }
        .boxed(),
    );

    let err = h.orchestrator_as("host-a").run_backup("prod").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::LockHeld);

    let second = other_outcome.lock().take().unwrap().unwrap();
    assert_eq!(second.name, "prod/FULL/20250101_040000.archive.enc");

    let first_name = "prod/FULL/20250101_020000.archive.enc";
    let first = h.catalog.get(first_name).await.unwrap();
    assert_eq!(first.status, ArtifactStatus::Failed);
    assert!(first.history.iter().all(|change| change.status != ArtifactStatus::Uploaded));
    assert!(!h.memory.contains(first_name));
    assert!(!h.dir.path().join("local").join(first_name).exists());

    let discoverable: Vec<String> = h
        .catalog
        .discoverable("prod")
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.name)
        .collect();
    assert_eq!(discoverable, vec![second.name.clone()]);
    assert!(h.memory.contains(&second.name));
}

#[tokio::test]
async fn test_run_within_its_lease_is_unaffected_by_slow_upload() {
    let (h, slow) = slow_harness();
    h.seed(3);

    // Slow, but well inside the lease duration
    let clock = h.clock.clone();
    slow.on_upload(async move { clock.advance(Duration::minutes(20)) }.boxed());

    let artifact = h.orchestrator().run_backup("prod").await.unwrap();
    assert_eq!(artifact.status, ArtifactStatus::Uploaded);
    assert_eq!(
        h.catalog.get(&artifact.name).await.unwrap().status,
        ArtifactStatus::Uploaded
    );
    assert!(h.dir.path().join("local").join(&artifact.name).exists());
    assert!(h.store.read_record("_locks/prod.lease").await.unwrap().is_none());
}
