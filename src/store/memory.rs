use super::{ObjectInfo, ObjectMetadata, ObjectReader, ObjectStore, ServerSideEncryption};
use crate::{Result, VaultError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    metadata: ObjectMetadata,
    sse: String,
}

/// In-process object store for tests and dry runs.
///
/// Supports fault injection: transient failures for the next N operations, a fully
/// unreachable mode, and byte-level tampering of stored objects.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<DashMap<String, StoredObject>>,
    pending_failures: Arc<AtomicUsize>,
    unreachable: Arc<AtomicBool>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` operations fail with a transient error.
    pub fn fail_next_operations(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Every operation fails with `UpstreamUnreachable` while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Flip one byte of a stored object in place, keeping its metadata.
    pub fn tamper(&self, name: &str, offset: usize) -> bool {
        match self.objects.get_mut(name) {
            Some(mut entry) if offset < entry.data.len() => {
                let mut data = entry.data.to_vec();
                data[offset] ^= 0xFF;
                entry.data = Bytes::from(data);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.objects.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn check_faults(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(VaultError::UpstreamUnreachable("memory store offline".into()));
        }
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(VaultError::TransientIo("injected transient failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn put_object(
        &self,
        name: &str,
        mut body: ObjectReader,
        metadata: &ObjectMetadata,
        sse: &ServerSideEncryption,
    ) -> Result<u64> {
        self.check_faults()?;
        super::validate_object_name(name)?;
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;
        let size = data.len() as u64;
        self.objects.insert(
            name.to_string(),
            StoredObject {
                data: Bytes::from(data),
                metadata: metadata.clone(),
                sse: sse.as_header().to_string(),
            },
        );
        Ok(size)
    }

    async fn put_if_absent(
        &self,
        name: &str,
        body: Bytes,
        metadata: &ObjectMetadata,
        sse: &ServerSideEncryption,
    ) -> Result<bool> {
        self.check_faults()?;
        super::validate_object_name(name)?;
        match self.objects.entry(name.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(StoredObject {
                    data: body,
                    metadata: metadata.clone(),
                    sse: sse.as_header().to_string(),
                });
                Ok(true)
            }
        }
    }

    async fn get_object(&self, name: &str) -> Result<ObjectReader> {
        self.check_faults()?;
        let data = self
            .objects
            .get(name)
            .map(|entry| entry.data.clone())
            .ok_or_else(|| VaultError::NotFound(name.to_string()))?;
        Ok(Box::pin(std::io::Cursor::new(data)))
    }

    async fn head_object(&self, name: &str) -> Result<Option<ObjectInfo>> {
        self.check_faults()?;
        Ok(self.objects.get(name).map(|entry| ObjectInfo {
            name: name.to_string(),
            size: entry.data.len() as u64,
            metadata: entry.metadata.clone(),
            server_side_encryption: Some(entry.sse.clone()),
        }))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_faults()?;
        let mut names: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn delete_object(&self, name: &str) -> Result<()> {
        self.check_faults()?;
        self.objects.remove(name);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(VaultError::UpstreamUnreachable("memory store offline".into()));
        }
        Ok(())
    }
}
