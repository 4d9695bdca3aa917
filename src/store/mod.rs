//! Remote store adapter.
//!
//! [`ObjectStore`] is the raw backend contract (memory, filesystem, S3). [`RemoteStore`] is
//! the single adapter every component goes through: it adds retry with backoff, mandatory
//! server-side encryption on every put, and idempotent uploads.

mod fs;
mod memory;
#[cfg(feature = "s3")]
mod s3;

pub use fs::FileObjectStore;
pub use memory::MemoryObjectStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;

use crate::retry::{RetryConfig, RetryExecutor};
use crate::{Result, VaultError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Streaming object body.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Metadata key holding the SHA-256 of the stored payload.
pub const CHECKSUM_KEY: &str = "checksum-sha256";

const COPY_BUFFER: usize = 64 * 1024;

/// Server-side encryption mode applied to every put.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ServerSideEncryption {
    Aes256,
    Kms { key_id: Option<String> },
}

impl Default for ServerSideEncryption {
    fn default() -> Self {
        ServerSideEncryption::Aes256
    }
}

impl ServerSideEncryption {
    pub fn as_header(&self) -> &'static str {
        match self {
            ServerSideEncryption::Aes256 => "AES256",
            ServerSideEncryption::Kms { .. } => "aws:kms",
        }
    }
}

/// User metadata attached to an object at upload time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectMetadata {
    entries: BTreeMap<String, String>,
}

impl ObjectMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }

    pub fn checksum(&self) -> Option<&str> {
        self.get(CHECKSUM_KEY)
    }
}

impl FromIterator<(String, String)> for ObjectMetadata {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
    pub metadata: ObjectMetadata,
    pub server_side_encryption: Option<String>,
}

/// Raw blob backend.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Backend name for logs and reports
    fn backend_name(&self) -> &str;

    /// Store `body` under `name`, replacing any existing object. Returns bytes written.
    async fn put_object(
        &self,
        name: &str,
        body: ObjectReader,
        metadata: &ObjectMetadata,
        sse: &ServerSideEncryption,
    ) -> Result<u64>;

    /// Store `body` only if `name` does not exist. Returns whether it was written.
    async fn put_if_absent(
        &self,
        name: &str,
        body: Bytes,
        metadata: &ObjectMetadata,
        sse: &ServerSideEncryption,
    ) -> Result<bool>;

    /// Open an object for streaming reads. Missing objects are `NotFound`.
    async fn get_object(&self, name: &str) -> Result<ObjectReader>;

    async fn head_object(&self, name: &str) -> Result<Option<ObjectInfo>>;

    /// Names under `prefix`, sorted.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove an object. Removing a missing object succeeds.
    async fn delete_object(&self, name: &str) -> Result<()>;

    /// Check reachability and credentials.
    async fn ping(&self) -> Result<()>;
}

/// Where an upload reads from. Re-opened on every attempt so retries never replay a
/// half-consumed stream.
#[derive(Debug, Clone)]
pub enum PutSource {
    File(PathBuf),
    Bytes(Bytes),
}

impl PutSource {
    async fn open(&self) -> Result<ObjectReader> {
        match self {
            PutSource::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(Box::pin(file))
            }
            PutSource::Bytes(bytes) => Ok(Box::pin(std::io::Cursor::new(bytes.clone()))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored { bytes: u64 },
    AlreadyPresent,
}

/// Size and SHA-256 of a downloaded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Clone)]
pub struct RemoteStore {
    backend: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    sse: ServerSideEncryption,
}

impl RemoteStore {
    pub fn new(backend: Arc<dyn ObjectStore>, retry: RetryConfig) -> Self {
        Self {
            backend,
            retry: RetryExecutor::new(retry),
            sse: ServerSideEncryption::default(),
        }
    }

    pub fn with_server_side_encryption(mut self, sse: ServerSideEncryption) -> Self {
        self.sse = sse;
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.backend_name()
    }

    /// Idempotent upload.
    ///
    /// If `name` already holds an object with the same checksum the call is a no-op.
    /// An existing object with different content is never overwritten.
    pub async fn put(
        &self,
        name: &str,
        source: PutSource,
        metadata: &ObjectMetadata,
    ) -> Result<PutOutcome> {
        if let Some(existing) = self.head(name).await? {
            return match (existing.metadata.checksum(), metadata.checksum()) {
                (Some(have), Some(want)) if have == want => {
                    debug!(object = %name, "Object already present with identical checksum");
                    Ok(PutOutcome::AlreadyPresent)
                }
                _ => Err(VaultError::Conflict(format!(
                    "{} already exists with different content",
                    name
                ))),
            };
        }

        let bytes = self
            .retry
            .execute("put", || {
                let source = source.clone();
                async move {
                    let body = source.open().await?;
                    self.backend.put_object(name, body, metadata, &self.sse).await
                }
            })
            .await?;

        info!(object = %name, bytes = bytes, backend = %self.backend_name(), "Object uploaded");
        Ok(PutOutcome::Stored { bytes })
    }

    /// Stream an object into a local file, hashing as it goes.
    pub async fn download_to(&self, name: &str, path: &Path) -> Result<DownloadSummary> {
        self.retry
            .execute("download", || async move {
                let mut reader = self.backend.get_object(name).await?;
                let mut file = tokio::fs::File::create(path).await?;
                let mut hasher = Sha256::new();
                let mut buffer = vec![0u8; COPY_BUFFER];
                let mut total = 0u64;
                loop {
                    let n = reader
                        .read(&mut buffer)
                        .await
                        .map_err(|e| VaultError::TransientIo(format!("reading {}: {}", name, e)))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buffer[..n]);
                    file.write_all(&buffer[..n]).await?;
                    total += n as u64;
                }
                file.flush().await?;
                Ok(DownloadSummary {
                    bytes: total,
                    sha256: hex(&hasher.finalize()),
                })
            })
            .await
    }

    /// Read a whole object into memory. Intended for records and WAL segments.
    pub async fn get_bytes(&self, name: &str) -> Result<Vec<u8>> {
        self.retry
            .execute("get", || async move {
                let mut reader = self.backend.get_object(name).await?;
                let mut data = Vec::new();
                reader
                    .read_to_end(&mut data)
                    .await
                    .map_err(|e| VaultError::TransientIo(format!("reading {}: {}", name, e)))?;
                Ok(data)
            })
            .await
    }

    pub async fn head(&self, name: &str) -> Result<Option<ObjectInfo>> {
        self.retry
            .execute("head", || self.backend.head_object(name))
            .await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.retry
            .execute("list", || self.backend.list_objects(prefix))
            .await
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        self.retry
            .execute("delete", || self.backend.delete_object(name))
            .await?;
        debug!(object = %name, "Object deleted");
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.backend.ping().await
    }

    /// Overwrite a small mutable record (catalog entries, leases, jobs).
    pub async fn write_record(&self, name: &str, data: Vec<u8>) -> Result<()> {
        let data = Bytes::from(data);
        let metadata = ObjectMetadata::new().with(CHECKSUM_KEY, sha256_hex(&data));
        self.retry
            .execute("write_record", || {
                let body: ObjectReader = Box::pin(std::io::Cursor::new(data.clone()));
                self.backend.put_object(name, body, &metadata, &self.sse)
            })
            .await?;
        Ok(())
    }

    /// Create a record only if absent. Returns whether this call created it.
    pub async fn create_record(&self, name: &str, data: Vec<u8>) -> Result<bool> {
        let data = Bytes::from(data);
        let metadata = ObjectMetadata::new().with(CHECKSUM_KEY, sha256_hex(&data));
        self.retry
            .execute("create_record", || {
                self.backend
                    .put_if_absent(name, data.clone(), &metadata, &self.sse)
            })
            .await
    }

    /// Read a record, `None` if missing.
    pub async fn read_record(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match self.get_bytes(name).await {
            Ok(data) => Ok(Some(data)),
            Err(VaultError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex(&Sha256::digest(data))
}

/// Reject names that could escape a filesystem root or collide with internal files.
pub(crate) fn validate_object_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(VaultError::Configuration(format!("invalid object name: {:?}", name)));
    }
    Ok(())
}
