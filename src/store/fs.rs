// Filesystem object store - for on-prem targets and local development

use super::{ObjectInfo, ObjectMetadata, ObjectReader, ObjectStore, ServerSideEncryption};
use crate::retry::transient;
use crate::{Result, VaultError};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const META_SUFFIX: &str = ".meta.json";
const PARTIAL_MARKER: &str = ".partial-";

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    metadata: ObjectMetadata,
    server_side_encryption: String,
}

/// Objects as files under a root directory, metadata in a JSON sidecar.
///
/// Writes go to a uniquely named partial file and are renamed into place, so a failed
/// upload never leaves a visible object behind.
pub struct FileObjectStore {
    root: PathBuf,
}

impl FileObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        super::validate_object_name(name)?;
        if name.ends_with(META_SUFFIX) || name.contains(PARTIAL_MARKER) {
            return Err(VaultError::Configuration(format!("reserved object name: {}", name)));
        }
        Ok(self.root.join(name))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(META_SUFFIX);
        PathBuf::from(os)
    }

    fn partial_path(path: &Path) -> PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(format!("{}{}", PARTIAL_MARKER, Uuid::new_v4().simple()));
        PathBuf::from(os)
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn write_sidecar(path: &Path, metadata: &ObjectMetadata, sse: &ServerSideEncryption) -> Result<()> {
        let sidecar = Sidecar {
            metadata: metadata.clone(),
            server_side_encryption: sse.as_header().to_string(),
        };
        fs::write(Self::sidecar_path(path), serde_json::to_vec_pretty(&sidecar)?).await?;
        Ok(())
    }

    async fn read_sidecar(path: &Path) -> Result<Option<Sidecar>> {
        match fs::read(Self::sidecar_path(path)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn collect<'a>(
        &'a self,
        dir: PathBuf,
        out: &'a mut Vec<String>,
    ) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    self.collect(path, out).await?;
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                if name.ends_with(META_SUFFIX) || name.contains(PARTIAL_MARKER) {
                    continue;
                }
                out.push(name);
            }
            Ok(())
        })
    }
}

#[async_trait]
impl ObjectStore for FileObjectStore {
    fn backend_name(&self) -> &str {
        "filesystem"
    }

    async fn put_object(
        &self,
        name: &str,
        mut body: ObjectReader,
        metadata: &ObjectMetadata,
        sse: &ServerSideEncryption,
    ) -> Result<u64> {
        let path = self.object_path(name)?;
        Self::ensure_parent(&path).await?;

        let partial = Self::partial_path(&path);
        let written = async {
            let mut file = fs::File::create(&partial).await?;
            let n = tokio::io::copy(&mut body, &mut file)
                .await
                .map_err(|e| transient("writing object", e))?;
            file.sync_all().await?;
            Ok::<u64, VaultError>(n)
        }
        .await;

        let written = match written {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        Self::write_sidecar(&path, metadata, sse).await?;
        fs::rename(&partial, &path).await?;
        Ok(written)
    }

    async fn put_if_absent(
        &self,
        name: &str,
        body: Bytes,
        metadata: &ObjectMetadata,
        sse: &ServerSideEncryption,
    ) -> Result<bool> {
        let path = self.object_path(name)?;
        Self::ensure_parent(&path).await?;

        // The body is complete before the name becomes visible: write a partial file, then
        // hard-link it into place. The link fails if the name exists.
        let partial = Self::partial_path(&path);
        let staged = async {
            let mut file = fs::File::create(&partial).await?;
            file.write_all(&body).await?;
            file.sync_all().await?;
            Ok::<(), VaultError>(())
        }
        .await;
        if let Err(e) = staged {
            let _ = fs::remove_file(&partial).await;
            return Err(e);
        }

        let linked = fs::hard_link(&partial, &path).await;
        let _ = fs::remove_file(&partial).await;
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        Self::write_sidecar(&path, metadata, sse).await?;
        Ok(true)
    }

    async fn get_object(&self, name: &str) -> Result<ObjectReader> {
        let path = self.object_path(name)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VaultError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn head_object(&self, name: &str) -> Result<Option<ObjectInfo>> {
        let path = self.object_path(name)?;
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let sidecar = Self::read_sidecar(&path).await?;
        Ok(Some(ObjectInfo {
            name: name.to_string(),
            size: meta.len(),
            metadata: sidecar
                .as_ref()
                .map(|s| s.metadata.clone())
                .unwrap_or_default(),
            server_side_encryption: sidecar.map(|s| s.server_side_encryption),
        }))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        self.collect(self.root.clone(), &mut names).await?;
        names.retain(|name| name.starts_with(prefix));
        names.sort();
        Ok(names)
    }

    async fn delete_object(&self, name: &str) -> Result<()> {
        let path = self.object_path(name)?;
        for target in [path.clone(), Self::sidecar_path(&path)] {
            match fs::remove_file(&target).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| VaultError::UpstreamUnreachable(format!("{}: {}", self.root.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::new(dir.path());
        let meta = ObjectMetadata::new().with("environment", "prod");

        let body: ObjectReader = Box::pin(std::io::Cursor::new(b"hello".to_vec()));
        let n = store
            .put_object("prod/FULL/a.archive.enc", body, &meta, &ServerSideEncryption::Aes256)
            .await
            .unwrap();
        assert_eq!(n, 5);

        let names = store.list_objects("prod/").await.unwrap();
        assert_eq!(names, vec!["prod/FULL/a.archive.enc".to_string()]);

        let info = store.head_object("prod/FULL/a.archive.enc").await.unwrap().unwrap();
        assert_eq!(info.metadata.get("environment"), Some("prod"));
        assert_eq!(info.server_side_encryption.as_deref(), Some("AES256"));
    }

    #[tokio::test]
    async fn test_put_if_absent_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::new(dir.path());
        let sse = ServerSideEncryption::Aes256;
        let meta = ObjectMetadata::new();

        assert!(store.put_if_absent("_locks/prod.lease", Bytes::from_static(b"a"), &meta, &sse).await.unwrap());
        assert!(!store.put_if_absent("_locks/prod.lease", Bytes::from_static(b"b"), &meta, &sse).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_creates_never_expose_partial_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileObjectStore::new(dir.path()));
        let body = Bytes::from(vec![b'x'; 256 * 1024]);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let body = body.clone();
            tasks.push(tokio::spawn(async move {
                let created = store
                    .put_if_absent("_locks/prod.lease", body, &ObjectMetadata::new(), &ServerSideEncryption::Aes256)
                    .await
                    .unwrap();
                let mut reader = store.get_object("_locks/prod.lease").await.unwrap();
                let mut seen = Vec::new();
                tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut seen).await.unwrap();
                (created, seen.len())
            }));
        }

        let mut winners = 0;
        for task in tasks {
            let (created, len) = task.await.unwrap();
            winners += created as usize;
            assert_eq!(len, body.len());
        }
        assert_eq!(winners, 1);

        // Only the object and its sidecar remain
        let mut leftovers = Vec::new();
        let mut entries = fs::read_dir(dir.path().join("_locks")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            leftovers.push(entry.file_name().to_string_lossy().into_owned());
        }
        leftovers.sort();
        assert_eq!(leftovers, vec!["prod.lease", "prod.lease.meta.json"]);
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileObjectStore::new(dir.path());
        assert!(matches!(store.get_object("prod/none").await, Err(VaultError::NotFound(_))));
        assert!(store.head_object("prod/none").await.unwrap().is_none());
        store.delete_object("prod/none").await.unwrap();
    }
}
