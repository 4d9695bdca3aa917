// Artifact download and payload decoding shared by restore and verify
//
// The encrypted artifact is staged on local disk so its checksum can be checked before any
// decryption happens. Plaintext is never written locally; it flows chunk by chunk from the
// decryptor through the archive decoder to the caller.

use crate::archive::{ArchiveDecoder, ArchiveManifest, ArchiveSummary};
use crate::artifact::BackupArtifact;
use crate::crypto::{Decryptor, OpenReader};
use crate::store::{DownloadSummary, RemoteStore};
use crate::{Result, VaultError};
use std::path::{Path, PathBuf};
use tokio::io::BufReader;
use tracing::{debug, warn};
use uuid::Uuid;

/// Encrypted artifact on local disk. The file is removed on drop.
#[derive(Debug)]
pub struct StagedArtifact {
    path: PathBuf,
    summary: DownloadSummary,
}

impl StagedArtifact {
    /// Download `artifact` into `staging_dir`.
    pub async fn download(store: &RemoteStore, artifact: &BackupArtifact, staging_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(staging_dir).await?;
        let path = staging_dir.join(format!("{}.enc", Uuid::new_v4().simple()));
        match store.download_to(&artifact.name, &path).await {
            Ok(summary) => {
                debug!(artifact = %artifact.name, bytes = summary.bytes, "Artifact staged");
                Ok(Self { path, summary })
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(e)
            }
        }
    }

    pub fn summary(&self) -> &DownloadSummary {
        &self.summary
    }

    /// Whether the staged bytes match the checksum recorded at upload.
    pub fn checksum_matches(&self, artifact: &BackupArtifact) -> bool {
        artifact.checksum.as_deref() == Some(self.summary.sha256.as_str())
            && artifact.encrypted_size == self.summary.bytes
    }

    /// Fail with `Integrity` unless the checksum matches.
    pub fn require_checksum(&self, artifact: &BackupArtifact) -> Result<()> {
        if self.checksum_matches(artifact) {
            return Ok(());
        }
        Err(VaultError::Integrity(format!(
            "{}: checksum mismatch (recorded {}, downloaded {} over {} bytes)",
            artifact.name,
            artifact.checksum.as_deref().unwrap_or("none"),
            self.summary.sha256,
            self.summary.bytes
        )))
    }

    /// Start decrypting and decoding the payload.
    pub async fn open(&self, decryptor: &Decryptor) -> Result<PayloadReader> {
        let file = tokio::fs::File::open(&self.path).await?;
        let opener = OpenReader::new(decryptor, BufReader::new(file)).await?;
        Ok(PayloadReader {
            opener,
            decoder: ArchiveDecoder::new(),
        })
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Could not remove staged artifact");
            }
        }
    }
}

/// Raw snapshot bytes out of a staged artifact.
///
/// Decryption problems surface as `Decryption`, container problems as `Integrity`.
pub struct PayloadReader {
    opener: OpenReader<BufReader<tokio::fs::File>>,
    decoder: ArchiveDecoder,
}

impl PayloadReader {
    /// Next run of raw bytes; `None` once the encrypted stream ends.
    pub async fn next_raw(&mut self) -> Result<Option<Vec<u8>>> {
        while let Some(chunk) = self.opener.next_chunk().await? {
            let raw = self.decoder.feed(&chunk)?;
            if !raw.is_empty() {
                return Ok(Some(raw));
            }
        }
        Ok(None)
    }

    /// Available once the container header has been read.
    pub fn manifest(&self) -> Option<&ArchiveManifest> {
        self.decoder.manifest()
    }

    /// Require a complete container with a matching trailer.
    pub fn finish(self) -> Result<ArchiveSummary> {
        self.decoder.finish()
    }

    /// Read the whole payload, discarding it. Returns the manifest and summary.
    pub async fn drain(mut self) -> Result<(ArchiveManifest, ArchiveSummary)> {
        while self.next_raw().await?.is_some() {}
        let manifest = self
            .manifest()
            .cloned()
            .ok_or_else(|| VaultError::Integrity("archive has no manifest".into()))?;
        Ok((manifest, self.finish()?))
    }
}
