//! Backup container format.
//!
//! The plaintext handed to the encryptor is a framed archive:
//!
//! ```text
//! "PITRVLT1"
//! u32 BE manifest length | manifest (JSON)
//! (u32 BE frame length | gzip bytes)*
//! u32 BE 0
//! u64 BE raw payload length | SHA-256 of raw payload (32) | "PITREND1"
//! ```
//!
//! Encoder and decoder are sans-IO: callers push bytes in and get bytes out, which lets the
//! same code run inside the backup pipeline, the verifier and the restore engine.

use crate::artifact::WalPosition;
use crate::{Result, VaultError};
use chrono::{DateTime, Utc};
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;

pub const ARCHIVE_MAGIC: &[u8; 8] = b"PITRVLT1";
pub const TRAILER_MAGIC: &[u8; 8] = b"PITREND1";
pub const FORMAT_VERSION: u32 = 1;

const MAX_MANIFEST_LEN: usize = 1024 * 1024;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const TRAILER_LEN: usize = 8 + 32 + 8;

/// Describes the snapshot inside an archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveManifest {
    pub format_version: u32,
    pub label: String,
    pub environment: String,
    pub source: String,
    pub wal_start: WalPosition,
    pub snapshot_at: DateTime<Utc>,
    pub compression: String,
}

impl ArchiveManifest {
    pub fn new(
        label: impl Into<String>,
        environment: impl Into<String>,
        source: impl Into<String>,
        wal_start: WalPosition,
        snapshot_at: DateTime<Utc>,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            label: label.into(),
            environment: environment.into(),
            source: source.into(),
            wal_start,
            snapshot_at,
            compression: "gzip".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub raw_bytes: u64,
    pub raw_sha256: String,
    pub archive_bytes: u64,
}

pub struct ArchiveEncoder {
    gz: GzEncoder<Vec<u8>>,
    hasher: Sha256,
    raw_bytes: u64,
    archive_bytes: u64,
}

impl ArchiveEncoder {
    /// Start an archive. Returns the encoder and the header bytes to emit first.
    pub fn start(manifest: &ArchiveManifest) -> Result<(Self, Vec<u8>)> {
        let manifest = serde_json::to_vec(manifest)?;
        let mut header = Vec::with_capacity(ARCHIVE_MAGIC.len() + 4 + manifest.len());
        header.extend_from_slice(ARCHIVE_MAGIC);
        header.extend_from_slice(&(manifest.len() as u32).to_be_bytes());
        header.extend_from_slice(&manifest);

        let encoder = Self {
            gz: GzEncoder::new(Vec::new(), Compression::default()),
            hasher: Sha256::new(),
            raw_bytes: 0,
            archive_bytes: header.len() as u64,
        };
        Ok((encoder, header))
    }

    /// Compress a chunk of raw payload. May return nothing while gzip buffers.
    pub fn encode(&mut self, chunk: &[u8]) -> Result<Vec<u8>> {
        self.hasher.update(chunk);
        self.raw_bytes += chunk.len() as u64;
        self.gz.write_all(chunk)?;
        let compressed = std::mem::take(self.gz.get_mut());
        Ok(self.frame(&compressed))
    }

    fn frame(&mut self, compressed: &[u8]) -> Vec<u8> {
        if compressed.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(4 + compressed.len());
        for piece in compressed.chunks(MAX_FRAME_LEN) {
            out.extend_from_slice(&(piece.len() as u32).to_be_bytes());
            out.extend_from_slice(piece);
        }
        self.archive_bytes += out.len() as u64;
        out
    }

    /// Flush gzip and append terminator and trailer.
    pub fn finish(mut self) -> Result<(Vec<u8>, ArchiveSummary)> {
        let gz = std::mem::replace(&mut self.gz, GzEncoder::new(Vec::new(), Compression::none()));
        let rest = gz.finish()?;
        let mut out = self.frame(&rest);

        let digest = self.hasher.finalize();
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&self.raw_bytes.to_be_bytes());
        out.extend_from_slice(&digest);
        out.extend_from_slice(TRAILER_MAGIC);
        self.archive_bytes += (4 + TRAILER_LEN) as u64;

        Ok((
            out,
            ArchiveSummary {
                raw_bytes: self.raw_bytes,
                raw_sha256: crate::store::hex(&digest),
                archive_bytes: self.archive_bytes,
            },
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Magic,
    ManifestLen,
    Manifest(usize),
    FrameLen,
    Frame(usize),
    Trailer,
    Done,
}

/// Push parser for archives. Every structural problem is an `Integrity` error.
pub struct ArchiveDecoder {
    state: State,
    buffer: Vec<u8>,
    manifest: Option<ArchiveManifest>,
    gz: Option<GzDecoder<Vec<u8>>>,
    hasher: Sha256,
    raw_bytes: u64,
    raw_sha256: Option<String>,
    archive_bytes: u64,
}

impl Default for ArchiveDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveDecoder {
    pub fn new() -> Self {
        Self {
            state: State::Magic,
            buffer: Vec::new(),
            manifest: None,
            gz: Some(GzDecoder::new(Vec::new())),
            hasher: Sha256::new(),
            raw_bytes: 0,
            raw_sha256: None,
            archive_bytes: 0,
        }
    }

    /// Available once the header has been parsed.
    pub fn manifest(&self) -> Option<&ArchiveManifest> {
        self.manifest.as_ref()
    }

    fn take(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.buffer.len() < n {
            return None;
        }
        let rest = self.buffer.split_off(n);
        Some(std::mem::replace(&mut self.buffer, rest))
    }

    fn inflate(&mut self, compressed: &[u8]) -> Result<Vec<u8>> {
        let gz = self
            .gz
            .as_mut()
            .ok_or_else(|| VaultError::Integrity("payload after end of stream".into()))?;
        gz.write_all(compressed)
            .map_err(|e| VaultError::Integrity(format!("corrupt payload: {}", e)))?;
        let raw = std::mem::take(gz.get_mut());
        self.hasher.update(&raw);
        self.raw_bytes += raw.len() as u64;
        Ok(raw)
    }

    /// Consume archive bytes and return any raw payload they complete.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.archive_bytes += data.len() as u64;
        if self.state == State::Done {
            if data.is_empty() {
                return Ok(Vec::new());
            }
            return Err(VaultError::Integrity("trailing bytes after archive trailer".into()));
        }
        self.buffer.extend_from_slice(data);
        let mut raw = Vec::new();

        loop {
            match self.state {
                State::Magic => {
                    let Some(magic) = self.take(ARCHIVE_MAGIC.len()) else { break };
                    if magic != ARCHIVE_MAGIC {
                        return Err(VaultError::Integrity("not a backup archive (bad magic)".into()));
                    }
                    self.state = State::ManifestLen;
                }
                State::ManifestLen => {
                    let Some(len) = self.take(4) else { break };
                    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
                    if len == 0 || len > MAX_MANIFEST_LEN {
                        return Err(VaultError::Integrity(format!("invalid manifest length {}", len)));
                    }
                    self.state = State::Manifest(len);
                }
                State::Manifest(len) => {
                    let Some(bytes) = self.take(len) else { break };
                    let manifest: ArchiveManifest = serde_json::from_slice(&bytes)
                        .map_err(|e| VaultError::Integrity(format!("invalid manifest: {}", e)))?;
                    if manifest.format_version != FORMAT_VERSION {
                        return Err(VaultError::Integrity(format!(
                            "unsupported archive version {}",
                            manifest.format_version
                        )));
                    }
                    self.manifest = Some(manifest);
                    self.state = State::FrameLen;
                }
                State::FrameLen => {
                    let Some(len) = self.take(4) else { break };
                    let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
                    if len > MAX_FRAME_LEN {
                        return Err(VaultError::Integrity(format!("invalid frame length {}", len)));
                    }
                    if len == 0 {
                        let gz = self.gz.take().ok_or_else(|| {
                            VaultError::Integrity("payload terminated twice".into())
                        })?;
                        let rest = gz
                            .finish()
                            .map_err(|e| VaultError::Integrity(format!("corrupt payload: {}", e)))?;
                        self.hasher.update(&rest);
                        self.raw_bytes += rest.len() as u64;
                        raw.extend_from_slice(&rest);
                        self.state = State::Trailer;
                    } else {
                        self.state = State::Frame(len);
                    }
                }
                State::Frame(len) => {
                    let Some(compressed) = self.take(len) else { break };
                    let inflated = self.inflate(&compressed)?;
                    raw.extend_from_slice(&inflated);
                    self.state = State::FrameLen;
                }
                State::Trailer => {
                    let Some(trailer) = self.take(TRAILER_LEN) else { break };
                    self.check_trailer(&trailer)?;
                    self.state = State::Done;
                    if !self.buffer.is_empty() {
                        return Err(VaultError::Integrity("trailing bytes after archive trailer".into()));
                    }
                    break;
                }
                State::Done => break,
            }
        }

        Ok(raw)
    }

    fn check_trailer(&mut self, trailer: &[u8]) -> Result<()> {
        if &trailer[40..] != TRAILER_MAGIC {
            return Err(VaultError::Integrity("missing archive trailer".into()));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&trailer[..8]);
        let expected_len = u64::from_be_bytes(len);
        if expected_len != self.raw_bytes {
            return Err(VaultError::Integrity(format!(
                "payload length {} does not match trailer {}",
                self.raw_bytes, expected_len
            )));
        }
        let digest = std::mem::take(&mut self.hasher).finalize();
        if digest.as_slice() != &trailer[8..40] {
            return Err(VaultError::Integrity("payload digest does not match trailer".into()));
        }
        self.raw_sha256 = Some(crate::store::hex(&digest));
        Ok(())
    }

    /// Require a complete, trailer-checked archive.
    pub fn finish(self) -> Result<ArchiveSummary> {
        let raw_sha256 = match (self.state, self.raw_sha256) {
            (State::Done, Some(digest)) => digest,
            _ => return Err(VaultError::Integrity("archive truncated".into())),
        };
        Ok(ArchiveSummary {
            raw_bytes: self.raw_bytes,
            raw_sha256,
            archive_bytes: self.archive_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn manifest() -> ArchiveManifest {
        ArchiveManifest::new(
            "pitr-vault-prod-20250101_020000",
            "prod",
            "prod-db",
            WalPosition(0x1_0000_0028),
            Utc.with_ymd_and_hms(2025, 1, 1, 2, 0, 0).unwrap(),
        )
    }

    fn encode(payload: &[u8], chunk: usize) -> (Vec<u8>, ArchiveSummary) {
        let (mut encoder, mut out) = ArchiveEncoder::start(&manifest()).unwrap();
        for piece in payload.chunks(chunk.max(1)) {
            out.extend(encoder.encode(piece).unwrap());
        }
        let (tail, summary) = encoder.finish().unwrap();
        out.extend(tail);
        (out, summary)
    }

    fn decode(archive: &[u8], chunk: usize) -> Result<(Vec<u8>, ArchiveManifest)> {
        let mut decoder = ArchiveDecoder::new();
        let mut raw = Vec::new();
        for piece in archive.chunks(chunk.max(1)) {
            raw.extend(decoder.feed(piece)?);
        }
        let manifest = decoder.manifest().cloned();
        decoder.finish()?;
        Ok((raw, manifest.unwrap()))
    }

    #[test]
    fn test_roundtrip_with_odd_chunking() {
        let payload: Vec<u8> = (0..300_000u32).flat_map(|i| (i % 97).to_le_bytes()).collect();
        let (archive, summary) = encode(&payload, 7_777);
        assert_eq!(summary.raw_bytes, payload.len() as u64);
        assert_eq!(summary.archive_bytes, archive.len() as u64);
        assert!(archive.len() < payload.len());

        let (raw, m) = decode(&archive, 1_000).unwrap();
        assert_eq!(raw, payload);
        assert_eq!(m, manifest());
    }

    #[test]
    fn test_empty_payload() {
        let (archive, _) = encode(b"", 1);
        let (raw, _) = decode(&archive, 3).unwrap();
        assert!(raw.is_empty());
    }

    #[test]
    fn test_truncated_archive_is_integrity_error() {
        let (archive, _) = encode(b"some table data", 4);
        let err = decode(&archive[..archive.len() - 5], 64).unwrap_err();
        assert!(matches!(err, VaultError::Integrity(ref m) if m.contains("truncated")));
    }

    #[test]
    fn test_bad_magic() {
        let err = decode(b"NOTVAULT\0\0\0\0", 64).unwrap_err();
        assert!(matches!(err, VaultError::Integrity(_)));
    }

    #[test]
    fn test_trailer_length_mismatch() {
        let (mut archive, _) = encode(b"rows", 4);
        let at = archive.len() - TRAILER_LEN;
        archive[at + 7] ^= 0x01;
        assert!(matches!(decode(&archive, 64), Err(VaultError::Integrity(_))));
    }

    #[test]
    fn test_trailing_garbage() {
        let (mut archive, _) = encode(b"rows", 4);
        archive.extend_from_slice(b"xx");
        assert!(matches!(decode(&archive, 1024), Err(VaultError::Integrity(_))));
    }
}
