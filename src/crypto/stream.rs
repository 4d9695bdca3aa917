//! Sealed stream framing.
//!
//! ```text
//! "PVENC\x01" | key id (8) | ephemeral public key (32) | nonce prefix (16)
//! frame*      = u32 BE ciphertext length | ciphertext (plaintext chunk + 16-byte tag)
//! ```
//!
//! Frame `i` uses nonce `prefix || i as u64 BE` and associated data `[is_last]`, so
//! reordering, dropping or truncating frames fails authentication. The final frame is always
//! present, even for empty input.

use super::{Decryptor, Encryptor, KEY_ID_LEN};
use crate::{Result, VaultError};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x25519_dalek::{PublicKey, StaticSecret};

pub const MAGIC: &[u8; 6] = b"PVENC\x01";
/// Plaintext bytes per frame.
pub const CHUNK_SIZE: usize = 64 * 1024;
const TAG_LEN: usize = 16;
const PREFIX_LEN: usize = 16;
const HEADER_LEN: usize = MAGIC.len() + KEY_ID_LEN + 32 + PREFIX_LEN;
const HKDF_INFO: &[u8] = b"pitr-vault-stream-xchacha20poly1305-v1";

fn derive_cipher(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> Result<XChaCha20Poly1305> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .map_err(|e| VaultError::Encryption(format!("key derivation failed: {}", e)))?;
    Ok(XChaCha20Poly1305::new(&key.into()))
}

fn nonce(prefix: &[u8; PREFIX_LEN], counter: u64) -> XNonce {
    let mut bytes = [0u8; 24];
    bytes[..PREFIX_LEN].copy_from_slice(prefix);
    bytes[PREFIX_LEN..].copy_from_slice(&counter.to_be_bytes());
    XNonce::from(bytes)
}

/// Totals of one sealed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealSummary {
    pub plaintext_bytes: u64,
    pub ciphertext_bytes: u64,
    /// SHA-256 of the complete sealed output, hex
    pub sha256: String,
}

/// Incremental encryptor over an async sink.
pub struct SealWriter<W> {
    inner: W,
    cipher: XChaCha20Poly1305,
    prefix: [u8; PREFIX_LEN],
    counter: u64,
    pending: Vec<u8>,
    hasher: Sha256,
    plaintext_bytes: u64,
    ciphertext_bytes: u64,
}

impl<W: AsyncWrite + Unpin> SealWriter<W> {
    /// Write the header for a fresh ephemeral key and return the writer.
    pub async fn new(encryptor: &Encryptor, inner: W) -> Result<Self> {
        let mut rng = rand::rngs::OsRng;
        let ephemeral = StaticSecret::random_from_rng(rng);
        let ephemeral_public = PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(encryptor.public());
        if !shared.was_contributory() {
            return Err(VaultError::Encryption("recipient public key is degenerate".into()));
        }
        let cipher = derive_cipher(shared.as_bytes(), &ephemeral_public, encryptor.public())?;

        let mut prefix = [0u8; PREFIX_LEN];
        rng.fill_bytes(&mut prefix);

        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&encryptor.key_id());
        header.extend_from_slice(ephemeral_public.as_bytes());
        header.extend_from_slice(&prefix);

        let mut writer = Self {
            inner,
            cipher,
            prefix,
            counter: 0,
            pending: Vec::with_capacity(CHUNK_SIZE),
            hasher: Sha256::new(),
            plaintext_bytes: 0,
            ciphertext_bytes: 0,
        };
        writer.emit(&header).await?;
        Ok(writer)
    }

    async fn emit(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes).await?;
        self.hasher.update(bytes);
        self.ciphertext_bytes += bytes.len() as u64;
        Ok(())
    }

    async fn seal_frame(&mut self, chunk: &[u8], last: bool) -> Result<()> {
        let aad = [last as u8];
        let sealed = self
            .cipher
            .encrypt(&nonce(&self.prefix, self.counter), Payload { msg: chunk, aad: &aad })
            .map_err(|_| VaultError::Encryption(format!("sealing frame {} failed", self.counter)))?;
        self.counter += 1;
        let len = (sealed.len() as u32).to_be_bytes();
        self.emit(&len).await?;
        self.emit(&sealed).await
    }

    /// Buffer plaintext; full frames are sealed as soon as more data follows them.
    ///
    /// `pending` never holds more than one frame. Whole frames are sealed straight from
    /// `data`, so the cost of a write is linear in its length.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.plaintext_bytes += data.len() as u64;
        let mut rest = data;

        if !self.pending.is_empty() {
            let take = (CHUNK_SIZE - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if rest.is_empty() {
                return Ok(());
            }
            let mut full = std::mem::take(&mut self.pending);
            self.seal_frame(&full, false).await?;
            full.clear();
            self.pending = full;
        }

        while rest.len() > CHUNK_SIZE {
            let (frame, tail) = rest.split_at(CHUNK_SIZE);
            self.seal_frame(frame, false).await?;
            rest = tail;
        }
        self.pending.extend_from_slice(rest);
        Ok(())
    }

    /// Seal the final frame, flush, and return the sink with the totals.
    pub async fn finish_into_inner(mut self) -> Result<(W, SealSummary)> {
        let chunk = std::mem::take(&mut self.pending);
        self.seal_frame(&chunk, true).await?;
        self.inner.flush().await?;
        let summary = SealSummary {
            plaintext_bytes: self.plaintext_bytes,
            ciphertext_bytes: self.ciphertext_bytes,
            sha256: crate::store::hex(&self.hasher.finalize()),
        };
        Ok((self.inner, summary))
    }

    pub async fn finish(self) -> Result<SealSummary> {
        Ok(self.finish_into_inner().await?.1)
    }
}

/// Incremental decryptor over an async source.
pub struct OpenReader<R> {
    inner: R,
    cipher: XChaCha20Poly1305,
    prefix: [u8; PREFIX_LEN],
    counter: u64,
    finished: bool,
}

impl<R: AsyncRead + Unpin> OpenReader<R> {
    /// Read and check the header. Wrong magic or a foreign key id is a `Decryption` error.
    pub async fn new(decryptor: &Decryptor, mut inner: R) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        read_exact_or(&mut inner, &mut header, "truncated header").await?;

        if &header[..MAGIC.len()] != MAGIC {
            return Err(VaultError::Decryption("not a sealed payload (bad magic)".into()));
        }
        let mut offset = MAGIC.len();
        if header[offset..offset + KEY_ID_LEN] != decryptor.key_id() {
            return Err(VaultError::Decryption(format!(
                "payload sealed for a different key than {}",
                decryptor.key_ref()
            )));
        }
        offset += KEY_ID_LEN;

        let mut ephemeral = [0u8; 32];
        ephemeral.copy_from_slice(&header[offset..offset + 32]);
        offset += 32;
        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&header[offset..offset + PREFIX_LEN]);

        let ephemeral = PublicKey::from(ephemeral);
        let shared = decryptor.secret().diffie_hellman(&ephemeral);
        if !shared.was_contributory() {
            return Err(VaultError::Decryption("degenerate ephemeral key".into()));
        }
        let cipher = derive_cipher(shared.as_bytes(), &ephemeral, decryptor.public())
            .map_err(|e| VaultError::Decryption(e.to_string()))?;

        Ok(Self {
            inner,
            cipher,
            prefix,
            counter: 0,
            finished: false,
        })
    }

    /// Next plaintext chunk, `None` after the authenticated final frame.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }

        let mut len = [0u8; 4];
        read_exact_or(&mut self.inner, &mut len, "truncated ciphertext").await?;
        let len = u32::from_be_bytes(len) as usize;
        if !(TAG_LEN..=CHUNK_SIZE + TAG_LEN).contains(&len) {
            return Err(VaultError::Decryption(format!(
                "frame {} has invalid length {}",
                self.counter, len
            )));
        }
        let mut sealed = vec![0u8; len];
        read_exact_or(&mut self.inner, &mut sealed, "truncated ciphertext").await?;

        let nonce = nonce(&self.prefix, self.counter);
        let (plain, last) = match self.cipher.decrypt(&nonce, Payload { msg: &sealed, aad: &[0] }) {
            Ok(plain) => (plain, false),
            Err(_) => {
                let plain = self
                    .cipher
                    .decrypt(&nonce, Payload { msg: &sealed, aad: &[1] })
                    .map_err(|_| {
                        VaultError::Decryption(format!("authentication failed at frame {}", self.counter))
                    })?;
                (plain, true)
            }
        };
        self.counter += 1;

        if last {
            self.finished = true;
            let mut extra = [0u8; 1];
            if self.inner.read(&mut extra).await? != 0 {
                return Err(VaultError::Decryption("trailing data after final frame".into()));
            }
        }
        Ok(Some(plain))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

async fn read_exact_or<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(VaultError::Decryption(what.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}
