//! Streaming public-key encryption for backup payloads.
//!
//! The backup host holds only the recipient's X25519 public key. Each payload gets a fresh
//! ephemeral key pair; the stream key is derived with HKDF-SHA256 from the DH shared secret
//! and the payload is sealed in XChaCha20-Poly1305 frames (see [`stream`]). Without the
//! private key the producing process cannot read its own output.
//!
//! Key files are a single line of standard base64 over the 32 raw key bytes.

pub mod stream;

pub use stream::{OpenReader, SealSummary, SealWriter};

use crate::{Result, VaultError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use x25519_dalek::{PublicKey, StaticSecret};

/// Length of the key fingerprint embedded in every sealed payload.
pub const KEY_ID_LEN: usize = 8;

const KEY_REF_PREFIX: &str = "x25519:";

fn key_id(public: &PublicKey) -> [u8; KEY_ID_LEN] {
    let digest = Sha256::digest(public.as_bytes());
    let mut id = [0u8; KEY_ID_LEN];
    id.copy_from_slice(&digest[..KEY_ID_LEN]);
    id
}

fn key_ref_for(id: &[u8; KEY_ID_LEN]) -> String {
    format!("{}{}", KEY_REF_PREFIX, crate::store::hex(id))
}

/// Parse an opaque key reference back into its fingerprint.
pub fn parse_key_ref(key_ref: &str) -> Result<[u8; KEY_ID_LEN]> {
    let hex = key_ref
        .strip_prefix(KEY_REF_PREFIX)
        .filter(|h| h.len() == KEY_ID_LEN * 2)
        .ok_or_else(|| VaultError::Decryption(format!("malformed key reference: {:?}", key_ref)))?;
    let mut id = [0u8; KEY_ID_LEN];
    for (i, byte) in id.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| {
            VaultError::Decryption(format!("malformed key reference: {:?}", key_ref))
        })?;
    }
    Ok(id)
}

/// Public half: seals payloads, can never open them.
#[derive(Clone)]
pub struct Encryptor {
    public: PublicKey,
    key_id: [u8; KEY_ID_LEN],
}

impl Encryptor {
    pub fn from_public_bytes(bytes: [u8; 32]) -> Self {
        let public = PublicKey::from(bytes);
        Self {
            key_id: key_id(&public),
            public,
        }
    }

    /// Opaque reference recorded on artifacts. Never the key material.
    pub fn key_ref(&self) -> String {
        key_ref_for(&self.key_id)
    }

    pub(crate) fn public(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn key_id(&self) -> [u8; KEY_ID_LEN] {
        self.key_id
    }
}

impl fmt::Debug for Encryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encryptor").field("key_ref", &self.key_ref()).finish()
    }
}

/// Private half, available only to verify and restore contexts.
#[derive(Clone)]
pub struct Decryptor {
    secret: StaticSecret,
    public: PublicKey,
    key_id: [u8; KEY_ID_LEN],
}

impl Decryptor {
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self {
            key_id: key_id(&public),
            secret,
            public,
        }
    }

    pub fn key_ref(&self) -> String {
        key_ref_for(&self.key_id)
    }

    /// Fail early when an artifact was sealed for a different key.
    pub fn check_key_ref(&self, key_ref: &str) -> Result<()> {
        if parse_key_ref(key_ref)? != self.key_id {
            return Err(VaultError::Decryption(format!(
                "artifact sealed for {} but loaded key is {}",
                key_ref,
                self.key_ref()
            )));
        }
        Ok(())
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub(crate) fn public(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn key_id(&self) -> [u8; KEY_ID_LEN] {
        self.key_id
    }
}

impl fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decryptor").field("key_ref", &self.key_ref()).finish_non_exhaustive()
    }
}

/// A freshly generated recipient key pair.
pub struct KeyPair {
    secret: StaticSecret,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            secret: StaticSecret::random_from_rng(rand::rngs::OsRng),
        }
    }

    pub fn encryptor(&self) -> Encryptor {
        Encryptor::from_public_bytes(PublicKey::from(&self.secret).to_bytes())
    }

    pub fn decryptor(&self) -> Decryptor {
        Decryptor::from_secret_bytes(self.secret.to_bytes())
    }

    /// Write `backup.pub` and `backup.key` into `dir`. Returns both paths.
    pub fn write_to(&self, dir: &Path) -> Result<(PathBuf, PathBuf)> {
        std::fs::create_dir_all(dir)?;
        let public_path = dir.join("backup.pub");
        let secret_path = dir.join("backup.key");
        std::fs::write(
            &public_path,
            format!("{}\n", BASE64.encode(PublicKey::from(&self.secret).as_bytes())),
        )?;
        std::fs::write(&secret_path, format!("{}\n", BASE64.encode(self.secret.to_bytes())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&secret_path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok((public_path, secret_path))
    }
}

fn read_key_file(path: &Path) -> Result<[u8; 32]> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        VaultError::Configuration(format!("cannot read key file {}: {}", path.display(), e))
    })?;
    let bytes = BASE64.decode(raw.trim()).map_err(|_| {
        VaultError::Configuration(format!("key file {} is not base64", path.display()))
    })?;
    bytes.try_into().map_err(|_| {
        VaultError::Configuration(format!("key file {} must hold 32 bytes", path.display()))
    })
}

pub fn load_encryptor(path: &Path) -> Result<Encryptor> {
    Ok(Encryptor::from_public_bytes(read_key_file(path)?))
}

pub fn load_decryptor(path: &Path) -> Result<Decryptor> {
    Ok(Decryptor::from_secret_bytes(read_key_file(path)?))
}

/// Open a sealed stream into `writer`. Returns plaintext bytes written.
pub async fn decrypt_stream<R, W>(decryptor: &Decryptor, reader: R, mut writer: W) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let mut opener = OpenReader::new(decryptor, reader).await?;
    let mut total = 0u64;
    while let Some(chunk) = opener.next_chunk().await? {
        writer.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    writer.flush().await?;
    Ok(total)
}

pub async fn encrypt_bytes(encryptor: &Encryptor, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut sealer = SealWriter::new(encryptor, Vec::new()).await?;
    sealer.write(plaintext).await?;
    let (out, _) = sealer.finish_into_inner().await?;
    Ok(out)
}

pub async fn decrypt_bytes(decryptor: &Decryptor, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    decrypt_stream(decryptor, ciphertext, &mut out).await?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip() {
        let keys = KeyPair::generate();
        let sealed = encrypt_bytes(&keys.encryptor(), b"patient records").await.unwrap();
        assert!(!sealed.windows(15).any(|w| w == b"patient records"));
        let opened = decrypt_bytes(&keys.decryptor(), &sealed).await.unwrap();
        assert_eq!(opened, b"patient records");
    }

    #[tokio::test]
    async fn test_wrong_key_is_decryption_error() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let sealed = encrypt_bytes(&a.encryptor(), b"x").await.unwrap();
        let err = decrypt_bytes(&b.decryptor(), &sealed).await.unwrap_err();
        assert!(matches!(err, VaultError::Decryption(_)));
    }

    #[test]
    fn test_key_refs_match_between_halves() {
        let keys = KeyPair::generate();
        let enc = keys.encryptor();
        let dec = keys.decryptor();
        assert_eq!(enc.key_ref(), dec.key_ref());
        assert!(enc.key_ref().starts_with("x25519:"));
        dec.check_key_ref(&enc.key_ref()).unwrap();
        assert!(matches!(dec.check_key_ref("rsa:1234"), Err(VaultError::Decryption(_))));
        assert!(matches!(
            dec.check_key_ref(&KeyPair::generate().encryptor().key_ref()),
            Err(VaultError::Decryption(_))
        ));
    }

    #[test]
    fn test_key_files_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let keys = KeyPair::generate();
        let (public, secret) = keys.write_to(dir.path()).unwrap();

        assert_eq!(load_encryptor(&public).unwrap().key_ref(), keys.encryptor().key_ref());
        assert_eq!(load_decryptor(&secret).unwrap().key_ref(), keys.decryptor().key_ref());
    }

    #[test]
    fn test_bad_key_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pub");
        std::fs::write(&path, "not base64!!").unwrap();
        assert!(matches!(load_encryptor(&path), Err(VaultError::Configuration(_))));
        assert!(matches!(
            load_encryptor(&dir.path().join("missing.pub")),
            Err(VaultError::Configuration(_))
        ));
    }
}
