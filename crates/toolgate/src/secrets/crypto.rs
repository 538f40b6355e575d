use std::fs;
use std::io::Write;
use std::path::Path;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::Context;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Associated data binding ciphertexts to this system.
const AAD: &[u8] = b"toolgate.secret.v1";

const ALGORITHM: &str = "aes-256-gcm";
const NONCE_LEN: usize = 12;

/// One encrypted value as persisted inside a secret bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedBlob {
    pub nonce: String,
    pub ciphertext: String,
    pub algorithm: String,
    /// Unix timestamp (seconds).
    pub encrypted_at: i64,
}

/// AES-256-GCM wrapper around the persisted master key.
///
/// Losing the key file makes existing bundles undecryptable; callers treat
/// that as a degraded state, never a crash.
pub struct SecretCipher {
    cipher: Aes256Gcm,
}

impl SecretCipher {
    pub fn from_key_bytes(key: &[u8]) -> anyhow::Result<Self> {
        if key.len() != 32 {
            anyhow::bail!("master key must be 32 bytes, got {}", key.len());
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Generate an ephemeral key. Bundles encrypted with it do not survive
    /// a restart; used only in memory-only storage mode.
    pub fn ephemeral() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Read the master key at `path`, generating it (mode 0600) on first run.
    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed reading master key {}", path.display()))?;
            let bytes = B64
                .decode(raw.trim())
                .with_context(|| format!("master key {} is not valid base64", path.display()))?;
            return Self::from_key_bytes(&bytes);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let key = Aes256Gcm::generate_key(&mut OsRng);
        let encoded = B64.encode(key.as_slice());
        write_restricted(path, encoded.as_bytes())
            .with_context(|| format!("failed writing master key {}", path.display()))?;
        tracing::info!(path = %path.display(), "generated new secret master key");
        Self::from_key_bytes(key.as_slice())
    }

    pub fn encrypt(&self, plaintext: &str) -> anyhow::Result<EncryptedBlob> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext.as_bytes(),
                    aad: AAD,
                },
            )
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;
        Ok(EncryptedBlob {
            nonce: B64.encode(nonce.as_slice()),
            ciphertext: B64.encode(&ciphertext),
            algorithm: ALGORITHM.to_string(),
            encrypted_at: time::OffsetDateTime::now_utc().unix_timestamp(),
        })
    }

    pub fn decrypt(&self, blob: &EncryptedBlob) -> anyhow::Result<String> {
        if blob.algorithm != ALGORITHM {
            anyhow::bail!("unsupported algorithm: {}", blob.algorithm);
        }
        let nonce_bytes = B64
            .decode(&blob.nonce)
            .context("blob nonce is not valid base64")?;
        if nonce_bytes.len() != NONCE_LEN {
            anyhow::bail!("nonce must be {NONCE_LEN} bytes, got {}", nonce_bytes.len());
        }
        let ciphertext = B64
            .decode(&blob.ciphertext)
            .context("blob ciphertext is not valid base64")?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &ciphertext,
                    aad: AAD,
                },
            )
            .map_err(|_| anyhow::anyhow!("decryption failed (wrong key or tampered data)"))?;
        String::from_utf8(plaintext).context("decrypted value is not UTF-8")
    }
}

/// Write a file at mode 0600, truncating any existing content.
pub fn write_restricted(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    file.flush()?;
    Ok(())
}
