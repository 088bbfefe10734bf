//! Integration config vault.
//!
//! Maps integration name -> credential map, persisted as one
//! AES-256-GCM blob. The key derives from a configured passphrase via
//! SHA-256; each write uses a fresh random nonce, stored alongside the
//! ciphertext base64-encoded. The engine consumes this read-only when
//! building parameter maps for scripts and plugins that name an
//! integration.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

const NONCE_LEN: usize = 12;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("integration '{0}' not found")]
    NotFound(String),

    #[error("vault file is corrupt: {0}")]
    Corrupt(String),

    /// Wrong key or tampered ciphertext.
    #[error("vault decryption failed; check the configured key")]
    Decrypt,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Credential map for one integration.
pub type Credentials = Map<String, Value>;

/// Encrypted at-rest key-value store of integration credentials.
pub struct Vault {
    path: PathBuf,
    cipher: Aes256Gcm,
    entries: Mutex<BTreeMap<String, Credentials>>,
}

impl Vault {
    /// Open the vault, decrypting the file if it exists.
    pub fn open(path: impl Into<PathBuf>, passphrase: &str) -> Result<Self> {
        let path = path.into();
        let key = derive_key(passphrase);
        let cipher = Aes256Gcm::new(&key);

        let entries = if path.exists() {
            let blob = std::fs::read_to_string(&path)?;
            decrypt_entries(&cipher, blob.trim())?
        } else {
            BTreeMap::new()
        };

        info!(
            integrations = entries.len(),
            path = %path.display(),
            "vault opened"
        );
        Ok(Self {
            path,
            cipher,
            entries: Mutex::new(entries),
        })
    }

    /// Names of stored integrations.
    pub fn list(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn get(&self, integration: &str) -> Result<Credentials> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(integration)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(integration.to_string()))
    }

    pub fn set(&self, integration: &str, credentials: Credentials) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(integration.to_string(), credentials);
        self.persist(&entries)?;
        debug!(integration, "vault entry written");
        Ok(())
    }

    /// Idempotent.
    pub fn delete(&self, integration: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.remove(integration).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    /// Check an integration exists and its credential map is non-empty.
    pub fn validate(&self, integration: &str) -> Result<()> {
        let credentials = self.get(integration)?;
        if credentials.is_empty() {
            return Err(VaultError::Corrupt(format!(
                "integration '{}' has an empty credential map",
                integration
            )));
        }
        Ok(())
    }

    fn persist(&self, entries: &BTreeMap<String, Credentials>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let plaintext = serde_json::to_vec(entries)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| VaultError::Decrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        // Temp sibling + rename keeps the previous generation on crash
        let tmp = self.path.with_extension("enc.tmp");
        std::fs::write(&tmp, BASE64.encode(blob))?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn derive_key(passphrase: &str) -> Key<Aes256Gcm> {
    let digest = Sha256::digest(passphrase.as_bytes());
    Key::<Aes256Gcm>::clone_from_slice(&digest)
}

fn decrypt_entries(
    cipher: &Aes256Gcm,
    blob: &str,
) -> Result<BTreeMap<String, Credentials>> {
    if blob.is_empty() {
        return Ok(BTreeMap::new());
    }
    let raw = BASE64
        .decode(blob)
        .map_err(|e| VaultError::Corrupt(format!("invalid base64: {}", e)))?;
    if raw.len() < NONCE_LEN {
        return Err(VaultError::Corrupt("blob shorter than nonce".to_string()));
    }
    let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| VaultError::Decrypt)?;
    Ok(serde_json::from_slice(&plaintext)?)
}
