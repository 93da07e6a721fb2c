//! At-rest encryption for mailbox credentials.
//!
//! Stored values have the shape `hex(nonce):hex(ciphertext)`. Values without a
//! separator predate encryption and are returned unchanged.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use thiserror::Error;
use tracing::warn;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const SEPARATOR: char = ':';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("vault configuration error: {0}")]
    Configuration(String),
    #[error("credential could not be decrypted: {0}")]
    Decryption(String),
    #[error("credential could not be encrypted: {0}")]
    Encryption(String),
}

#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
    legacy_warned: Arc<AtomicBool>,
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Build a vault from a 64-character hex key.
    pub fn from_hex_key(key_hex: &str) -> Result<Self, VaultError> {
        let key_hex = key_hex.trim();
        if key_hex.is_empty() {
            return Err(VaultError::Configuration(
                "vault key is not configured".to_string(),
            ));
        }
        let key_bytes = hex::decode(key_hex)
            .map_err(|err| VaultError::Configuration(format!("vault key is not hex: {err}")))?;
        if key_bytes.len() != KEY_SIZE {
            return Err(VaultError::Configuration(format!(
                "vault key must be {KEY_SIZE} bytes, got {}",
                key_bytes.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(&key_bytes)
            .map_err(|err| VaultError::Configuration(err.to_string()))?;
        Ok(Self {
            cipher,
            legacy_warned: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn encrypt(&self, secret: &str) -> Result<String, VaultError> {
        if secret.is_empty() {
            return Err(VaultError::Encryption("refusing to encrypt an empty secret".into()));
        }
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, secret.as_bytes())
            .map_err(|err| VaultError::Encryption(err.to_string()))?;
        Ok(format!(
            "{}{SEPARATOR}{}",
            hex::encode(nonce),
            hex::encode(ciphertext)
        ))
    }

    pub fn decrypt(&self, stored: &str) -> Result<String, VaultError> {
        if !stored.contains(SEPARATOR) {
            self.note_legacy_value();
            return Ok(stored.to_string());
        }

        let segments: Vec<&str> = stored.split(SEPARATOR).collect();
        let [nonce_hex, ciphertext_hex] = segments.as_slice() else {
            return Err(VaultError::Decryption(format!(
                "expected 2 segments, found {}",
                segments.len()
            )));
        };

        let nonce_bytes = hex::decode(nonce_hex)
            .map_err(|err| VaultError::Decryption(format!("nonce is not hex: {err}")))?;
        if nonce_bytes.len() != NONCE_SIZE {
            return Err(VaultError::Decryption(format!(
                "nonce must be {NONCE_SIZE} bytes, got {}",
                nonce_bytes.len()
            )));
        }
        let ciphertext = hex::decode(ciphertext_hex)
            .map_err(|err| VaultError::Decryption(format!("ciphertext is not hex: {err}")))?;

        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| VaultError::Decryption("authentication failed".into()))?;
        String::from_utf8(plain).map_err(|err| VaultError::Decryption(err.to_string()))
    }

    /// Returns true only for the first legacy value seen by this vault.
    fn note_legacy_value(&self) -> bool {
        let first = !self.legacy_warned.swap(true, Ordering::Relaxed);
        if first {
            warn!("found unencrypted credential value; it will be encrypted on next write");
        }
        first
    }
}
