//! At-rest protection for donated key material.
//!
//! Keys are stored as base64(nonce || ciphertext || tag) under AES-256-GCM
//! and deduplicated by a SHA-256 hex digest of the plaintext.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// AES-256-GCM nonce size (96 bits).
const NONCE_SIZE: usize = 12;

/// GCM authentication tag size.
const TAG_SIZE: usize = 16;

/// Encrypts and decrypts API keys with a key derived from a passphrase.
pub struct KeyVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for KeyVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVault").finish_non_exhaustive()
    }
}

impl KeyVault {
    /// Build a vault from an arbitrary-length passphrase (SHA-256 derived).
    pub fn new(passphrase: &str) -> Self {
        let derived: [u8; 32] = Sha256::digest(passphrase.as_bytes()).into();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&derived));
        Self { cipher }
    }

    /// Build a vault with a random key. Ciphertexts do not survive a restart.
    pub fn ephemeral() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes));
        Self { cipher }
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

        let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        output.extend_from_slice(&nonce_bytes);
        output.extend_from_slice(&ciphertext);
        Ok(general_purpose::STANDARD.encode(output))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<SecretString> {
        let bytes = general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::Crypto(format!("Invalid ciphertext encoding: {}", e)))?;

        if bytes.len() < NONCE_SIZE + TAG_SIZE {
            return Err(Error::Crypto("Ciphertext too short".to_string()));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| Error::Crypto("Decryption failed: wrong key or tampered data".to_string()))?;

        String::from_utf8(plaintext)
            .map(SecretString::from)
            .map_err(|e| Error::Crypto(format!("Decrypted key is not UTF-8: {}", e)))
    }
}

/// One-way hash used to detect the same key being donated twice.
pub fn key_hash(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.trim().as_bytes()))
}

/// Short display hint for a secret: `sk-p...wxyz`.
pub fn key_hint(secret: &SecretString) -> String {
    let raw = secret.expose_secret();
    let chars: Vec<char> = raw.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}
