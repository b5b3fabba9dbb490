//! AES-256-GCM + PBKDF2 encryption for the one class of secret the core
//! persists at rest: webhook subscription secrets (§6.2 "core never
//! stores secrets in plaintext" applies here with equal force even though
//! spec.md doesn't name this module explicitly).
//!
//! Output format is `base64(salt(16) || nonce(12) || ciphertext)`. The
//! key is derived from a passphrase via PBKDF2-HMAC-SHA256 with 100,000
//! iterations, never cached across calls — `kiln-persistence` holds the
//! passphrase in memory only for the lifetime of the writer thread.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const PBKDF2_ROUNDS: u32 = 100_000;

/// How webhook-secret encryption is configured: on/off, and where the
/// passphrase comes from. Mirrors the teacher's `EncryptionConfig`
/// (inline passphrase or an environment-variable indirection).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub env_var: Option<String>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self { enabled: false, passphrase: None, env_var: Some("KILN_ENCRYPT_KEY".to_string()) }
    }
}

impl EncryptionConfig {
    /// Resolves the passphrase: an inline value takes precedence over the
    /// environment variable.
    pub fn resolve_passphrase(&self) -> anyhow::Result<String> {
        if let Some(p) = &self.passphrase {
            return Ok(p.clone());
        }
        if let Some(var) = &self.env_var {
            if let Ok(v) = std::env::var(var) {
                return Ok(v);
            }
        }
        anyhow::bail!("encryption is enabled but no passphrase or environment variable is set")
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypts `plaintext` under `passphrase`, returning a self-contained
/// base64 string (salt + nonce are stored alongside the ciphertext so
/// `decrypt` needs only the passphrase).
pub fn encrypt(plaintext: &str, passphrase: &str) -> anyhow::Result<String> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let key_bytes = derive_key(passphrase, &salt);
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| anyhow::anyhow!("encryption failed: {e}"))?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

/// Inverse of [`encrypt`].
pub fn decrypt(encoded: &str, passphrase: &str) -> anyhow::Result<String> {
    let raw = BASE64.decode(encoded).map_err(|e| anyhow::anyhow!("invalid base64: {e}"))?;
    if raw.len() < SALT_LEN + NONCE_LEN {
        anyhow::bail!("ciphertext too short to contain salt and nonce");
    }
    let (salt, rest) = raw.split_at(SALT_LEN);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let key_bytes = derive_key(passphrase, salt);
    let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| anyhow::anyhow!("decryption failed: wrong passphrase or corrupted data"))?;
    String::from_utf8(plaintext).map_err(|e| anyhow::anyhow!("decrypted data is not UTF-8: {e}"))
}
