//! Credential sealing for secrets at rest.
//!
//! The core never chooses a cipher: everything that must persist a secret
//! (agent credentials) goes through an injected [`Sealer`]. The default
//! implementation is ChaCha20-Poly1305 with a key derived from
//! `DEVYARD_SEALER_SECRET`.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{OrchestratorError, Result};

const NONCE_LEN: usize = 12;

pub trait Sealer: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// ChaCha20-Poly1305 sealer; output layout is `nonce || ciphertext`.
pub struct ChaChaSealer {
    cipher: ChaCha20Poly1305,
}

impl ChaChaSealer {
    pub fn from_secret(secret: &str) -> Self {
        let key_bytes = Sha256::digest(secret.as_bytes());
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        Self { cipher }
    }

    /// Key from `DEVYARD_SEALER_SECRET`, or an ephemeral random key when
    /// unset; sealed blobs then do not survive a restart, which is fine
    /// for development and loudly wrong for production.
    pub fn from_env() -> Self {
        match std::env::var("DEVYARD_SEALER_SECRET") {
            Ok(secret) if !secret.trim().is_empty() => Self::from_secret(&secret),
            _ => {
                tracing::warn!(
                    "DEVYARD_SEALER_SECRET not set; using an ephemeral sealing key"
                );
                let mut secret = [0u8; 32];
                OsRng.fill_bytes(&mut secret);
                Self::from_secret(&hex::encode(secret))
            }
        }
    }
}

impl Sealer for ChaChaSealer {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| OrchestratorError::Storage("sealing failed".into()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() <= NONCE_LEN {
            return Err(OrchestratorError::Storage("sealed blob too short".into()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| OrchestratorError::Storage("unsealing failed".into()))
    }
}

/// Seal to a base64 string suitable for a TEXT column.
pub fn seal_to_string(sealer: &dyn Sealer, plaintext: &str) -> Result<String> {
    use base64::Engine;
    let sealed = sealer.seal(plaintext.as_bytes())?;
    Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
}

pub fn open_from_string(sealer: &dyn Sealer, blob: &str) -> Result<String> {
    use base64::Engine;
    let sealed = base64::engine::general_purpose::STANDARD
        .decode(blob)
        .map_err(|err| OrchestratorError::Storage(format!("invalid sealed blob: {err}")))?;
    let plaintext = sealer.open(&sealed)?;
    String::from_utf8(plaintext)
        .map_err(|err| OrchestratorError::Storage(format!("sealed blob not UTF-8: {err}")))
}
