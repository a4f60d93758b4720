//! Message body encryption using XChaCha20-Poly1305.
//!
//! Every encryption draws a fresh random 24-byte nonce; the wire form is
//! `base64(nonce || ciphertext)`. Decryption failures are deliberately
//! uniform: a malformed wire form, a wrong key, and a tampered ciphertext all
//! surface as the same error.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Key, XChaCha20Poly1305, XNonce,
};
use thiserror::Error;
use tokio::sync::OnceCell;
use zeroize::Zeroize;

/// Key length fixed by XChaCha20-Poly1305.
pub const KEY_LEN: usize = 32;
/// Nonce length fixed by XChaCha20-Poly1305.
pub const NONCE_LEN: usize = 24;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("room key must be base64 of exactly {KEY_LEN} bytes")]
    InvalidKey,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
}

/// Authenticated-encryption engine for message bodies.
///
/// Stateless apart from a one-time readiness gate: the first caller runs a
/// round-trip probe of the AEAD backend, and every concurrent or later caller
/// awaits that same initialization instead of racing its own.
#[derive(Default)]
pub struct CryptoEngine {
    ready: OnceCell<()>,
}

impl CryptoEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent readiness gate. `encrypt` and `decrypt` call this lazily,
    /// so explicit initialization is optional.
    pub async fn initialize(&self) -> Result<(), CryptoError> {
        self.ready
            .get_or_try_init(|| async { self_check() })
            .await?;
        Ok(())
    }

    /// Encrypt `plaintext` under the base64-encoded room key. A fresh random
    /// nonce is drawn for every call, so two encryptions of identical input
    /// never produce the same wire form.
    pub async fn encrypt(&self, plaintext: &str, key_b64: &str) -> Result<String, CryptoError> {
        self.initialize().await?;
        let mut key = decode_key(key_b64)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed);
        key.zeroize();
        let sealed = sealed?;

        let mut wire = Vec::with_capacity(NONCE_LEN + sealed.len());
        wire.extend_from_slice(nonce.as_slice());
        wire.extend_from_slice(&sealed);
        Ok(STANDARD.encode(wire))
    }

    /// Decrypt a wire form under the base64-encoded room key. Pure function
    /// of its inputs: the same wire form and key always yield the same
    /// plaintext, or always fail the same way.
    pub async fn decrypt(&self, wire_b64: &str, key_b64: &str) -> Result<String, CryptoError> {
        self.initialize().await?;
        let wire = STANDARD
            .decode(wire_b64)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        if wire.len() < NONCE_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        let mut key = decode_key(key_b64).map_err(|_| CryptoError::DecryptionFailed)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();

        let (nonce, ciphertext) = wire.split_at(NONCE_LEN);
        let opened = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        String::from_utf8(opened).map_err(|_| CryptoError::DecryptionFailed)
    }
}

fn decode_key(key_b64: &str) -> Result<[u8; KEY_LEN], CryptoError> {
    let mut raw = STANDARD
        .decode(key_b64)
        .map_err(|_| CryptoError::InvalidKey)?;
    if raw.len() != KEY_LEN {
        raw.zeroize();
        return Err(CryptoError::InvalidKey);
    }
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&raw);
    raw.zeroize();
    Ok(key)
}

// Round-trip probe under a fixed key and nonce, run once before the engine
// handles real traffic.
fn self_check() -> Result<(), CryptoError> {
    let key = [0u8; KEY_LEN];
    let nonce = [0u8; NONCE_LEN];
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let probe: &[u8] = b"crypto-engine-probe";
    let sealed = cipher
        .encrypt(XNonce::from_slice(&nonce), probe)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    let opened = cipher
        .decrypt(XNonce::from_slice(&nonce), sealed.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)?;
    if opened != probe {
        return Err(CryptoError::DecryptionFailed);
    }
    Ok(())
}
