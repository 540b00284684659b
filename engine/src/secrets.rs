//! Encryption of generated application credentials
//!
//! Credentials are sealed with ChaCha20-Poly1305 under a key derived from the
//! caller's token, so only a holder of that token can read them back.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use secrecy::{ExposeSecret, SecretString};

use crate::errors::EngineError;
use crate::utils::sha256_digest;

const NONCE_LEN: usize = 12;

/// Domain separator mixed into the token before hashing
const KEY_CONTEXT: &[u8] = b"kubedeck/app-credential/v1:";

/// Derive a 256-bit key from a caller token
pub fn derive_key(token: &SecretString) -> [u8; 32] {
    let mut material = Vec::with_capacity(KEY_CONTEXT.len() + token.expose_secret().len());
    material.extend_from_slice(KEY_CONTEXT);
    material.extend_from_slice(token.expose_secret().as_bytes());
    sha256_digest(&material)
}

/// Encrypt a plaintext string. Returns base64-encoded nonce + ciphertext.
pub fn encrypt(plaintext: &str, key: &[u8; 32]) -> Result<String, EngineError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|_| EngineError::CryptoError("encryption failed".to_string()))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(&combined))
}

/// Decrypt a base64-encoded nonce + ciphertext
pub fn decrypt(encoded: &str, key: &[u8; 32]) -> Result<String, EngineError> {
    let combined = BASE64
        .decode(encoded.trim())
        .map_err(|_| EngineError::CryptoError("invalid encoding".to_string()))?;

    if combined.len() < NONCE_LEN {
        return Err(EngineError::CryptoError("ciphertext too short".to_string()));
    }

    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(key.into());

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| EngineError::CryptoError("decryption failed".to_string()))?;

    String::from_utf8(plaintext).map_err(|_| EngineError::CryptoError("invalid UTF-8".to_string()))
}
