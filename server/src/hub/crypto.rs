//! # Frame Encryption
//!
//! Every WebSocket frame between controller and agent is a base64 text
//! frame wrapping `nonce ‖ AES-256-GCM(plaintext)`. The key is derived
//! deterministically from the node's agent secret: its UTF-8 bytes,
//! zero-padded or truncated to 32 bytes. Both sides derive the same key,
//! so a node is authenticated by being able to speak at all.

use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::error::{FabricError, Result};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Pads or truncates the secret's UTF-8 bytes to a 32-byte key.
pub fn derive_key(secret: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    let bytes = secret.as_bytes();
    let n = bytes.len().min(KEY_LEN);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}

/// AEAD sealer/opener bound to one node's derived key.
pub struct FrameCipher {
    cipher: Aes256Gcm,
}

impl FrameCipher {
    pub fn new(secret: &str) -> Self {
        let key = derive_key(secret);
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
        }
    }

    /// Encrypts with a fresh random nonce and base64-encodes the result.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| FabricError::Crypto("encrypt failed".into()))?;

        let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(frame))
    }

    /// Decodes a frame, splits the nonce prefix, and decrypts. Tampered
    /// or foreign-key ciphertexts are rejected by the GCM tag.
    pub fn open(&self, frame: &str) -> Result<Vec<u8>> {
        let raw = BASE64
            .decode(frame.trim())
            .map_err(|e| FabricError::Crypto(format!("bad base64: {e}")))?;
        if raw.len() < NONCE_LEN {
            return Err(FabricError::Crypto("frame shorter than nonce".into()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| FabricError::Crypto("decrypt failed".into()))
    }
}
