//! Payload confidentiality via AES-256-GCM
//!
//! Every frame payload is sealed under the pre-shared key for its
//! sender-receiver pair with a fresh random 96-bit nonce. The nonce rides
//! in the frame header; the 16-byte tag trails the ciphertext.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

use capmesh_core::{NONCE_LEN, TAG_LEN};

use crate::error::CryptoError;

/// Size of payload keys (256 bits).
pub const PAYLOAD_KEY_LEN: usize = 32;

/// A pre-shared symmetric key for one sender-receiver pair
#[derive(Clone, PartialEq, Eq)]
pub struct PayloadKey([u8; PAYLOAD_KEY_LEN]);

impl PayloadKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; PAYLOAD_KEY_LEN];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    /// Construct from raw bytes
    pub fn from_bytes(bytes: [u8; PAYLOAD_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse from lowercase hex (64 characters)
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(encoded)
            .map_err(|e| CryptoError::InvalidKey(format!("invalid hex: {e}")))?;
        let bytes: [u8; PAYLOAD_KEY_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            CryptoError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Render as lowercase hex for key files
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw key bytes (secret material; handle with care)
    pub fn as_bytes(&self) -> &[u8; PAYLOAD_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for PayloadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "PayloadKey(..)")
    }
}

/// A sealed payload: nonce plus ciphertext-with-tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Random per-frame nonce
    pub nonce: [u8; NONCE_LEN],
    /// AEAD output, 16-byte tag appended
    pub ciphertext: Vec<u8>,
}

/// Seal plaintext under a payload key with a fresh random nonce
pub fn seal(key: &PayloadKey, plaintext: &[u8]) -> Result<Sealed, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CryptoError::EncryptFailed(e.to_string()))?;

    Ok(Sealed {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Open a sealed payload
///
/// Fails on a wrong key, a tampered ciphertext, or a truncated buffer. The
/// caller drops the packet and counts a decrypt failure; transport-level
/// feedback has already happened, so no NAK is involved.
pub fn open(key: &PayloadKey, sealed: &Sealed) -> Result<Vec<u8>, CryptoError> {
    if sealed.ciphertext.len() < TAG_LEN {
        return Err(CryptoError::DecryptFailed);
    }

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let nonce = Nonce::from_slice(&sealed.nonce);

    cipher
        .decrypt(nonce, sealed.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptFailed)
}
