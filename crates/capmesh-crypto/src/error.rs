//! Crypto error types

use thiserror::Error;

use capmesh_core::{NodeId, SecurityError};

/// Errors from AEAD and signature operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed: {0}")]
    EncryptFailed(String),

    #[error("Decryption failed")]
    DecryptFailed,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Signature verification failed")]
    SigInvalid,

    #[error("No trusted verify key registered for source {0}")]
    UnknownSigner(NodeId),

    #[error("No pre-shared payload key for peer {0}")]
    UnknownPeer(NodeId),
}

impl From<CryptoError> for SecurityError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::SigInvalid => SecurityError::SigInvalid,
            CryptoError::UnknownSigner(id) => SecurityError::UnknownSigner(id),
            _ => SecurityError::DecryptFailed,
        }
    }
}

/// Result type alias for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
