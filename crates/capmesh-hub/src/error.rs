//! Hub error types

use thiserror::Error;

use capmesh_codec::WireError;
use capmesh_core::{ApplicationError, DurabilityError, TransportError};
use capmesh_store::StoreError;

/// Errors from hub operations
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    #[error("Application error: {0}")]
    Application(#[from] ApplicationError),

    #[error("Durability error: {0}")]
    Durability(#[from] DurabilityError),

    #[error("Capsule error: {0}")]
    Capsule(#[from] capmesh_core::CapsuleError),

    #[error("Gossip error: {0}")]
    Gossip(#[from] capmesh_gossip::GossipError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] capmesh_crypto::CryptoError),
}

/// Result type alias for hub operations
pub type HubResult<T> = Result<T, HubError>;
