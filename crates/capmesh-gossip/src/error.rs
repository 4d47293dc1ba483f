//! Gossip error types

use thiserror::Error;

use capmesh_core::{NodeId, TransportError};
use capmesh_crypto::CryptoError;

/// Errors in manifest handling and selective sync
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("Manifest from {0} failed signature verification")]
    ManifestSigInvalid(NodeId),

    #[error("Manifest from untrusted source {0}")]
    UntrustedSource(NodeId),

    #[error("Manifest serialization failed: {0}")]
    Serialization(String),

    #[error("Wire error: {0}")]
    Wire(#[from] capmesh_codec::WireError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result type alias for gossip operations
pub type GossipResult<T> = Result<T, GossipError>;
