//! Store error types

use thiserror::Error;
use uuid::Uuid;

use capmesh_core::{DurabilityError, NodeId};

/// Errors from capsule store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The capsule's signature did not verify; never stored, never retried.
    #[error("Capsule {0} rejected: signature invalid")]
    SigInvalid(Uuid),

    /// The capsule claims a source with no registered verify key.
    #[error("Capsule {capsule_id} rejected: unknown signer {source_id}")]
    UnknownSigner { capsule_id: Uuid, source_id: NodeId },

    /// Same capsule id already stored under a different source.
    #[error("Capsule id {0} collides across sources")]
    IdCollision(Uuid),

    /// A write could not be made durable; fatal for the node.
    #[error("Store I/O failure: {0}")]
    Io(#[from] DurabilityError),

    #[error("Log row serialization failed: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(DurabilityError::from(err))
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
