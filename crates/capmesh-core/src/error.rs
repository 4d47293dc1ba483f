//! Error taxonomy for the capsule mesh
//!
//! Errors are grouped by how they propagate: transport and delivery errors
//! are recovered locally where possible, security errors are terminal per
//! packet and never retried, application errors surface to the caller, and
//! durability errors are fatal to the node.

use thiserror::Error;
use uuid::Uuid;

use crate::identity::NodeId;

/// Top-level error type for mesh operations
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("Application error: {0}")]
    Application(#[from] ApplicationError),

    #[error("Durability error: {0}")]
    Durability(#[from] DurabilityError),

    #[error("Capsule error: {0}")]
    Capsule(#[from] CapsuleError),
}

/// Errors related to node identity
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid identity length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Invalid identity format: {0}")]
    InvalidFormat(String),
}

/// Errors reported synchronously by the transport at admission
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Frame of {size} bytes exceeds chunk limit of {max} and auto-chunking is disabled")]
    Oversized { size: usize, max: usize },

    #[error("Destination {0} is not registered with the simulator")]
    UnknownDestination(NodeId),

    #[error("Simulator is shut down")]
    SimulatorDown,

    #[error("Frame rejected at admission: {0}")]
    MalformedFrame(String),
}

/// Errors on the asynchronous delivery path
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Chunk {chunk_index} of packet {packet_id} was lost")]
    LostChunk { packet_id: Uuid, chunk_index: u16 },

    #[error("Reassembly of packet {0} timed out")]
    ReassemblyTimeout(Uuid),

    #[error("Packet {0} exceeded the retry limit")]
    MaxRetriesExceeded(Uuid),
}

/// Terminal per-packet security failures; never retried
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SecurityError {
    #[error("Payload decryption failed")]
    DecryptFailed,

    #[error("Capsule signature verification failed")]
    SigInvalid,

    #[error("No trusted verify key registered for source {0}")]
    UnknownSigner(NodeId),
}

/// Errors surfaced to the querying caller
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("Answer generation failed: {0}")]
    AnswerFailed(String),

    #[error("Reply window elapsed while the request is still queued")]
    QueuedTimeout,

    #[error("Question rejected: {0}")]
    InvalidQuestion(String),
}

/// Fatal persistence failures
#[derive(Debug, Error)]
pub enum DurabilityError {
    #[error("Store I/O failure: {0}")]
    StoreIoFail(String),
}

impl From<std::io::Error> for DurabilityError {
    fn from(err: std::io::Error) -> Self {
        DurabilityError::StoreIoFail(err.to_string())
    }
}

/// Errors building or validating capsules and manifests
#[derive(Debug, Error)]
pub enum CapsuleError {
    #[error("Canonical serialization failed: {0}")]
    Canonical(String),

    #[error("Capsule id {0} already present with a different source")]
    IdCollision(Uuid),

    #[error("Invalid signature length: expected {expected}, got {actual}")]
    InvalidSignatureLength { expected: usize, actual: usize },
}

/// Result type alias for mesh operations
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Oversized {
            size: 2048,
            max: 800,
        };
        let msg = err.to_string();
        assert!(msg.contains("2048"));
        assert!(msg.contains("800"));

        let dst = NodeId::from_name("ghost");
        assert!(
            TransportError::UnknownDestination(dst)
                .to_string()
                .contains("not registered")
        );
    }

    #[test]
    fn test_security_error_display() {
        assert!(
            SecurityError::DecryptFailed
                .to_string()
                .contains("decryption failed")
        );
        assert!(
            SecurityError::SigInvalid
                .to_string()
                .contains("signature verification")
        );
    }

    #[test]
    fn test_error_conversions() {
        let err: MeshError = SecurityError::SigInvalid.into();
        assert!(matches!(err, MeshError::Security(_)));

        let err: MeshError = TransportError::SimulatorDown.into();
        assert!(matches!(err, MeshError::Transport(_)));

        let err: MeshError = ApplicationError::QueuedTimeout.into();
        assert!(matches!(err, MeshError::Application(_)));
    }

    #[test]
    fn test_io_error_becomes_durability() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only fs");
        let err = DurabilityError::from(io);
        assert!(err.to_string().contains("read-only fs"));
    }
}
