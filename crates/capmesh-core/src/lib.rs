//! # Capmesh Core
//!
//! Shared types for the capmesh knowledge-capsule mesh: node identities,
//! signed knowledge capsules, manifests, the packet model, and the error
//! taxonomy used across every crate in the workspace.
//!
//! The mesh moves immutable, Ed25519-signed Q/A records ("capsules")
//! between edge hubs over an intermittent, lossy link. This crate holds
//! only the vocabulary; behavior lives in the sibling crates:
//!
//! - `capmesh-crypto`: AEAD sealing and capsule signing
//! - `capmesh-codec`: wire frames and chunking
//! - `capmesh-store`: capsule persistence and TTL sweeping
//! - `capmesh-netsim`: the simulated degraded transport
//! - `capmesh-hub` / `capmesh-gossip`: hub roles and manifest sync

pub mod capsule;
pub mod error;
pub mod identity;
pub mod manifest;
pub mod packet;

pub use capsule::{
    KnowledgeCapsule, SIGNATURE_LEN, normalize_question, now_millis, question_hash, rfc3339_millis,
};
pub use error::{
    ApplicationError, CapsuleError, DeliveryError, DurabilityError, IdentityError, MeshError,
    MeshResult, SecurityError, TransportError,
};
pub use identity::{NODE_ID_LEN, NodeId};
pub use manifest::{Manifest, ManifestEntry};
pub use packet::{
    CapsulePayload, CapsuleRequestPayload, ManifestPayload, NONCE_LEN, Packet, PacketType,
    PayloadBody, Priority, QueryPayload, TAG_LEN, WIRE_VERSION,
};
