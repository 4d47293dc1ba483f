//! Capsule integrity via Ed25519
//!
//! Main hubs sign the canonical serialization of every capsule and manifest
//! they publish. Receivers verify against a [`TrustStore`] of registered
//! source keys; anything that fails verification is rejected before it can
//! reach a store.

use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;

use capmesh_core::{NodeId, SIGNATURE_LEN};

use crate::error::CryptoError;

/// Signing half of a hub's identity
///
/// Owned only by the hub whose `source_id` it carries.
pub struct NodeSigner {
    source_id: NodeId,
    signing_key: SigningKey,
}

impl NodeSigner {
    /// Generate a fresh signing identity for a hub
    pub fn generate(source_id: NodeId) -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self {
            source_id,
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    /// Reconstruct from a stored 32-byte secret
    pub fn from_secret_bytes(source_id: NodeId, secret: &[u8; 32]) -> Self {
        Self {
            source_id,
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// The identity this key signs for
    pub fn source_id(&self) -> NodeId {
        self.source_id
    }

    /// The public verify key to register with peers
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign canonical bytes, returning the detached 64-byte signature
    pub fn sign(&self, canonical: &[u8]) -> Vec<u8> {
        self.signing_key.sign(canonical).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for NodeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeSigner({})", self.source_id)
    }
}

/// Registered verify keys, by source identity
///
/// Shared read-mostly across every component that accepts capsules.
#[derive(Debug, Default)]
pub struct TrustStore {
    keys: DashMap<NodeId, VerifyingKey>,
}

impl TrustStore {
    /// Create an empty trust store
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source's verify key
    pub fn register(&self, source_id: NodeId, key: VerifyingKey) {
        self.keys.insert(source_id, key);
    }

    /// Register a signer's own public half (test and bootstrap convenience)
    pub fn register_signer(&self, signer: &NodeSigner) {
        self.register(signer.source_id(), signer.verifying_key());
    }

    /// Whether a source is trusted
    pub fn is_trusted(&self, source_id: &NodeId) -> bool {
        self.keys.contains_key(source_id)
    }

    /// Verify a detached signature over canonical bytes
    ///
    /// `UnknownSigner` when the source has no registered key, `SigInvalid`
    /// on length or verification failure.
    pub fn verify(
        &self,
        source_id: &NodeId,
        canonical: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let key = self
            .keys
            .get(source_id)
            .ok_or(CryptoError::UnknownSigner(*source_id))?;

        let signature: [u8; SIGNATURE_LEN] = signature
            .try_into()
            .map_err(|_| CryptoError::SigInvalid)?;

        key.verify(canonical, &Signature::from_bytes(&signature))
            .map_err(|_| CryptoError::SigInvalid)
    }
}
