//! Per-peer payload key lookup
//!
//! Key establishment is modeled as a pre-shared 256-bit key per
//! sender-receiver pair. [`PeerKeyProvider`] is the seam a future ephemeral
//! key agreement would slot into; the codec and hub logic only ever ask for
//! "the key for this peer".

use dashmap::DashMap;

use capmesh_core::NodeId;

use crate::aead::PayloadKey;
use crate::error::CryptoError;

/// Resolves the AEAD key to use with a given peer
pub trait PeerKeyProvider: Send + Sync {
    /// The payload key shared with `peer`
    fn key_for(&self, peer: &NodeId) -> Result<PayloadKey, CryptoError>;
}

/// Static pre-shared keyring
///
/// Symmetric by construction: both ends of a pair must be provisioned with
/// the same key out of band.
#[derive(Debug, Default)]
pub struct KeyRing {
    keys: DashMap<NodeId, PayloadKey>,
}

impl KeyRing {
    /// Create an empty keyring
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision the key shared with a peer
    pub fn provision(&self, peer: NodeId, key: PayloadKey) {
        self.keys.insert(peer, key);
    }

    /// Generate and provision a fresh key, returning a copy for the peer
    pub fn provision_fresh(&self, peer: NodeId) -> PayloadKey {
        let key = PayloadKey::generate();
        self.keys.insert(peer, key.clone());
        key
    }

    /// Number of provisioned peers
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no peers are provisioned
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl PeerKeyProvider for KeyRing {
    fn key_for(&self, peer: &NodeId) -> Result<PayloadKey, CryptoError> {
        self.keys
            .get(peer)
            .map(|k| k.clone())
            .ok_or(CryptoError::UnknownPeer(*peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_and_lookup() {
        let ring = KeyRing::new();
        let peer = NodeId::from_name("main");
        let key = PayloadKey::generate();
        ring.provision(peer, key.clone());

        assert_eq!(ring.key_for(&peer).unwrap(), key);
    }

    #[test]
    fn test_unknown_peer() {
        let ring = KeyRing::new();
        let peer = NodeId::from_name("stranger");
        assert_eq!(ring.key_for(&peer), Err(CryptoError::UnknownPeer(peer)));
    }

    #[test]
    fn test_provision_fresh_matches_lookup() {
        let ring = KeyRing::new();
        let peer = NodeId::from_name("mini-1");
        let issued = ring.provision_fresh(peer);
        assert_eq!(ring.key_for(&peer).unwrap(), issued);
        assert_eq!(ring.len(), 1);
    }
}
