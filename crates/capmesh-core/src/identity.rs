//! Node identity for mesh participants
//!
//! Every hub is addressed by a fixed-width [`NodeId`], a 16-byte value
//! derived from the node's registered name. The wire format carries these
//! raw bytes in the frame header, so the width is part of the protocol.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::IdentityError;

/// Width of a node identity in bytes (fixed by the frame header layout).
pub const NODE_ID_LEN: usize = 16;

/// Fixed-width identity of a mesh node
///
/// Derived deterministically from the node's name, so two processes that
/// agree on names agree on addresses without any exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Derive an identity from a human-readable node name
    pub fn from_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&digest[..NODE_ID_LEN]);
        Self(id)
    }

    /// Construct from raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != NODE_ID_LEN {
            return Err(IdentityError::InvalidLength {
                expected: NODE_ID_LEN,
                actual: bytes.len(),
            });
        }
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// Get the raw identity bytes
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Short display form for logging (first 4 bytes as hex)
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_id())
    }
}

impl FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::InvalidFormat(s.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = NodeId::from_name("mini-hub-1");
        let b = NodeId::from_name("mini-hub-1");
        assert_eq!(a, b);
        assert_ne!(a, NodeId::from_name("mini-hub-2"));
    }

    #[test]
    fn test_bytes_roundtrip() {
        let id = NodeId::from_name("main");
        let recovered = NodeId::from_bytes(id.as_bytes()).unwrap();
        assert_eq!(id, recovered);
    }

    #[test]
    fn test_rejects_wrong_length() {
        let result = NodeId::from_bytes(&[1, 2, 3]);
        assert!(matches!(
            result,
            Err(IdentityError::InvalidLength {
                expected: 16,
                actual: 3
            })
        ));
    }

    #[test]
    fn test_hex_parse() {
        let id = NodeId::from_name("main");
        let full = hex::encode(id.as_bytes());
        let parsed: NodeId = full.parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-hex".parse::<NodeId>().is_err());
    }
}
