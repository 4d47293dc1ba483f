//! # Capmesh Crypto
//!
//! Confidentiality and integrity primitives for the capsule mesh:
//!
//! - **AEAD**: AES-256-GCM with a fresh random 96-bit nonce per frame.
//!   Nonce and tag travel in the frame; keys are pre-shared per peer pair.
//! - **Signatures**: Ed25519 over canonical capsule/manifest bytes, verified
//!   against a [`TrustStore`] of registered sources.
//! - **Key material**: [`KeyRing`] implements the pluggable
//!   [`PeerKeyProvider`] seam so a real key agreement can replace the
//!   pre-shared scheme without touching codec or hub logic.

pub mod aead;
pub mod error;
pub mod keyring;
pub mod signing;

pub use aead::{PAYLOAD_KEY_LEN, PayloadKey, Sealed, open, seal};
pub use error::{CryptoError, CryptoResult};
pub use keyring::{KeyRing, PeerKeyProvider};
pub use signing::{NodeSigner, TrustStore};
