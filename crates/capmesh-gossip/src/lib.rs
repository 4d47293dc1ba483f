//! # Capmesh Gossip
//!
//! Manifest gossip and selective capsule sync.
//!
//! Main hubs run a [`ManifestBroadcaster`]: every interval they sign a
//! manifest of their fresh capsules and push it to subscribed mini hubs.
//! Mini hubs run a [`GossipSyncer`]: verified manifests are diffed against
//! the local store and only missing capsules are fetched, with a bounded
//! number of requests outstanding at once.
//!
//! The two periodic drives (broadcast and re-evaluation) together give
//! convergence under loss: a dropped manifest or capsule is simply picked
//! up on a later round.

pub mod broadcaster;
pub mod config;
pub mod error;
pub mod syncer;

pub use broadcaster::ManifestBroadcaster;
pub use config::{GossipConfig, GossipConfigWarning};
pub use error::{GossipError, GossipResult};
pub use syncer::GossipSyncer;
