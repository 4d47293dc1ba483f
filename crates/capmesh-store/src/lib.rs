//! # Capmesh Store
//!
//! Capsule persistence shared by mini and main hubs: a keyed relation by
//! `capsule_id` with a secondary index on `question_hash`, manifest entry
//! generation, and periodic TTL sweeping.
//!
//! Two backends implement [`CapsuleStore`]:
//!
//! - [`MemoryCapsuleStore`]: concurrent in-memory maps, for edge caches and
//!   tests.
//! - [`PersistentCapsuleStore`]: the same view made durable with an
//!   append-only log; an acknowledged put survives a restart.
//!
//! Every accepted capsule has had its signature verified against the trust
//! store — there is no path into a store that skips verification.

pub mod error;
pub mod memory;
pub mod persistent;
pub mod sweep;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryCapsuleStore;
pub use persistent::PersistentCapsuleStore;
pub use sweep::SweeperTask;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use capmesh_core::{KnowledgeCapsule, ManifestEntry, now_millis};

/// A capsule as held by a store, with local receipt time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCapsule {
    /// The verified capsule
    pub capsule: KnowledgeCapsule,
    /// When this node accepted it
    pub received_at: DateTime<Utc>,
}

impl StoredCapsule {
    /// Wrap a capsule received just now
    pub fn received_now(capsule: KnowledgeCapsule) -> Self {
        Self {
            capsule,
            received_at: now_millis(),
        }
    }
}

/// Capsule persistence contract shared by all hub roles
///
/// Readers (`get`, `find_*`, `manifest_entries`) never block each other;
/// writers (`put`, `sweep`) serialize per record.
#[async_trait]
pub trait CapsuleStore: Send + Sync {
    /// Store a capsule after verifying its signature
    ///
    /// Returns `Ok(true)` on first insert and `Ok(false)` when the id is
    /// already present (the earlier record is kept). Signature and signer
    /// failures reject the capsule without storing it.
    async fn put(&self, capsule: KnowledgeCapsule) -> StoreResult<bool>;

    /// O(1) lookup by capsule id (fresh or not)
    async fn get(&self, capsule_id: &Uuid) -> Option<KnowledgeCapsule>;

    /// Newest fresh capsule matching the normalized question, if any
    async fn find_by_question(&self, question: &str) -> Option<KnowledgeCapsule>;

    /// Newest fresh capsule for a precomputed question hash
    async fn find_by_hash(&self, hash: &str) -> Option<KnowledgeCapsule>;

    /// All fresh capsules, ordered by `created_at` ascending
    async fn fresh_capsules(&self) -> Vec<KnowledgeCapsule>;

    /// Manifest entries for every fresh capsule, ordered by `created_at`
    async fn manifest_entries(&self) -> Vec<ManifestEntry>;

    /// Remove expired capsules, returning their ids
    async fn sweep(&self) -> StoreResult<Vec<Uuid>>;

    /// Number of stored capsules, fresh or not
    async fn len(&self) -> usize;

    /// Whether the store holds nothing
    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
