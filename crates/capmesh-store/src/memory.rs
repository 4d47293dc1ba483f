//! In-memory capsule store
//!
//! Primary relation keyed by `capsule_id` with a secondary index on
//! `question_hash`. Suitable for mini hubs and tests; the persistent
//! backend layers durability on top of this same structure.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};
use uuid::Uuid;

use capmesh_core::{KnowledgeCapsule, ManifestEntry, question_hash};
use capmesh_crypto::TrustStore;

use crate::error::{StoreError, StoreResult};
use crate::{CapsuleStore, StoredCapsule};

/// Concurrent in-memory capsule store
#[derive(Debug)]
pub struct MemoryCapsuleStore {
    /// Primary relation: capsule_id -> stored record
    capsules: DashMap<Uuid, StoredCapsule>,
    /// Secondary index: question_hash -> capsule ids
    by_hash: DashMap<String, Vec<Uuid>>,
    /// Verify keys for accepted sources
    trust: Arc<TrustStore>,
    /// Capsules rejected with an invalid signature
    rejected_sig: AtomicU64,
}

impl MemoryCapsuleStore {
    /// Create an empty store trusting the given sources
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self {
            capsules: DashMap::new(),
            by_hash: DashMap::new(),
            trust,
            rejected_sig: AtomicU64::new(0),
        }
    }

    /// Count of capsules rejected for signature failures
    pub fn rejected_count(&self) -> u64 {
        self.rejected_sig.load(Ordering::Relaxed)
    }

    /// Verify a capsule's signature against the trust store
    pub(crate) fn verify(&self, capsule: &KnowledgeCapsule) -> StoreResult<()> {
        let canonical = capsule
            .canonical_bytes()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        self.trust
            .verify(&capsule.source_id, &canonical, &capsule.signature)
            .map_err(|err| {
                self.rejected_sig.fetch_add(1, Ordering::Relaxed);
                match err {
                    capmesh_crypto::CryptoError::UnknownSigner(source_id) => {
                        StoreError::UnknownSigner {
                            capsule_id: capsule.capsule_id,
                            source_id,
                        }
                    }
                    _ => StoreError::SigInvalid(capsule.capsule_id),
                }
            })
    }

    /// Insert an already-verified record
    ///
    /// Returns false when the id is already present (first write wins);
    /// rejects id collisions across different sources.
    pub(crate) fn insert_record(&self, record: StoredCapsule) -> StoreResult<bool> {
        let capsule_id = record.capsule.capsule_id;

        if let Some(existing) = self.capsules.get(&capsule_id) {
            if existing.capsule.source_id != record.capsule.source_id {
                return Err(StoreError::IdCollision(capsule_id));
            }
            trace!(capsule = %capsule_id, "Duplicate put, keeping earlier record");
            return Ok(false);
        }

        self.by_hash
            .entry(record.capsule.question_hash.clone())
            .or_default()
            .push(capsule_id);
        self.capsules.insert(capsule_id, record);
        Ok(true)
    }

    /// Remove a capsule and its index entry
    pub(crate) fn remove_record(&self, capsule_id: &Uuid) -> Option<StoredCapsule> {
        let (_, record) = self.capsules.remove(capsule_id)?;
        if let Some(mut ids) = self.by_hash.get_mut(&record.capsule.question_hash) {
            ids.retain(|id| id != capsule_id);
        }
        Some(record)
    }

    /// Ids of expired capsules at `now`
    fn expired_at(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.capsules
            .iter()
            .filter(|r| !r.capsule.is_fresh_at(now))
            .map(|r| r.capsule.capsule_id)
            .collect()
    }
}

#[async_trait]
impl CapsuleStore for MemoryCapsuleStore {
    async fn put(&self, capsule: KnowledgeCapsule) -> StoreResult<bool> {
        self.verify(&capsule)?;
        let inserted = self.insert_record(StoredCapsule::received_now(capsule))?;
        if inserted {
            trace!(total = self.capsules.len(), "Capsule stored");
        }
        Ok(inserted)
    }

    async fn get(&self, capsule_id: &Uuid) -> Option<KnowledgeCapsule> {
        self.capsules.get(capsule_id).map(|r| r.capsule.clone())
    }

    async fn find_by_question(&self, question: &str) -> Option<KnowledgeCapsule> {
        self.find_by_hash(&question_hash(question)).await
    }

    async fn find_by_hash(&self, hash: &str) -> Option<KnowledgeCapsule> {
        let ids = self.by_hash.get(hash)?;
        let now = Utc::now();
        ids.iter()
            .filter_map(|id| self.capsules.get(id))
            .filter(|r| r.capsule.is_fresh_at(now))
            .max_by_key(|r| r.capsule.created_at)
            .map(|r| r.capsule.clone())
    }

    async fn fresh_capsules(&self) -> Vec<KnowledgeCapsule> {
        let now = Utc::now();
        let mut fresh: Vec<KnowledgeCapsule> = self
            .capsules
            .iter()
            .filter(|r| r.capsule.is_fresh_at(now))
            .map(|r| r.capsule.clone())
            .collect();
        fresh.sort_by_key(|c| (c.created_at, c.capsule_id));
        fresh
    }

    async fn manifest_entries(&self) -> Vec<ManifestEntry> {
        self.fresh_capsules()
            .await
            .iter()
            .map(ManifestEntry::from_capsule)
            .collect()
    }

    async fn sweep(&self) -> StoreResult<Vec<Uuid>> {
        let expired = self.expired_at(Utc::now());
        for capsule_id in &expired {
            self.remove_record(capsule_id);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Swept expired capsules");
        }
        Ok(expired)
    }

    async fn len(&self) -> usize {
        self.capsules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capmesh_core::NodeId;
    use capmesh_crypto::NodeSigner;

    fn make_test_signer() -> (NodeSigner, Arc<TrustStore>) {
        let signer = NodeSigner::generate(NodeId::from_name("main"));
        let trust = Arc::new(TrustStore::new());
        trust.register_signer(&signer);
        (signer, trust)
    }

    fn make_signed_capsule(signer: &NodeSigner, question: &str, ttl: u64) -> KnowledgeCapsule {
        let capsule = KnowledgeCapsule::bind(question, "the answer", signer.source_id(), ttl);
        let canonical = capsule.canonical_bytes().unwrap();
        let signature = signer.sign(&canonical);
        capsule.with_signature(signature)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (signer, trust) = make_test_signer();
        let store = MemoryCapsuleStore::new(trust);
        let capsule = make_signed_capsule(&signer, "What is photosynthesis?", 3600);

        assert!(store.put(capsule.clone()).await.unwrap());
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&capsule.capsule_id).await.unwrap(), capsule);
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let (signer, trust) = make_test_signer();
        let store = MemoryCapsuleStore::new(trust);
        let capsule = make_signed_capsule(&signer, "Define entropy", 3600);

        assert!(store.put(capsule.clone()).await.unwrap());
        assert!(!store.put(capsule.clone()).await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_tampered_capsule_rejected() {
        let (signer, trust) = make_test_signer();
        let store = MemoryCapsuleStore::new(trust);
        let mut capsule = make_signed_capsule(&signer, "Explain TLS", 3600);
        capsule.answer_text.push('!');

        let result = store.put(capsule).await;
        assert!(matches!(result, Err(StoreError::SigInvalid(_))));
        assert_eq!(store.len().await, 0);
        assert_eq!(store.rejected_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_signer_rejected() {
        let (_, trust) = make_test_signer();
        let rogue = NodeSigner::generate(NodeId::from_name("rogue"));
        let store = MemoryCapsuleStore::new(trust);
        let capsule = make_signed_capsule(&rogue, "Explain TLS", 3600);

        let result = store.put(capsule).await;
        assert!(matches!(result, Err(StoreError::UnknownSigner { .. })));
    }

    #[tokio::test]
    async fn test_id_collision_across_sources_rejected() {
        let signer_a = NodeSigner::generate(NodeId::from_name("main-a"));
        let signer_b = NodeSigner::generate(NodeId::from_name("main-b"));
        let trust = Arc::new(TrustStore::new());
        trust.register_signer(&signer_a);
        trust.register_signer(&signer_b);
        let store = MemoryCapsuleStore::new(trust);

        let original = make_signed_capsule(&signer_a, "Define entropy", 3600);
        store.put(original.clone()).await.unwrap();

        let mut impostor = KnowledgeCapsule::bind("Define entropy", "other", signer_b.source_id(), 3600);
        impostor.capsule_id = original.capsule_id;
        let canonical = impostor.canonical_bytes().unwrap();
        let impostor = impostor.with_signature(signer_b.sign(&canonical));

        let result = store.put(impostor).await;
        assert!(matches!(result, Err(StoreError::IdCollision(_))));
    }

    #[tokio::test]
    async fn test_find_by_question_prefers_newest_fresh() {
        let (signer, trust) = make_test_signer();
        let store = MemoryCapsuleStore::new(trust);

        let mut older = make_signed_capsule(&signer, "Define entropy", 3600);
        older.created_at -= chrono::Duration::seconds(100);
        let canonical = older.canonical_bytes().unwrap();
        let older = older.with_signature(signer.sign(&canonical));
        let newer = make_signed_capsule(&signer, "define  ENTROPY", 3600);

        store.put(older).await.unwrap();
        store.put(newer.clone()).await.unwrap();

        let found = store.find_by_question("Define entropy").await.unwrap();
        assert_eq!(found.capsule_id, newer.capsule_id);
    }

    #[tokio::test]
    async fn test_expired_capsules_invisible_and_swept() {
        let (signer, trust) = make_test_signer();
        let store = MemoryCapsuleStore::new(trust);
        let capsule = make_signed_capsule(&signer, "Old news", 0);
        let capsule_id = capsule.capsule_id;

        store.put(capsule).await.unwrap();
        assert!(store.find_by_question("Old news").await.is_none());
        assert!(store.manifest_entries().await.is_empty());

        let swept = store.sweep().await.unwrap();
        assert_eq!(swept, vec![capsule_id]);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_manifest_entries_ordered() {
        let (signer, trust) = make_test_signer();
        let store = MemoryCapsuleStore::new(trust);

        for i in 0..5 {
            let mut capsule = make_signed_capsule(&signer, &format!("question {i}"), 3600);
            capsule.created_at -= chrono::Duration::seconds(100 - i);
            let canonical = capsule.canonical_bytes().unwrap();
            let capsule = capsule.with_signature(signer.sign(&canonical));
            store.put(capsule).await.unwrap();
        }

        let entries = store.manifest_entries().await;
        assert_eq!(entries.len(), 5);
        for pair in entries.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }
}
