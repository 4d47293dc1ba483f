//! Signed capsule manifests for gossip-driven sync
//!
//! A manifest lists every fresh capsule its source currently holds, ordered
//! by creation time. Mini hubs diff manifests against their local store and
//! fetch only what they are missing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capsule::{KnowledgeCapsule, now_millis, rfc3339_millis};
use crate::error::CapsuleError;
use crate::identity::NodeId;

/// One capsule reference inside a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// The capsule's identifier
    pub capsule_id: Uuid,
    /// Digest of the normalized question
    pub question_hash: String,
    /// When the capsule was created
    pub created_at: DateTime<Utc>,
}

impl ManifestEntry {
    /// Build an entry from a stored capsule
    pub fn from_capsule(capsule: &KnowledgeCapsule) -> Self {
        Self {
            capsule_id: capsule.capsule_id,
            question_hash: capsule.question_hash.clone(),
            created_at: capsule.created_at,
        }
    }
}

/// A signed listing of the fresh capsules a source holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Identity of the publishing hub
    pub source_id: NodeId,
    /// When this manifest was generated
    pub generated_at: DateTime<Utc>,
    /// Fresh capsules, ordered by `created_at` ascending
    pub entries: Vec<ManifestEntry>,
    /// Ed25519 signature over the canonical serialization of the fields above
    pub signature: Vec<u8>,
}

impl Manifest {
    /// Assemble an unsigned manifest from entries
    ///
    /// Entries are sorted by `created_at` ascending (ties broken by id so
    /// the canonical form is deterministic).
    pub fn assemble(source_id: NodeId, mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.capsule_id.cmp(&b.capsule_id))
        });
        Self {
            source_id,
            generated_at: now_millis(),
            entries,
            signature: Vec::new(),
        }
    }

    /// Attach a signature produced over [`Self::canonical_bytes`]
    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = signature;
        self
    }

    /// Canonical serialization used for signing: all fields except
    /// `signature`, sorted keys, no whitespace.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CapsuleError> {
        let mut out = String::from("{\"entries\":[");
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str("{\"capsule_id\":\"");
            out.push_str(&entry.capsule_id.to_string());
            out.push_str("\",\"created_at\":\"");
            out.push_str(&rfc3339_millis(&entry.created_at));
            out.push_str("\",\"question_hash\":\"");
            out.push_str(&entry.question_hash);
            out.push_str("\"}");
        }
        out.push_str("],\"generated_at\":\"");
        out.push_str(&rfc3339_millis(&self.generated_at));
        out.push_str("\",\"source_id\":\"");
        out.push_str(&hex::encode(self.source_id.as_bytes()));
        out.push_str("\"}");
        Ok(out.into_bytes())
    }

    /// Ids referenced by this manifest
    pub fn capsule_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.entries.iter().map(|e| e.capsule_id)
    }

    /// Number of listed capsules
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest lists nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
