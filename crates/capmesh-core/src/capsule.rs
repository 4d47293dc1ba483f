//! Knowledge capsules: immutable, signed Q/A records with a TTL
//!
//! A capsule binds a question and its authoritative answer under an Ed25519
//! signature from the producing main hub. Capsules are immutable by
//! identity; freshness is purely a function of `created_at` and
//! `ttl_seconds`.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

use crate::error::CapsuleError;
use crate::identity::NodeId;

/// Length of an Ed25519 signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Normalize a question for hashing: lowercase, NFC, collapsed whitespace.
pub fn normalize_question(question: &str) -> String {
    question
        .to_lowercase()
        .nfc()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic question digest: `hex(SHA256(normalize(question)))`.
pub fn question_hash(question: &str) -> String {
    hex::encode(Sha256::digest(normalize_question(question).as_bytes()))
}

/// Truncate a timestamp to millisecond precision
///
/// All capsule timestamps are ms-precision so the canonical form
/// round-trips exactly through RFC3339.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    Utc.timestamp_millis_opt(now.timestamp_millis())
        .single()
        .unwrap_or(now)
}

/// Render a timestamp as RFC3339 with exactly millisecond precision and `Z`.
pub fn rfc3339_millis(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// An immutable, signed Q/A record produced by a main hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeCapsule {
    /// Globally unique identifier
    pub capsule_id: Uuid,
    /// The question, verbatim as asked
    pub question_text: String,
    /// The authoritative answer (empty on ERROR capsules)
    pub answer_text: String,
    /// SHA-256 of the normalized question, lowercase hex
    pub question_hash: String,
    /// Identity of the producing main hub
    pub source_id: NodeId,
    /// Creation time, millisecond precision
    pub created_at: DateTime<Utc>,
    /// Freshness window; zero means immediately expired
    pub ttl_seconds: u64,
    /// Ed25519 signature over the canonical serialization
    pub signature: Vec<u8>,
}

impl KnowledgeCapsule {
    /// Assemble an unsigned capsule for a question/answer pair
    ///
    /// The returned capsule has an empty signature; the producing hub signs
    /// the canonical bytes and attaches the result before publishing.
    pub fn bind(question: &str, answer: &str, source_id: NodeId, ttl_seconds: u64) -> Self {
        Self {
            capsule_id: Uuid::new_v4(),
            question_text: question.to_string(),
            answer_text: answer.to_string(),
            question_hash: question_hash(question),
            source_id,
            created_at: now_millis(),
            ttl_seconds,
            signature: Vec::new(),
        }
    }

    /// Attach a signature produced over [`Self::canonical_bytes`]
    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = signature;
        self
    }

    /// Canonical serialization used for signing
    ///
    /// JSON with keys in the fixed order `capsule_id, question_text,
    /// answer_text, question_hash, source_id, created_at, ttl_seconds`,
    /// UTF-8, no whitespace, RFC3339 ms timestamps with `Z` suffix.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, CapsuleError> {
        let mut out = String::from("{");
        push_field(&mut out, "capsule_id", &self.capsule_id.to_string())?;
        out.push(',');
        push_field(&mut out, "question_text", &self.question_text)?;
        out.push(',');
        push_field(&mut out, "answer_text", &self.answer_text)?;
        out.push(',');
        push_field(&mut out, "question_hash", &self.question_hash)?;
        out.push(',');
        push_field(&mut out, "source_id", &hex::encode(self.source_id.as_bytes()))?;
        out.push(',');
        push_field(&mut out, "created_at", &rfc3339_millis(&self.created_at))?;
        out.push(',');
        out.push_str("\"ttl_seconds\":");
        out.push_str(&self.ttl_seconds.to_string());
        out.push('}');
        Ok(out.into_bytes())
    }

    /// Whether the capsule is fresh at `now`
    ///
    /// A capsule with `ttl_seconds == 0` is never fresh.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        let age_ms = now.timestamp_millis() - self.created_at.timestamp_millis();
        age_ms >= 0 && (age_ms as u128) < (self.ttl_seconds as u128) * 1000
    }

    /// Whether the capsule is fresh right now
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now())
    }

    /// Whether this capsule reports an answer failure
    ///
    /// ERROR capsules are signed like any other but carry an empty answer;
    /// they are surfaced to the caller and never cached.
    pub fn is_error(&self) -> bool {
        self.answer_text.is_empty()
    }
}

fn push_field(out: &mut String, key: &str, value: &str) -> Result<(), CapsuleError> {
    let encoded =
        serde_json::to_string(value).map_err(|e| CapsuleError::Canonical(e.to_string()))?;
    out.push('"');
    out.push_str(key);
    out.push_str("\":");
    out.push_str(&encoded);
    Ok(())
}
