//! Hub-level counters
//!
//! Application metrics that the transport cannot see: cache performance,
//! security rejections, and answer generation activity.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counter set shared across a hub's workers
#[derive(Debug, Default)]
pub struct HubMetrics {
    cache_hits: AtomicU64,
    queries_forwarded: AtomicU64,
    fresh_received: AtomicU64,
    queued_timeouts: AtomicU64,
    unavailable: AtomicU64,
    decrypt_fail: AtomicU64,
    sig_invalid: AtomicU64,
    answers_generated: AtomicU64,
    dedup_hits: AtomicU64,
    capsule_requests_served: AtomicU64,
    manifests_received: AtomicU64,
}

impl HubMetrics {
    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_query_forwarded(&self) {
        self.queries_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fresh_received(&self) {
        self.fresh_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queued_timeout(&self) {
        self.queued_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unavailable(&self) {
        self.unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decrypt_fail(&self) {
        self.decrypt_fail.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sig_invalid(&self) {
        self.sig_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_answer_generated(&self) {
        self.answers_generated.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dedup_hit(&self) {
        self.dedup_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_capsule_request_served(&self) {
        self.capsule_requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_manifest_received(&self) {
        self.manifests_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            queries_forwarded: self.queries_forwarded.load(Ordering::Relaxed),
            fresh_received: self.fresh_received.load(Ordering::Relaxed),
            queued_timeouts: self.queued_timeouts.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            decrypt_fail: self.decrypt_fail.load(Ordering::Relaxed),
            sig_invalid: self.sig_invalid.load(Ordering::Relaxed),
            answers_generated: self.answers_generated.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            capsule_requests_served: self.capsule_requests_served.load(Ordering::Relaxed),
            manifests_received: self.manifests_received.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a hub's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Queries answered from the local cache
    pub cache_hits: u64,
    /// Queries forwarded to the authoritative hub
    pub queries_forwarded: u64,
    /// Fresh capsules received in reply to a query
    pub fresh_received: u64,
    /// Queries that timed out while still queued
    pub queued_timeouts: u64,
    /// Queries resolved as unavailable
    pub unavailable: u64,
    /// Inbound frames dropped for AEAD failures
    pub decrypt_fail: u64,
    /// Inbound capsules rejected for signature failures
    pub sig_invalid: u64,
    /// Answers produced by the generator
    pub answers_generated: u64,
    /// Queries served from the dedup window
    pub dedup_hits: u64,
    /// Capsule requests served during sync
    pub capsule_requests_served: u64,
    /// Manifests accepted off the wire
    pub manifests_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = HubMetrics::default();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_decrypt_fail();
        metrics.record_sig_invalid();

        let snap = metrics.snapshot();
        assert_eq!(snap.cache_hits, 2);
        assert_eq!(snap.decrypt_fail, 1);
        assert_eq!(snap.sig_invalid, 1);
        assert_eq!(snap.answers_generated, 0);
    }
}
