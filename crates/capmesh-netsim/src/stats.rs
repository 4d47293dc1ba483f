//! Traffic counters
//!
//! Lightweight atomic counters exposed through the admin surface; useful
//! for asserting boundary behaviors in tests and for operator dashboards.

use std::sync::atomic::{AtomicU64, Ordering};

/// Internal counter set
#[derive(Debug, Default)]
pub struct SimStats {
    frames_submitted: AtomicU64,
    chunks_sent: AtomicU64,
    chunks_dropped: AtomicU64,
    frames_delivered: AtomicU64,
    acks_sent: AtomicU64,
    naks_sent: AtomicU64,
    oversized_rejected: AtomicU64,
    reassembly_expired: AtomicU64,
}

impl SimStats {
    pub(crate) fn record_submitted(&self, chunks: usize) {
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
        self.chunks_sent.fetch_add(chunks as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.chunks_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.frames_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_nak(&self) {
        self.naks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_oversized(&self) {
        self.oversized_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reassembly_expired(&self) {
        self.reassembly_expired.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            naks_sent: self.naks_sent.load(Ordering::Relaxed),
            oversized_rejected: self.oversized_rejected.load(Ordering::Relaxed),
            reassembly_expired: self.reassembly_expired.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the simulator's counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Frames accepted at admission
    pub frames_submitted: u64,
    /// Chunks handed to the link (before loss)
    pub chunks_sent: u64,
    /// Chunks dropped by the loss roll
    pub chunks_dropped: u64,
    /// Frames fully reassembled at a destination
    pub frames_delivered: u64,
    /// ACKs routed back to senders
    pub acks_sent: u64,
    /// NAKs routed back to senders
    pub naks_sent: u64,
    /// Frames rejected as oversized at admission
    pub oversized_rejected: u64,
    /// Reassembly buffers discarded on timeout
    pub reassembly_expired: u64,
}
