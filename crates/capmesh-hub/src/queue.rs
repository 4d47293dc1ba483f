//! Retransmit queue with exponential backoff
//!
//! Every forwarded query owns one [`QueueEntry`], created when the first
//! transmission is handed to the simulator. A NAK for any chunk, or the
//! absence of an ACK within the ACK timeout, schedules a retransmission
//! after an exponentially growing delay; the entry fails terminally once
//! the retry cap is reached. Entries are append-logged so a restart
//! resumes pending work.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use capmesh_core::{NodeId, now_millis};
use capmesh_netsim::SimConfig;

/// Retransmission policy knobs
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retransmission
    pub base_backoff: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Transmissions allowed before the entry fails terminally
    pub max_retries: u32,
    /// How long an in-flight transmission may wait for its ACK
    pub ack_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_retries: 6,
            ack_timeout: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the `attempt`-th transmission:
    /// `base_backoff * multiplier^(attempt - 1)`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.base_backoff
            .mul_f64(self.multiplier.powi(attempt.saturating_sub(1) as i32))
    }

    /// Worst-case time from enqueue to terminal failure
    pub fn max_total_backoff(&self) -> Duration {
        (1..self.max_retries)
            .map(|attempt| self.backoff_for(attempt))
            .sum::<Duration>()
            + self.ack_timeout * self.max_retries
    }

    /// Check this policy against a link configuration
    ///
    /// The contract requires
    /// `ack_timeout >= 2 x (base_latency + jitter + reorder_window)`.
    pub fn validate_against(&self, link: &SimConfig) -> Vec<RetryPolicyWarning> {
        let mut warnings = Vec::new();
        if self.ack_timeout < link.ack_timeout_floor() {
            warnings.push(RetryPolicyWarning::AckTimeoutBelowFloor);
        }
        if self.max_retries == 0 {
            warnings.push(RetryPolicyWarning::ZeroRetries);
        }
        warnings
    }
}

/// Retry policy contract violations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicyWarning {
    /// `ack_timeout < 2 x (base_latency + jitter + reorder_window)`
    AckTimeoutBelowFloor,
    /// `max_retries` is zero; every query fails immediately
    ZeroRetries,
}

impl std::fmt::Display for RetryPolicyWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPolicyWarning::AckTimeoutBelowFloor => {
                write!(f, "ack_timeout below 2 x (base_latency + jitter + reorder_window)")
            }
            RetryPolicyWarning::ZeroRetries => write!(f, "max_retries must be positive"),
        }
    }
}

/// Lifecycle of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting for its next transmission window
    Pending,
    /// Transmitted, awaiting ACK or NAK
    InFlight,
    /// ACKed by the transport; terminal
    Delivered,
    /// Retry cap exceeded; terminal
    Failed,
}

/// Retransmission state for one forwarded packet
///
/// Owned exclusively by the issuing mini hub; never serialized to the
/// wire. `attempts` counts transmissions, including the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// The packet this entry retransmits
    pub packet_id: Uuid,
    /// Where the packet is addressed
    pub destination: NodeId,
    /// The exact bytes of every transmission attempt
    pub encoded_packet: Vec<u8>,
    /// Transmissions so far
    pub attempts: u32,
    /// When the next transmission is due (meaningful while Pending)
    pub next_attempt_at: DateTime<Utc>,
    /// When the entry was created
    pub first_enqueued_at: DateTime<Utc>,
    /// When the last transmission left (meaningful while InFlight)
    pub last_sent_at: Option<DateTime<Utc>>,
    /// Current lifecycle state
    pub status: EntryStatus,
}

/// Result of an ACK arrival
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckOutcome {
    /// The ACK moved an entry to Delivered (duplicates report false)
    pub newly_delivered: bool,
    /// Entries whose backoff was reset by the reconciliation drain
    pub drained: usize,
}

/// Due and failed work discovered by a scan
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Entries to transmit now: `(packet_id, destination, bytes)`
    pub due: Vec<(Uuid, NodeId, Vec<u8>)>,
    /// Entries that failed terminally during this scan
    pub failed: Vec<Uuid>,
}

/// The mini hub's retransmission engine state
#[derive(Debug)]
pub struct RetransmitQueue {
    entries: DashMap<Uuid, QueueEntry>,
    policy: RetryPolicy,
    /// Failures since the last successful delivery; a delivery that ends a
    /// non-zero streak triggers the reconciliation drain
    failure_streak: AtomicU32,
    log: Option<QueueLog>,
}

impl RetransmitQueue {
    /// Create an in-memory queue (state dies with the process)
    pub fn in_memory(policy: RetryPolicy) -> Self {
        Self {
            entries: DashMap::new(),
            policy,
            failure_streak: AtomicU32::new(0),
            log: None,
        }
    }

    /// Open a persistent queue, resuming entries logged by a prior run
    ///
    /// Entries restored as InFlight become Pending due immediately: their
    /// transmission outcome is unknowable after a restart.
    pub async fn open(policy: RetryPolicy, dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let (log, restored) = QueueLog::open(dir).await?;
        let queue = Self {
            entries: DashMap::new(),
            policy,
            failure_streak: AtomicU32::new(0),
            log: Some(log),
        };

        let mut resumed = 0usize;
        for mut entry in restored {
            if entry.status == EntryStatus::InFlight {
                entry.status = EntryStatus::Pending;
                entry.next_attempt_at = now_millis();
            }
            if matches!(entry.status, EntryStatus::Pending) {
                resumed += 1;
            }
            queue.entries.insert(entry.packet_id, entry);
        }
        if resumed > 0 {
            info!(resumed, "Resumed pending queue entries from log");
        }
        Ok(queue)
    }

    /// The policy this queue runs with
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a packet whose first transmission just left
    pub async fn enqueue_in_flight(
        &self,
        packet_id: Uuid,
        destination: NodeId,
        encoded_packet: Vec<u8>,
    ) {
        let now = now_millis();
        let entry = QueueEntry {
            packet_id,
            destination,
            encoded_packet,
            attempts: 1,
            next_attempt_at: now,
            first_enqueued_at: now,
            last_sent_at: Some(now),
            status: EntryStatus::InFlight,
        };
        self.persist(&entry).await;
        self.entries.insert(packet_id, entry);
        trace!(packet = %packet_id, "Queue entry created in flight");
    }

    /// Handle a transport ACK
    ///
    /// Idempotent: duplicate ACKs and ACKs for unknown packets are no-ops.
    /// Ending a failure streak resets every pending entry's backoff so the
    /// queue drains immediately after the link recovers.
    pub async fn on_ack(&self, packet_id: Uuid) -> AckOutcome {
        let snapshot = {
            let Some(mut entry) = self.entries.get_mut(&packet_id) else {
                return AckOutcome::default();
            };
            if entry.status == EntryStatus::Delivered {
                return AckOutcome::default();
            }
            entry.status = EntryStatus::Delivered;
            entry.clone()
        };

        self.persist(&snapshot).await;
        debug!(packet = %packet_id, "Queue entry delivered");

        let streak = self.failure_streak.swap(0, Ordering::AcqRel);
        let drained = if streak > 0 {
            self.drain_pending().await
        } else {
            0
        };

        AckOutcome {
            newly_delivered: true,
            drained,
        }
    }

    /// Handle a transport NAK for one chunk
    ///
    /// Only an in-flight entry reacts: a NAK and an ACK timeout racing in
    /// the same attempt window schedule a single retransmission.
    pub async fn on_nak(&self, packet_id: Uuid, chunk_index: u16) -> Option<EntryStatus> {
        trace!(packet = %packet_id, chunk = chunk_index, "NAK received");
        self.retry_or_fail(packet_id).await
    }

    /// Handle a submission failure reported by the simulator
    pub async fn on_send_failure(&self, packet_id: Uuid) -> Option<EntryStatus> {
        self.retry_or_fail(packet_id).await
    }

    /// Scan for due work
    ///
    /// In-flight entries whose ACK window has elapsed are treated as
    /// implicit NAKs; pending entries past `next_attempt_at` are marked
    /// in flight and returned for transmission.
    pub async fn scan(&self) -> ScanOutcome {
        let now = now_millis();
        let mut outcome = ScanOutcome::default();

        // Implicit ACK timeouts.
        let timed_out: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|e| {
                e.status == EntryStatus::InFlight
                    && e.last_sent_at
                        .map(|sent| {
                            now.signed_duration_since(sent).num_milliseconds()
                                >= self.policy.ack_timeout.as_millis() as i64
                        })
                        .unwrap_or(false)
            })
            .map(|e| e.packet_id)
            .collect();

        for packet_id in timed_out {
            if let Some(EntryStatus::Failed) = self.retry_or_fail(packet_id).await {
                outcome.failed.push(packet_id);
            }
        }

        // Due retransmissions.
        let due_ids: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::Pending && e.next_attempt_at <= now)
            .map(|e| e.packet_id)
            .collect();

        for packet_id in due_ids {
            let snapshot = {
                let Some(mut entry) = self.entries.get_mut(&packet_id) else {
                    continue;
                };
                if entry.status != EntryStatus::Pending {
                    continue;
                }
                entry.status = EntryStatus::InFlight;
                entry.attempts += 1;
                entry.last_sent_at = Some(now);
                entry.clone()
            };
            self.persist(&snapshot).await;
            trace!(
                packet = %packet_id,
                attempt = snapshot.attempts,
                "Retransmission due"
            );
            outcome
                .due
                .push((packet_id, snapshot.destination, snapshot.encoded_packet));
        }

        outcome
    }

    /// Look up an entry's current state
    pub fn get(&self, packet_id: &Uuid) -> Option<QueueEntry> {
        self.entries.get(packet_id).map(|e| e.clone())
    }

    /// An entry's status, if known
    pub fn status(&self, packet_id: &Uuid) -> Option<EntryStatus> {
        self.entries.get(packet_id).map(|e| e.status)
    }

    /// Number of tracked entries in any state
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue tracks nothing
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries still working toward delivery
    pub fn open_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.status, EntryStatus::Pending | EntryStatus::InFlight))
            .count()
    }

    /// Schedule a retransmission or fail the entry at the cap
    async fn retry_or_fail(&self, packet_id: Uuid) -> Option<EntryStatus> {
        let snapshot = {
            let mut entry = self.entries.get_mut(&packet_id)?;
            if entry.status != EntryStatus::InFlight {
                // Pending, already delivered, or already failed: the other
                // trigger in this attempt window won.
                return Some(entry.status);
            }

            if entry.attempts >= self.policy.max_retries {
                entry.status = EntryStatus::Failed;
                warn!(
                    packet = %packet_id,
                    attempts = entry.attempts,
                    "Retry cap exceeded, entry failed"
                );
            } else {
                entry.status = EntryStatus::Pending;
                entry.next_attempt_at =
                    now_millis() + chrono::Duration::from_std(self.policy.backoff_for(entry.attempts))
                        .unwrap_or_else(|_| chrono::Duration::seconds(1));
                debug!(
                    packet = %packet_id,
                    attempt = entry.attempts,
                    next = %entry.next_attempt_at,
                    "Retransmission scheduled"
                );
            }
            entry.clone()
        };

        self.failure_streak.fetch_add(1, Ordering::AcqRel);
        self.persist(&snapshot).await;
        Some(snapshot.status)
    }

    /// Reset every pending entry's backoff to fire immediately
    async fn drain_pending(&self) -> usize {
        let now = now_millis();
        let pending: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|e| e.status == EntryStatus::Pending)
            .map(|e| e.packet_id)
            .collect();

        let mut drained = 0usize;
        for packet_id in &pending {
            let snapshot = {
                let Some(mut entry) = self.entries.get_mut(packet_id) else {
                    continue;
                };
                if entry.status != EntryStatus::Pending {
                    continue;
                }
                entry.next_attempt_at = now;
                entry.clone()
            };
            self.persist(&snapshot).await;
            drained += 1;
        }

        if drained > 0 {
            info!(drained, "Link recovery drain scheduled pending retries");
        }
        drained
    }

    /// Best-effort append of the entry's latest state
    async fn persist(&self, entry: &QueueEntry) {
        if let Some(log) = &self.log {
            if let Err(e) = log.record(entry).await {
                warn!(packet = %entry.packet_id, error = %e, "Queue log write failed");
            }
        }
    }
}

/// Append-only queue log; one JSON row per state change, last row wins
#[derive(Debug)]
struct QueueLog {
    writer: Mutex<BufWriter<File>>,
    #[allow(dead_code)]
    path: PathBuf,
}

impl QueueLog {
    /// Open the log and replay it into the latest entry states
    async fn open(dir: impl AsRef<Path>) -> std::io::Result<(Self, Vec<QueueEntry>)> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join("queue.log");

        let mut latest: std::collections::HashMap<Uuid, QueueEntry> =
            std::collections::HashMap::new();
        if tokio::fs::try_exists(&path).await? {
            let file = File::open(&path).await?;
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<QueueEntry>(&line) {
                    Ok(entry) => {
                        latest.insert(entry.packet_id, entry);
                    }
                    Err(e) => warn!(error = %e, "Skipping unparseable queue log row"),
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok((
            Self {
                writer: Mutex::new(BufWriter::new(file)),
                path,
            },
            latest.into_values().collect(),
        ))
    }

    /// Append one entry snapshot
    async fn record(&self, entry: &QueueEntry) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await
    }
}
