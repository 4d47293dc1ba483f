//! The simulated link
//!
//! The simulator is the sole transport between hubs. A submitted frame is
//! admitted synchronously (size check against the chunk limit), fragmented,
//! and each chunk independently rolls for loss, waits out the shared
//! bandwidth budget, and sleeps its latency before arriving at the
//! destination's reassembly buffer. Completion of a whole frame emits one
//! ACK back to the sender; every lost chunk emits one NAK.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use capmesh_codec::{Chunk, Reassembler, decode_header, fragment};
use capmesh_core::{NodeId, TransportError};

use crate::bucket::TokenBucket;
use crate::config::SimConfig;
use crate::stats::{SimStats, StatsSnapshot};

/// Size of each endpoint's event mailbox.
const INBOX_CAPACITY: usize = 1024;

/// How often reassembly buffers are checked for expiry.
const SWEEP_INTERVAL: Duration = Duration::from_millis(200);

/// Transport feedback pushed to an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// A fully reassembled frame arrived
    Packet {
        /// Who sent it
        src: NodeId,
        /// The reassembled wire frame
        bytes: Vec<u8>,
    },
    /// The destination reassembled one of our frames
    Ack {
        /// The acknowledged frame
        packet_id: Uuid,
    },
    /// The link dropped one of our chunks
    Nak {
        /// The affected frame
        packet_id: Uuid,
        /// Which chunk was lost
        chunk_index: u16,
    },
}

/// Receiving side of a registered node
///
/// Handed to the owning hub; the simulator pushes [`DeliveryEvent`]s into
/// it from delivery tasks.
#[derive(Debug)]
pub struct SimEndpoint {
    node_id: NodeId,
    events: mpsc::Receiver<DeliveryEvent>,
}

impl SimEndpoint {
    /// The node this endpoint belongs to
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Wait for the next delivery event
    ///
    /// Returns `None` once the simulator has shut down.
    pub async fn recv(&mut self) -> Option<DeliveryEvent> {
        self.events.recv().await
    }
}

/// Receipt returned by a successful admission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitReceipt {
    /// The frame's packet id, read from its header
    pub packet_id: Uuid,
    /// How many chunks this attempt produced
    pub chunk_count: u16,
}

/// Per-node state held by the simulator
#[derive(Debug)]
struct EndpointState {
    inbox: mpsc::Sender<DeliveryEvent>,
    reassembler: Mutex<Reassembler>,
}

/// Shared simulator internals, cloned into delivery tasks
#[derive(Debug)]
struct SimShared {
    config: std::sync::RwLock<Arc<SimConfig>>,
    endpoints: DashMap<NodeId, Arc<EndpointState>>,
    bucket: TokenBucket,
    stats: SimStats,
    closed: AtomicBool,
}

impl SimShared {
    fn snapshot(&self) -> Arc<SimConfig> {
        self.config
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

/// The simulated degraded link between hubs
#[derive(Debug, Clone)]
pub struct Simulator {
    shared: Arc<SimShared>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Simulator {
    /// Create a simulator with the given policy and start its maintenance
    /// worker
    pub fn new(config: SimConfig) -> Self {
        for warning in config.validate() {
            warn!(%warning, "Simulator configured with a contract violation");
        }

        let bucket = TokenBucket::new(config.bandwidth_bytes_per_sec);
        let shared = Arc::new(SimShared {
            config: std::sync::RwLock::new(Arc::new(config)),
            endpoints: DashMap::new(),
            bucket,
            stats: SimStats::default(),
            closed: AtomicBool::new(false),
        });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let sim = Self {
            shared,
            shutdown_tx,
        };
        sim.spawn_sweeper(shutdown_rx);
        info!("Network simulator started");
        sim
    }

    /// Register a node, returning its event endpoint
    ///
    /// Re-registering a node replaces its mailbox; the old endpoint stops
    /// receiving.
    pub fn register(&self, node_id: NodeId) -> SimEndpoint {
        let (inbox, events) = mpsc::channel(INBOX_CAPACITY);
        let timeout = self.shared.snapshot().reassembly_timeout();
        self.shared.endpoints.insert(
            node_id,
            Arc::new(EndpointState {
                inbox,
                reassembler: Mutex::new(Reassembler::new(timeout)),
            }),
        );
        debug!(node = %node_id, "Node registered with simulator");
        SimEndpoint { node_id, events }
    }

    /// Remove a node; its endpoint stops receiving
    pub fn unregister(&self, node_id: &NodeId) {
        self.shared.endpoints.remove(node_id);
        debug!(node = %node_id, "Node unregistered from simulator");
    }

    /// Point-in-time view of the current configuration
    pub fn config_snapshot(&self) -> Arc<SimConfig> {
        self.shared.snapshot()
    }

    /// Replace the configuration atomically
    ///
    /// Frames admitted before the swap finish under their old snapshot.
    pub fn set_config(&self, config: SimConfig) {
        for warning in config.validate() {
            warn!(%warning, "Simulator reconfigured with a contract violation");
        }
        if let Ok(mut guard) = self.shared.config.write() {
            *guard = Arc::new(config);
        }
    }

    /// Mutate a copy of the current configuration and swap it in
    pub fn update_config(&self, apply: impl FnOnce(&mut SimConfig)) {
        let mut config = (*self.shared.snapshot()).clone();
        apply(&mut config);
        self.set_config(config);
    }

    /// Current traffic counters
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Submit an encoded frame for delivery
    ///
    /// Admission is synchronous: oversized frames (with auto-chunking off)
    /// and unknown destinations are rejected immediately. Everything after
    /// admission is asynchronous and reported through endpoint events.
    pub fn submit(
        &self,
        src: NodeId,
        dst: NodeId,
        frame: Vec<u8>,
    ) -> Result<SubmitReceipt, TransportError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::SimulatorDown);
        }

        let config = self.shared.snapshot();

        let header = decode_header(&frame)
            .map_err(|e| TransportError::MalformedFrame(e.to_string()))?;

        if !self.shared.endpoints.contains_key(&dst) {
            return Err(TransportError::UnknownDestination(dst));
        }

        if frame.len() > config.max_chunk_size_bytes && !config.auto_chunk_large_payloads {
            self.shared.stats.record_oversized();
            return Err(TransportError::Oversized {
                size: frame.len(),
                max: config.max_chunk_size_bytes,
            });
        }

        let chunks = fragment(header.packet_id, &frame, config.max_chunk_size_bytes)
            .map_err(|e| TransportError::MalformedFrame(e.to_string()))?;
        let chunk_count = chunks.len() as u16;

        trace!(
            packet = %header.packet_id,
            src = %src,
            dst = %dst,
            chunks = chunk_count,
            bytes = frame.len(),
            "Frame admitted"
        );
        self.shared.stats.record_submitted(chunks.len());

        for chunk in chunks {
            let lost = rand::rng().random::<f64>() < config.loss_probability;
            let shared = self.shared.clone();
            let config = config.clone();

            if lost {
                self.shared.stats.record_dropped();
                debug!(
                    packet = %chunk.packet_id,
                    chunk = chunk.chunk_index,
                    "Chunk dropped by link"
                );
                tokio::spawn(async move {
                    nak_chunk(shared, config, src, chunk.packet_id, chunk.chunk_index).await;
                });
            } else {
                tokio::spawn(async move {
                    deliver_chunk(shared, config, src, dst, chunk).await;
                });
            }
        }

        Ok(SubmitReceipt {
            packet_id: header.packet_id,
            chunk_count,
        })
    }

    /// Stop the simulator; subsequent submissions fail with `SimulatorDown`
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(());
        self.shared.endpoints.clear();
        info!("Network simulator shut down");
    }

    /// Spawn the periodic reassembly-buffer sweeper
    fn spawn_sweeper(&self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        let timeout = shared.snapshot().reassembly_timeout();
                        let states: Vec<Arc<EndpointState>> = shared
                            .endpoints
                            .iter()
                            .map(|entry| entry.value().clone())
                            .collect();
                        for state in states {
                            let mut reassembler = state.reassembler.lock().await;
                            reassembler.set_timeout(timeout);
                            let expired = reassembler.sweep();
                            for packet_id in expired {
                                shared.stats.record_reassembly_expired();
                                debug!(packet = %packet_id, "Reassembly buffer expired");
                            }
                        }
                    }
                }
            }
        })
    }
}

/// Sample the one-way delay for a chunk under a config snapshot
fn sample_delay(config: &SimConfig) -> Duration {
    let mut rng = rand::rng();
    let mut delay_ms = config.base_latency_ms;
    if config.latency_jitter_ms > 0 {
        delay_ms += rng.random_range(0..=config.latency_jitter_ms);
    }
    if config.enable_reordering && config.reorder_window_ms > 0 {
        delay_ms += rng.random_range(0..=config.reorder_window_ms);
    }
    Duration::from_millis(delay_ms)
}

/// Feedback delay: base latency plus jitter, no reorder component
fn feedback_delay(config: &SimConfig) -> Duration {
    let mut delay_ms = config.base_latency_ms;
    if config.latency_jitter_ms > 0 {
        delay_ms += rand::rng().random_range(0..=config.latency_jitter_ms);
    }
    Duration::from_millis(delay_ms)
}

/// Carry one chunk across the link
async fn deliver_chunk(
    shared: Arc<SimShared>,
    config: Arc<SimConfig>,
    src: NodeId,
    dst: NodeId,
    chunk: Chunk,
) {
    shared
        .bucket
        .acquire(chunk.wire_size(), config.bandwidth_bytes_per_sec)
        .await;
    tokio::time::sleep(sample_delay(&config)).await;

    let Some(state) = shared.endpoints.get(&dst).map(|e| e.value().clone()) else {
        return; // Destination vanished mid-flight.
    };

    let packet_id = chunk.packet_id;
    let completed = {
        let mut reassembler = state.reassembler.lock().await;
        match reassembler.offer(chunk) {
            Ok(completed) => completed,
            Err(e) => {
                warn!(packet = %packet_id, error = %e, "Chunk rejected at reassembly");
                return;
            }
        }
    };

    if let Some(frame) = completed {
        shared.stats.record_delivered();
        trace!(packet = %packet_id, dst = %dst, "Frame reassembled and delivered");
        if state
            .inbox
            .send(DeliveryEvent::Packet { src, bytes: frame })
            .await
            .is_err()
        {
            return; // Receiver hung up; no one left to ACK for.
        }

        // One ACK per logical packet, routed back to the sender with the
        // same latency envelope as data.
        tokio::time::sleep(feedback_delay(&config)).await;
        if let Some(sender) = shared.endpoints.get(&src).map(|e| e.value().clone()) {
            shared.stats.record_ack();
            let _ = sender.inbox.send(DeliveryEvent::Ack { packet_id }).await;
        }
    }
}

/// Report one lost chunk back to its sender
async fn nak_chunk(
    shared: Arc<SimShared>,
    config: Arc<SimConfig>,
    src: NodeId,
    packet_id: Uuid,
    chunk_index: u16,
) {
    tokio::time::sleep(feedback_delay(&config)).await;
    if let Some(sender) = shared.endpoints.get(&src).map(|e| e.value().clone()) {
        shared.stats.record_nak();
        let _ = sender
            .inbox
            .send(DeliveryEvent::Nak {
                packet_id,
                chunk_index,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capmesh_core::{NONCE_LEN, Packet, PacketType, TAG_LEN};

    fn make_test_frame(payload_len: usize) -> (Uuid, Vec<u8>) {
        let mut ciphertext = vec![0x5A; payload_len];
        ciphertext.extend_from_slice(&[0xAA; TAG_LEN]);
        let packet = Packet::new(
            PacketType::Query,
            NodeId::from_name("mini-1"),
            NodeId::from_name("main"),
            [1u8; NONCE_LEN],
            ciphertext,
        );
        let frame = capmesh_codec::encode(&packet).unwrap();
        (packet.packet_id, frame)
    }

    #[tokio::test]
    async fn test_single_chunk_delivery_and_ack() {
        let sim = Simulator::new(SimConfig::ideal());
        let mini = NodeId::from_name("mini-1");
        let main = NodeId::from_name("main");
        let mut mini_ep = sim.register(mini);
        let mut main_ep = sim.register(main);

        let (packet_id, frame) = make_test_frame(64);
        let receipt = sim.submit(mini, main, frame.clone()).unwrap();
        assert_eq!(receipt.packet_id, packet_id);
        assert_eq!(receipt.chunk_count, 1);

        let event = main_ep.recv().await.unwrap();
        assert_eq!(
            event,
            DeliveryEvent::Packet {
                src: mini,
                bytes: frame
            }
        );

        let event = mini_ep.recv().await.unwrap();
        assert_eq!(event, DeliveryEvent::Ack { packet_id });
    }

    #[tokio::test]
    async fn test_fragmented_delivery_reassembles() {
        let mut config = SimConfig::ideal();
        config.max_chunk_size_bytes = 100;
        config.enable_reordering = true;
        config.reorder_window_ms = 10;
        let sim = Simulator::new(config);

        let mini = NodeId::from_name("mini-1");
        let main = NodeId::from_name("main");
        let _mini_ep = sim.register(mini);
        let mut main_ep = sim.register(main);

        let (_, frame) = make_test_frame(900);
        let receipt = sim.submit(mini, main, frame.clone()).unwrap();
        assert!(receipt.chunk_count > 1);

        let event = main_ep.recv().await.unwrap();
        match event {
            DeliveryEvent::Packet { bytes, .. } => assert_eq!(bytes, frame),
            other => panic!("expected packet, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_total_loss_naks_every_chunk() {
        let mut config = SimConfig::offline();
        config.base_latency_ms = 1;
        config.latency_jitter_ms = 0;
        config.max_chunk_size_bytes = 100;
        let sim = Simulator::new(config);

        let mini = NodeId::from_name("mini-1");
        let main = NodeId::from_name("main");
        let mut mini_ep = sim.register(mini);
        let mut main_ep = sim.register(main);

        let (packet_id, frame) = make_test_frame(250);
        let receipt = sim.submit(mini, main, frame).unwrap();

        let mut nak_indices = Vec::new();
        for _ in 0..receipt.chunk_count {
            match mini_ep.recv().await.unwrap() {
                DeliveryEvent::Nak {
                    packet_id: id,
                    chunk_index,
                } => {
                    assert_eq!(id, packet_id);
                    nak_indices.push(chunk_index);
                }
                other => panic!("expected NAK, got {other:?}"),
            }
        }
        nak_indices.sort_unstable();
        assert_eq!(nak_indices.len(), receipt.chunk_count as usize);

        // Nothing must reach the destination.
        let nothing =
            tokio::time::timeout(Duration::from_millis(100), main_ep.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_oversized_rejected_synchronously() {
        let mut config = SimConfig::ideal();
        config.max_chunk_size_bytes = 100;
        config.auto_chunk_large_payloads = false;
        let sim = Simulator::new(config);

        let mini = NodeId::from_name("mini-1");
        let main = NodeId::from_name("main");
        sim.register(mini);
        sim.register(main);

        let (_, frame) = make_test_frame(500);
        let result = sim.submit(mini, main, frame);
        assert!(matches!(result, Err(TransportError::Oversized { .. })));
        assert_eq!(sim.stats().oversized_rejected, 1);
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let sim = Simulator::new(SimConfig::ideal());
        let mini = NodeId::from_name("mini-1");
        sim.register(mini);

        let ghost = NodeId::from_name("ghost");
        let (_, frame) = make_test_frame(64);
        let result = sim.submit(mini, ghost, frame);
        assert_eq!(result, Err(TransportError::UnknownDestination(ghost)));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_fails() {
        let sim = Simulator::new(SimConfig::ideal());
        let mini = NodeId::from_name("mini-1");
        let main = NodeId::from_name("main");
        sim.register(mini);
        sim.register(main);
        sim.shutdown();

        let (_, frame) = make_test_frame(64);
        assert_eq!(
            sim.submit(mini, main, frame),
            Err(TransportError::SimulatorDown)
        );
    }

    #[tokio::test]
    async fn test_runtime_config_update() {
        let sim = Simulator::new(SimConfig::ideal());
        assert_eq!(sim.config_snapshot().loss_probability, 0.0);

        sim.update_config(|cfg| cfg.loss_probability = 1.0);
        assert_eq!(sim.config_snapshot().loss_probability, 1.0);

        sim.update_config(|cfg| cfg.loss_probability = 0.0);
        assert_eq!(sim.config_snapshot().loss_probability, 0.0);
    }

    #[tokio::test]
    async fn test_retransmission_is_fresh_fragmentation() {
        let mut config = SimConfig::ideal();
        config.max_chunk_size_bytes = 100;
        let sim = Simulator::new(config);

        let mini = NodeId::from_name("mini-1");
        let main = NodeId::from_name("main");
        let mut mini_ep = sim.register(mini);
        let mut main_ep = sim.register(main);

        let (packet_id, frame) = make_test_frame(250);
        sim.submit(mini, main, frame.clone()).unwrap();
        let first = main_ep.recv().await.unwrap();

        // Same packet id, same bytes, new independent transmission.
        sim.submit(mini, main, frame.clone()).unwrap();
        let second = main_ep.recv().await.unwrap();
        assert_eq!(first, second);

        // Both attempts are ACKed; duplicates are idempotent for the queue.
        for _ in 0..2 {
            assert_eq!(
                mini_ep.recv().await.unwrap(),
                DeliveryEvent::Ack { packet_id }
            );
        }
    }
}
