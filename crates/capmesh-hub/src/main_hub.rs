//! Main hub: the authoritative capsule generator
//!
//! Receives decrypted QUERY frames, answers them (from its own store when a
//! fresh capsule already exists, otherwise through the injected `Answer`
//! capability), binds the answer into a signed capsule, stores it durably,
//! and replies. Requests are deduplicated by `packet_id` within a window so
//! retransmitted queries are answered idempotently.
//!
//! The reply reuses the query's `packet_id`, which is how mini hubs match
//! replies to requests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use capmesh_codec::{WireError, open_packet, seal_body};
use capmesh_core::{
    CapsulePayload, CapsuleRequestPayload, KnowledgeCapsule, Manifest, NodeId, PayloadBody,
    QueryPayload, question_hash,
};
use capmesh_crypto::{CryptoError, NodeSigner, PeerKeyProvider};
use capmesh_gossip::{GossipConfig, GossipResult, ManifestBroadcaster};
use capmesh_netsim::{DeliveryEvent, SimEndpoint, Simulator};
use capmesh_store::{CapsuleStore, SweeperTask};

use crate::answer::AnswerProvider;
use crate::error::HubResult;
use crate::metrics::HubMetrics;

/// Main hub configuration
#[derive(Debug, Clone)]
pub struct MainHubConfig {
    /// TTL stamped on every produced capsule
    pub capsule_ttl_seconds: u64,
    /// How long a `packet_id` stays deduplicated
    pub dedup_window: Duration,
    /// TTL sweep cadence
    pub sweep_interval: Duration,
    /// Manifest broadcast timing
    pub gossip: GossipConfig,
}

impl Default for MainHubConfig {
    fn default() -> Self {
        Self {
            capsule_ttl_seconds: 86_400,
            dedup_window: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            gossip: GossipConfig::default(),
        }
    }
}

impl MainHubConfig {
    /// Tight timings for tests
    pub fn fast() -> Self {
        Self {
            sweep_interval: Duration::from_millis(500),
            gossip: GossipConfig::fast(),
            ..Default::default()
        }
    }
}

/// A capsule already produced for a request packet
#[derive(Debug, Clone)]
struct DedupRecord {
    capsule_id: Uuid,
    confidence: f32,
    produced_at: Instant,
}

/// The authoritative node that creates and signs capsules
pub struct MainHub<S: CapsuleStore + 'static> {
    node_id: NodeId,
    config: MainHubConfig,
    store: Arc<S>,
    signer: Arc<NodeSigner>,
    keys: Arc<dyn PeerKeyProvider>,
    sim: Simulator,
    answer: Arc<dyn AnswerProvider>,
    dedup: DashMap<Uuid, DedupRecord>,
    broadcaster: Arc<ManifestBroadcaster<S>>,
    metrics: Arc<HubMetrics>,
    healthy: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<S: CapsuleStore + 'static> MainHub<S> {
    /// Start a main hub: register with the simulator and spawn its workers
    pub async fn start(
        config: MainHubConfig,
        store: Arc<S>,
        signer: Arc<NodeSigner>,
        keys: Arc<dyn PeerKeyProvider>,
        sim: Simulator,
        answer: Arc<dyn AnswerProvider>,
    ) -> HubResult<Arc<Self>> {
        let node_id = signer.source_id();

        for warning in config.gossip.validate_against_ttl(config.capsule_ttl_seconds) {
            warn!(node = %node_id, %warning, "Gossip timing violates convergence headroom");
        }

        let endpoint = sim.register(node_id);
        let broadcaster = ManifestBroadcaster::new(
            node_id,
            store.clone(),
            signer.clone(),
            keys.clone(),
            sim.clone(),
            config.gossip.clone(),
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let hub = Arc::new(Self {
            node_id,
            config,
            store,
            signer,
            keys,
            sim,
            answer,
            dedup: DashMap::new(),
            broadcaster,
            metrics: Arc::new(HubMetrics::default()),
            healthy: AtomicBool::new(true),
            shutdown_tx,
            handles: std::sync::Mutex::new(Vec::new()),
        });

        let mut handles = vec![
            hub.clone().spawn_io_loop(endpoint),
            hub.broadcaster.clone().spawn(hub.shutdown_tx.subscribe()),
            SweeperTask::spawn(
                hub.store.clone(),
                hub.config.sweep_interval,
                hub.shutdown_tx.subscribe(),
            ),
        ];
        if let Ok(mut guard) = hub.handles.lock() {
            guard.append(&mut handles);
        }

        info!(node = %node_id, "Main hub started");
        Ok(hub)
    }

    /// This hub's identity
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Application metrics
    pub fn metrics(&self) -> crate::metrics::MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Whether the hub has hit a fatal durability error
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Subscribe a mini hub to manifest broadcasts
    pub fn add_mini(&self, peer: NodeId) {
        self.broadcaster.add_peer(peer);
    }

    /// Sign and regenerate the manifest on demand
    pub async fn latest_manifest(&self) -> GossipResult<Manifest> {
        self.broadcaster.build_manifest().await
    }

    /// Fresh capsules currently held
    pub async fn list_capsules(&self) -> Vec<KnowledgeCapsule> {
        self.store.fresh_capsules().await
    }

    /// Look up one capsule by id
    pub async fn get_capsule(&self, capsule_id: &Uuid) -> Option<KnowledgeCapsule> {
        self.store.get(capsule_id).await
    }

    /// Pre-load a signed capsule for a known question/answer pair
    ///
    /// Operator seeding; the capsule enters the store like any generated
    /// one and appears in the next manifest.
    pub async fn seed_capsule(&self, question: &str, answer: &str) -> HubResult<KnowledgeCapsule> {
        let capsule = self.sign_capsule(KnowledgeCapsule::bind(
            question,
            answer,
            self.node_id,
            self.config.capsule_ttl_seconds,
        ))?;
        self.store.put(capsule.clone()).await?;
        debug!(node = %self.node_id, capsule = %capsule.capsule_id, "Capsule seeded");
        Ok(capsule)
    }

    /// Attach this hub's signature to a capsule
    fn sign_capsule(&self, capsule: KnowledgeCapsule) -> HubResult<KnowledgeCapsule> {
        let canonical = capsule.canonical_bytes()?;
        let signature = self.signer.sign(&canonical);
        Ok(capsule.with_signature(signature))
    }

    /// Spawn the transport event loop
    fn spawn_io_loop(self: Arc<Self>, mut endpoint: SimEndpoint) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(node = %self.node_id, "Main hub I/O loop shutting down");
                        break;
                    }
                    event = endpoint.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            DeliveryEvent::Packet { src, bytes } => {
                                self.handle_frame(src, bytes).await;
                            }
                            // Replies are fire-and-forget: a lost reply is
                            // recovered by the mini hub's retransmitted
                            // query hitting the dedup window.
                            DeliveryEvent::Ack { packet_id } => {
                                trace!(node = %self.node_id, packet = %packet_id, "Reply ACKed");
                            }
                            DeliveryEvent::Nak { packet_id, chunk_index } => {
                                trace!(
                                    node = %self.node_id,
                                    packet = %packet_id,
                                    chunk = chunk_index,
                                    "Reply chunk lost"
                                );
                            }
                        }
                    }
                }
            }
        })
    }

    /// Decode, decrypt, and dispatch one inbound frame
    async fn handle_frame(&self, src: NodeId, bytes: Vec<u8>) {
        let packet = match capmesh_codec::decode(&bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "Undecodable frame dropped");
                return;
            }
        };

        let key = match self.keys.key_for(&src) {
            Ok(key) => key,
            Err(e) => {
                warn!(node = %self.node_id, peer = %src, error = %e, "No key for peer, frame dropped");
                return;
            }
        };

        let body = match open_packet(&packet, &key) {
            Ok(body) => body,
            Err(WireError::Crypto(CryptoError::DecryptFailed)) => {
                self.metrics.record_decrypt_fail();
                warn!(node = %self.node_id, packet = %packet.packet_id, "Payload decryption failed, frame dropped");
                return;
            }
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "Unusable frame dropped");
                return;
            }
        };

        match body {
            PayloadBody::Query(payload) => {
                self.handle_query(packet.packet_id, payload).await;
            }
            PayloadBody::CapsuleRequest(payload) => {
                self.handle_capsule_request(packet.packet_id, payload).await;
            }
            other => {
                trace!(node = %self.node_id, body = ?other.packet_type(), "Unexpected body at main hub");
            }
        }
    }

    /// Answer one query frame
    async fn handle_query(&self, packet_id: Uuid, query: QueryPayload) {
        self.purge_dedup();

        // Idempotent response for a retransmitted request.
        if let Some(record) = self.dedup.get(&packet_id).map(|r| r.clone()) {
            if let Some(capsule) = self.store.get(&record.capsule_id).await {
                self.metrics.record_dedup_hit();
                debug!(node = %self.node_id, packet = %packet_id, "Dedup window hit, resending capsule");
                self.send_capsule(
                    query.reply_to,
                    packet_id,
                    CapsulePayload::new(capsule, record.confidence),
                );
                return;
            }
        }

        // Reuse a fresh capsule for the same normalized question.
        let hash = question_hash(&query.question);
        if let Some(capsule) = self.store.find_by_hash(&hash).await {
            trace!(node = %self.node_id, capsule = %capsule.capsule_id, "Reusing fresh capsule");
            self.remember(packet_id, &capsule, 1.0);
            self.send_capsule(query.reply_to, packet_id, CapsulePayload::new(capsule, 1.0));
            return;
        }

        // Generate, bind, sign, store, reply.
        match self.answer.answer(&query.question).await {
            Ok(generated) => {
                let capsule = match self.sign_capsule(KnowledgeCapsule::bind(
                    &query.question,
                    &generated.text,
                    self.node_id,
                    self.config.capsule_ttl_seconds,
                )) {
                    Ok(capsule) => capsule,
                    Err(e) => {
                        warn!(node = %self.node_id, error = %e, "Capsule signing failed");
                        return;
                    }
                };

                match self.store.put(capsule.clone()).await {
                    Ok(_) => {
                        self.metrics.record_answer_generated();
                        info!(
                            node = %self.node_id,
                            capsule = %capsule.capsule_id,
                            user = %query.user_id,
                            "Capsule generated"
                        );
                        self.remember(packet_id, &capsule, generated.confidence);
                        self.send_capsule(
                            query.reply_to,
                            packet_id,
                            CapsulePayload::new(capsule, generated.confidence),
                        );
                    }
                    Err(e) => {
                        // A capsule that is not durable must not be
                        // acknowledged as knowledge.
                        self.healthy.store(false, Ordering::Release);
                        tracing::error!(node = %self.node_id, error = %e, "Capsule store write failed");
                        self.send_error(query.reply_to, packet_id, &query.question, "STORE_IO_FAIL");
                    }
                }
            }
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "Answer generation failed");
                self.send_error(query.reply_to, packet_id, &query.question, "ANSWER_FAIL");
            }
        }
    }

    /// Serve one capsule fetched during selective sync
    async fn handle_capsule_request(&self, packet_id: Uuid, request: CapsuleRequestPayload) {
        match self.store.get(&request.capsule_id).await {
            Some(capsule) => {
                self.metrics.record_capsule_request_served();
                trace!(
                    node = %self.node_id,
                    capsule = %request.capsule_id,
                    peer = %request.reply_to,
                    "Serving capsule request"
                );
                self.send_capsule(
                    request.reply_to,
                    packet_id,
                    CapsulePayload::new(capsule, 1.0),
                );
            }
            None => {
                debug!(
                    node = %self.node_id,
                    capsule = %request.capsule_id,
                    "Capsule request for unknown id ignored"
                );
            }
        }
    }

    /// Reply with a signed ERROR capsule (empty answer, zero TTL)
    fn send_error(&self, dst: NodeId, packet_id: Uuid, question: &str, code: &str) {
        let capsule = match self.sign_capsule(KnowledgeCapsule::bind(question, "", self.node_id, 0))
        {
            Ok(capsule) => capsule,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "Error capsule signing failed");
                return;
            }
        };
        self.send_capsule(dst, packet_id, CapsulePayload::error(capsule, code));
    }

    /// Seal and submit a capsule reply carrying the request's packet id
    fn send_capsule(&self, dst: NodeId, packet_id: Uuid, payload: CapsulePayload) {
        let body = PayloadBody::Capsule(payload);
        let key = match self.keys.key_for(&dst) {
            Ok(key) => key,
            Err(e) => {
                warn!(node = %self.node_id, peer = %dst, error = %e, "No key for reply peer");
                return;
            }
        };

        let packet = match seal_body(&body, self.node_id, dst, &key) {
            Ok(packet) => packet.with_packet_id(packet_id),
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "Reply sealing failed");
                return;
            }
        };
        let frame = match capmesh_codec::encode(&packet) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node = %self.node_id, error = %e, "Reply encoding failed");
                return;
            }
        };

        if let Err(e) = self.sim.submit(self.node_id, dst, frame) {
            debug!(node = %self.node_id, peer = %dst, error = %e, "Reply submission failed");
        }
    }

    /// Record a produced capsule for idempotent re-responses
    fn remember(&self, packet_id: Uuid, capsule: &KnowledgeCapsule, confidence: f32) {
        self.dedup.insert(
            packet_id,
            DedupRecord {
                capsule_id: capsule.capsule_id,
                confidence,
                produced_at: Instant::now(),
            },
        );
    }

    /// Drop dedup records older than the window
    fn purge_dedup(&self) {
        let window = self.config.dedup_window;
        self.dedup.retain(|_, record| record.produced_at.elapsed() < window);
    }

    /// Stop all workers and deregister from the simulator
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        self.sim.unregister(&self.node_id);

        let handles = self
            .handles
            .lock()
            .map(|mut guard| guard.drain(..).collect::<Vec<_>>())
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }
        info!(node = %self.node_id, "Main hub stopped");
    }
}
