//! Mini hub: the edge query engine
//!
//! Serves user questions from the local capsule cache and forwards misses
//! to the authoritative hub over the simulated link. A forwarded query is
//! tracked by the retransmit queue until the transport ACKs it; the reply
//! capsule is matched back to its query by `packet_id` and handed to the
//! waiting caller.
//!
//! Workers (all shut down together): the I/O loop consuming transport
//! events, the retransmission worker draining the queue, the gossip syncer,
//! and the TTL sweeper.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use capmesh_codec::{WireError, open_packet, seal_frame};
use capmesh_core::{
    ApplicationError, CapsulePayload, KnowledgeCapsule, NodeId, PayloadBody, QueryPayload,
    question_hash,
};
use capmesh_crypto::{CryptoError, PeerKeyProvider, TrustStore};
use capmesh_gossip::{GossipConfig, GossipSyncer};
use capmesh_netsim::{DeliveryEvent, SimEndpoint, Simulator};
use capmesh_store::{CapsuleStore, StoreError, SweeperTask};

use crate::answer::SimilarityScorer;
use crate::error::HubResult;
use crate::metrics::HubMetrics;
use crate::queue::{EntryStatus, RetransmitQueue, RetryPolicy};

/// Result of a user query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// Answered from the local cache
    CacheHit(KnowledgeCapsule),
    /// Answered by the authoritative hub within the reply window
    Fresh(KnowledgeCapsule),
    /// Still in the retransmit queue when the reply window closed
    Queued(Uuid),
    /// Terminally unanswerable right now
    Unavailable {
        /// Machine-readable code (`offline`, `ANSWER_FAIL`, ...)
        code: String,
        /// Human-readable explanation
        message: String,
    },
}

/// What the I/O loop reports back to a waiting `query` call
#[derive(Debug)]
enum CapsuleOutcome {
    Fresh(KnowledgeCapsule),
    Unavailable { code: String, message: String },
}

/// Mini hub configuration
#[derive(Debug, Clone)]
pub struct MiniHubConfig {
    /// Node name; the identity is derived from it
    pub name: String,
    /// The authoritative hub queries are forwarded to
    pub main_hub: NodeId,
    /// Per-call reply window for `query`
    pub reply_timeout: Duration,
    /// Retransmission policy for forwarded queries
    pub retry: RetryPolicy,
    /// Upper bound on question size in bytes
    pub max_question_bytes: usize,
    /// Score floor for the optional similarity cache path
    pub similarity_threshold: f64,
    /// TTL sweep cadence
    pub sweep_interval: Duration,
    /// Gossip sync timing
    pub gossip: GossipConfig,
    /// Where to persist the retransmit queue; in-memory when unset
    pub queue_dir: Option<PathBuf>,
}

impl MiniHubConfig {
    /// Defaults for a node of the given name
    pub fn new(name: &str, main_hub: NodeId) -> Self {
        Self {
            name: name.to_string(),
            main_hub,
            reply_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            max_question_bytes: 8 * 1024,
            similarity_threshold: 0.78,
            sweep_interval: Duration::from_secs(60),
            gossip: GossipConfig::default(),
            queue_dir: None,
        }
    }

    /// Tight timings for tests
    pub fn fast(name: &str, main_hub: NodeId) -> Self {
        Self {
            reply_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                base_backoff: Duration::from_millis(50),
                multiplier: 2.0,
                max_retries: 6,
                ack_timeout: Duration::from_millis(200),
            },
            sweep_interval: Duration::from_millis(500),
            gossip: GossipConfig::fast(),
            ..Self::new(name, main_hub)
        }
    }
}

/// How often the retransmission worker polls for due work.
const RETRANSMIT_TICK: Duration = Duration::from_millis(25);

/// An edge node serving queries from cache and forwarding misses
pub struct MiniHub<S: CapsuleStore + 'static> {
    node_id: NodeId,
    config: MiniHubConfig,
    store: Arc<S>,
    trust: Arc<TrustStore>,
    keys: Arc<dyn PeerKeyProvider>,
    sim: Simulator,
    queue: Arc<RetransmitQueue>,
    waiters: Arc<DashMap<Uuid, oneshot::Sender<CapsuleOutcome>>>,
    similarity: Option<Arc<dyn SimilarityScorer>>,
    syncer: Arc<GossipSyncer<S>>,
    metrics: Arc<HubMetrics>,
    healthy: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<S: CapsuleStore + 'static> MiniHub<S> {
    /// Start a mini hub: register with the simulator and spawn its workers
    pub async fn start(
        config: MiniHubConfig,
        store: Arc<S>,
        trust: Arc<TrustStore>,
        keys: Arc<dyn PeerKeyProvider>,
        sim: Simulator,
        similarity: Option<Arc<dyn SimilarityScorer>>,
    ) -> HubResult<Arc<Self>> {
        let node_id = NodeId::from_name(&config.name);

        for warning in config.retry.validate_against(&sim.config_snapshot()) {
            warn!(node = %node_id, %warning, "Retry policy violates the link contract");
        }
        if config.reply_timeout < config.retry.ack_timeout {
            warn!(
                node = %node_id,
                "reply_timeout is shorter than ack_timeout; queries will time out before the first retry"
            );
        }

        let queue = match &config.queue_dir {
            Some(dir) => RetransmitQueue::open(config.retry.clone(), dir)
                .await
                .map_err(capmesh_core::DurabilityError::from)?,
            None => RetransmitQueue::in_memory(config.retry.clone()),
        };

        let endpoint = sim.register(node_id);
        let syncer = GossipSyncer::new(
            node_id,
            store.clone(),
            trust.clone(),
            keys.clone(),
            sim.clone(),
            config.gossip.clone(),
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let hub = Arc::new(Self {
            node_id,
            config,
            store,
            trust,
            keys,
            sim,
            queue: Arc::new(queue),
            waiters: Arc::new(DashMap::new()),
            similarity,
            syncer,
            metrics: Arc::new(HubMetrics::default()),
            healthy: AtomicBool::new(true),
            shutdown_tx,
            handles: std::sync::Mutex::new(Vec::new()),
        });

        let mut handles = vec![
            hub.clone().spawn_io_loop(endpoint),
            hub.clone().spawn_retransmit_worker(),
            hub.syncer.clone().spawn(hub.shutdown_tx.subscribe()),
            SweeperTask::spawn(
                hub.store.clone(),
                hub.config.sweep_interval,
                hub.shutdown_tx.subscribe(),
            ),
        ];
        if let Ok(mut guard) = hub.handles.lock() {
            guard.append(&mut handles);
        }

        info!(node = %node_id, main = %hub.config.main_hub, "Mini hub started");
        Ok(hub)
    }

    /// This hub's identity
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The retransmit queue (exposed for inspection)
    pub fn queue(&self) -> &RetransmitQueue {
        &self.queue
    }

    /// The gossip syncer (exposed for inspection)
    pub fn syncer(&self) -> &Arc<GossipSyncer<S>> {
        &self.syncer
    }

    /// Application metrics
    pub fn metrics(&self) -> crate::metrics::MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Whether the hub has hit a fatal durability error
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Fresh capsules currently held
    pub async fn list_capsules(&self) -> Vec<KnowledgeCapsule> {
        self.store.fresh_capsules().await
    }

    /// Look up one capsule by id
    pub async fn get_capsule(&self, capsule_id: &Uuid) -> Option<KnowledgeCapsule> {
        self.store.get(capsule_id).await
    }

    /// Answer a user question
    ///
    /// Cache first; on miss the question is forwarded to the main hub and
    /// the call waits up to the reply window. A timeout with the queue
    /// entry still working returns `Queued`; retransmission continues in
    /// the background and a late capsule is still cached.
    pub async fn query(
        &self,
        user_id: &str,
        question: &str,
        hint_id: Option<Uuid>,
    ) -> HubResult<QueryResult> {
        if question.trim().is_empty() {
            return Err(ApplicationError::InvalidQuestion("question is empty".into()).into());
        }
        if question.len() > self.config.max_question_bytes {
            return Err(ApplicationError::InvalidQuestion(format!(
                "question exceeds {} bytes",
                self.config.max_question_bytes
            ))
            .into());
        }

        if let Some(capsule) = self.cache_lookup(question, hint_id).await {
            self.metrics.record_cache_hit();
            debug!(node = %self.node_id, capsule = %capsule.capsule_id, "Cache hit");
            return Ok(QueryResult::CacheHit(capsule));
        }

        // Miss: forward to the authoritative hub.
        let mut payload = QueryPayload::new(user_id, question, self.node_id);
        if let Some(hint) = hint_id {
            payload = payload.with_hint(hint);
        }
        let body = PayloadBody::Query(payload);
        let key = self.keys.key_for(&self.config.main_hub)?;
        let (packet, frame) = seal_frame(&body, self.node_id, self.config.main_hub, &key)?;
        let packet_id = packet.packet_id;

        let (tx, rx) = oneshot::channel();
        self.waiters.insert(packet_id, tx);

        if let Err(e) = self
            .sim
            .submit(self.node_id, self.config.main_hub, frame.clone())
        {
            self.waiters.remove(&packet_id);
            return Err(e.into());
        }
        self.queue
            .enqueue_in_flight(packet_id, self.config.main_hub, frame)
            .await;
        self.metrics.record_query_forwarded();
        debug!(node = %self.node_id, packet = %packet_id, "Query forwarded");

        match tokio::time::timeout(self.config.reply_timeout, rx).await {
            Ok(Ok(CapsuleOutcome::Fresh(capsule))) => Ok(QueryResult::Fresh(capsule)),
            Ok(Ok(CapsuleOutcome::Unavailable { code, message })) => {
                self.metrics.record_unavailable();
                Ok(QueryResult::Unavailable { code, message })
            }
            Ok(Err(_)) => {
                // I/O loop went away (shutdown) without resolving us.
                self.waiters.remove(&packet_id);
                Ok(QueryResult::Unavailable {
                    code: "shutdown".into(),
                    message: "hub is shutting down".into(),
                })
            }
            Err(_) => {
                // Reply window closed. The queue entry keeps working.
                self.waiters.remove(&packet_id);
                if self.queue.status(&packet_id) == Some(EntryStatus::Failed) {
                    self.metrics.record_unavailable();
                    Ok(QueryResult::Unavailable {
                        code: "offline".into(),
                        message: "retry budget exhausted without reaching the main hub".into(),
                    })
                } else {
                    self.metrics.record_queued_timeout();
                    Ok(QueryResult::Queued(packet_id))
                }
            }
        }
    }

    /// Hint, hash, and similarity cache paths, in that order
    async fn cache_lookup(&self, question: &str, hint_id: Option<Uuid>) -> Option<KnowledgeCapsule> {
        let hash = question_hash(question);

        if let Some(hint) = hint_id {
            if let Some(capsule) = self.store.get(&hint).await {
                if capsule.is_fresh() && !capsule.is_error() && capsule.question_hash == hash {
                    return Some(capsule);
                }
            }
        }

        if let Some(capsule) = self.store.find_by_hash(&hash).await {
            return Some(capsule);
        }

        // Optional injected similarity matcher over the fresh candidates.
        let scorer = self.similarity.as_ref()?;
        let threshold = self.config.similarity_threshold;
        self.store
            .fresh_capsules()
            .await
            .into_iter()
            .filter(|c| !c.is_error())
            .map(|c| (scorer.score(question, &c.question_text), c))
            .filter(|(score, _)| *score >= threshold)
            .max_by(|(a, _), (b, _)| a.total_cmp(b))
            .map(|(_, c)| c)
    }

    /// Spawn the transport event loop
    fn spawn_io_loop(self: Arc<Self>, mut endpoint: SimEndpoint) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(node = %self.node_id, "Mini hub I/O loop shutting down");
                        break;
                    }
                    event = endpoint.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            DeliveryEvent::Packet { src, bytes } => {
                                self.handle_frame(src, bytes).await;
                            }
                            DeliveryEvent::Ack { packet_id } => {
                                let outcome = self.queue.on_ack(packet_id).await;
                                if outcome.drained > 0 {
                                    debug!(
                                        node = %self.node_id,
                                        drained = outcome.drained,
                                        "Reconciliation drain after link recovery"
                                    );
                                }
                            }
                            DeliveryEvent::Nak { packet_id, chunk_index } => {
                                if let Some(EntryStatus::Failed) =
                                    self.queue.on_nak(packet_id, chunk_index).await
                                {
                                    self.fail_waiter(packet_id);
                                }
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
            PayloadBody::Capsule(payload) => {
                self.handle_capsule(packet.packet_id, payload).await;
            }
            PayloadBody::Manifest(payload) => {
                self.metrics.record_manifest_received();
                if let Err(e) = self.syncer.handle_manifest(payload.manifest).await {
                    warn!(node = %self.node_id, error = %e, "Manifest rejected");
                }
            }
            other => {
                trace!(node = %self.node_id, body = ?other.packet_type(), "Unexpected body at mini hub");
            }
        }
    }

    /// Process a capsule reply or sync response
    async fn handle_capsule(&self, packet_id: Uuid, payload: CapsulePayload) {
        // A reply is proof the query frame arrived, even if its ACK raced
        // or was dropped.
        self.queue.on_ack(packet_id).await;

        let capsule = payload.capsule;

        if payload.error_code.is_some() || capsule.is_error() {
            // ERROR capsules are signed like any other, verified, surfaced,
            // and never cached.
            if self.verify_capsule(&capsule).is_err() {
                self.metrics.record_sig_invalid();
                warn!(node = %self.node_id, packet = %packet_id, "ERROR capsule with bad signature dropped");
                return;
            }
            let code = payload.error_code.unwrap_or_else(|| "ANSWER_FAIL".into());
            debug!(node = %self.node_id, packet = %packet_id, code = %code, "Error capsule received");
            self.resolve_waiter(
                packet_id,
                CapsuleOutcome::Unavailable {
                    message: format!("main hub reported {code}"),
                    code,
                },
            );
            return;
        }

        match self.store.put(capsule.clone()).await {
            Ok(_) => {
                trace!(node = %self.node_id, capsule = %capsule.capsule_id, "Capsule cached");
                self.metrics.record_fresh_received();
                self.syncer.on_capsule_stored(capsule.capsule_id).await;
                self.resolve_waiter(packet_id, CapsuleOutcome::Fresh(capsule));
            }
            Err(StoreError::SigInvalid(_)) | Err(StoreError::UnknownSigner { .. }) => {
                self.metrics.record_sig_invalid();
                warn!(
                    node = %self.node_id,
                    capsule = %capsule.capsule_id,
                    "Capsule rejected: signature invalid"
                );
                // No waiter resolution: a retransmission may still deliver
                // an untampered copy before the reply window closes.
            }
            Err(StoreError::IdCollision(id)) => {
                warn!(node = %self.node_id, capsule = %id, "Capsule rejected: id collision across sources");
            }
            Err(e) => {
                // Durability failure: the capsule must not be acknowledged.
                self.healthy.store(false, Ordering::Release);
                tracing::error!(node = %self.node_id, error = %e, "Capsule store write failed");
            }
        }
    }

    fn verify_capsule(&self, capsule: &KnowledgeCapsule) -> Result<(), CryptoError> {
        let canonical = capsule
            .canonical_bytes()
            .map_err(|_| CryptoError::SigInvalid)?;
        self.trust
            .verify(&capsule.source_id, &canonical, &capsule.signature)
    }

    /// Spawn the retransmission worker
    fn spawn_retransmit_worker(self: Arc<Self>) -> JoinHandle<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETRANSMIT_TICK);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!(node = %self.node_id, "Retransmission worker shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        let scan = self.queue.scan().await;
                        for (packet_id, destination, bytes) in scan.due {
                            match self.sim.submit(self.node_id, destination, bytes) {
                                Ok(_) => {
                                    trace!(node = %self.node_id, packet = %packet_id, "Retransmitted");
                                }
                                Err(e) => {
                                    debug!(node = %self.node_id, packet = %packet_id, error = %e, "Retransmission submit failed");
                                    if let Some(EntryStatus::Failed) =
                                        self.queue.on_send_failure(packet_id).await
                                    {
                                        self.fail_waiter(packet_id);
                                    }
                                }
                            }
                        }
                        for packet_id in scan.failed {
                            self.fail_waiter(packet_id);
                        }
                    }
                }
            }
        })
    }

    /// Resolve a waiting query call, if it is still waiting
    fn resolve_waiter(&self, packet_id: Uuid, outcome: CapsuleOutcome) {
        if let Some((_, tx)) = self.waiters.remove(&packet_id) {
            let _ = tx.send(outcome);
        }
    }

    /// Resolve a waiting query call with the terminal offline result
    fn fail_waiter(&self, packet_id: Uuid) {
        self.resolve_waiter(
            packet_id,
            CapsuleOutcome::Unavailable {
                code: "offline".into(),
                message: "retry budget exhausted without reaching the main hub".into(),
            },
        );
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
        info!(node = %self.node_id, "Mini hub stopped");
    }
}
