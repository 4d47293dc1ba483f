//! Manifest-driven selective sync (mini-hub side)
//!
//! Consumes verified manifests, diffs them against the local store, and
//! fetches only the missing capsules. Requests are rate-limited to
//! `max_inflight_sync` outstanding per peer; the periodic re-evaluation
//! loop re-issues anything still missing, so convergence survives loss.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use capmesh_core::{CapsuleRequestPayload, Manifest, NodeId, PayloadBody};
use capmesh_crypto::{PeerKeyProvider, TrustStore};
use capmesh_netsim::Simulator;
use capmesh_store::CapsuleStore;

use crate::config::GossipConfig;
use crate::error::{GossipError, GossipResult};

/// An outstanding capsule request
#[derive(Debug, Clone)]
struct InflightRequest {
    peer: NodeId,
    requested_at: Instant,
}

/// Pulls missing capsules named by trusted manifests
pub struct GossipSyncer<S: CapsuleStore + 'static> {
    node_id: NodeId,
    store: Arc<S>,
    trust: Arc<TrustStore>,
    keys: Arc<dyn PeerKeyProvider>,
    sim: Simulator,
    config: GossipConfig,
    /// Newest manifest seen per trusted source
    latest: DashMap<NodeId, Manifest>,
    /// Outstanding requests by capsule id
    inflight: DashMap<Uuid, InflightRequest>,
    /// Overflow beyond the inflight budget, in discovery order
    queued: Mutex<VecDeque<(Uuid, NodeId)>>,
    /// Membership view of `queued`
    queued_ids: DashSet<Uuid>,
}

impl<S: CapsuleStore + 'static> GossipSyncer<S> {
    /// Create a syncer for a mini hub
    pub fn new(
        node_id: NodeId,
        store: Arc<S>,
        trust: Arc<TrustStore>,
        keys: Arc<dyn PeerKeyProvider>,
        sim: Simulator,
        config: GossipConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            store,
            trust,
            keys,
            sim,
            config,
            latest: DashMap::new(),
            inflight: DashMap::new(),
            queued: Mutex::new(VecDeque::new()),
            queued_ids: DashSet::new(),
        })
    }

    /// Ingest a manifest received off the wire
    ///
    /// Verifies the signature against the trust store, keeps the newest
    /// manifest per source by `generated_at`, and kicks off a sync pass.
    pub async fn handle_manifest(&self, manifest: Manifest) -> GossipResult<()> {
        if !self.trust.is_trusted(&manifest.source_id) {
            return Err(GossipError::UntrustedSource(manifest.source_id));
        }

        let canonical = manifest
            .canonical_bytes()
            .map_err(|e| GossipError::Serialization(e.to_string()))?;
        self.trust
            .verify(&manifest.source_id, &canonical, &manifest.signature)
            .map_err(|_| GossipError::ManifestSigInvalid(manifest.source_id))?;

        let source = manifest.source_id;
        let stale = self
            .latest
            .get(&source)
            .map(|held| held.generated_at >= manifest.generated_at)
            .unwrap_or(false);
        if stale {
            trace!(source = %source, "Ignoring manifest older than the one held");
            return Ok(());
        }

        debug!(
            source = %source,
            entries = manifest.len(),
            "Accepted manifest"
        );
        self.latest.insert(source, manifest);
        self.evaluate().await;
        Ok(())
    }

    /// A capsule arrived and was stored; release its request slot
    pub async fn on_capsule_stored(&self, capsule_id: Uuid) {
        if self.inflight.remove(&capsule_id).is_some() {
            trace!(capsule = %capsule_id, "Sync request fulfilled");
        }
        self.queued_ids.remove(&capsule_id);
        self.issue_requests().await;
    }

    /// Number of requests currently outstanding
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Diff the newest trusted manifest against the store and queue fetches
    ///
    /// Policy: act on the manifest with the newest `generated_at` among
    /// trusted signers.
    pub async fn evaluate(&self) {
        let Some(newest) = self
            .latest
            .iter()
            .max_by_key(|entry| entry.generated_at)
            .map(|entry| entry.value().clone())
        else {
            return;
        };

        let source = newest.source_id;
        let mut discovered = 0usize;
        for entry in &newest.entries {
            let id = entry.capsule_id;
            if self.inflight.contains_key(&id) || self.queued_ids.contains(&id) {
                continue;
            }
            if self.store.get(&id).await.is_some() {
                continue;
            }
            self.queued_ids.insert(id);
            self.queued.lock().await.push_back((id, source));
            discovered += 1;
        }

        if discovered > 0 {
            debug!(missing = discovered, source = %source, "Manifest diff found missing capsules");
        }
        self.issue_requests().await;
    }

    /// Issue queued requests up to the inflight budget
    async fn issue_requests(&self) {
        loop {
            if self.inflight.len() >= self.config.max_inflight_sync {
                return;
            }
            let Some((capsule_id, peer)) = self.queued.lock().await.pop_front() else {
                return;
            };
            self.queued_ids.remove(&capsule_id);

            // May have arrived while queued (e.g. as a query response).
            if self.store.get(&capsule_id).await.is_some() {
                continue;
            }

            match self.send_request(capsule_id, peer) {
                Ok(()) => {
                    self.inflight.insert(
                        capsule_id,
                        InflightRequest {
                            peer,
                            requested_at: Instant::now(),
                        },
                    );
                    trace!(capsule = %capsule_id, peer = %peer, "Capsule request issued");
                }
                Err(e) => {
                    // Next evaluation rediscovers the id from the manifest.
                    debug!(capsule = %capsule_id, error = %e, "Capsule request failed");
                }
            }
        }
    }

    fn send_request(&self, capsule_id: Uuid, peer: NodeId) -> GossipResult<()> {
        let body = PayloadBody::CapsuleRequest(CapsuleRequestPayload {
            capsule_id,
            reply_to: self.node_id,
        });
        let key = self.keys.key_for(&peer)?;
        let (_, frame) = capmesh_codec::seal_frame(&body, self.node_id, peer, &key)?;
        self.sim.submit(self.node_id, peer, frame)?;
        Ok(())
    }

    /// Reclaim slots from requests that have been outstanding too long
    fn expire_stale(&self) {
        let timeout = self.config.request_timeout;
        let stale: Vec<Uuid> = self
            .inflight
            .iter()
            .filter(|r| r.requested_at.elapsed() > timeout)
            .map(|r| *r.key())
            .collect();

        for capsule_id in stale {
            if let Some((_, request)) = self.inflight.remove(&capsule_id) {
                warn!(
                    capsule = %capsule_id,
                    peer = %request.peer,
                    "Capsule request timed out, slot reclaimed"
                );
            }
        }
    }

    /// Spawn the periodic sync loop
    ///
    /// The loop drives convergence under loss: manifests or capsules that
    /// went missing are re-requested on every tick.
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_ms = self.config.gossip_interval.as_millis() as u64,
                "Gossip syncer started"
            );
            let mut ticker = tokio::time::interval(self.config.gossip_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Gossip syncer shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.expire_stale();
                        self.evaluate().await;
                    }
                }
            }
        })
    }
}
