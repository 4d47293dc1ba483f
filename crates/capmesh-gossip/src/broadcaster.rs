//! Periodic manifest broadcast (main-hub side)
//!
//! Every `manifest_interval`, signs a fresh manifest of the store's fresh
//! capsules and pushes it to every subscribed mini hub. Broadcast is
//! fire-and-forget; the mini-side poll loop covers losses.

use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use capmesh_core::{Manifest, ManifestPayload, NodeId, PayloadBody};
use capmesh_crypto::{NodeSigner, PeerKeyProvider};
use capmesh_netsim::Simulator;
use capmesh_store::CapsuleStore;

use crate::config::GossipConfig;
use crate::error::{GossipError, GossipResult};

/// Broadcasts signed manifests to subscribed peers
pub struct ManifestBroadcaster<S: CapsuleStore + 'static> {
    node_id: NodeId,
    store: Arc<S>,
    signer: Arc<NodeSigner>,
    keys: Arc<dyn PeerKeyProvider>,
    sim: Simulator,
    peers: Arc<DashSet<NodeId>>,
    config: GossipConfig,
}

impl<S: CapsuleStore + 'static> ManifestBroadcaster<S> {
    /// Create a broadcaster for a main hub
    pub fn new(
        node_id: NodeId,
        store: Arc<S>,
        signer: Arc<NodeSigner>,
        keys: Arc<dyn PeerKeyProvider>,
        sim: Simulator,
        config: GossipConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            store,
            signer,
            keys,
            sim,
            peers: Arc::new(DashSet::new()),
            config,
        })
    }

    /// Subscribe a mini hub to manifest broadcasts
    pub fn add_peer(&self, peer: NodeId) {
        self.peers.insert(peer);
    }

    /// Unsubscribe a mini hub
    pub fn remove_peer(&self, peer: &NodeId) {
        self.peers.remove(peer);
    }

    /// Number of subscribed peers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Build and sign a manifest reflecting the store right now
    pub async fn build_manifest(&self) -> GossipResult<Manifest> {
        let entries = self.store.manifest_entries().await;
        let manifest = Manifest::assemble(self.node_id, entries);
        let canonical = manifest
            .canonical_bytes()
            .map_err(|e| GossipError::Serialization(e.to_string()))?;
        Ok(manifest.with_signature(self.signer.sign(&canonical)))
    }

    /// Broadcast one manifest round to every subscribed peer
    pub async fn broadcast_once(&self) -> GossipResult<Manifest> {
        let manifest = self.build_manifest().await?;
        let body = PayloadBody::Manifest(ManifestPayload {
            manifest: manifest.clone(),
        });

        for peer in self.peers.iter() {
            let peer = *peer;
            match self.send_to(&body, peer) {
                Ok(()) => {
                    debug!(peer = %peer, entries = manifest.len(), "Manifest broadcast")
                }
                Err(e) => debug!(peer = %peer, error = %e, "Manifest broadcast failed"),
            }
        }
        Ok(manifest)
    }

    fn send_to(&self, body: &PayloadBody, peer: NodeId) -> GossipResult<()> {
        let key = self.keys.key_for(&peer)?;
        let (_, frame) = capmesh_codec::seal_frame(body, self.node_id, peer, &key)?;
        self.sim.submit(self.node_id, peer, frame)?;
        Ok(())
    }

    /// Spawn the periodic broadcast loop
    pub fn spawn(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_ms = self.config.manifest_interval.as_millis() as u64,
                "Manifest broadcaster started"
            );
            let mut ticker = tokio::time::interval(self.config.manifest_interval);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Manifest broadcaster shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.broadcast_once().await {
                            warn!(error = %e, "Manifest round failed");
                        }
                    }
                }
            }
        })
    }
}
