//! Background TTL sweeper
//!
//! Low-priority periodic task that removes expired capsules from a store.
//! Every hub runs one per store.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::CapsuleStore;

/// Periodic TTL sweeper over a capsule store
pub struct SweeperTask<S: CapsuleStore + 'static> {
    store: Arc<S>,
    interval: Duration,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<S: CapsuleStore + 'static> SweeperTask<S> {
    /// Create a sweeper over the given store
    pub fn new(store: Arc<S>, interval: Duration, shutdown_rx: broadcast::Receiver<()>) -> Self {
        Self {
            store,
            interval,
            shutdown_rx,
        }
    }

    /// Spawn the sweeper as a background task
    pub fn spawn(
        store: Arc<S>,
        interval: Duration,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let task = Self::new(store, interval, shutdown_rx);
        tokio::spawn(async move {
            task.run().await;
        })
    }

    /// Run the sweep loop
    async fn run(mut self) {
        info!(interval_secs = self.interval.as_secs(), "TTL sweeper started");
        let mut ticker = tokio::time::interval(self.interval);
        // The first tick fires immediately; skip it so a freshly seeded
        // store is not swept before it has served anything.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("TTL sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match self.store.sweep().await {
                        Ok(removed) if !removed.is_empty() => {
                            debug!(removed = removed.len(), "Sweep removed expired capsules");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Sweep failed"),
                    }
                }
            }
        }
    }
}
