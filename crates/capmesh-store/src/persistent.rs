//! Persistent capsule store
//!
//! An append-only log of store mutations layered over the in-memory store.
//! Rows are JSON, one per line; the log is replayed on open to reconstruct
//! the in-memory view. A put is acknowledged only after its row has been
//! flushed, so an acknowledged capsule survives a restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use capmesh_core::{KnowledgeCapsule, ManifestEntry};
use capmesh_crypto::TrustStore;

use crate::error::{StoreError, StoreResult};
use crate::memory::MemoryCapsuleStore;
use crate::{CapsuleStore, StoredCapsule};

/// One mutation in the append-only log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRow {
    /// A capsule was accepted (signature already verified at append time)
    Put {
        capsule: KnowledgeCapsule,
        received_at: DateTime<Utc>,
    },
    /// A capsule was removed by the sweeper
    Remove { capsule_id: Uuid },
}

/// Durable capsule store backed by an append-only log
#[derive(Debug)]
pub struct PersistentCapsuleStore {
    /// In-memory view, reconstructed from the log on open
    view: MemoryCapsuleStore,
    /// Directory holding the log file
    storage_path: PathBuf,
    /// Serialized writer for the log
    writer: Arc<Mutex<BufWriter<File>>>,
    /// Whether to fsync after each row (durability over throughput)
    sync_writes: bool,
}

impl PersistentCapsuleStore {
    /// Open (or create) a store at the given directory
    pub async fn open(storage_path: impl AsRef<Path>, trust: Arc<TrustStore>) -> StoreResult<Self> {
        Self::open_with_options(storage_path, trust, true).await
    }

    /// Open with explicit durability options
    pub async fn open_with_options(
        storage_path: impl AsRef<Path>,
        trust: Arc<TrustStore>,
        sync_writes: bool,
    ) -> StoreResult<Self> {
        let storage_path = storage_path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&storage_path).await?;

        let view = MemoryCapsuleStore::new(trust);
        let log_path = storage_path.join("capsules.log");
        replay(&log_path, &view).await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;

        Ok(Self {
            view,
            storage_path,
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
            sync_writes,
        })
    }

    /// The directory this store persists into
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// Count of capsules rejected for signature failures
    pub fn rejected_count(&self) -> u64 {
        self.view.rejected_count()
    }

    /// Append one row and make it durable
    async fn append(&self, row: &LogRow) -> StoreResult<()> {
        let mut line =
            serde_json::to_vec(row).map_err(|e| StoreError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await?;
        if self.sync_writes {
            writer.get_ref().sync_data().await?;
        }
        Ok(())
    }
}

/// Replay log rows into the in-memory view
///
/// Rows were signature-verified before they were appended, so replay
/// applies them directly. Unparseable rows (torn tail writes) are skipped
/// with a warning.
async fn replay(log_path: &Path, view: &MemoryCapsuleStore) -> StoreResult<()> {
    if !tokio::fs::try_exists(log_path).await? {
        debug!(path = ?log_path, "No existing capsule log, starting fresh");
        return Ok(());
    }

    let file = File::open(log_path).await?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut applied = 0usize;
    let mut skipped = 0usize;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogRow>(&line) {
            Ok(LogRow::Put {
                capsule,
                received_at,
            }) => {
                if view
                    .insert_record(StoredCapsule {
                        capsule,
                        received_at,
                    })
                    .is_ok()
                {
                    applied += 1;
                }
            }
            Ok(LogRow::Remove { capsule_id }) => {
                view.remove_record(&capsule_id);
                applied += 1;
            }
            Err(e) => {
                skipped += 1;
                warn!(error = %e, "Skipping unparseable capsule log row");
            }
        }
    }

    info!(applied, skipped, "Replayed capsule log");
    Ok(())
}

#[async_trait]
impl CapsuleStore for PersistentCapsuleStore {
    async fn put(&self, capsule: KnowledgeCapsule) -> StoreResult<bool> {
        self.view.verify(&capsule)?;

        let record = StoredCapsule::received_now(capsule.clone());
        let received_at = record.received_at;
        if !self.view.insert_record(record)? {
            return Ok(false);
        }

        if let Err(err) = self
            .append(&LogRow::Put {
                capsule: capsule.clone(),
                received_at,
            })
            .await
        {
            // Not durable: roll back the in-memory insert so the capsule is
            // never acknowledged without surviving a restart.
            self.view.remove_record(&capsule.capsule_id);
            return Err(err);
        }
        Ok(true)
    }

    async fn get(&self, capsule_id: &Uuid) -> Option<KnowledgeCapsule> {
        self.view.get(capsule_id).await
    }

    async fn find_by_question(&self, question: &str) -> Option<KnowledgeCapsule> {
        self.view.find_by_question(question).await
    }

    async fn find_by_hash(&self, hash: &str) -> Option<KnowledgeCapsule> {
        self.view.find_by_hash(hash).await
    }

    async fn fresh_capsules(&self) -> Vec<KnowledgeCapsule> {
        self.view.fresh_capsules().await
    }

    async fn manifest_entries(&self) -> Vec<ManifestEntry> {
        self.view.manifest_entries().await
    }

    async fn sweep(&self) -> StoreResult<Vec<Uuid>> {
        let removed = self.view.sweep().await?;
        for capsule_id in &removed {
            self.append(&LogRow::Remove {
                capsule_id: *capsule_id,
            })
            .await?;
        }
        Ok(removed)
    }

    async fn len(&self) -> usize {
        self.view.len().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capmesh_core::NodeId;
    use capmesh_crypto::NodeSigner;

    fn make_test_signer() -> (NodeSigner, Arc<TrustStore>) {
        let signer = NodeSigner::generate(NodeId::from_name("main"));
        let trust = Arc::new(TrustStore::new());
        trust.register_signer(&signer);
        (signer, trust)
    }

    fn make_signed_capsule(signer: &NodeSigner, question: &str, ttl: u64) -> KnowledgeCapsule {
        let capsule = KnowledgeCapsule::bind(question, "the answer", signer.source_id(), ttl);
        let canonical = capsule.canonical_bytes().unwrap();
        let signature = signer.sign(&canonical);
        capsule.with_signature(signature)
    }

    #[tokio::test]
    async fn test_acknowledged_put_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (signer, trust) = make_test_signer();
        let capsule = make_signed_capsule(&signer, "What is photosynthesis?", 3600);

        {
            let store = PersistentCapsuleStore::open(dir.path(), trust.clone())
                .await
                .unwrap();
            assert!(store.put(capsule.clone()).await.unwrap());
        }

        let reopened = PersistentCapsuleStore::open(dir.path(), trust).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        assert_eq!(reopened.get(&capsule.capsule_id).await.unwrap(), capsule);
    }

    #[tokio::test]
    async fn test_sweep_is_durable() {
        let dir = tempfile::tempdir().unwrap();
        let (signer, trust) = make_test_signer();
        let capsule = make_signed_capsule(&signer, "ephemeral", 0);

        {
            let store = PersistentCapsuleStore::open(dir.path(), trust.clone())
                .await
                .unwrap();
            store.put(capsule).await.unwrap();
            let removed = store.sweep().await.unwrap();
            assert_eq!(removed.len(), 1);
        }

        let reopened = PersistentCapsuleStore::open(dir.path(), trust).await.unwrap();
        assert_eq!(reopened.len().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_put_not_logged_twice() {
        let dir = tempfile::tempdir().unwrap();
        let (signer, trust) = make_test_signer();
        let capsule = make_signed_capsule(&signer, "Define entropy", 3600);

        {
            let store = PersistentCapsuleStore::open(dir.path(), trust.clone())
                .await
                .unwrap();
            assert!(store.put(capsule.clone()).await.unwrap());
            assert!(!store.put(capsule.clone()).await.unwrap());
        }

        let log = std::fs::read_to_string(dir.path().join("capsules.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_torn_tail_row_skipped_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        let (signer, trust) = make_test_signer();
        let capsule = make_signed_capsule(&signer, "Define entropy", 3600);

        {
            let store = PersistentCapsuleStore::open(dir.path(), trust.clone())
                .await
                .unwrap();
            store.put(capsule.clone()).await.unwrap();
        }

        // Simulate a crash mid-write: a truncated trailing row.
        let log_path = dir.path().join("capsules.log");
        let mut contents = std::fs::read_to_string(&log_path).unwrap();
        contents.push_str("{\"op\":\"put\",\"capsule\":{\"trunc");
        std::fs::write(&log_path, contents).unwrap();

        let reopened = PersistentCapsuleStore::open(dir.path(), trust).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        assert!(reopened.get(&capsule.capsule_id).await.is_some());
    }

    #[tokio::test]
    async fn test_rejected_capsule_never_hits_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (signer, trust) = make_test_signer();
        let mut capsule = make_signed_capsule(&signer, "Explain TLS", 3600);
        capsule.answer_text.push('!');

        let store = PersistentCapsuleStore::open(dir.path(), trust).await.unwrap();
        assert!(store.put(capsule).await.is_err());

        let log = std::fs::read_to_string(dir.path().join("capsules.log")).unwrap();
        assert!(log.is_empty());
    }
}
