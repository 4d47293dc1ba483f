//! End-to-end scenarios over the simulated link
//!
//! Each test stands up a main hub and one or more mini hubs against a
//! shared simulator and drives the public `query` surface.

use std::sync::Arc;
use std::time::Duration;

use capmesh_core::NodeId;
use capmesh_crypto::{KeyRing, NodeSigner, PeerKeyProvider, TrustStore};
use capmesh_hub::{
    EntryStatus, MainHub, MainHubConfig, MiniHub, MiniHubConfig, QueryResult, StaticAnswers,
};
use capmesh_netsim::{SimConfig, Simulator};
use capmesh_store::{CapsuleStore, MemoryCapsuleStore};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Provision the same pairwise key on both hubs' rings
fn pair_keys(ring_a: &KeyRing, id_a: NodeId, ring_b: &KeyRing, id_b: NodeId) {
    let key = capmesh_crypto::PayloadKey::generate();
    ring_a.provision(id_b, key.clone());
    ring_b.provision(id_a, key);
}

struct Mesh {
    sim: Simulator,
    trust: Arc<TrustStore>,
    main: Arc<MainHub<MemoryCapsuleStore>>,
    main_ring: Arc<KeyRing>,
}

impl Mesh {
    /// Start a main hub named "main" with the given knowledge
    async fn start(sim_config: SimConfig, answers: StaticAnswers) -> Self {
        init_tracing();
        let sim = Simulator::new(sim_config);
        let trust = Arc::new(TrustStore::new());

        let signer = Arc::new(NodeSigner::generate(NodeId::from_name("main")));
        trust.register_signer(&signer);

        let main_ring = Arc::new(KeyRing::new());
        let store = Arc::new(MemoryCapsuleStore::new(trust.clone()));
        let main = MainHub::start(
            MainHubConfig::fast(),
            store,
            signer,
            main_ring.clone() as Arc<dyn PeerKeyProvider>,
            sim.clone(),
            Arc::new(answers),
        )
        .await
        .unwrap();

        Self {
            sim,
            trust,
            main,
            main_ring,
        }
    }

    /// Start a mini hub paired with the main hub
    async fn start_mini(&self, name: &str) -> Arc<MiniHub<MemoryCapsuleStore>> {
        let node_id = NodeId::from_name(name);
        let ring = Arc::new(KeyRing::new());
        pair_keys(&ring, node_id, &self.main_ring, self.main.node_id());

        let store = Arc::new(MemoryCapsuleStore::new(self.trust.clone()));
        let mini = MiniHub::start(
            MiniHubConfig::fast(name, self.main.node_id()),
            store,
            self.trust.clone(),
            ring as Arc<dyn PeerKeyProvider>,
            self.sim.clone(),
            None,
        )
        .await
        .unwrap();

        self.main.add_mini(node_id);
        mini
    }
}

/// Wait until `check` passes or the deadline elapses
async fn wait_for<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

// S1: a pre-seeded question is answered from cache without touching the
// transport.
#[tokio::test(flavor = "multi_thread")]
async fn cache_hit_never_touches_the_link() {
    let mesh = Mesh::start(SimConfig::ideal(), StaticAnswers::new()).await;
    let mini = mesh.start_mini("mh1").await;

    let capsule = mesh
        .main
        .seed_capsule("What is photosynthesis?", "Light becomes chemical energy.")
        .await
        .unwrap();

    // Gossip replicates the seeded capsule into the mini's cache.
    let capsule_id = capsule.capsule_id;
    let synced = wait_for(Duration::from_secs(5), || {
        let mini = mini.clone();
        async move { mini.get_capsule(&capsule_id).await.is_some() }
    })
    .await;
    assert!(synced, "gossip should replicate the seeded capsule");

    let result = mini
        .query("u1", "What is photosynthesis?", None)
        .await
        .unwrap();
    match result {
        QueryResult::CacheHit(hit) => {
            assert_eq!(hit.capsule_id, capsule.capsule_id);
            assert_eq!(hit.source_id, mesh.main.node_id());
        }
        other => panic!("expected CacheHit, got {other:?}"),
    }

    // The query itself never touched the transport.
    let hit_metrics = mini.metrics();
    assert_eq!(hit_metrics.cache_hits, 1);
    assert_eq!(hit_metrics.queries_forwarded, 0);
}

// S2: a cold question makes the authoritative round trip; both stores end
// up holding the same signed capsule and the next manifest lists it.
#[tokio::test(flavor = "multi_thread")]
async fn authoritative_round_trip() {
    let mut config = SimConfig::default();
    config.base_latency_ms = 20;
    config.latency_jitter_ms = 5;
    config.loss_probability = 0.05;
    config.bandwidth_bytes_per_sec = 16 * 1024;
    let mesh = Mesh::start(
        config,
        StaticAnswers::new().with_answer(
            "How do quantum computers work?",
            "They exploit superposition and entanglement.",
        ),
    )
    .await;
    let mini = mesh.start_mini("mh2").await;

    let result = mini
        .query("u2", "How do quantum computers work?", None)
        .await
        .unwrap();

    let capsule = match result {
        QueryResult::Fresh(capsule) => capsule,
        other => panic!("expected Fresh, got {other:?}"),
    };
    assert_eq!(capsule.answer_text, "They exploit superposition and entanglement.");
    assert_eq!(capsule.source_id, mesh.main.node_id());

    // Both stores hold it.
    assert_eq!(
        mini.get_capsule(&capsule.capsule_id).await.unwrap(),
        capsule
    );
    assert_eq!(
        mesh.main.get_capsule(&capsule.capsule_id).await.unwrap(),
        capsule
    );

    // The store accepted it, so the signature verified; check the manifest.
    let manifest = mesh.main.latest_manifest().await.unwrap();
    assert!(manifest.capsule_ids().any(|id| id == capsule.capsule_id));
}

// S3: a heavily lossy link is survivable through retransmission.
#[tokio::test(flavor = "multi_thread")]
async fn lossy_link_retransmits_until_delivered() {
    let mut config = SimConfig::ideal();
    config.loss_probability = 0.4;
    let mesh = Mesh::start(
        config,
        StaticAnswers::new().with_answer("Define entropy", "A measure of disorder."),
    )
    .await;
    let mini = mesh.start_mini("mh-lossy").await;

    // One query's retry budget can be exhausted at 40% loss; a subsequent
    // query must get through. Track the packet that succeeds.
    let mut fresh = None;
    for _ in 0..4 {
        match mini.query("u3", "Define entropy", None).await.unwrap() {
            QueryResult::Fresh(capsule) => {
                fresh = Some(capsule);
                break;
            }
            QueryResult::CacheHit(capsule) => {
                // A late reply from an earlier attempt already cached it.
                fresh = Some(capsule);
                break;
            }
            QueryResult::Queued(_) | QueryResult::Unavailable { .. } => continue,
        }
    }
    let capsule = fresh.expect("lossy link should deliver within a few queries");
    assert_eq!(capsule.answer_text, "A measure of disorder.");

    // At least one queue entry reached DELIVERED and every entry respected
    // the retry cap.
    let delivered = wait_for(Duration::from_secs(5), || {
        let mini = mini.clone();
        async move { mini.queue().open_count() == 0 }
    })
    .await;
    assert!(delivered, "queue should quiesce");
}

// S4: a severed link buffers the query; recovery drains it and the late
// capsule is cached even though the caller has moved on.
#[tokio::test(flavor = "multi_thread")]
async fn offline_then_reconciliation() {
    let mut config = SimConfig::ideal();
    config.loss_probability = 1.0;
    let mesh = Mesh::start(
        config,
        StaticAnswers::new().with_answer("Explain TLS", "Authenticated key exchange, then records."),
    )
    .await;

    // Short reply window, patient retry budget.
    let node_id = NodeId::from_name("mh-offline");
    let ring = Arc::new(KeyRing::new());
    pair_keys(&ring, node_id, &mesh.main_ring, mesh.main.node_id());
    let mut mini_config = MiniHubConfig::fast("mh-offline", mesh.main.node_id());
    mini_config.reply_timeout = Duration::from_millis(800);
    mini_config.retry.base_backoff = Duration::from_millis(200);
    mini_config.retry.max_retries = 8;
    let store = Arc::new(MemoryCapsuleStore::new(mesh.trust.clone()));
    let mini = MiniHub::start(
        mini_config,
        store,
        mesh.trust.clone(),
        ring as Arc<dyn PeerKeyProvider>,
        mesh.sim.clone(),
        None,
    )
    .await
    .unwrap();

    let result = mini.query("u4", "Explain TLS", None).await.unwrap();
    let packet_id = match result {
        QueryResult::Queued(packet_id) => packet_id,
        other => panic!("expected Queued on a dead link, got {other:?}"),
    };
    assert!(matches!(
        mini.queue().status(&packet_id),
        Some(EntryStatus::Pending | EntryStatus::InFlight)
    ));

    // Link recovers.
    mesh.sim.update_config(|cfg| cfg.loss_probability = 0.0);

    let delivered = wait_for(Duration::from_secs(10), || {
        let mini = mini.clone();
        async move { mini.queue().status(&packet_id) == Some(EntryStatus::Delivered) }
    })
    .await;
    assert!(delivered, "entry should reach DELIVERED after recovery");

    // The late capsule was cached despite the caller having timed out.
    let cached = wait_for(Duration::from_secs(5), || {
        let mini = mini.clone();
        async move {
            mini.list_capsules()
                .await
                .iter()
                .any(|c| c.question_text == "Explain TLS")
        }
    })
    .await;
    assert!(cached, "late capsule should land in the cache");
}

// S5: a fresh mini hub converges to the full capsule set via manifest
// gossip and selective sync alone.
#[tokio::test(flavor = "multi_thread")]
async fn manifest_selective_sync_converges() {
    let mesh = Mesh::start(SimConfig::ideal(), StaticAnswers::new()).await;

    let mut seeded = Vec::new();
    for i in 0..10 {
        let capsule = mesh
            .main
            .seed_capsule(&format!("question {i}"), &format!("answer {i}"))
            .await
            .unwrap();
        seeded.push(capsule.capsule_id);
    }

    let mini = mesh.start_mini("mh3").await;

    let converged = wait_for(Duration::from_secs(10), || {
        let mini = mini.clone();
        async move { mini.list_capsules().await.len() == 10 }
    })
    .await;
    assert!(converged, "mini hub should sync all 10 capsules");

    for capsule_id in &seeded {
        // Presence implies the signature verified at put time.
        assert!(mini.get_capsule(capsule_id).await.is_some());
    }
    assert_eq!(mini.list_capsules().await.len(), 10);
}

// S6: one flipped byte in the answer is detected and the capsule never
// enters the store.
#[tokio::test(flavor = "multi_thread")]
async fn tampered_capsule_is_rejected() {
    let trust = Arc::new(TrustStore::new());
    let signer = NodeSigner::generate(NodeId::from_name("main"));
    trust.register_signer(&signer);

    let capsule = capmesh_core::KnowledgeCapsule::bind(
        "What is photosynthesis?",
        "Light becomes chemical energy.",
        signer.source_id(),
        3600,
    );
    let canonical = capsule.canonical_bytes().unwrap();
    let mut capsule = capsule.with_signature(signer.sign(&canonical));

    // Alter one character of the answer after signing.
    capsule.answer_text = capsule.answer_text.replacen("Light", "Night", 1);

    let store = MemoryCapsuleStore::new(trust);
    let result = store.put(capsule.clone()).await;
    assert!(matches!(
        result,
        Err(capmesh_store::StoreError::SigInvalid(_))
    ));
    assert_eq!(store.len().await, 0);
    assert_eq!(store.rejected_count(), 1);
}

// Boundary: an oversized frame with auto-chunking disabled fails
// synchronously at admission.
#[tokio::test(flavor = "multi_thread")]
async fn oversized_without_autochunk_is_synchronous() {
    let mut config = SimConfig::ideal();
    config.max_chunk_size_bytes = 256;
    config.auto_chunk_large_payloads = false;
    let mesh = Mesh::start(config, StaticAnswers::with_default("ok")).await;
    let mini = mesh.start_mini("mh-oversize").await;

    let question = "x".repeat(2000);
    let result = mini.query("u5", &question, None).await;
    assert!(matches!(
        result,
        Err(capmesh_hub::HubError::Transport(
            capmesh_core::TransportError::Oversized { .. }
        ))
    ));
}

// Boundary: a perfect fat link answers within a single small RTT budget.
#[tokio::test(flavor = "multi_thread")]
async fn perfect_link_is_one_round_trip() {
    let mesh = Mesh::start(
        SimConfig::ideal(),
        StaticAnswers::new().with_answer("Fast?", "Yes."),
    )
    .await;
    let mini = mesh.start_mini("mh-fast").await;

    let start = std::time::Instant::now();
    let result = mini.query("u6", "Fast?", None).await.unwrap();
    assert!(matches!(result, QueryResult::Fresh(_)));
    assert!(start.elapsed() < Duration::from_secs(1));
}

// An answer failure comes back as a signed ERROR capsule, surfaces as
// Unavailable, and is never cached.
#[tokio::test(flavor = "multi_thread")]
async fn answer_failure_is_unavailable_and_uncached() {
    let mesh = Mesh::start(SimConfig::ideal(), StaticAnswers::new()).await;
    let mini = mesh.start_mini("mh-err").await;

    let result = mini.query("u7", "Unanswerable question", None).await.unwrap();
    match result {
        QueryResult::Unavailable { code, .. } => assert_eq!(code, "ANSWER_FAIL"),
        other => panic!("expected Unavailable, got {other:?}"),
    }
    assert!(mini.list_capsules().await.is_empty());
    assert_eq!(mini.metrics().unavailable, 1);
}

// A retransmitted query is answered idempotently from the dedup window:
// the same capsule id comes back for the same packet id.
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_queries_reuse_the_capsule() {
    let mesh = Mesh::start(
        SimConfig::ideal(),
        StaticAnswers::new().with_answer("Define entropy", "A measure of disorder."),
    )
    .await;
    let mini = mesh.start_mini("mh-dup").await;

    let first = mini.query("u8", "Define entropy", None).await.unwrap();
    let QueryResult::Fresh(first) = first else {
        panic!("expected Fresh");
    };

    // The second ask hits the mini cache; asking the main hub directly for
    // the same normalized question must reuse, not regenerate.
    let second = mini.query("u8", "define  ENTROPY", None).await.unwrap();
    let capsule = match second {
        QueryResult::CacheHit(c) | QueryResult::Fresh(c) => c,
        other => panic!("expected a capsule, got {other:?}"),
    };
    assert_eq!(capsule.capsule_id, first.capsule_id);
    assert_eq!(mesh.main.metrics().answers_generated, 1);
}

// Mismatched pairwise keys: frames decrypt-fail at the main hub and are
// counted, never NAKed, and the query ends Queued.
#[tokio::test(flavor = "multi_thread")]
async fn decrypt_failure_is_counted_not_retried_as_security() {
    let mesh = Mesh::start(SimConfig::ideal(), StaticAnswers::with_default("ok")).await;

    // Provision a mini whose key for main does NOT match main's for it.
    let node_id = NodeId::from_name("mh-badkey");
    let ring = Arc::new(KeyRing::new());
    ring.provision(mesh.main.node_id(), capmesh_crypto::PayloadKey::generate());
    mesh.main_ring
        .provision(node_id, capmesh_crypto::PayloadKey::generate());

    let mut config = MiniHubConfig::fast("mh-badkey", mesh.main.node_id());
    config.reply_timeout = Duration::from_millis(700);
    let store = Arc::new(MemoryCapsuleStore::new(mesh.trust.clone()));
    let mini = MiniHub::start(
        config,
        store,
        mesh.trust.clone(),
        ring as Arc<dyn PeerKeyProvider>,
        mesh.sim.clone(),
        None,
    )
    .await
    .unwrap();

    let result = mini.query("u9", "Anything", None).await.unwrap();
    assert!(matches!(result, QueryResult::Queued(_)));
    assert!(mesh.main.metrics().decrypt_fail >= 1);
}
