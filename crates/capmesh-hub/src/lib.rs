//! # Capmesh Hub
//!
//! The two node roles of the capsule mesh.
//!
//! [`MiniHub`] is the edge: it answers user questions from its local
//! capsule cache and forwards misses over the simulated link, retrying
//! with exponential backoff until the transport acknowledges delivery or
//! the retry budget runs out. Replies are correlated to requests by
//! `packet_id`, never by arrival order.
//!
//! [`MainHub`] is the authority: it deduplicates retransmitted queries,
//! reuses fresh knowledge, invokes the injected answer generator on a true
//! miss, and binds every answer into a signed, TTL-stamped capsule that
//! then propagates through manifest gossip.

pub mod answer;
pub mod error;
pub mod main_hub;
pub mod metrics;
pub mod mini;
pub mod queue;

pub use answer::{AnswerProvider, GeneratedAnswer, NormalizedEquality, SimilarityScorer, StaticAnswers};
pub use error::{HubError, HubResult};
pub use main_hub::{MainHub, MainHubConfig};
pub use metrics::{HubMetrics, MetricsSnapshot};
pub use mini::{MiniHub, MiniHubConfig, QueryResult};
pub use queue::{
    AckOutcome, EntryStatus, QueueEntry, RetransmitQueue, RetryPolicy, RetryPolicyWarning,
    ScanOutcome,
};
