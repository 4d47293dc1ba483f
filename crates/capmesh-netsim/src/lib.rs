//! # Capmesh Netsim
//!
//! The simulated unreliable transport that carries all traffic between
//! hubs. It faithfully degrades frames according to a runtime-mutable
//! policy:
//!
//! - per-chunk Bernoulli loss (with a NAK back to the sender),
//! - base latency plus uniform jitter,
//! - a global token bucket pacing aggregate bandwidth,
//! - optional reorder delay so chunk arrival order differs from send order,
//! - fragmentation against `max_chunk_size_bytes` with endpoint-side
//!   reassembly and exactly one ACK per fully reassembled frame.
//!
//! The simulator never inspects payloads: it reads only the frame header
//! for `packet_id` and addressing, and moves opaque ciphertext.

pub mod bucket;
pub mod config;
pub mod simulator;
pub mod stats;

pub use bucket::TokenBucket;
pub use config::{ConfigWarning, SimConfig};
pub use simulator::{DeliveryEvent, SimEndpoint, SubmitReceipt, Simulator};
pub use stats::{SimStats, StatsSnapshot};
