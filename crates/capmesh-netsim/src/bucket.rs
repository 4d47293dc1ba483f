//! Global bandwidth pacing
//!
//! A token bucket shared by every in-flight chunk. Concurrent
//! transmissions draw from the same budget, so aggregate throughput never
//! exceeds the configured bytes-per-second regardless of how many frames
//! are in flight.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Shared token bucket; tokens are bytes
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// Current balance; may go negative while a large chunk drains
    tokens: f64,
    /// Last refill instant
    refilled_at: Instant,
}

impl TokenBucket {
    /// Create a bucket with a one-second burst allowance
    pub fn new(bandwidth_bytes_per_sec: u64) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: bandwidth_bytes_per_sec as f64,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Reserve `bytes` of budget, waiting out any deficit
    ///
    /// The deduction is immediate so later callers see the debt; the wait
    /// is whatever time the refill needs to bring the balance back to zero.
    /// `rate` comes from the frame's config snapshot, so a runtime
    /// bandwidth change applies to frames admitted after it.
    pub async fn acquire(&self, bytes: usize, rate_bytes_per_sec: u64) {
        let rate = rate_bytes_per_sec.max(1) as f64;

        let wait = {
            let mut state = self.state.lock().await;

            let elapsed = state.refilled_at.elapsed().as_secs_f64();
            state.refilled_at = Instant::now();
            // Refill, capping the burst at one second of budget.
            state.tokens = (state.tokens + elapsed * rate).min(rate);

            state.tokens -= bytes as f64;
            if state.tokens >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-state.tokens / rate)
            }
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
