//! Simulator configuration
//!
//! All knobs are runtime-mutable through the simulator's admin surface.
//! Each frame admission captures an immutable snapshot, so a frame is
//! processed end to end under one consistent view.

use std::time::Duration;

/// Tunable degradation policy for the simulated link
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Base one-way latency in milliseconds
    pub base_latency_ms: u64,
    /// Uniform additive jitter bound in milliseconds
    pub latency_jitter_ms: u64,
    /// Per-chunk drop probability in `[0, 1]`
    pub loss_probability: f64,
    /// Shared delivery pacing budget in bytes per second
    pub bandwidth_bytes_per_sec: u64,
    /// Maximum chunk payload size before fragmentation
    pub max_chunk_size_bytes: usize,
    /// Fragment oversized frames instead of rejecting them
    pub auto_chunk_large_payloads: bool,
    /// Add a uniform reorder delay to each chunk
    pub enable_reordering: bool,
    /// Reorder delay bound in milliseconds
    pub reorder_window_ms: u64,
    /// How long an incomplete reassembly buffer may sit before discard
    pub reassembly_timeout_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 250,
            latency_jitter_ms: 50,
            loss_probability: 0.05,
            bandwidth_bytes_per_sec: 1024,
            max_chunk_size_bytes: 800,
            auto_chunk_large_payloads: true,
            enable_reordering: false,
            reorder_window_ms: 100,
            reassembly_timeout_ms: 2_000,
        }
    }
}

impl SimConfig {
    /// An effectively perfect link, for fast deterministic tests
    pub fn ideal() -> Self {
        Self {
            base_latency_ms: 1,
            latency_jitter_ms: 0,
            loss_probability: 0.0,
            bandwidth_bytes_per_sec: 8 * 1024 * 1024,
            max_chunk_size_bytes: 64 * 1024,
            auto_chunk_large_payloads: true,
            enable_reordering: false,
            reorder_window_ms: 0,
            reassembly_timeout_ms: 1_000,
        }
    }

    /// A degraded LoRa-class link with heavy loss
    pub fn lossy() -> Self {
        Self {
            loss_probability: 0.4,
            ..Self::default()
        }
    }

    /// A fully severed link; every chunk is dropped
    pub fn offline() -> Self {
        Self {
            loss_probability: 1.0,
            ..Self::default()
        }
    }

    /// Base latency as a [`Duration`]
    pub fn base_latency(&self) -> Duration {
        Duration::from_millis(self.base_latency_ms)
    }

    /// Reassembly buffer timeout as a [`Duration`]
    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    /// The contractual floor for ACK timeouts over this link:
    /// `2 × (base_latency + jitter + reorder_window)`
    pub fn ack_timeout_floor(&self) -> Duration {
        let reorder = if self.enable_reordering {
            self.reorder_window_ms
        } else {
            0
        };
        Duration::from_millis(2 * (self.base_latency_ms + self.latency_jitter_ms + reorder))
    }

    /// Validate configuration invariants
    ///
    /// Returns a list of machine-readable warnings; an empty list means the
    /// configuration honors all contracts.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if !(0.0..=1.0).contains(&self.loss_probability) {
            warnings.push(ConfigWarning::LossProbabilityOutOfRange);
        }
        if self.bandwidth_bytes_per_sec == 0 {
            warnings.push(ConfigWarning::ZeroBandwidth);
        }
        if self.max_chunk_size_bytes == 0 {
            warnings.push(ConfigWarning::ZeroChunkSize);
        }

        let reorder = if self.enable_reordering {
            self.reorder_window_ms
        } else {
            0
        };
        if self.reassembly_timeout_ms < 2 * (self.base_latency_ms + reorder) {
            warnings.push(ConfigWarning::ReassemblyTimeoutTooShort);
        }

        warnings
    }

    /// Whether the configuration honors all contracts
    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}

/// Configuration contract violations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigWarning {
    /// `loss_probability` outside `[0, 1]`
    LossProbabilityOutOfRange,
    /// `bandwidth_bytes_per_sec` is zero
    ZeroBandwidth,
    /// `max_chunk_size_bytes` is zero
    ZeroChunkSize,
    /// `reassembly_timeout < 2 × (base_latency + reorder_window)`
    ReassemblyTimeoutTooShort,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LossProbabilityOutOfRange => {
                write!(f, "loss_probability must be within [0, 1]")
            }
            ConfigWarning::ZeroBandwidth => write!(f, "bandwidth_bytes_per_sec must be positive"),
            ConfigWarning::ZeroChunkSize => write!(f, "max_chunk_size_bytes must be positive"),
            ConfigWarning::ReassemblyTimeoutTooShort => {
                write!(f, "reassembly_timeout below 2 x (base_latency + reorder_window)")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SimConfig::default().is_valid());
    }

    #[test]
    fn test_preset_configs_are_valid() {
        assert!(SimConfig::ideal().is_valid());
        assert!(SimConfig::lossy().is_valid());
        assert!(SimConfig::offline().is_valid());
    }

    #[test]
    fn test_invalid_loss_detected() {
        let config = SimConfig {
            loss_probability: 1.5,
            ..Default::default()
        };
        assert!(
            config
                .validate()
                .contains(&ConfigWarning::LossProbabilityOutOfRange)
        );
    }

    #[test]
    fn test_short_reassembly_timeout_detected() {
        let config = SimConfig {
            base_latency_ms: 2_000,
            reassembly_timeout_ms: 1_000,
            ..Default::default()
        };
        assert!(
            config
                .validate()
                .contains(&ConfigWarning::ReassemblyTimeoutTooShort)
        );
    }

    #[test]
    fn test_ack_timeout_floor_includes_reordering() {
        let mut config = SimConfig {
            base_latency_ms: 100,
            latency_jitter_ms: 50,
            reorder_window_ms: 200,
            enable_reordering: false,
            ..Default::default()
        };
        assert_eq!(config.ack_timeout_floor(), Duration::from_millis(300));

        config.enable_reordering = true;
        assert_eq!(config.ack_timeout_floor(), Duration::from_millis(700));
    }
}
