//! Gossip timing configuration

use std::time::Duration;

/// Knobs for manifest broadcast and selective sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipConfig {
    /// Main-hub manifest broadcast interval
    pub manifest_interval: Duration,
    /// Mini-hub sync re-evaluation interval
    pub gossip_interval: Duration,
    /// Outstanding CAPSULE_REQUESTs allowed per peer
    pub max_inflight_sync: usize,
    /// How long a capsule request may stay outstanding before its slot is
    /// reclaimed
    pub request_timeout: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            manifest_interval: Duration::from_secs(30),
            gossip_interval: Duration::from_secs(45),
            max_inflight_sync: 8,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl GossipConfig {
    /// Tight intervals for tests
    pub fn fast() -> Self {
        Self {
            manifest_interval: Duration::from_millis(100),
            gossip_interval: Duration::from_millis(150),
            max_inflight_sync: 8,
            request_timeout: Duration::from_millis(500),
        }
    }

    /// Validate against the capsule TTL this mesh runs with
    ///
    /// Convergence headroom requires `manifest_interval < ttl / 10`.
    pub fn validate_against_ttl(&self, capsule_ttl_seconds: u64) -> Vec<GossipConfigWarning> {
        let mut warnings = Vec::new();
        if self.manifest_interval.as_secs().saturating_mul(10) >= capsule_ttl_seconds {
            warnings.push(GossipConfigWarning::ManifestIntervalTooLong);
        }
        if self.max_inflight_sync == 0 {
            warnings.push(GossipConfigWarning::ZeroInflightBudget);
        }
        warnings
    }
}

/// Gossip configuration contract violations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GossipConfigWarning {
    /// `manifest_interval >= capsule_ttl / 10`
    ManifestIntervalTooLong,
    /// `max_inflight_sync` is zero; sync would never issue requests
    ZeroInflightBudget,
}

impl std::fmt::Display for GossipConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GossipConfigWarning::ManifestIntervalTooLong => {
                write!(f, "manifest_interval must stay under capsule_ttl / 10")
            }
            GossipConfigWarning::ZeroInflightBudget => {
                write!(f, "max_inflight_sync must be positive")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_valid_for_day_ttl() {
        let config = GossipConfig::default();
        assert!(config.validate_against_ttl(86_400).is_empty());
    }

    #[test]
    fn test_short_ttl_flagged() {
        let config = GossipConfig::default();
        let warnings = config.validate_against_ttl(200);
        assert!(warnings.contains(&GossipConfigWarning::ManifestIntervalTooLong));
    }

    #[test]
    fn test_zero_inflight_flagged() {
        let config = GossipConfig {
            max_inflight_sync: 0,
            ..Default::default()
        };
        assert!(
            config
                .validate_against_ttl(86_400)
                .contains(&GossipConfigWarning::ZeroInflightBudget)
        );
    }
}
