//! Scheduler configuration.
//!
//! Every section carries the production defaults and `with_*` builders.
//! Files may omit any field; missing values take the defaults.

use crate::assignment::Strategy;
use serde::{Deserialize, Serialize};
use swarm_core::{SwarmError, SwarmResult};

/// Node registry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Expected heartbeat interval in milliseconds
    pub heartbeat_interval_ms: u64,
    /// A node silent for more than `interval * multiplier` is disconnected
    pub heartbeat_timeout_multiplier: u32,
    /// Reliability assigned to a node seen for the first time
    pub initial_reliability: f64,
    /// Lower reliability bound
    pub reliability_floor: f64,
    /// Upper reliability bound
    pub reliability_ceiling: f64,
    /// How long disconnected nodes keep their reliability record
    pub offline_retention_ms: u64,
}

impl RegistryConfig {
    /// Set heartbeat interval
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval_ms: u64) -> Self {
        self.heartbeat_interval_ms = interval_ms;
        self
    }

    /// Set heartbeat timeout multiplier
    #[must_use]
    pub fn with_timeout_multiplier(mut self, multiplier: u32) -> Self {
        self.heartbeat_timeout_multiplier = multiplier;
        self
    }

    /// Set initial reliability
    #[must_use]
    pub fn with_initial_reliability(mut self, reliability: f64) -> Self {
        self.initial_reliability = reliability;
        self
    }

    /// Silence after which a node is swept
    #[must_use]
    pub fn heartbeat_timeout_ms(&self) -> u64 {
        self.heartbeat_interval_ms
            .saturating_mul(u64::from(self.heartbeat_timeout_multiplier))
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_multiplier: 2,
            initial_reliability: 1.0,
            reliability_floor: 0.5,
            reliability_ceiling: 1.0,
            offline_retention_ms: 3_600_000,
        }
    }
}

/// Task ledger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Execution timeout per assignment in milliseconds
    pub execution_timeout_ms: u64,
    /// Default fraction of results that must agree
    pub consensus_threshold: f64,
    /// Independent executions collected before consensus is declared lost
    pub redundancy: u32,
    /// Default attempts per task
    pub max_attempts: u32,
    /// Queue wait that consumes one attempt when no node is eligible
    pub pending_timeout_ms: u64,
    /// How long finished tasks stay queryable before eviction
    pub finished_retention_ms: u64,
}

impl LedgerConfig {
    /// Set execution timeout
    #[must_use]
    pub fn with_execution_timeout(mut self, timeout_ms: u64) -> Self {
        self.execution_timeout_ms = timeout_ms;
        self
    }

    /// Set consensus threshold
    #[must_use]
    pub fn with_consensus_threshold(mut self, threshold: f64) -> Self {
        self.consensus_threshold = threshold;
        self
    }

    /// Set max attempts
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set pending timeout
    #[must_use]
    pub fn with_pending_timeout(mut self, timeout_ms: u64) -> Self {
        self.pending_timeout_ms = timeout_ms;
        self
    }

    /// Set finished-task retention
    #[must_use]
    pub fn with_finished_retention(mut self, retention_ms: u64) -> Self {
        self.finished_retention_ms = retention_ms;
        self
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            execution_timeout_ms: 300_000,
            consensus_threshold: 0.66,
            redundancy: 3,
            max_attempts: 3,
            pending_timeout_ms: 600_000,
            finished_retention_ms: 3_600_000,
        }
    }
}

/// Assignment engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    /// Strategy used at startup
    pub default_strategy: Strategy,
    /// Whether the optimizer may switch strategies
    pub adaptive: bool,
    /// Optimizer interval in milliseconds
    pub optimizer_interval_ms: u64,
    /// Average completion rate below which reliability-weighted is forced
    pub completion_rate_floor: f64,
    /// Active-task count on a single node that forces load-balanced
    pub load_high_water: u32,
    /// Top-scored nodes considered by the weighted-random pick
    pub reliability_candidates: usize,
    /// Seed for the selection RNG (random when absent)
    pub seed: Option<u64>,
}

impl AssignmentConfig {
    /// Set default strategy
    #[must_use]
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Enable or disable adaptive switching
    #[must_use]
    pub fn with_adaptive(mut self, adaptive: bool) -> Self {
        self.adaptive = adaptive;
        self
    }

    /// Fix the selection seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::ReliabilityWeighted,
            adaptive: true,
            optimizer_interval_ms: 60_000,
            completion_rate_floor: 0.7,
            load_high_water: 5,
            reliability_candidates: 3,
            seed: None,
        }
    }
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Messages buffered per sub-channel before the oldest is dropped
    pub max_buffered: usize,
    /// Retransmissions allowed on ordered sub-channels
    pub max_retransmits: u32,
    /// Malformed signaling messages tolerated before the peer is torn down
    pub signaling_retry_budget: u32,
    /// Weight of a new RTT sample in the smoothed estimate
    pub rtt_smoothing: f64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_buffered: 1024,
            max_retransmits: 5,
            signaling_retry_budget: 3,
            rtt_smoothing: 0.2,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Registry section
    pub registry: RegistryConfig,
    /// Ledger section
    pub ledger: LedgerConfig,
    /// Assignment section
    pub assignment: AssignmentConfig,
    /// Transport section
    pub transport: TransportConfig,
}

impl SwarmConfig {
    /// Parse a JSON document
    ///
    /// # Errors
    ///
    /// Returns `Encoding` for malformed JSON and `InvalidConfig` for bad values
    pub fn from_json(json: &str) -> SwarmResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field
    pub fn validate(&self) -> SwarmResult<()> {
        let r = &self.registry;
        if r.heartbeat_interval_ms == 0 {
            return Err(invalid("registry.heartbeat_interval_ms", "must be > 0"));
        }
        if r.heartbeat_timeout_multiplier == 0 {
            return Err(invalid("registry.heartbeat_timeout_multiplier", "must be >= 1"));
        }
        if !(0.0 < r.reliability_floor && r.reliability_floor <= r.reliability_ceiling && r.reliability_ceiling <= 1.0) {
            return Err(invalid(
                "registry.reliability_floor",
                "must satisfy 0 < floor <= ceiling <= 1",
            ));
        }
        if !(r.reliability_floor..=r.reliability_ceiling).contains(&r.initial_reliability) {
            return Err(invalid("registry.initial_reliability", "must lie within floor..=ceiling"));
        }

        let l = &self.ledger;
        if !(l.consensus_threshold > 0.0 && l.consensus_threshold <= 1.0) {
            return Err(invalid("ledger.consensus_threshold", "must be in (0, 1]"));
        }
        if l.max_attempts == 0 {
            return Err(invalid("ledger.max_attempts", "must be >= 1"));
        }
        if l.redundancy == 0 {
            return Err(invalid("ledger.redundancy", "must be >= 1"));
        }
        if l.execution_timeout_ms == 0 {
            return Err(invalid("ledger.execution_timeout_ms", "must be > 0"));
        }

        let a = &self.assignment;
        if a.reliability_candidates == 0 {
            return Err(invalid("assignment.reliability_candidates", "must be >= 1"));
        }
        if !(0.0..=1.0).contains(&a.completion_rate_floor) {
            return Err(invalid("assignment.completion_rate_floor", "must be in [0, 1]"));
        }

        let t = &self.transport;
        if !(t.rtt_smoothing > 0.0 && t.rtt_smoothing <= 1.0) {
            return Err(invalid("transport.rtt_smoothing", "must be in (0, 1]"));
        }
        if t.max_buffered == 0 {
            return Err(invalid("transport.max_buffered", "must be >= 1"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> SwarmError {
    SwarmError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = SwarmConfig::default();
        assert_eq!(config.registry.heartbeat_interval_ms, 30_000);
        assert_eq!(config.registry.heartbeat_timeout_ms(), 60_000);
        assert_eq!(config.ledger.execution_timeout_ms, 300_000);
        assert!((config.ledger.consensus_threshold - 0.66).abs() < f64::EPSILON);
        assert_eq!(config.ledger.max_attempts, 3);
        assert_eq!(config.registry.reliability_floor, 0.5);
        assert_eq!(config.registry.reliability_ceiling, 1.0);
        assert_eq!(config.assignment.default_strategy, Strategy::ReliabilityWeighted);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = SwarmConfig::from_json(r#"{"ledger": {"max_attempts": 5}}"#).unwrap();
        assert_eq!(config.ledger.max_attempts, 5);
        assert_eq!(config.ledger.execution_timeout_ms, 300_000);
        assert_eq!(config.registry, RegistryConfig::default());
    }

    #[test]
    fn test_from_json_strategy_name() {
        let config =
            SwarmConfig::from_json(r#"{"assignment": {"default_strategy": "capability-matched"}}"#)
                .unwrap();
        assert_eq!(config.assignment.default_strategy, Strategy::CapabilityMatched);
    }

    #[test]
    fn test_validate_rejects_bad_threshold() {
        let mut config = SwarmConfig::default();
        config.ledger.consensus_threshold = 0.0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SwarmError::InvalidConfig { field, .. } if field == "ledger.consensus_threshold"));
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut config = SwarmConfig::default();
        config.registry.reliability_floor = 0.9;
        config.registry.reliability_ceiling = 0.8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_malformed() {
        assert!(matches!(SwarmConfig::from_json("{"), Err(SwarmError::Encoding(_))));
    }

    #[test]
    fn test_builders() {
        let ledger = LedgerConfig::default()
            .with_execution_timeout(1_000)
            .with_max_attempts(2)
            .with_consensus_threshold(0.5);
        assert_eq!(ledger.execution_timeout_ms, 1_000);
        assert_eq!(ledger.max_attempts, 2);
        assert_eq!(ledger.consensus_threshold, 0.5);
    }
}
