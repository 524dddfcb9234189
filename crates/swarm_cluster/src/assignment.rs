//! Assignment engine: picks the node that runs a task.
//!
//! Every strategy shares one eligibility filter and one signature:
//! `select(demand, candidates, strategy) -> Option<NodeId>`. Selection is
//! computed fresh on each call from the candidate snapshot; the only state
//! carried between calls is the round-robin offset and the RNG behind the
//! reliability-weighted pick.
//!
//! The reliability-weighted strategy ranks candidates deterministically and
//! then draws among the top of the ranking with probability proportional to
//! score. The draw is intentional: always taking the arg-max would pile
//! every task onto the single best node. Fix `assignment.seed` to make the
//! draw reproducible.
//!
//! The adaptive optimizer is a hysteresis rule, not a controller. Its
//! switches are advisory and carry no optimality guarantee.

use crate::config::AssignmentConfig;
use crate::registry::Node;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, PoisonError};
use swarm_core::{NodeId, SwarmError, TaskRequirements, TaskType, MILLIS_PER_HOUR};
use tracing::info;

/// Uptime at which the uptime component of the reliability score saturates
const UPTIME_SATURATION_MS: u64 = 24 * MILLIS_PER_HOUR;

/// Distance assigned to nodes that did not report a location
const UNKNOWN_DISTANCE: u8 = 3;

/// Node-selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Cycle through eligible nodes in registration order
    RoundRobin,
    /// Least loaded node
    LoadBalanced,
    /// Largest capability surplus
    CapabilityMatched,
    /// Closest node to the requester
    LocalityAware,
    /// Weighted-random draw over a reliability composite
    ReliabilityWeighted,
    /// Cheapest expected cost
    CostOptimized,
}

impl Strategy {
    /// All strategies
    pub const ALL: [Strategy; 6] = [
        Strategy::RoundRobin,
        Strategy::LoadBalanced,
        Strategy::CapabilityMatched,
        Strategy::LocalityAware,
        Strategy::ReliabilityWeighted,
        Strategy::CostOptimized,
    ];

    /// Canonical name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::LoadBalanced => "load-balanced",
            Self::CapabilityMatched => "capability-matched",
            Self::LocalityAware => "locality-aware",
            Self::ReliabilityWeighted => "reliability-weighted",
            Self::CostOptimized => "cost-optimized",
        }
    }
}

impl Default for Strategy {
    fn default() -> Self {
        Self::ReliabilityWeighted
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.name() == normalized)
            .ok_or_else(|| SwarmError::InvalidConfig {
                field: "strategy".to_string(),
                reason: format!("unknown strategy '{}'", s),
            })
    }
}

/// What the engine needs to know about a task
#[derive(Debug, Clone, Copy)]
pub struct Demand<'a> {
    /// Task type
    pub task_type: &'a TaskType,
    /// Hardware and reliability requirements
    pub requirements: &'a TaskRequirements,
    /// Reward budget, used by cost estimation
    pub reward: f64,
}

/// A node as seen by the engine
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Registry snapshot
    pub node: Node,
    /// Rolling completion rate
    pub completion_rate: f64,
    /// Smoothed transport round trip, if measured
    pub latency_ms: Option<f64>,
    /// Session uptime
    pub uptime_ms: u64,
}

impl Candidate {
    /// Wrap a node with no history and no latency sample
    #[must_use]
    pub fn from_node(node: Node) -> Self {
        Self {
            node,
            completion_rate: 1.0,
            latency_ms: None,
            uptime_ms: 0,
        }
    }

    fn load_score(&self) -> f64 {
        let m = &self.node.metrics;
        0.4 * f64::from(m.active_tasks)
            + 0.2 * m.cpu_usage
            + 0.2 * m.memory_usage
            + 0.2 * (f64::from(m.queue_depth) / 10.0)
    }

    fn capability_score(&self, demand: &Demand<'_>) -> f64 {
        let profile = &self.node.profile;
        let req = demand.requirements;
        let cpu = surplus(f64::from(profile.cpu_cores), f64::from(req.min_cpu_cores));
        let mem = surplus(profile.memory_mb as f64, req.min_memory_mb as f64);
        let gpu = match (req.gpu, profile.gpu) {
            (true, true) => 1.0,
            (false, false) => 0.5,
            (false, true) => 0.25,
            (true, false) => 0.0,
        };
        let kind = if profile.task_types.contains(demand.task_type) { 1.0 } else { 0.0 };
        0.35 * cpu + 0.35 * mem + 0.2 * gpu + 0.1 * kind
    }

    fn distance(&self, demand: &Demand<'_>) -> u8 {
        match (&demand.requirements.origin, &self.node.profile.location) {
            (Some(origin), Some(location)) => origin.distance(location),
            _ => UNKNOWN_DISTANCE,
        }
    }

    fn reliability_score(&self) -> f64 {
        let uptime = (self.uptime_ms as f64 / UPTIME_SATURATION_MS as f64).min(1.0);
        let latency = self.latency_ms.map_or(0.5, |ms| 1.0 / (1.0 + ms.max(0.0) / 100.0));
        0.4 * self.node.reliability + 0.2 * uptime + 0.3 * self.completion_rate + 0.1 * latency
    }

    fn cost(&self, demand: &Demand<'_>) -> f64 {
        if self.node.profile.cpu_cores == 0 {
            return f64::INFINITY;
        }
        demand.reward * (2.0 - self.node.reliability) / f64::from(self.node.profile.cpu_cores)
    }
}

/// Capacity over requirement, normalized to `[0, 1]` (4x surplus saturates)
fn surplus(have: f64, need: f64) -> f64 {
    let ratio = if need <= 0.0 { 1.0 + have.min(3.0) / 3.0 } else { have / need };
    (ratio.min(4.0)) / 4.0
}

/// First element with the lowest key
fn arg_min<'a, F>(candidates: &[&'a Candidate], key: F) -> Option<&'a Candidate>
where
    F: Fn(&Candidate) -> f64,
{
    candidates.iter().copied().fold(None, |best, c| match best {
        Some(b) if key(b) <= key(c) => Some(b),
        _ => Some(c),
    })
}

/// First element with the highest key
fn arg_max<'a, F>(candidates: &[&'a Candidate], key: F) -> Option<&'a Candidate>
where
    F: Fn(&Candidate) -> f64,
{
    candidates.iter().copied().fold(None, |best, c| match best {
        Some(b) if key(b) >= key(c) => Some(b),
        _ => Some(c),
    })
}

/// Draw one entry with probability proportional to its weight
fn weighted_pick<R: Rng>(rng: &mut R, weighted: &[(NodeId, f64)]) -> Option<NodeId> {
    let total: f64 = weighted.iter().map(|(_, w)| w.max(0.0)).sum();
    if weighted.is_empty() {
        return None;
    }
    if total <= 0.0 {
        return weighted.first().map(|(id, _)| *id);
    }
    let mut target = rng.gen_range(0.0..total);
    for (id, weight) in weighted {
        let weight = weight.max(0.0);
        if target < weight {
            return Some(*id);
        }
        target -= weight;
    }
    weighted.last().map(|(id, _)| *id)
}

#[derive(Debug)]
struct EngineState {
    strategy: Strategy,
    adaptive: bool,
    switches: u64,
}

/// Strategy-driven node selection
pub struct AssignmentEngine {
    /// Configuration
    config: AssignmentConfig,
    /// Current strategy and adaptation flag
    state: Mutex<EngineState>,
    /// Round-robin rotation
    rr_offset: AtomicUsize,
    /// RNG for the weighted-random pick
    rng: Mutex<ChaCha8Rng>,
}

impl AssignmentEngine {
    /// Create an engine
    #[must_use]
    pub fn new(config: AssignmentConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            state: Mutex::new(EngineState {
                strategy: config.default_strategy,
                adaptive: config.adaptive,
                switches: 0,
            }),
            rr_offset: AtomicUsize::new(0),
            rng: Mutex::new(rng),
            config,
        }
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &AssignmentConfig {
        &self.config
    }

    /// Strategy in effect
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).strategy
    }

    /// Whether the optimizer may switch strategies
    #[must_use]
    pub fn is_adaptive(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).adaptive
    }

    /// Strategy switches performed so far
    #[must_use]
    pub fn switch_count(&self) -> u64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).switches
    }

    /// Pin a strategy chosen by an operator
    ///
    /// Turns adaptive switching off until [`Self::set_adaptive`] re-enables it.
    /// Returns the previous strategy.
    pub fn set_strategy(&self, strategy: Strategy) -> Strategy {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = state.strategy;
        state.adaptive = false;
        if previous != strategy {
            state.strategy = strategy;
            state.switches += 1;
        }
        info!(from = %previous, to = %strategy, "strategy pinned");
        previous
    }

    /// Enable or disable adaptive switching
    pub fn set_adaptive(&self, adaptive: bool) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).adaptive = adaptive;
    }

    /// Strategy the hysteresis rule recommends for the observed swarm
    #[must_use]
    pub fn recommend(&self, average_completion_rate: f64, max_active_tasks: u32) -> Strategy {
        if average_completion_rate < self.config.completion_rate_floor {
            Strategy::ReliabilityWeighted
        } else if max_active_tasks > self.config.load_high_water {
            Strategy::LoadBalanced
        } else {
            Strategy::CostOptimized
        }
    }

    /// Apply the recommendation if adaptive switching is on
    ///
    /// Returns `(from, to)` when the strategy changed.
    pub fn optimize(&self, average_completion_rate: f64, max_active_tasks: u32) -> Option<(Strategy, Strategy)> {
        let target = self.recommend(average_completion_rate, max_active_tasks);
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.adaptive || state.strategy == target {
            return None;
        }
        let from = state.strategy;
        state.strategy = target;
        state.switches += 1;
        info!(%from, to = %target, average_completion_rate, max_active_tasks, "strategy switched");
        Some((from, target))
    }

    /// Select under the current strategy
    #[must_use]
    pub fn select_current(&self, demand: &Demand<'_>, candidates: &[Candidate]) -> Option<NodeId> {
        self.select(demand, candidates, self.strategy())
    }

    /// Select the node that should run `demand` under `strategy`
    ///
    /// Candidates must be in registration order. Returns `None` when no
    /// candidate passes the eligibility filter or the strategy rejects all.
    #[must_use]
    pub fn select(&self, demand: &Demand<'_>, candidates: &[Candidate], strategy: Strategy) -> Option<NodeId> {
        let eligible: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.node.is_eligible(demand.task_type, demand.requirements))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let chosen = match strategy {
            Strategy::RoundRobin => {
                let offset = self.rr_offset.fetch_add(1, AtomicOrdering::Relaxed);
                Some(eligible[offset % eligible.len()])
            }
            Strategy::LoadBalanced => arg_min(&eligible, Candidate::load_score),
            Strategy::CapabilityMatched => arg_max(&eligible, |c| c.capability_score(demand))
                .filter(|c| c.capability_score(demand) > 0.0),
            Strategy::LocalityAware => arg_min(&eligible, |c| f64::from(c.distance(demand))),
            Strategy::ReliabilityWeighted => return self.reliability_weighted(&eligible),
            Strategy::CostOptimized => arg_min(&eligible, |c| c.cost(demand)),
        };
        chosen.map(|c| c.node.id)
    }

    fn reliability_weighted(&self, eligible: &[&Candidate]) -> Option<NodeId> {
        let mut ranked: Vec<(NodeId, f64)> = eligible
            .iter()
            .map(|c| (c.node.id, c.reliability_score()))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        ranked.truncate(self.config.reliability_candidates);

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        weighted_pick(&mut *rng, &ranked)
    }
}

impl Default for AssignmentEngine {
    fn default() -> Self {
        Self::new(AssignmentConfig::default())
    }
}
