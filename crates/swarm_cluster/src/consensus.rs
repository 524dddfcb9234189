//! Majority consensus over redundant task results.
//!
//! Pure evaluation: no locks, no I/O. The ledger feeds the collected
//! results in arrival order and acts on the [`Verdict`]. Grouping is by
//! digest equality, so the verdict does not depend on arrival order or on
//! which worker produced which result.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use swarm_core::{NodeId, ResultDigest, Timestamp};

/// Reliability multiplier for a worker whose result did not agree
pub const DISAGREEMENT_PENALTY: f64 = 0.95;

/// Reliability multiplier for a worker in the accepted group
pub const AGREEMENT_BOOST: f64 = 1.01;

/// Slack for products like `3 * 0.66` landing a hair above an integer
const CEIL_EPSILON: f64 = 1e-9;

/// One worker's reported output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedResult {
    /// Worker that produced it
    pub worker: NodeId,
    /// Content digest
    pub digest: ResultDigest,
    /// Arrival time
    pub timestamp: Timestamp,
}

impl SubmittedResult {
    /// Create a result record
    #[must_use]
    pub fn new(worker: NodeId, digest: ResultDigest, timestamp: Timestamp) -> Self {
        Self { worker, digest, timestamp }
    }
}

/// Outcome of evaluating the results collected so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Too few results to attempt consensus
    Collecting {
        /// Results so far
        collected: usize,
        /// Results required before the first evaluation
        required: usize,
    },
    /// The largest group met the threshold
    Accepted {
        /// Accepted digest
        digest: ResultDigest,
        /// Workers in the accepted group, in arrival order
        contributors: Vec<NodeId>,
        /// Workers outside the accepted group
        dissenters: Vec<NodeId>,
    },
    /// No group met the threshold but redundancy is not exhausted
    Inconclusive {
        /// Results so far
        collected: usize,
    },
    /// No group met the threshold with full redundancy collected
    Rejected {
        /// Workers whose result matched no other worker's
        dissenters: Vec<NodeId>,
    },
}

/// Threshold and redundancy for one task
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsensusRule {
    threshold: f64,
    redundancy: u32,
}

impl ConsensusRule {
    /// Create a rule
    #[must_use]
    pub fn new(threshold: f64, redundancy: u32) -> Self {
        Self {
            threshold: threshold.clamp(f64::MIN_POSITIVE, 1.0),
            redundancy: redundancy.max(1),
        }
    }

    /// Agreement fraction
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Target number of independent executions
    #[must_use]
    pub fn redundancy(&self) -> u32 {
        self.redundancy
    }

    /// Results required before consensus is first attempted:
    /// `ceil(redundancy * threshold)`
    #[must_use]
    pub fn required_results(&self) -> usize {
        ceil_fraction(self.redundancy as usize, self.threshold)
    }

    /// Group size needed to accept with `collected` results:
    /// `ceil(collected * threshold)`
    #[must_use]
    pub fn agreement_needed(&self, collected: usize) -> usize {
        ceil_fraction(collected, self.threshold)
    }

    /// Evaluate the collected results
    #[must_use]
    pub fn evaluate(&self, results: &[SubmittedResult]) -> Verdict {
        let collected = results.len();
        let required = self.required_results();
        if collected < required {
            return Verdict::Collecting { collected, required };
        }

        let groups = group_by_digest(results);
        // Largest group; equal sizes resolve to the lowest digest.
        let winner = groups
            .iter()
            .max_by(|a, b| a.1.len().cmp(&b.1.len()).then_with(|| b.0.cmp(a.0)));
        if let Some((digest, contributors)) = winner {
            if contributors.len() >= self.agreement_needed(collected) {
                let dissenters = results
                    .iter()
                    .filter(|r| r.digest != **digest)
                    .map(|r| r.worker)
                    .collect();
                return Verdict::Accepted {
                    digest: **digest,
                    contributors: contributors.clone(),
                    dissenters,
                };
            }
        }

        if collected < self.redundancy as usize {
            return Verdict::Inconclusive { collected };
        }
        let dissenters = groups
            .values()
            .filter(|workers| workers.len() == 1)
            .flatten()
            .copied()
            .collect();
        Verdict::Rejected { dissenters }
    }
}

fn ceil_fraction(count: usize, fraction: f64) -> usize {
    let raw = (count as f64 * fraction - CEIL_EPSILON).ceil();
    (raw.max(1.0)) as usize
}

fn group_by_digest(results: &[SubmittedResult]) -> BTreeMap<&ResultDigest, Vec<NodeId>> {
    let mut groups: BTreeMap<&ResultDigest, Vec<NodeId>> = BTreeMap::new();
    for result in results {
        groups.entry(&result.digest).or_default().push(result.worker);
    }
    groups
}

/// Split `budget` across contributors in proportion to reliability
///
/// Weights that are not positive count as zero. If every weight is zero the
/// budget is split evenly.
#[must_use]
pub fn split_rewards(budget: f64, weights: &[(NodeId, f64)]) -> Vec<(NodeId, f64)> {
    if weights.is_empty() {
        return Vec::new();
    }
    let total: f64 = weights.iter().map(|(_, w)| w.max(0.0)).sum();
    if total <= 0.0 {
        let even = budget / weights.len() as f64;
        return weights.iter().map(|(id, _)| (*id, even)).collect();
    }
    weights
        .iter()
        .map(|(id, w)| (*id, budget * w.max(0.0) / total))
        .collect()
}
