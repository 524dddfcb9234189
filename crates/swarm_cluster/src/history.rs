//! Distribution history: rolling per-node outcome counters and per-task-type
//! aggregates.
//!
//! The assignment engine reads completion rates from here, and the optimizer
//! reads the swarm-wide average to decide strategy switches.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use swarm_core::{NodeId, TaskType};
use tokio::sync::RwLock;

/// Outcomes remembered per node for the rolling completion rate
pub const OUTCOME_WINDOW: usize = 100;

/// Per-node counters
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeCounters {
    /// Lifetime completions
    pub completed: u64,
    /// Lifetime failures
    pub failed: u64,
    /// Lifetime outcomes
    pub total: u64,
    /// Most recent outcomes, `true` = completed
    #[serde(skip)]
    window: VecDeque<bool>,
}

impl NodeCounters {
    fn record(&mut self, completed: bool) {
        self.total += 1;
        if completed {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        if self.window.len() == OUTCOME_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(completed);
    }

    /// Completion rate over the rolling window (1.0 with no history)
    #[must_use]
    pub fn completion_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let done = self.window.iter().filter(|c| **c).count();
        done as f64 / self.window.len() as f64
    }
}

/// Aggregates per task type
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskTypeMetrics {
    /// Tasks submitted
    pub submitted: u64,
    /// Tasks completed by consensus
    pub completed: u64,
    /// Tasks failed terminally
    pub failed: u64,
    /// Sum of submit-to-completion times
    pub total_completion_ms: u64,
}

impl TaskTypeMetrics {
    /// Mean submit-to-completion time
    #[must_use]
    pub fn average_completion_ms(&self) -> u64 {
        if self.completed == 0 {
            return 0;
        }
        self.total_completion_ms / self.completed
    }
}

/// Rolling distribution history
#[derive(Debug, Default)]
pub struct DistributionHistory {
    nodes: RwLock<HashMap<NodeId, NodeCounters>>,
    task_types: RwLock<HashMap<TaskType, TaskTypeMetrics>>,
}

impl DistributionHistory {
    /// Create an empty history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a node's contribution to an accepted result
    pub async fn record_node_completion(&self, node: NodeId) {
        self.nodes.write().await.entry(node).or_default().record(true);
    }

    /// Record a timeout, disconnect or disagreeing result
    pub async fn record_node_failure(&self, node: NodeId) {
        self.nodes.write().await.entry(node).or_default().record(false);
    }

    /// Forget a node's counters
    pub async fn forget_node(&self, node: NodeId) -> bool {
        self.nodes.write().await.remove(&node).is_some()
    }

    /// Record a submission
    pub async fn record_submitted(&self, task_type: &TaskType) {
        self.task_types.write().await.entry(task_type.clone()).or_default().submitted += 1;
    }

    /// Record a consensus completion
    pub async fn record_task_completed(&self, task_type: &TaskType, elapsed_ms: u64) {
        let mut types = self.task_types.write().await;
        let metrics = types.entry(task_type.clone()).or_default();
        metrics.completed += 1;
        metrics.total_completion_ms += elapsed_ms;
    }

    /// Record a terminal failure
    pub async fn record_task_failed(&self, task_type: &TaskType) {
        self.task_types.write().await.entry(task_type.clone()).or_default().failed += 1;
    }

    /// Rolling completion rate of a node
    pub async fn completion_rate(&self, node: NodeId) -> f64 {
        self.nodes
            .read()
            .await
            .get(&node)
            .map_or(1.0, NodeCounters::completion_rate)
    }

    /// Completion rates of many nodes in one lock
    pub async fn completion_rates(&self, nodes: &[NodeId]) -> HashMap<NodeId, f64> {
        let counters = self.nodes.read().await;
        nodes
            .iter()
            .map(|id| (*id, counters.get(id).map_or(1.0, NodeCounters::completion_rate)))
            .collect()
    }

    /// Mean completion rate over nodes with any history (1.0 with none)
    pub async fn average_completion_rate(&self) -> f64 {
        let counters = self.nodes.read().await;
        let rates: Vec<f64> = counters
            .values()
            .filter(|c| c.total > 0)
            .map(NodeCounters::completion_rate)
            .collect();
        if rates.is_empty() {
            return 1.0;
        }
        rates.iter().sum::<f64>() / rates.len() as f64
    }

    /// Copy of all per-node counters
    pub async fn node_counters(&self) -> HashMap<NodeId, NodeCounters> {
        self.nodes.read().await.clone()
    }

    /// Copy of all per-task-type aggregates
    pub async fn task_type_metrics(&self) -> HashMap<TaskType, TaskTypeMetrics> {
        self.task_types.read().await.clone()
    }
}
