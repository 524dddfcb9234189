//! Task ledger: queue, assignment records, redundant result collection and
//! consensus acceptance.
//!
//! Every task lives behind its own lock. Lock order is task, then node
//! (registry), then peer (transport); the queue lock is never held while a
//! task lock is being acquired.
//!
//! Each assignment carries an epoch. Execution timers fire into a channel
//! with the epoch they were armed for, and a firing whose epoch no longer
//! matches the task's current assignment is ignored. That is what keeps a
//! late timeout from undoing a result and a late result from reviving a
//! timed-out assignment.

use crate::assignment::{AssignmentEngine, Candidate, Demand};
use crate::config::LedgerConfig;
use crate::consensus::{split_rewards, ConsensusRule, SubmittedResult, Verdict, AGREEMENT_BOOST, DISAGREEMENT_PENALTY};
use crate::events::{EventBus, RewardEvent, SwarmEvent};
use crate::history::DistributionHistory;
use crate::registry::NodeRegistry;
use crate::store::{CompletionRecord, StoreRecord, WriteBehind};
use crate::transport::TransportChannelManager;
use crate::wire::WireMessage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swarm_core::{
    NodeId, Priority, ResultDigest, SwarmError, SwarmResult, TaskId, TaskRequirements, TaskType, Timestamp,
};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reliability multiplier for a node whose assignment timed out or was abandoned
pub const TIMEOUT_PENALTY: f64 = 0.9;

/// Failure reason when the queue wait exhausts the attempts
pub const NO_ELIGIBLE_NODE_REASON: &str = "no eligible node within timeout";

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a worker
    Pending,
    /// Held by a worker, no results yet
    Assigned,
    /// At least one result collected this round
    Validating,
    /// Accepted by consensus
    Completed,
    /// Attempts exhausted
    Failed,
    /// Cancelled by the requester
    Cancelled,
}

impl TaskStatus {
    /// Whether the task will never change again
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// What a requester submits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task type
    pub task_type: TaskType,
    /// Queue priority
    #[serde(default)]
    pub priority: Priority,
    /// Node requirements
    #[serde(default)]
    pub requirements: TaskRequirements,
    /// Opaque payload reference handed to workers
    pub payload_ref: String,
    /// Reward split among the accepted group
    pub reward_budget: f64,
    /// Agreement fraction; the ledger default when absent
    #[serde(default)]
    pub consensus_threshold: Option<f64>,
    /// Attempt limit; the ledger default when absent
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl TaskSpec {
    /// Create a normal-priority spec with no requirements
    #[must_use]
    pub fn new(task_type: impl Into<TaskType>, payload_ref: impl Into<String>, reward_budget: f64) -> Self {
        Self {
            task_type: task_type.into(),
            priority: Priority::Normal,
            requirements: TaskRequirements::none(),
            payload_ref: payload_ref.into(),
            reward_budget,
            consensus_threshold: None,
            max_attempts: None,
        }
    }

    /// Set priority
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set requirements
    #[must_use]
    pub fn with_requirements(mut self, requirements: TaskRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Set consensus threshold
    #[must_use]
    pub fn with_consensus_threshold(mut self, threshold: f64) -> Self {
        self.consensus_threshold = Some(threshold);
        self
    }

    /// Set attempt limit
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Check the spec
    ///
    /// # Errors
    ///
    /// Returns `InvalidTask` describing the first problem found
    pub fn validate(&self) -> SwarmResult<()> {
        if self.task_type.as_str().is_empty() {
            return Err(invalid_task("task type is empty"));
        }
        if !self.reward_budget.is_finite() || self.reward_budget < 0.0 {
            return Err(invalid_task("reward budget must be a non-negative number"));
        }
        if let Some(threshold) = self.consensus_threshold {
            if !(threshold > 0.0 && threshold <= 1.0) {
                return Err(invalid_task("consensus threshold must be in (0, 1]"));
            }
        }
        if self.max_attempts == Some(0) {
            return Err(invalid_task("max attempts must be at least 1"));
        }
        self.requirements.validate()
    }
}

fn invalid_task(reason: &str) -> SwarmError {
    SwarmError::InvalidTask { reason: reason.to_string() }
}

/// A task owned by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Task ID
    pub id: TaskId,
    /// Task type
    pub task_type: TaskType,
    /// Queue priority
    pub priority: Priority,
    /// Node requirements
    pub requirements: TaskRequirements,
    /// Payload reference
    pub payload_ref: String,
    /// Reward budget
    pub reward_budget: f64,
    /// Agreement fraction
    pub consensus_threshold: f64,
    /// Attempts consumed
    pub attempts: u32,
    /// Attempt limit
    pub max_attempts: u32,
    /// Results collected this round, in arrival order
    pub results: Vec<SubmittedResult>,
    /// Status
    pub status: TaskStatus,
    /// Submission time
    pub submitted_at: Timestamp,
    /// Terminal transition time
    pub finished_at: Option<Timestamp>,
    /// Accepted digest
    pub accepted: Option<ResultDigest>,
    /// Generic failure reason
    pub failure_reason: Option<String>,
}

impl Task {
    /// What the assignment engine needs
    #[must_use]
    pub fn demand(&self) -> Demand<'_> {
        Demand {
            task_type: &self.task_type,
            requirements: &self.requirements,
            reward: self.reward_budget,
        }
    }
}

/// The live assignment of a task to a node
#[derive(Debug, Clone)]
pub struct Assignment {
    /// Holder
    pub node: NodeId,
    /// Monotonic assignment epoch
    pub epoch: u64,
    /// When the assignment started
    pub assigned_at: Timestamp,
    /// Execution timer handle
    timer: CancellationToken,
}

/// An execution timer that fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expiry {
    /// Task
    pub task_id: TaskId,
    /// Epoch the timer was armed for
    pub epoch: u64,
}

/// Requester-facing status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    /// Task
    pub task_id: TaskId,
    /// Status
    pub status: TaskStatus,
    /// Attempts consumed
    pub attempts: u32,
    /// Attempt limit
    pub max_attempts: u32,
    /// Results collected this round
    pub results_collected: usize,
    /// Current holder
    pub holder: Option<NodeId>,
    /// Accepted digest
    pub accepted: Option<ResultDigest>,
    /// Generic failure reason
    pub failure_reason: Option<String>,
}

/// Counts over all tasks
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Pending tasks
    pub pending: usize,
    /// Assigned tasks
    pub assigned: usize,
    /// Validating tasks
    pub validating: usize,
    /// Completed tasks
    pub completed: usize,
    /// Failed tasks
    pub failed: usize,
    /// Cancelled tasks
    pub cancelled: usize,
    /// Tasks waiting for a worker
    pub queue_depth: usize,
    /// Mean time queued tasks have been waiting
    pub average_wait_ms: u64,
}

struct TaskEntry {
    task: Task,
    assignment: Option<Assignment>,
    /// Workers that already contributed to this round
    contributed: HashSet<NodeId>,
    /// Holders that timed out or were lost; never handed this task again
    excluded: HashSet<NodeId>,
    /// Queue sequence while waiting for a worker
    queue_seq: Option<u64>,
    queued_at: Timestamp,
}

/// Components the ledger drives
#[derive(Clone)]
pub struct LedgerDeps {
    /// Node registry
    pub registry: Arc<NodeRegistry>,
    /// Assignment engine
    pub engine: Arc<AssignmentEngine>,
    /// Outcome history
    pub history: Arc<DistributionHistory>,
    /// Transport
    pub transport: Arc<TransportChannelManager>,
    /// Event publisher
    pub events: EventBus,
    /// Persistence queue
    pub persistence: Arc<WriteBehind>,
}

/// Task ledger
pub struct TaskLedger {
    /// Configuration
    config: LedgerConfig,
    /// Tasks by ID
    tasks: RwLock<HashMap<TaskId, Arc<Mutex<TaskEntry>>>>,
    /// Tasks waiting for a worker: (priority, sequence, task)
    queue: Mutex<BTreeSet<(Priority, u64, TaskId)>>,
    /// Queue sequence counter
    sequence: AtomicU64,
    /// Assignment epoch counter
    epochs: AtomicU64,
    /// Fired execution timers
    expiries: mpsc::UnboundedSender<Expiry>,
    /// Collaborators
    deps: LedgerDeps,
}

impl TaskLedger {
    /// Create a ledger
    ///
    /// The returned receiver yields fired execution timers; feed it to
    /// [`TaskLedger::run_timers`].
    #[must_use]
    pub fn new(config: LedgerConfig, deps: LedgerDeps) -> (Self, mpsc::UnboundedReceiver<Expiry>) {
        let (expiries, receiver) = mpsc::unbounded_channel();
        let ledger = Self {
            config,
            tasks: RwLock::new(HashMap::new()),
            queue: Mutex::new(BTreeSet::new()),
            sequence: AtomicU64::new(0),
            epochs: AtomicU64::new(0),
            expiries,
            deps,
        };
        (ledger, receiver)
    }

    /// Ledger configuration
    #[must_use]
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Apply fired timers until shutdown
    pub async fn run_timers(
        self: Arc<Self>,
        mut expiries: mpsc::UnboundedReceiver<Expiry>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                expiry = expiries.recv() => match expiry {
                    Some(expiry) => {
                        self.expire(expiry.task_id, expiry.epoch).await;
                    }
                    None => break,
                },
            }
        }
    }

    async fn entry(&self, task_id: TaskId) -> Option<Arc<Mutex<TaskEntry>>> {
        self.tasks.read().await.get(&task_id).cloned()
    }

    fn rule(&self, task: &Task) -> ConsensusRule {
        ConsensusRule::new(task.consensus_threshold, self.config.redundancy)
    }

    async fn enqueue(&self, entry: &mut TaskEntry, now: Timestamp) {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut queue = self.queue.lock().await;
        if let Some(old) = entry.queue_seq.replace(seq) {
            queue.remove(&(entry.task.priority, old, entry.task.id));
        }
        queue.insert((entry.task.priority, seq, entry.task.id));
        entry.queued_at = now;
    }

    async fn dequeue(&self, entry: &mut TaskEntry) {
        if let Some(seq) = entry.queue_seq.take() {
            self.queue.lock().await.remove(&(entry.task.priority, seq, entry.task.id));
        }
    }

    /// Submit a task and try to assign it right away
    ///
    /// # Errors
    ///
    /// Returns `InvalidTask` if the spec does not validate
    pub async fn submit(&self, spec: TaskSpec) -> SwarmResult<TaskId> {
        let id = self.submit_at(spec, Timestamp::now()).await?;
        self.process_queue().await;
        Ok(id)
    }

    /// Submit a task at an explicit time without running a scheduling pass
    ///
    /// # Errors
    ///
    /// Returns `InvalidTask` if the spec does not validate
    pub async fn submit_at(&self, spec: TaskSpec, now: Timestamp) -> SwarmResult<TaskId> {
        spec.validate()?;
        let id = TaskId::new();
        let task = Task {
            id,
            task_type: spec.task_type,
            priority: spec.priority,
            requirements: spec.requirements,
            payload_ref: spec.payload_ref,
            reward_budget: spec.reward_budget,
            consensus_threshold: spec.consensus_threshold.unwrap_or(self.config.consensus_threshold),
            attempts: 0,
            max_attempts: spec.max_attempts.unwrap_or(self.config.max_attempts),
            results: Vec::new(),
            status: TaskStatus::Pending,
            submitted_at: now,
            finished_at: None,
            accepted: None,
            failure_reason: None,
        };
        let task_type = task.task_type.clone();
        let mut entry = TaskEntry {
            task,
            assignment: None,
            contributed: HashSet::new(),
            excluded: HashSet::new(),
            queue_seq: None,
            queued_at: now,
        };
        self.enqueue(&mut entry, now).await;
        self.tasks.write().await.insert(id, Arc::new(Mutex::new(entry)));

        self.deps.history.record_submitted(&task_type).await;
        info!(task = %id, task_type = %task_type, "task submitted");
        self.deps.events.publish(SwarmEvent::TaskSubmitted { task: id });
        Ok(id)
    }

    async fn candidates(&self, now: Timestamp) -> Vec<Candidate> {
        let nodes = self.deps.registry.snapshot().await;
        let ids: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
        let rates = self.deps.history.completion_rates(&ids).await;
        let latencies = self.deps.transport.latencies().await;
        nodes
            .into_iter()
            .map(|node| Candidate {
                completion_rate: rates.get(&node.id).copied().unwrap_or(1.0),
                latency_ms: latencies.get(&node.id).copied(),
                uptime_ms: node.uptime_ms(now),
                node,
            })
            .collect()
    }

    /// Run one scheduling pass over the queue in priority order
    ///
    /// Returns the number of assignments made.
    pub async fn process_queue(&self) -> usize {
        let queued: Vec<TaskId> = self.queue.lock().await.iter().map(|(_, _, id)| *id).collect();
        if queued.is_empty() {
            return 0;
        }
        let now = Timestamp::now();
        let mut candidates = self.candidates(now).await;
        let mut assigned = 0;

        for task_id in queued {
            if !candidates.iter().any(|c| c.node.is_available()) {
                break;
            }
            let Some(entry) = self.entry(task_id).await else {
                continue;
            };
            let mut entry = entry.lock().await;
            if entry.queue_seq.is_none() || entry.assignment.is_some() || entry.task.status.is_terminal() {
                continue;
            }

            let chosen = {
                let pool: Vec<Candidate> = candidates
                    .iter()
                    .filter(|c| !entry.contributed.contains(&c.node.id) && !entry.excluded.contains(&c.node.id))
                    .cloned()
                    .collect();
                self.deps.engine.select_current(&entry.task.demand(), &pool)
            };
            let Some(node) = chosen else {
                debug!(task = %task_id, "{}", SwarmError::NoEligibleNode(task_id));
                continue;
            };

            match self.assign_locked(&mut entry, node, now).await {
                Ok(_) => {
                    assigned += 1;
                    if let Some(c) = candidates.iter_mut().find(|c| c.node.id == node) {
                        c.node.current_task = Some(task_id);
                    }
                }
                Err(err) => debug!(task = %task_id, node = %node, error = %err, "assignment skipped"),
            }
        }
        assigned
    }

    /// Assign a waiting task to a specific node
    ///
    /// Starts the execution timer and delivers the task. Returns the
    /// assignment epoch.
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound`, `InvalidTask` if the task is not waiting for
    /// a worker, `NodeNotFound`, or `NodeBusy` if the node's slot is taken
    pub async fn on_assigned(&self, task_id: TaskId, node: NodeId) -> SwarmResult<u64> {
        let entry = self.entry(task_id).await.ok_or(SwarmError::TaskNotFound(task_id))?;
        let mut entry = entry.lock().await;
        if entry.queue_seq.is_none() || entry.assignment.is_some() {
            return Err(invalid_task("task is not waiting for a worker"));
        }
        if entry.contributed.contains(&node) {
            return Err(invalid_task("node already contributed a result this round"));
        }
        if entry.excluded.contains(&node) {
            return Err(invalid_task("node already failed this task"));
        }
        self.assign_locked(&mut entry, node, Timestamp::now()).await
    }

    async fn assign_locked(&self, entry: &mut TaskEntry, node: NodeId, now: Timestamp) -> SwarmResult<u64> {
        let task_id = entry.task.id;
        self.deps.registry.claim(node, task_id).await?;
        self.dequeue(entry).await;

        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let timer = CancellationToken::new();
        entry.assignment = Some(Assignment { node, epoch, assigned_at: now, timer: timer.clone() });
        entry.task.status = if entry.task.results.is_empty() {
            TaskStatus::Assigned
        } else {
            TaskStatus::Validating
        };
        self.arm_timer(task_id, epoch, timer);

        let message = WireMessage::Task {
            task_id,
            epoch,
            task_type: entry.task.task_type.clone(),
            payload_ref: entry.task.payload_ref.clone(),
        };
        if let Err(err) = self.deps.transport.send_task(node, &message).await {
            warn!(task = %task_id, node = %node, error = %err, "task delivery failed");
        }

        info!(task = %task_id, node = %node, epoch, attempts = entry.task.attempts, "task assigned");
        self.deps.events.publish(SwarmEvent::TaskAssigned { task: task_id, node, epoch });
        Ok(epoch)
    }

    fn arm_timer(&self, task_id: TaskId, epoch: u64, timer: CancellationToken) {
        let expiries = self.expiries.clone();
        let timeout = Duration::from_millis(self.config.execution_timeout_ms);
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let _ = expiries.send(Expiry { task_id, epoch });
                }
            }
        });
    }

    /// Execution timeout for the task's current assignment
    ///
    /// Returns whether the timeout was applied.
    pub async fn on_timeout(&self, task_id: TaskId) -> bool {
        let epoch = match self.entry(task_id).await {
            Some(entry) => entry.lock().await.assignment.as_ref().map(|a| a.epoch),
            None => None,
        };
        match epoch {
            Some(epoch) => self.expire(task_id, epoch).await,
            None => false,
        }
    }

    /// Apply a timer armed for `epoch`; stale timers are ignored
    ///
    /// Returns whether the timeout was applied.
    pub async fn expire(&self, task_id: TaskId, epoch: u64) -> bool {
        let Some(entry) = self.entry(task_id).await else {
            return false;
        };
        {
            let mut entry = entry.lock().await;
            let current = entry.assignment.as_ref().map(|a| a.epoch);
            if current != Some(epoch) {
                debug!(task = %task_id, epoch, ?current, "stale timer ignored");
                return false;
            }
            let Some(assignment) = entry.assignment.take() else {
                return false;
            };
            assignment.timer.cancel();
            let node = assignment.node;
            entry.excluded.insert(node);
            self.deps.registry.release(node, task_id).await;
            let reliability = self.deps.registry.scale_reliability(node, TIMEOUT_PENALTY).await;
            self.deps.history.record_node_failure(node).await;
            let cancel = WireMessage::Cancel { task_id, epoch };
            if let Err(err) = self.deps.transport.send_control(node, &cancel).await {
                debug!(task = %task_id, node = %node, error = %err, "cancel not delivered");
            }
            info!(task = %task_id, node = %node, epoch, ?reliability, "execution timed out");
            self.retry_or_fail(&mut entry, "execution timeout", Timestamp::now()).await;
        }
        self.process_queue().await;
        true
    }

    /// Return the task a lost node held to the queue
    ///
    /// The registry has already freed the slot. Returns whether the task
    /// was affected.
    pub async fn on_node_lost(&self, node: NodeId, task_id: TaskId) -> bool {
        let Some(entry) = self.entry(task_id).await else {
            return false;
        };
        {
            let mut entry = entry.lock().await;
            if entry.assignment.as_ref().map(|a| a.node) != Some(node) {
                return false;
            }
            if let Some(assignment) = entry.assignment.take() {
                assignment.timer.cancel();
            }
            entry.excluded.insert(node);
            self.deps.registry.scale_reliability(node, TIMEOUT_PENALTY).await;
            self.deps.history.record_node_failure(node).await;
            info!(task = %task_id, node = %node, "holder lost, task requeued");
            self.retry_or_fail(&mut entry, "node disconnected", Timestamp::now()).await;
        }
        self.process_queue().await;
        true
    }

    /// Consume an attempt, then requeue or fail
    async fn retry_or_fail(&self, entry: &mut TaskEntry, reason: &str, now: Timestamp) {
        entry.task.attempts += 1;
        if entry.task.attempts >= entry.task.max_attempts {
            let reason = format!("no consensus after {} attempts", entry.task.attempts);
            self.fail(entry, reason, now).await;
            return;
        }
        entry.task.status = TaskStatus::Pending;
        self.enqueue(entry, now).await;
        debug!(task = %entry.task.id, attempts = entry.task.attempts, reason, "task requeued");
        self.deps.events.publish(SwarmEvent::TaskRequeued {
            task: entry.task.id,
            attempts: entry.task.attempts,
            reason: reason.to_string(),
        });
    }

    async fn fail(&self, entry: &mut TaskEntry, reason: String, now: Timestamp) {
        self.dequeue(entry).await;
        if let Some(assignment) = entry.assignment.take() {
            assignment.timer.cancel();
            self.deps.registry.release(assignment.node, entry.task.id).await;
        }
        entry.task.status = TaskStatus::Failed;
        entry.task.finished_at = Some(now);
        entry.task.failure_reason = Some(reason.clone());
        self.deps.history.record_task_failed(&entry.task.task_type).await;
        warn!(task = %entry.task.id, attempts = entry.task.attempts, %reason, "task failed");
        self.deps.events.publish(SwarmEvent::TaskFailed {
            task: entry.task.id,
            attempts: entry.task.attempts,
            reason,
        });
    }

    /// Record a worker's result
    ///
    /// Only the current holder's result counts; anything else is a late or
    /// unsolicited result and is ignored. Returns the task status afterwards.
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` for unknown tasks
    pub async fn submit_result(&self, task_id: TaskId, worker: NodeId, digest: ResultDigest) -> SwarmResult<TaskStatus> {
        self.accept_result(task_id, worker, None, digest, Timestamp::now()).await
    }

    /// Record a result that echoes its assignment epoch
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` for unknown tasks
    pub async fn submit_result_for_epoch(
        &self,
        task_id: TaskId,
        worker: NodeId,
        epoch: u64,
        digest: ResultDigest,
    ) -> SwarmResult<TaskStatus> {
        self.accept_result(task_id, worker, Some(epoch), digest, Timestamp::now()).await
    }

    async fn accept_result(
        &self,
        task_id: TaskId,
        worker: NodeId,
        epoch: Option<u64>,
        digest: ResultDigest,
        now: Timestamp,
    ) -> SwarmResult<TaskStatus> {
        let entry = self.entry(task_id).await.ok_or(SwarmError::TaskNotFound(task_id))?;
        let status = {
            let mut entry = entry.lock().await;
            let holder = entry.assignment.as_ref().map(|a| (a.node, a.epoch));
            let current = match holder {
                Some((node, current)) if node == worker && epoch.is_none_or(|e| e == current) => current,
                _ => {
                    warn!(task = %task_id, worker = %worker, ?epoch, status = ?entry.task.status, "late or unsolicited result ignored");
                    return Ok(entry.task.status);
                }
            };
            if let Some(assignment) = entry.assignment.take() {
                assignment.timer.cancel();
            }
            self.deps.registry.release(worker, task_id).await;
            entry.task.results.push(SubmittedResult::new(worker, digest, now));
            entry.contributed.insert(worker);
            debug!(task = %task_id, worker = %worker, epoch = current, digest = %digest.short(), "result collected");

            let rule = self.rule(&entry.task);
            match rule.evaluate(&entry.task.results) {
                Verdict::Collecting { .. } | Verdict::Inconclusive { .. } => {
                    entry.task.status = TaskStatus::Validating;
                    self.enqueue(&mut entry, now).await;
                }
                Verdict::Accepted { digest, contributors, dissenters } => {
                    self.complete(&mut entry, digest, contributors, dissenters, now).await;
                }
                Verdict::Rejected { dissenters } => {
                    for node in &dissenters {
                        self.deps.registry.scale_reliability(*node, DISAGREEMENT_PENALTY).await;
                        self.deps.history.record_node_failure(*node).await;
                    }
                    info!(task = %task_id, collected = entry.task.results.len(), dissenters = dissenters.len(), "{}",
                        SwarmError::ConsensusNotReached { task: task_id, attempts: entry.task.attempts + 1 });
                    entry.task.results.clear();
                    entry.contributed.clear();
                    self.retry_or_fail(&mut entry, "no consensus", now).await;
                }
            }
            entry.task.status
        };
        self.process_queue().await;
        Ok(status)
    }

    async fn complete(
        &self,
        entry: &mut TaskEntry,
        digest: ResultDigest,
        contributors: Vec<NodeId>,
        dissenters: Vec<NodeId>,
        now: Timestamp,
    ) {
        let task_id = entry.task.id;
        self.dequeue(entry).await;
        entry.task.status = TaskStatus::Completed;
        entry.task.finished_at = Some(now);
        entry.task.accepted = Some(digest);

        let registry = &self.deps.registry;
        let mut weights = Vec::with_capacity(contributors.len());
        for node in &contributors {
            let reliability = registry
                .reliability(*node)
                .await
                .unwrap_or(registry.config().initial_reliability);
            weights.push((*node, reliability));
        }
        for (node, amount) in split_rewards(entry.task.reward_budget, &weights) {
            registry.record_completion(node, amount).await;
            registry.scale_reliability(node, AGREEMENT_BOOST).await;
            self.deps.history.record_node_completion(node).await;
            let reward = RewardEvent { node_id: node, amount, task_id, timestamp: now };
            self.deps.persistence.enqueue(StoreRecord::Reward(reward.clone()));
            self.deps.events.publish(SwarmEvent::Reward(reward));
        }
        for node in &dissenters {
            registry.scale_reliability(*node, DISAGREEMENT_PENALTY).await;
            self.deps.history.record_node_failure(*node).await;
        }

        let elapsed = now.millis_since(entry.task.submitted_at);
        self.deps.history.record_task_completed(&entry.task.task_type, elapsed).await;
        self.deps.persistence.enqueue(StoreRecord::Completion(CompletionRecord {
            task_id,
            task_type: entry.task.task_type.clone(),
            digest,
            contributors: contributors.clone(),
            attempts: entry.task.attempts,
            completed_at: now,
        }));
        info!(task = %task_id, digest = %digest.short(), contributors = contributors.len(), "consensus reached");
        self.deps.events.publish(SwarmEvent::TaskCompleted { task: task_id, digest, contributors });
    }

    /// Cancel a task
    ///
    /// Frees the holder and tells it to stop. Cancelling a finished task is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` for unknown tasks
    pub async fn cancel(&self, task_id: TaskId) -> SwarmResult<TaskStatus> {
        let entry = self.entry(task_id).await.ok_or(SwarmError::TaskNotFound(task_id))?;
        let freed = {
            let mut entry = entry.lock().await;
            if entry.task.status.is_terminal() {
                return Ok(entry.task.status);
            }
            self.dequeue(&mut entry).await;
            let freed = entry.assignment.take();
            if let Some(assignment) = &freed {
                assignment.timer.cancel();
                self.deps.registry.release(assignment.node, task_id).await;
                let cancel = WireMessage::Cancel { task_id, epoch: assignment.epoch };
                if let Err(err) = self.deps.transport.send_control(assignment.node, &cancel).await {
                    debug!(task = %task_id, error = %err, "cancel not delivered");
                }
            }
            entry.task.status = TaskStatus::Cancelled;
            entry.task.finished_at = Some(Timestamp::now());
            info!(task = %task_id, "task cancelled");
            self.deps.events.publish(SwarmEvent::TaskCancelled { task: task_id });
            freed.is_some()
        };
        if freed {
            self.process_queue().await;
        }
        Ok(TaskStatus::Cancelled)
    }

    /// Consume an attempt for every task queued longer than the pending timeout
    ///
    /// Returns the number of tasks charged.
    pub async fn sweep_pending_at(&self, now: Timestamp) -> usize {
        let queued: Vec<TaskId> = self.queue.lock().await.iter().map(|(_, _, id)| *id).collect();
        let mut charged = 0;
        for task_id in queued {
            let Some(entry) = self.entry(task_id).await else {
                continue;
            };
            let mut entry = entry.lock().await;
            if entry.queue_seq.is_none() || now.millis_since(entry.queued_at) <= self.config.pending_timeout_ms {
                continue;
            }
            charged += 1;
            entry.task.attempts += 1;
            if entry.task.attempts >= entry.task.max_attempts {
                self.fail(&mut entry, NO_ELIGIBLE_NODE_REASON.to_string(), now).await;
            } else {
                entry.queued_at = now;
                debug!(task = %task_id, attempts = entry.task.attempts, "pending timeout");
                self.deps.events.publish(SwarmEvent::TaskRequeued {
                    task: task_id,
                    attempts: entry.task.attempts,
                    reason: "pending timeout".to_string(),
                });
            }
        }
        charged
    }

    /// Drop finished tasks older than the retention window
    ///
    /// Returns the number of tasks evicted.
    pub async fn evict_finished_at(&self, now: Timestamp) -> usize {
        let retention = self.config.finished_retention_ms;
        let entries: Vec<(TaskId, Arc<Mutex<TaskEntry>>)> =
            self.tasks.read().await.iter().map(|(id, e)| (*id, e.clone())).collect();
        let mut expired = Vec::new();
        for (task_id, entry) in entries {
            let entry = entry.lock().await;
            if !entry.task.status.is_terminal() {
                continue;
            }
            if entry.task.finished_at.is_some_and(|at| now.millis_since(at) > retention) {
                expired.push(task_id);
            }
        }
        if expired.is_empty() {
            return 0;
        }
        let mut tasks = self.tasks.write().await;
        for task_id in &expired {
            tasks.remove(task_id);
        }
        debug!(evicted = expired.len(), "finished tasks evicted");
        expired.len()
    }

    /// Requester-facing status of a task
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` for unknown tasks
    pub async fn get_status(&self, task_id: TaskId) -> SwarmResult<TaskStatusView> {
        let entry = self.entry(task_id).await.ok_or(SwarmError::TaskNotFound(task_id))?;
        let entry = entry.lock().await;
        Ok(TaskStatusView {
            task_id,
            status: entry.task.status,
            attempts: entry.task.attempts,
            max_attempts: entry.task.max_attempts,
            results_collected: entry.task.results.len(),
            holder: entry.assignment.as_ref().map(|a| a.node),
            accepted: entry.task.accepted,
            failure_reason: entry.task.failure_reason.clone(),
        })
    }

    /// Copy of a task
    pub async fn task(&self, task_id: TaskId) -> Option<Task> {
        let entry = self.entry(task_id).await?;
        let task = entry.lock().await.task.clone();
        Some(task)
    }

    /// Current assignment of a task
    pub async fn assignment(&self, task_id: TaskId) -> Option<Assignment> {
        let entry = self.entry(task_id).await?;
        let assignment = entry.lock().await.assignment.clone();
        assignment
    }

    /// Counts per status, queue depth and average wait
    pub async fn queue_stats(&self) -> QueueStats {
        self.queue_stats_at(Timestamp::now()).await
    }

    /// Counts per status, queue depth and average wait at an explicit time
    pub async fn queue_stats_at(&self, now: Timestamp) -> QueueStats {
        let entries: Vec<_> = self.tasks.read().await.values().cloned().collect();
        let mut stats = QueueStats::default();
        let mut total_wait = 0u64;
        for entry in entries {
            let entry = entry.lock().await;
            match entry.task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::Validating => stats.validating += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
            if entry.queue_seq.is_some() {
                stats.queue_depth += 1;
                total_wait += now.millis_since(entry.queued_at);
            }
        }
        if stats.queue_depth > 0 {
            stats.average_wait_ms = total_wait / stats.queue_depth as u64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::Strategy;
    use crate::config::{AssignmentConfig, RegistryConfig, TransportConfig};
    use crate::events::DisconnectReason;
    use crate::transport::MpscLink;
    use swarm_core::DeviceProfile;

    struct Harness {
        ledger: Arc<TaskLedger>,
        registry: Arc<NodeRegistry>,
        history: Arc<DistributionHistory>,
        events: EventBus,
        expiries: Option<mpsc::UnboundedReceiver<Expiry>>,
        _store_rx: mpsc::Receiver<StoreRecord>,
    }

    fn harness(config: LedgerConfig) -> Harness {
        let events = EventBus::default();
        let registry = Arc::new(NodeRegistry::new(RegistryConfig::default(), events.clone()));
        let engine = Arc::new(AssignmentEngine::new(
            AssignmentConfig::default().with_strategy(Strategy::RoundRobin).with_adaptive(false),
        ));
        let history = Arc::new(DistributionHistory::new());
        let (link, _frames) = MpscLink::new();
        let transport = Arc::new(TransportChannelManager::new(TransportConfig::default(), Arc::new(link), events.clone()));
        let (persistence, store_rx) = WriteBehind::new(1024);
        let deps = LedgerDeps {
            registry: registry.clone(),
            engine,
            history: history.clone(),
            transport,
            events: events.clone(),
            persistence: Arc::new(persistence),
        };
        let (ledger, expiries) = TaskLedger::new(config, deps);
        Harness {
            ledger: Arc::new(ledger),
            registry,
            history,
            events,
            expiries: Some(expiries),
            _store_rx: store_rx,
        }
    }

    async fn node(h: &Harness, name: &str) -> NodeId {
        let profile = DeviceProfile::new(name)
            .with_cpu_cores(4)
            .with_memory_mb(4_096)
            .with_bandwidth_mbps(10)
            .with_task_type("render");
        h.registry.register(name, profile, "c").await.unwrap().node_id
    }

    fn spec() -> TaskSpec {
        TaskSpec::new("render", "blob://frame-1", 9.0)
    }

    async fn holder(h: &Harness, task: TaskId) -> NodeId {
        h.ledger.get_status(task).await.unwrap().holder.unwrap()
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_spec() {
        let h = harness(LedgerConfig::default());
        let err = h.ledger.submit(spec().with_consensus_threshold(1.5)).await.unwrap_err();
        assert!(matches!(err, SwarmError::InvalidTask { .. }));
        let err = h.ledger.submit(TaskSpec::new("render", "p", -1.0)).await.unwrap_err();
        assert!(matches!(err, SwarmError::InvalidTask { .. }));
    }

    #[tokio::test]
    async fn test_submit_without_nodes_stays_pending() {
        let h = harness(LedgerConfig::default());
        let task = h.ledger.submit(spec()).await.unwrap();
        let status = h.ledger.get_status(task).await.unwrap();
        assert_eq!(status.status, TaskStatus::Pending);
        assert_eq!(status.holder, None);
        assert_eq!(h.ledger.queue_stats().await.queue_depth, 1);
    }

    #[tokio::test]
    async fn test_submit_assigns_immediately() {
        let h = harness(LedgerConfig::default());
        let n = node(&h, "a").await;
        let task = h.ledger.submit(spec()).await.unwrap();
        let status = h.ledger.get_status(task).await.unwrap();
        assert_eq!(status.status, TaskStatus::Assigned);
        assert_eq!(status.holder, Some(n));
        assert_eq!(h.registry.get(n).await.unwrap().current_task, Some(task));
    }

    #[tokio::test]
    async fn test_two_of_three_consensus_pays_agreeing_workers() {
        let h = harness(LedgerConfig::default());
        let mut events = h.events.subscribe();
        node(&h, "a").await;
        node(&h, "b").await;
        node(&h, "c").await;
        let task = h.ledger.submit(spec()).await.unwrap();
        let good = ResultDigest::compute(b"good");
        let bad = ResultDigest::compute(b"bad");

        let first = holder(&h, task).await;
        assert_eq!(h.ledger.submit_result(task, first, good).await.unwrap(), TaskStatus::Validating);
        let second = holder(&h, task).await;
        assert_ne!(first, second);
        assert_eq!(h.ledger.submit_result(task, second, bad).await.unwrap(), TaskStatus::Validating);
        let third = holder(&h, task).await;
        assert_ne!(third, first);
        assert_ne!(third, second);
        assert_eq!(h.ledger.submit_result(task, third, good).await.unwrap(), TaskStatus::Completed);

        let view = h.ledger.get_status(task).await.unwrap();
        assert_eq!(view.accepted, Some(good));
        assert_eq!(view.holder, None);

        let mut paid = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SwarmEvent::Reward(r) = event {
                paid.push(r.node_id);
                assert!((r.amount - 4.5).abs() < 1e-9);
            }
        }
        paid.sort();
        let mut expected = vec![first, third];
        expected.sort();
        assert_eq!(paid, expected);

        assert_eq!(h.registry.get(second).await.unwrap().earnings, 0.0);
        assert!((h.registry.reliability(second).await.unwrap() - 0.95).abs() < 1e-9);
        assert_eq!(h.registry.get(first).await.unwrap().tasks_completed, 1);
        for n in [first, second, third] {
            assert!(h.registry.get(n).await.unwrap().is_available());
        }
    }

    #[tokio::test]
    async fn test_timeout_penalizes_and_requeues() {
        let h = harness(LedgerConfig::default());
        let n = node(&h, "a").await;
        let task = h.ledger.submit(spec()).await.unwrap();
        assert!(h.ledger.on_timeout(task).await);

        assert!((h.registry.reliability(n).await.unwrap() - 0.9).abs() < 1e-9);
        let view = h.ledger.get_status(task).await.unwrap();
        assert_eq!(view.attempts, 1);
        assert_eq!(view.status, TaskStatus::Pending);
        assert_eq!(view.holder, None);
        assert!(h.history.completion_rate(n).await < 1.0);

        // The slot is free, but this task is not handed back to the node that dropped it.
        assert!(h.registry.get(n).await.unwrap().is_available());
        assert_eq!(h.ledger.process_queue().await, 0);
        assert!(matches!(h.ledger.on_assigned(task, n).await, Err(SwarmError::InvalidTask { .. })));

        let other = node(&h, "b").await;
        assert_eq!(h.ledger.process_queue().await, 1);
        assert_eq!(holder(&h, task).await, other);
    }

    #[tokio::test]
    async fn test_timed_out_node_still_serves_other_tasks() {
        let h = harness(LedgerConfig::default());
        let n = node(&h, "a").await;
        let first = h.ledger.submit(spec()).await.unwrap();
        let second = h.ledger.submit(spec()).await.unwrap();
        assert!(h.ledger.on_timeout(first).await);
        assert_eq!(holder(&h, second).await, n);
        assert_eq!(h.ledger.get_status(first).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_timeout_with_partial_results_waits_as_pending() {
        let h = harness(LedgerConfig::default());
        node(&h, "a").await;
        node(&h, "b").await;
        let task = h.ledger.submit(spec()).await.unwrap();
        let first = holder(&h, task).await;
        assert_eq!(
            h.ledger.submit_result(task, first, ResultDigest::compute(b"x")).await.unwrap(),
            TaskStatus::Validating
        );
        assert!(h.ledger.on_timeout(task).await);

        let view = h.ledger.get_status(task).await.unwrap();
        assert_eq!(view.status, TaskStatus::Pending);
        assert_eq!(view.holder, None);
        assert_eq!(view.results_collected, 1);
        assert_eq!(h.ledger.queue_stats().await.validating, 0);

        let c = node(&h, "c").await;
        h.ledger.process_queue().await;
        let view = h.ledger.get_status(task).await.unwrap();
        assert_eq!(view.status, TaskStatus::Validating);
        assert_eq!(view.holder, Some(c));
    }

    #[tokio::test]
    async fn test_timeout_returns_to_pending_when_no_other_node() {
        let h = harness(LedgerConfig::default());
        let n = node(&h, "a").await;
        let task = h.ledger.submit(spec()).await.unwrap();
        h.registry.disconnect(n, DisconnectReason::Requested).await;
        let epoch = h.ledger.assignment(task).await.unwrap().epoch;
        assert!(h.ledger.expire(task, epoch).await);
        let view = h.ledger.get_status(task).await.unwrap();
        assert_eq!(view.status, TaskStatus::Pending);
        assert_eq!(view.attempts, 1);
    }

    #[tokio::test]
    async fn test_stale_timer_ignored_after_result() {
        let h = harness(LedgerConfig::default());
        let n = node(&h, "a").await;
        let task = h.ledger.submit(spec().with_consensus_threshold(0.3)).await.unwrap();
        let epoch = h.ledger.assignment(task).await.unwrap().epoch;
        let status = h.ledger.submit_result(task, n, ResultDigest::compute(b"x")).await.unwrap();
        assert_eq!(status, TaskStatus::Completed);
        assert!(!h.ledger.expire(task, epoch).await);
        assert_eq!(h.ledger.get_status(task).await.unwrap().status, TaskStatus::Completed);
        assert!((h.registry.reliability(n).await.unwrap() - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_late_result_after_timeout_ignored() {
        let h = harness(LedgerConfig::default());
        let a = node(&h, "a").await;
        let task = h.ledger.submit(spec()).await.unwrap();
        let old_epoch = h.ledger.assignment(task).await.unwrap().epoch;
        h.ledger.on_timeout(task).await;
        let status = h
            .ledger
            .submit_result_for_epoch(task, a, old_epoch, ResultDigest::compute(b"x"))
            .await
            .unwrap();
        assert_eq!(status, TaskStatus::Pending);
        assert_eq!(h.ledger.get_status(task).await.unwrap().results_collected, 0);
        assert!(h.registry.get(a).await.unwrap().is_available());
    }

    #[tokio::test]
    async fn test_attempts_exhausted_fails_task() {
        let h = harness(LedgerConfig::default().with_max_attempts(2));
        node(&h, "a").await;
        node(&h, "b").await;
        let mut events = h.events.subscribe();
        let task = h.ledger.submit(spec()).await.unwrap();
        h.ledger.on_timeout(task).await;
        h.ledger.on_timeout(task).await;
        let view = h.ledger.get_status(task).await.unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.attempts, view.max_attempts);
        assert_eq!(view.failure_reason.as_deref(), Some("no consensus after 2 attempts"));
        assert!(!h.ledger.on_timeout(task).await);

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            failed |= matches!(event, SwarmEvent::TaskFailed { task: t, attempts: 2, .. } if t == task);
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn test_three_way_disagreement_consumes_attempt() {
        let h = harness(LedgerConfig::default());
        node(&h, "a").await;
        node(&h, "b").await;
        node(&h, "c").await;
        let task = h.ledger.submit(spec()).await.unwrap();
        for content in [b"x", b"y", b"z"] {
            let worker = holder(&h, task).await;
            h.ledger.submit_result(task, worker, ResultDigest::compute(content)).await.unwrap();
        }
        let view = h.ledger.get_status(task).await.unwrap();
        assert_eq!(view.attempts, 1);
        assert_eq!(view.results_collected, 0);
        assert_eq!(view.status, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn test_node_lost_requeues_with_one_attempt() {
        let h = harness(LedgerConfig::default());
        let a = node(&h, "a").await;
        let task = h.ledger.submit(spec()).await.unwrap();
        let gone = h.registry.disconnect(a, DisconnectReason::HeartbeatTimeout).await.unwrap();
        assert_eq!(gone.held_task, Some(task));
        assert!(h.ledger.on_node_lost(a, task).await);
        let view = h.ledger.get_status(task).await.unwrap();
        assert_eq!(view.status, TaskStatus::Pending);
        assert_eq!(view.attempts, 1);

        let b = node(&h, "b").await;
        assert_eq!(h.ledger.process_queue().await, 1);
        assert_eq!(h.ledger.get_status(task).await.unwrap().holder, Some(b));
        assert!(!h.ledger.on_node_lost(a, task).await);
    }

    #[tokio::test]
    async fn test_on_assigned_rejects_busy_node() {
        let h = harness(LedgerConfig::default());
        let a = node(&h, "a").await;
        let first = h.ledger.submit(spec()).await.unwrap();
        assert_eq!(holder(&h, first).await, a);
        let second = h.ledger.submit(spec()).await.unwrap();
        let err = h.ledger.on_assigned(second, a).await.unwrap_err();
        assert_eq!(err, SwarmError::NodeBusy { node: a, task: first });
        let err = h.ledger.on_assigned(first, a).await.unwrap_err();
        assert!(matches!(err, SwarmError::InvalidTask { .. }));
    }

    #[tokio::test]
    async fn test_priority_order() {
        let h = harness(LedgerConfig::default());
        let low = h.ledger.submit(spec().with_priority(Priority::Low)).await.unwrap();
        let normal = h.ledger.submit(spec()).await.unwrap();
        let critical = h.ledger.submit(spec().with_priority(Priority::Critical)).await.unwrap();
        let a = node(&h, "a").await;
        h.ledger.process_queue().await;
        assert_eq!(h.registry.get(a).await.unwrap().current_task, Some(critical));
        let b = node(&h, "b").await;
        h.ledger.process_queue().await;
        assert_eq!(h.registry.get(b).await.unwrap().current_task, Some(normal));
        assert_eq!(h.ledger.get_status(low).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_frees_holder() {
        let h = harness(LedgerConfig::default());
        let a = node(&h, "a").await;
        let task = h.ledger.submit(spec()).await.unwrap();
        let waiting = h.ledger.submit(spec()).await.unwrap();
        assert_eq!(h.ledger.cancel(task).await.unwrap(), TaskStatus::Cancelled);
        assert_eq!(h.ledger.get_status(task).await.unwrap().status, TaskStatus::Cancelled);
        assert_eq!(h.registry.get(a).await.unwrap().current_task, Some(waiting));
        assert_eq!(h.ledger.cancel(task).await.unwrap(), TaskStatus::Cancelled);
        assert!(matches!(h.ledger.cancel(TaskId::new()).await, Err(SwarmError::TaskNotFound(_))));
    }

    #[tokio::test]
    async fn test_pending_timeout_exhausts_attempts() {
        let h = harness(LedgerConfig::default().with_max_attempts(2).with_pending_timeout(1_000));
        let t0 = Timestamp::from_millis(10_000);
        let task = h.ledger.submit_at(spec(), t0).await.unwrap();
        assert_eq!(h.ledger.sweep_pending_at(t0.plus_millis(500)).await, 0);
        assert_eq!(h.ledger.sweep_pending_at(t0.plus_millis(1_001)).await, 1);
        assert_eq!(h.ledger.get_status(task).await.unwrap().attempts, 1);
        assert_eq!(h.ledger.sweep_pending_at(t0.plus_millis(1_500)).await, 0);
        assert_eq!(h.ledger.sweep_pending_at(t0.plus_millis(2_002)).await, 1);
        let view = h.ledger.get_status(task).await.unwrap();
        assert_eq!(view.status, TaskStatus::Failed);
        assert_eq!(view.attempts, 2);
        assert_eq!(view.failure_reason.as_deref(), Some(NO_ELIGIBLE_NODE_REASON));
        assert_eq!(h.ledger.queue_stats().await.queue_depth, 0);
    }

    #[tokio::test]
    async fn test_evict_finished_after_retention() {
        let h = harness(LedgerConfig::default().with_finished_retention(1_000));
        let n = node(&h, "a").await;
        let done = h.ledger.submit(spec().with_consensus_threshold(0.3)).await.unwrap();
        h.ledger.submit_result(done, n, ResultDigest::compute(b"x")).await.unwrap();
        let cancelled = h.ledger.submit(spec()).await.unwrap();
        h.ledger.cancel(cancelled).await.unwrap();
        let waiting = h.ledger.submit(spec()).await.unwrap();

        let now = Timestamp::now();
        assert_eq!(h.ledger.evict_finished_at(now).await, 0);
        assert_eq!(h.ledger.evict_finished_at(now.plus_millis(5_000)).await, 2);
        assert!(matches!(h.ledger.get_status(done).await, Err(SwarmError::TaskNotFound(_))));
        assert!(matches!(h.ledger.get_status(cancelled).await, Err(SwarmError::TaskNotFound(_))));
        assert!(!h.ledger.get_status(waiting).await.unwrap().status.is_terminal());
        assert_eq!(h.ledger.queue_stats().await.completed, 0);
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let h = harness(LedgerConfig::default());
        let t0 = Timestamp::from_millis(0);
        h.ledger.submit_at(spec(), t0).await.unwrap();
        h.ledger.submit_at(spec(), t0.plus_millis(1_000)).await.unwrap();
        let stats = h.ledger.queue_stats_at(t0.plus_millis(3_000)).await;
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.queue_depth, 2);
        assert_eq!(stats.average_wait_ms, 2_500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_timer_drives_timeout() {
        let mut h = harness(LedgerConfig::default().with_execution_timeout(1_000));
        let shutdown = CancellationToken::new();
        let expiries = h.expiries.take().unwrap();
        let driver = tokio::spawn(h.ledger.clone().run_timers(expiries, shutdown.clone()));

        let n = node(&h, "a").await;
        let task = h.ledger.submit(spec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        assert!((h.registry.reliability(n).await.unwrap() - 0.9).abs() < 1e-9);
        let view = h.ledger.get_status(task).await.unwrap();
        assert_eq!(view.attempts, 1);
        assert_eq!(view.status, TaskStatus::Pending);
        assert_eq!(view.holder, None);

        shutdown.cancel();
        driver.await.unwrap();
    }
}
