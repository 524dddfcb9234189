//! Scheduling coordinator.
//!
//! Wires registry, history, assignment engine, transport and ledger into
//! the single scheduling authority collaborators talk to, and owns the
//! background loops: heartbeat watchdogs, the periodic sweep, the strategy
//! optimizer, execution timers and the persistence drain.

use crate::assignment::{AssignmentEngine, Strategy};
use crate::config::SwarmConfig;
use crate::events::{DisconnectReason, EventBus, SwarmEvent};
use crate::history::{DistributionHistory, NodeCounters, TaskTypeMetrics};
use crate::ledger::{Expiry, LedgerDeps, QueueStats, TaskLedger, TaskSpec, TaskStatus, TaskStatusView};
use crate::registry::{Disconnected, HeartbeatAck, NetworkStats, Node, NodeMetrics, NodeRegistry};
use crate::signaling::SessionDescription;
use crate::store::{self, SessionRecord, StoreRecord, SwarmStore, WriteBehind, DEFAULT_QUEUE_CAPACITY};
use crate::transport::{PeerLink, TransportChannelManager};
use crate::wire::{SubChannel, WireMessage};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use swarm_core::{
    DeviceProfile, NodeId, ResultDigest, SwarmResult, TaskId, TaskRequirements, TaskType, Timestamp,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Strategy state and outcome aggregates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributionStats {
    /// Strategy in effect
    pub strategy: Strategy,
    /// Whether the optimizer may switch strategies
    pub adaptive: bool,
    /// Strategy switches so far
    pub switches: u64,
    /// Per-node counters
    pub nodes: HashMap<NodeId, NodeCounters>,
    /// Per-task-type aggregates
    pub task_types: HashMap<TaskType, TaskTypeMetrics>,
}

/// What one sweep did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SweepReport {
    /// Nodes disconnected for heartbeat silence
    pub expired: usize,
    /// Retained offline records dropped
    pub pruned: usize,
    /// Queued tasks charged an attempt for waiting too long
    pub pending_charged: usize,
    /// Finished tasks dropped after their retention window
    pub evicted: usize,
}

/// Components shared with background tasks
#[derive(Clone)]
struct Parts {
    registry: Arc<NodeRegistry>,
    history: Arc<DistributionHistory>,
    engine: Arc<AssignmentEngine>,
    transport: Arc<TransportChannelManager>,
    ledger: Arc<TaskLedger>,
    events: EventBus,
    persistence: Arc<WriteBehind>,
    shutdown: CancellationToken,
}

impl Parts {
    fn persist_session(&self, node: &Node, disconnected_at: Option<Timestamp>) {
        self.persistence.enqueue(StoreRecord::Session(SessionRecord {
            node_id: node.id,
            owner_id: node.owner_id.clone(),
            connected_at: node.connected_at,
            disconnected_at,
            reliability: node.reliability,
            tasks_completed: node.tasks_completed,
            earnings: node.earnings,
        }));
    }

    /// Remove a node everywhere and return its task to the queue
    async fn drop_node(&self, node_id: NodeId, reason: DisconnectReason, now: Timestamp) -> Option<Disconnected> {
        let last_seen = self.registry.get(node_id).await;
        let gone = self.registry.disconnect_at(node_id, reason, now).await?;
        self.transport.remove_peer(node_id).await;
        if let Some(node) = last_seen {
            self.persist_session(&node, Some(now));
        }
        if let Some(task) = gone.held_task {
            self.ledger.on_node_lost(node_id, task).await;
        }
        Some(gone)
    }

    /// Disconnect the node once it falls silent
    ///
    /// Stops when the monitor is cancelled or the coordinator shuts down.
    fn watch(&self, node_id: NodeId, monitor: CancellationToken) {
        let parts = self.clone();
        let period = Duration::from_millis(self.registry.config().heartbeat_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = monitor.cancelled() => break,
                    _ = parts.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(period) => {
                        let now = Timestamp::now();
                        if parts.registry.is_expired(node_id, now).await {
                            parts.drop_node(node_id, DisconnectReason::HeartbeatTimeout, now).await;
                            break;
                        }
                    }
                }
            }
        });
    }
}

struct Receivers {
    expiries: mpsc::UnboundedReceiver<Expiry>,
    records: mpsc::Receiver<StoreRecord>,
}

/// The scheduling authority
pub struct Coordinator {
    config: SwarmConfig,
    parts: Parts,
    store: Arc<dyn SwarmStore>,
    shutdown: CancellationToken,
    receivers: Mutex<Option<Receivers>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build a coordinator
    ///
    /// Nothing runs until [`Self::start`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration does not validate
    pub fn new(config: SwarmConfig, link: Arc<dyn PeerLink>, store: Arc<dyn SwarmStore>) -> SwarmResult<Self> {
        config.validate()?;
        let events = EventBus::default();
        let registry = Arc::new(NodeRegistry::new(config.registry.clone(), events.clone()));
        let history = Arc::new(DistributionHistory::new());
        let engine = Arc::new(AssignmentEngine::new(config.assignment.clone()));
        let transport = Arc::new(TransportChannelManager::new(config.transport.clone(), link, events.clone()));
        let shutdown = CancellationToken::new();
        let (persistence, records) = WriteBehind::new(DEFAULT_QUEUE_CAPACITY);
        let persistence = Arc::new(persistence);
        let (ledger, expiries) = TaskLedger::new(
            config.ledger.clone(),
            LedgerDeps {
                registry: registry.clone(),
                engine: engine.clone(),
                history: history.clone(),
                transport: transport.clone(),
                events: events.clone(),
                persistence: persistence.clone(),
            },
        );

        Ok(Self {
            config,
            parts: Parts {
                registry,
                history,
                engine,
                transport,
                ledger: Arc::new(ledger),
                events,
                persistence,
                shutdown: shutdown.clone(),
            },
            store,
            shutdown,
            receivers: Mutex::new(Some(Receivers { expiries, records })),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the background loops
    ///
    /// Returns `false` if they were already started.
    pub fn start(&self) -> bool {
        let Some(receivers) = self.receivers.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return false;
        };
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        workers.push(tokio::spawn(
            self.parts.ledger.clone().run_timers(receivers.expiries, self.shutdown.clone()),
        ));

        let store = self.store.clone();
        let shutdown = self.shutdown.clone();
        workers.push(tokio::spawn(async move {
            let written = store::drain(store, receivers.records, shutdown).await;
            debug!(written, "persistence drain finished");
        }));

        let parts = self.parts.clone();
        let shutdown = self.shutdown.clone();
        let period = Duration::from_millis(self.config.registry.heartbeat_interval_ms);
        workers.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = sweep(&parts, Timestamp::now()).await;
                        if report != SweepReport::default() {
                            debug!(?report, "sweep");
                        }
                    }
                }
            }
        }));

        let parts = self.parts.clone();
        let shutdown = self.shutdown.clone();
        let period = Duration::from_millis(self.config.assignment.optimizer_interval_ms);
        workers.push(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        optimize(&parts).await;
                    }
                }
            }
        }));

        info!(
            heartbeat_interval_ms = self.config.registry.heartbeat_interval_ms,
            strategy = %self.parts.engine.strategy(),
            "coordinator started"
        );
        true
    }

    /// Stop the background loops and flush queued persistence records
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers: Vec<_> = self.workers.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        for result in join_all(workers).await {
            if let Err(err) = result {
                warn!(error = %err, "background task ended abnormally");
            }
        }
        info!("coordinator stopped");
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Subscribe to scheduler events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.parts.events.subscribe()
    }

    /// Node registry
    #[must_use]
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.parts.registry
    }

    /// Task ledger
    #[must_use]
    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.parts.ledger
    }

    /// Transport manager
    #[must_use]
    pub fn transport(&self) -> &Arc<TransportChannelManager> {
        &self.parts.transport
    }

    /// Assignment engine
    #[must_use]
    pub fn engine(&self) -> &Arc<AssignmentEngine> {
        &self.parts.engine
    }

    // Node lifecycle

    /// Register a node and start watching its heartbeats
    ///
    /// # Errors
    ///
    /// Propagates registry errors
    pub async fn register(&self, owner_id: &str, profile: DeviceProfile, connection: &str) -> SwarmResult<NodeId> {
        let registration = self.parts.registry.register(owner_id, profile, connection).await?;
        let node_id = registration.node_id;
        self.parts.watch(node_id, registration.monitor);
        if let Some(node) = self.parts.registry.get(node_id).await {
            self.parts.persist_session(&node, None);
        }
        self.parts.ledger.process_queue().await;
        Ok(node_id)
    }

    /// Record a heartbeat and probe the node's latency
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if the node is not registered
    pub async fn heartbeat(&self, node_id: NodeId, metrics: NodeMetrics) -> SwarmResult<HeartbeatAck> {
        let ack = self.parts.registry.heartbeat(node_id, metrics).await?;
        if self.parts.transport.is_open(node_id, SubChannel::Control).await {
            if let Err(err) = self.parts.transport.ping(node_id, Timestamp::now()).await {
                debug!(node = %node_id, error = %err, "latency probe not sent");
            }
        }
        Ok(ack)
    }

    /// Disconnect a node at its own request
    ///
    /// Any task it held goes back to the queue. Idempotent.
    pub async fn disconnect(&self, node_id: NodeId) -> Option<Disconnected> {
        self.parts.drop_node(node_id, DisconnectReason::Requested, Timestamp::now()).await
    }

    /// Whether a node could take a task with these requirements right now
    pub async fn is_eligible(&self, node_id: NodeId, task_type: &TaskType, requirements: &TaskRequirements) -> bool {
        self.parts.registry.is_eligible(node_id, task_type, requirements).await
    }

    /// Aggregate view over all nodes
    pub async fn network_stats(&self) -> NetworkStats {
        self.parts.registry.network_stats().await
    }

    // Task API

    /// Submit a task
    ///
    /// # Errors
    ///
    /// Returns `InvalidTask` if the spec does not validate
    pub async fn submit(&self, spec: TaskSpec) -> SwarmResult<TaskId> {
        self.parts.ledger.submit(spec).await
    }

    /// Requester-facing status
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` for unknown tasks
    pub async fn get_status(&self, task_id: TaskId) -> SwarmResult<TaskStatusView> {
        self.parts.ledger.get_status(task_id).await
    }

    /// Cancel a task
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` for unknown tasks
    pub async fn cancel(&self, task_id: TaskId) -> SwarmResult<TaskStatus> {
        self.parts.ledger.cancel(task_id).await
    }

    /// Queue statistics
    pub async fn queue_stats(&self) -> QueueStats {
        self.parts.ledger.queue_stats().await
    }

    /// Record a worker's result delivered outside the transport
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` for unknown tasks
    pub async fn submit_result(&self, task_id: TaskId, worker: NodeId, digest: ResultDigest) -> SwarmResult<TaskStatus> {
        self.parts.ledger.submit_result(task_id, worker, digest).await
    }

    // Transport signaling

    /// Start a handshake with a node
    ///
    /// An offer to an open peer renegotiates without closing its
    /// sub-channels.
    ///
    /// # Errors
    ///
    /// Never fails today; fallible like the other signaling calls
    pub async fn create_offer(&self, node_id: NodeId) -> SwarmResult<SessionDescription> {
        self.parts.transport.create_offer(node_id).await
    }

    /// Answer a node's offer
    ///
    /// # Errors
    ///
    /// Returns `SignalingError` for a malformed offer
    pub async fn create_answer(&self, node_id: NodeId, offer: &str) -> SwarmResult<SessionDescription> {
        self.parts.transport.create_answer(node_id, offer).await
    }

    /// Accept a node's answer to our offer
    ///
    /// # Errors
    ///
    /// Returns `SignalingError` for a malformed or unexpected answer
    pub async fn accept_answer(&self, node_id: NodeId, answer: &str) -> SwarmResult<()> {
        self.parts.transport.accept_answer(node_id, answer).await
    }

    /// Add a remote connectivity candidate
    ///
    /// # Errors
    ///
    /// Returns `SignalingError` for a malformed candidate
    pub async fn add_candidate(&self, node_id: NodeId, candidate: &str) -> SwarmResult<()> {
        self.parts.transport.add_candidate(node_id, candidate).await
    }

    /// Close one sub-channel of a node's connection
    ///
    /// When that was the last open sub-channel the node is disconnected and
    /// its task requeued. Returns whether the node was disconnected.
    pub async fn close_channel(&self, node_id: NodeId, channel: SubChannel) -> bool {
        if !self.parts.transport.close_channel(node_id, channel).await {
            return false;
        }
        self.parts
            .drop_node(node_id, DisconnectReason::TransportClosed, Timestamp::now())
            .await
            .is_some()
    }

    /// Process a frame received from a node
    ///
    /// # Errors
    ///
    /// Returns `Encoding` for malformed frames, `ChannelNotOpen` if the
    /// node's connection is not open, and `TaskNotFound` for results about
    /// unknown tasks
    pub async fn handle_inbound(&self, node_id: NodeId, bytes: &[u8]) -> SwarmResult<()> {
        match self.parts.transport.handle_inbound(node_id, bytes).await? {
            Some(WireMessage::Result { task_id, epoch, digest }) => {
                self.parts.ledger.submit_result_for_epoch(task_id, node_id, epoch, digest).await?;
            }
            Some(WireMessage::Progress { task_id, epoch, percent }) => {
                debug!(node = %node_id, task = %task_id, epoch, percent, "progress");
            }
            Some(_) | None => {}
        }
        Ok(())
    }

    // Strategy control

    /// Pin a strategy by name
    ///
    /// Disables adaptive switching. Returns the previous strategy.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an unknown name
    pub fn set_strategy(&self, name: &str) -> SwarmResult<Strategy> {
        let strategy: Strategy = name.parse()?;
        let previous = self.parts.engine.set_strategy(strategy);
        if previous != strategy {
            self.parts.events.publish(SwarmEvent::StrategySwitched { from: previous, to: strategy });
        }
        Ok(previous)
    }

    /// Enable or disable adaptive switching
    pub fn set_adaptive(&self, adaptive: bool) {
        self.parts.engine.set_adaptive(adaptive);
    }

    /// Run the optimizer once
    ///
    /// Returns `(from, to)` when it switched strategy.
    pub async fn optimize(&self) -> Option<(Strategy, Strategy)> {
        optimize(&self.parts).await
    }

    /// Strategy state and outcome aggregates
    pub async fn distribution_stats(&self) -> DistributionStats {
        let engine = &self.parts.engine;
        DistributionStats {
            strategy: engine.strategy(),
            adaptive: engine.is_adaptive(),
            switches: engine.switch_count(),
            nodes: self.parts.history.node_counters().await,
            task_types: self.parts.history.task_type_metrics().await,
        }
    }

    /// Run one sweep at an explicit time
    pub async fn sweep_at(&self, now: Timestamp) -> SweepReport {
        sweep(&self.parts, now).await
    }
}

async fn sweep(parts: &Parts, now: Timestamp) -> SweepReport {
    let mut report = SweepReport::default();
    for node in parts.registry.expired_nodes(now).await {
        if parts.drop_node(node, DisconnectReason::HeartbeatTimeout, now).await.is_some() {
            report.expired += 1;
        }
    }
    let pruned = parts.registry.prune_retained(now).await;
    for node in &pruned {
        parts.history.forget_node(*node).await;
    }
    report.pruned = pruned.len();
    report.pending_charged = parts.ledger.sweep_pending_at(now).await;
    report.evicted = parts.ledger.evict_finished_at(now).await;
    if report.expired > 0 {
        parts.ledger.process_queue().await;
    }
    report
}

async fn optimize(parts: &Parts) -> Option<(Strategy, Strategy)> {
    let average = parts.history.average_completion_rate().await;
    let max_active = parts
        .registry
        .snapshot()
        .await
        .iter()
        .map(|node| node.metrics.active_tasks)
        .max()
        .unwrap_or(0);
    let switched = parts.engine.optimize(average, max_active);
    if let Some((from, to)) = switched {
        parts.events.publish(SwarmEvent::StrategySwitched { from, to });
    }
    switched
}
