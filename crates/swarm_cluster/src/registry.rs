//! Node registry: identity, capability, health and reliability of every
//! connected compute node.
//!
//! The node table is keyed by [`NodeId`] and kept in registration order.
//! Each entry sits behind its own lock, so heartbeats for one node never
//! wait on assignment changes for another. The outer table lock is held only
//! to insert, remove or look up entries.
//!
//! Reliability is always clamped to `[floor, ceiling]` from
//! [`RegistryConfig`].

use crate::config::RegistryConfig;
use crate::events::{DisconnectReason, EventBus, SwarmEvent};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use swarm_core::{
    DeviceProfile, NodeId, SwarmError, SwarmResult, TaskId, TaskRequirements, TaskType, Timestamp,
    MILLIS_PER_HOUR,
};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Multiplier applied per heartbeat once uptime passes one hour
pub const UPTIME_BOOST: f64 = 1.001;

/// Node health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Connected and idle
    Online,
    /// Connected and holding a task
    Processing,
    /// Disconnected; only the retained record remains
    Offline,
}

/// Live metrics reported with each heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMetrics {
    /// CPU utilization in `[0, 1]`
    pub cpu_usage: f64,
    /// Memory utilization in `[0, 1]`
    pub memory_usage: f64,
    /// Tasks the device is running, including work from outside this scheduler
    pub active_tasks: u32,
    /// Work queued locally on the device
    pub queue_depth: u32,
}

/// A registered compute node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Stable node ID
    pub id: NodeId,
    /// Authenticated owner supplied by the identity service
    pub owner_id: String,
    /// Capability profile
    pub profile: DeviceProfile,
    /// Opaque handle of the owner's connection
    pub connection: String,
    /// Health
    pub status: NodeStatus,
    /// Task holding the assignment slot
    pub current_task: Option<TaskId>,
    /// Reliability score
    pub reliability: f64,
    /// When this session started
    pub connected_at: Timestamp,
    /// Last heartbeat
    pub last_heartbeat: Timestamp,
    /// Tasks whose result was accepted by consensus
    pub tasks_completed: u64,
    /// Accumulated rewards
    pub earnings: f64,
    /// Latest reported metrics
    pub metrics: NodeMetrics,
}

impl Node {
    /// Continuous uptime of the current session
    #[must_use]
    pub fn uptime_ms(&self, now: Timestamp) -> u64 {
        now.millis_since(self.connected_at)
    }

    /// Whether the node is online with a free slot
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.status == NodeStatus::Online && self.current_task.is_none()
    }

    /// Full eligibility check for a task
    #[must_use]
    pub fn is_eligible(&self, task_type: &TaskType, req: &TaskRequirements) -> bool {
        self.is_available()
            && self.reliability >= req.min_reliability
            && self.profile.satisfies(task_type, req)
    }
}

/// What survives a disconnect
#[derive(Debug, Clone, PartialEq)]
struct RetainedNode {
    reliability: f64,
    tasks_completed: u64,
    earnings: f64,
    offline_since: Timestamp,
}

/// Result of a registration
#[derive(Debug, Clone)]
pub struct Registration {
    /// Node ID
    pub node_id: NodeId,
    /// Whether an existing record (live or retained) was revived
    pub revived: bool,
    /// Heartbeat monitor handle; cancelled on disconnect
    pub monitor: CancellationToken,
}

/// Heartbeat acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Session uptime in milliseconds
    pub uptime_ms: u64,
    /// Reliability after this heartbeat
    pub reliability: f64,
}

/// Outcome of a disconnect that actually removed a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected {
    /// Node removed
    pub node_id: NodeId,
    /// Task it was holding
    pub held_task: Option<TaskId>,
}

/// Aggregate view over all nodes
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkStats {
    /// Live plus retained nodes
    pub total_nodes: usize,
    /// Online and idle
    pub online_nodes: usize,
    /// Holding a task
    pub processing_nodes: usize,
    /// Retained offline records
    pub offline_nodes: usize,
    /// CPU cores across live nodes
    pub total_cpu_cores: u64,
    /// Memory across live nodes
    pub total_memory_mb: u64,
    /// Live nodes with a GPU
    pub gpu_nodes: usize,
    /// Mean reliability of live nodes
    pub average_reliability: f64,
    /// Mean CPU utilization of live nodes
    pub average_cpu_usage: f64,
    /// Tasks completed by live nodes this session
    pub tasks_completed: u64,
    /// Earnings of live nodes
    pub total_earnings: f64,
}

struct NodeEntry {
    node: Node,
    monitor: CancellationToken,
}

/// Registry of compute nodes
pub struct NodeRegistry {
    /// Configuration
    config: RegistryConfig,
    /// Live nodes in registration order
    nodes: RwLock<IndexMap<NodeId, Arc<Mutex<NodeEntry>>>>,
    /// Records of disconnected nodes
    retained: RwLock<HashMap<NodeId, RetainedNode>>,
    /// Event publisher
    events: EventBus,
}

impl NodeRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: RegistryConfig, events: EventBus) -> Self {
        Self {
            config,
            nodes: RwLock::new(IndexMap::new()),
            retained: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Registry configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn clamp(&self, reliability: f64) -> f64 {
        reliability.clamp(self.config.reliability_floor, self.config.reliability_ceiling)
    }

    async fn entry(&self, node_id: NodeId) -> Option<Arc<Mutex<NodeEntry>>> {
        self.nodes.read().await.get(&node_id).cloned()
    }

    /// Register a node now
    ///
    /// # Errors
    ///
    /// Never fails today; the signature leaves room for profile validation.
    pub async fn register(
        &self,
        owner_id: &str,
        profile: DeviceProfile,
        connection: impl Into<String>,
    ) -> SwarmResult<Registration> {
        self.register_at(owner_id, profile, connection, Timestamp::now()).await
    }

    /// Register a node at an explicit time
    ///
    /// Idempotent for the same owner/device pair: a live record is refreshed
    /// in place and keeps its slot, a retained record gets its reliability back.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature leaves room for profile validation.
    pub async fn register_at(
        &self,
        owner_id: &str,
        profile: DeviceProfile,
        connection: impl Into<String>,
        now: Timestamp,
    ) -> SwarmResult<Registration> {
        let node_id = NodeId::derive(owner_id, &profile.fingerprint);
        let connection = connection.into();
        let monitor = CancellationToken::new();

        let mut nodes = self.nodes.write().await;
        if let Some(entry) = nodes.get(&node_id).cloned() {
            drop(nodes);
            let mut entry = entry.lock().await;
            entry.monitor.cancel();
            entry.monitor = monitor.clone();
            let node = &mut entry.node;
            node.profile = profile;
            node.connection = connection;
            node.last_heartbeat = now;
            if node.status == NodeStatus::Offline {
                node.status = NodeStatus::Online;
            }
            debug!(node = %node_id, "refreshed live registration");
            self.events.publish(SwarmEvent::NodeRegistered { node: node_id, revived: true });
            return Ok(Registration { node_id, revived: true, monitor });
        }

        let retained = self.retained.write().await.remove(&node_id);
        let revived = retained.is_some();
        let (reliability, tasks_completed, earnings) = match retained {
            Some(r) => (r.reliability, r.tasks_completed, r.earnings),
            None => (self.config.initial_reliability, 0, 0.0),
        };

        let node = Node {
            id: node_id,
            owner_id: owner_id.to_string(),
            profile,
            connection,
            status: NodeStatus::Online,
            current_task: None,
            reliability: self.clamp(reliability),
            connected_at: now,
            last_heartbeat: now,
            tasks_completed,
            earnings,
            metrics: NodeMetrics::default(),
        };

        nodes.insert(
            node_id,
            Arc::new(Mutex::new(NodeEntry { node, monitor: monitor.clone() })),
        );
        drop(nodes);

        info!(node = %node_id, owner = owner_id, revived, "node registered");
        self.events.publish(SwarmEvent::NodeRegistered { node: node_id, revived });
        Ok(Registration { node_id, revived, monitor })
    }

    /// Record a heartbeat now
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if the node is not live
    pub async fn heartbeat(&self, node_id: NodeId, metrics: NodeMetrics) -> SwarmResult<HeartbeatAck> {
        self.heartbeat_at(node_id, metrics, Timestamp::now()).await
    }

    /// Record a heartbeat at an explicit time
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if the node is not live
    pub async fn heartbeat_at(
        &self,
        node_id: NodeId,
        metrics: NodeMetrics,
        now: Timestamp,
    ) -> SwarmResult<HeartbeatAck> {
        let entry = self.entry(node_id).await.ok_or(SwarmError::NodeNotFound(node_id))?;
        let mut entry = entry.lock().await;
        let node = &mut entry.node;
        node.last_heartbeat = now;
        node.metrics = metrics;

        let uptime_ms = node.uptime_ms(now);
        if uptime_ms > MILLIS_PER_HOUR {
            node.reliability = self.clamp(node.reliability * UPTIME_BOOST);
        }
        Ok(HeartbeatAck { uptime_ms, reliability: node.reliability })
    }

    /// Remove a node from the live table
    ///
    /// Cancels its heartbeat monitor and keeps a retained record. Returns
    /// `None` when the node was already gone.
    pub async fn disconnect(&self, node_id: NodeId, reason: DisconnectReason) -> Option<Disconnected> {
        self.disconnect_at(node_id, reason, Timestamp::now()).await
    }

    /// Remove a node from the live table at an explicit time
    pub async fn disconnect_at(
        &self,
        node_id: NodeId,
        reason: DisconnectReason,
        now: Timestamp,
    ) -> Option<Disconnected> {
        let entry = self.nodes.write().await.shift_remove(&node_id)?;
        let mut entry = entry.lock().await;
        entry.monitor.cancel();
        let node = &mut entry.node;
        node.status = NodeStatus::Offline;
        let held_task = node.current_task.take();

        self.retained.write().await.insert(
            node_id,
            RetainedNode {
                reliability: node.reliability,
                tasks_completed: node.tasks_completed,
                earnings: node.earnings,
                offline_since: now,
            },
        );

        info!(node = %node_id, ?reason, held_task = ?held_task, "node disconnected");
        self.events.publish(SwarmEvent::NodeDisconnected { node: node_id, held_task, reason });
        Some(Disconnected { node_id, held_task })
    }

    /// Whether a node has been silent past the timeout window
    pub async fn is_expired(&self, node_id: NodeId, now: Timestamp) -> bool {
        let Some(entry) = self.entry(node_id).await else {
            return false;
        };
        let entry = entry.lock().await;
        now.millis_since(entry.node.last_heartbeat) > self.config.heartbeat_timeout_ms()
    }

    /// Live nodes silent past the timeout window
    pub async fn expired_nodes(&self, now: Timestamp) -> Vec<NodeId> {
        let entries: Vec<_> = self.nodes.read().await.values().cloned().collect();
        let timeout = self.config.heartbeat_timeout_ms();
        let mut expired = Vec::new();
        for entry in entries {
            let entry = entry.lock().await;
            if now.millis_since(entry.node.last_heartbeat) > timeout {
                expired.push(entry.node.id);
            }
        }
        expired
    }

    /// Drop retained records older than the retention window
    ///
    /// Returns the nodes whose records were dropped.
    pub async fn prune_retained(&self, now: Timestamp) -> Vec<NodeId> {
        let retention = self.config.offline_retention_ms;
        let mut retained = self.retained.write().await;
        let stale: Vec<NodeId> = retained
            .iter()
            .filter(|(_, r)| now.millis_since(r.offline_since) > retention)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            retained.remove(id);
        }
        stale
    }

    /// Take the node's assignment slot for `task_id`
    ///
    /// # Errors
    ///
    /// Returns `NodeNotFound` if the node is not live and `NodeBusy` if its
    /// slot is already taken
    pub async fn claim(&self, node_id: NodeId, task_id: TaskId) -> SwarmResult<()> {
        let entry = self.entry(node_id).await.ok_or(SwarmError::NodeNotFound(node_id))?;
        let mut entry = entry.lock().await;
        let node = &mut entry.node;
        if let Some(task) = node.current_task {
            return Err(SwarmError::NodeBusy { node: node_id, task });
        }
        node.current_task = Some(task_id);
        node.status = NodeStatus::Processing;
        Ok(())
    }

    /// Free the node's slot if `task_id` still holds it
    ///
    /// Returns whether the slot was released.
    pub async fn release(&self, node_id: NodeId, task_id: TaskId) -> bool {
        let Some(entry) = self.entry(node_id).await else {
            return false;
        };
        let mut entry = entry.lock().await;
        let node = &mut entry.node;
        if node.current_task != Some(task_id) {
            return false;
        }
        node.current_task = None;
        node.status = NodeStatus::Online;
        true
    }

    /// Multiply a node's reliability by `factor`, clamped to bounds
    ///
    /// Applies to retained records too, so a penalty for a node that already
    /// dropped still sticks. Returns the new score.
    pub async fn scale_reliability(&self, node_id: NodeId, factor: f64) -> Option<f64> {
        if let Some(entry) = self.entry(node_id).await {
            let mut entry = entry.lock().await;
            entry.node.reliability = self.clamp(entry.node.reliability * factor);
            return Some(entry.node.reliability);
        }
        let mut retained = self.retained.write().await;
        let record = retained.get_mut(&node_id)?;
        record.reliability = self.clamp(record.reliability * factor);
        Some(record.reliability)
    }

    /// Credit a completed task and its reward
    pub async fn record_completion(&self, node_id: NodeId, amount: f64) {
        if let Some(entry) = self.entry(node_id).await {
            let mut entry = entry.lock().await;
            entry.node.tasks_completed += 1;
            entry.node.earnings += amount;
            return;
        }
        if let Some(record) = self.retained.write().await.get_mut(&node_id) {
            record.tasks_completed += 1;
            record.earnings += amount;
        }
    }

    /// Check whether a node can take a task right now
    pub async fn is_eligible(&self, node_id: NodeId, task_type: &TaskType, req: &TaskRequirements) -> bool {
        match self.entry(node_id).await {
            Some(entry) => entry.lock().await.node.is_eligible(task_type, req),
            None => false,
        }
    }

    /// Copy of a live node
    pub async fn get(&self, node_id: NodeId) -> Option<Node> {
        let entry = self.entry(node_id).await?;
        let node = entry.lock().await.node.clone();
        Some(node)
    }

    /// Reliability of a live or retained node
    pub async fn reliability(&self, node_id: NodeId) -> Option<f64> {
        if let Some(entry) = self.entry(node_id).await {
            return Some(entry.lock().await.node.reliability);
        }
        self.retained.read().await.get(&node_id).map(|r| r.reliability)
    }

    /// Copies of all live nodes in registration order
    pub async fn snapshot(&self) -> Vec<Node> {
        let entries: Vec<_> = self.nodes.read().await.values().cloned().collect();
        let mut nodes = Vec::with_capacity(entries.len());
        for entry in entries {
            nodes.push(entry.lock().await.node.clone());
        }
        nodes
    }

    /// Number of live nodes
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    /// Whether no nodes are live
    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Aggregate counts, capacity and performance
    pub async fn network_stats(&self) -> NetworkStats {
        let nodes = self.snapshot().await;
        let offline_nodes = self.retained.read().await.len();

        let mut stats = NetworkStats {
            total_nodes: nodes.len() + offline_nodes,
            offline_nodes,
            ..NetworkStats::default()
        };
        for node in &nodes {
            match node.status {
                NodeStatus::Online => stats.online_nodes += 1,
                NodeStatus::Processing => stats.processing_nodes += 1,
                NodeStatus::Offline => stats.offline_nodes += 1,
            }
            stats.total_cpu_cores += u64::from(node.profile.cpu_cores);
            stats.total_memory_mb += node.profile.memory_mb;
            if node.profile.gpu {
                stats.gpu_nodes += 1;
            }
            stats.average_reliability += node.reliability;
            stats.average_cpu_usage += node.metrics.cpu_usage;
            stats.tasks_completed += node.tasks_completed;
            stats.total_earnings += node.earnings;
        }
        if !nodes.is_empty() {
            stats.average_reliability /= nodes.len() as f64;
            stats.average_cpu_usage /= nodes.len() as f64;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(RegistryConfig::default(), EventBus::default())
    }

    fn profile(fp: &str) -> DeviceProfile {
        DeviceProfile::new(fp)
            .with_cpu_cores(4)
            .with_memory_mb(8_192)
            .with_bandwidth_mbps(50)
            .with_task_type("render")
    }

    #[tokio::test]
    async fn test_register_creates_online_node() {
        let reg = registry();
        let r = reg.register_at("alice", profile("fp1"), "conn-1", Timestamp::from_millis(0)).await.unwrap();
        assert!(!r.revived);
        let node = reg.get(r.node_id).await.unwrap();
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.reliability, 1.0);
        assert_eq!(node.id, NodeId::derive("alice", "fp1"));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let reg = registry();
        let a = reg.register("alice", profile("fp1"), "c1").await.unwrap();
        let b = reg.register("alice", profile("fp1"), "c2").await.unwrap();
        assert_eq!(a.node_id, b.node_id);
        assert!(b.revived);
        assert!(a.monitor.is_cancelled());
        assert!(!b.monitor.is_cancelled());
        assert_eq!(reg.len().await, 1);
        assert_eq!(reg.get(a.node_id).await.unwrap().connection, "c2");
    }

    #[tokio::test]
    async fn test_reregistration_revives_reliability() {
        let reg = registry();
        let r = reg.register("bob", profile("fp"), "c").await.unwrap();
        reg.scale_reliability(r.node_id, 0.9).await;
        reg.disconnect(r.node_id, DisconnectReason::Requested).await.unwrap();
        let again = reg.register("bob", profile("fp"), "c").await.unwrap();
        assert!(again.revived);
        assert!((reg.reliability(r.node_id).await.unwrap() - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_node() {
        let reg = registry();
        let err = reg.heartbeat(NodeId::new(), NodeMetrics::default()).await.unwrap_err();
        assert!(matches!(err, SwarmError::NodeNotFound(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_boosts_after_one_hour() {
        let reg = registry();
        let t0 = Timestamp::from_millis(1_000);
        let r = reg.register_at("carol", profile("fp"), "c", t0).await.unwrap();
        reg.scale_reliability(r.node_id, 0.8).await;

        let early = reg.heartbeat_at(r.node_id, NodeMetrics::default(), t0.plus_millis(60_000)).await.unwrap();
        assert!((early.reliability - 0.8).abs() < 1e-12);

        let late = reg
            .heartbeat_at(r.node_id, NodeMetrics::default(), t0.plus_millis(MILLIS_PER_HOUR + 1))
            .await
            .unwrap();
        assert!((late.reliability - 0.8 * UPTIME_BOOST).abs() < 1e-12);
        assert_eq!(late.uptime_ms, MILLIS_PER_HOUR + 1);
    }

    #[tokio::test]
    async fn test_claim_twice_is_busy() {
        let reg = registry();
        let r = reg.register("dave", profile("fp"), "c").await.unwrap();
        let t1 = TaskId::new();
        reg.claim(r.node_id, t1).await.unwrap();
        let err = reg.claim(r.node_id, TaskId::new()).await.unwrap_err();
        assert_eq!(err, SwarmError::NodeBusy { node: r.node_id, task: t1 });
        assert_eq!(reg.get(r.node_id).await.unwrap().status, NodeStatus::Processing);
    }

    #[tokio::test]
    async fn test_release_only_for_holder() {
        let reg = registry();
        let r = reg.register("erin", profile("fp"), "c").await.unwrap();
        let t1 = TaskId::new();
        reg.claim(r.node_id, t1).await.unwrap();
        assert!(!reg.release(r.node_id, TaskId::new()).await);
        assert!(reg.release(r.node_id, t1).await);
        assert!(reg.get(r.node_id).await.unwrap().is_available());
    }

    #[tokio::test]
    async fn test_disconnect_returns_held_task_and_is_idempotent() {
        let reg = registry();
        let r = reg.register("frank", profile("fp"), "c").await.unwrap();
        let t = TaskId::new();
        reg.claim(r.node_id, t).await.unwrap();
        let d = reg.disconnect(r.node_id, DisconnectReason::Requested).await.unwrap();
        assert_eq!(d.held_task, Some(t));
        assert!(r.monitor.is_cancelled());
        assert!(reg.disconnect(r.node_id, DisconnectReason::Requested).await.is_none());
        assert!(reg.get(r.node_id).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_nodes() {
        let reg = registry();
        let t0 = Timestamp::from_millis(0);
        let a = reg.register_at("a", profile("1"), "c", t0).await.unwrap();
        let b = reg.register_at("b", profile("2"), "c", t0).await.unwrap();
        reg.heartbeat_at(b.node_id, NodeMetrics::default(), t0.plus_millis(50_000)).await.unwrap();
        let expired = reg.expired_nodes(t0.plus_millis(60_001)).await;
        assert_eq!(expired, vec![a.node_id]);
        assert!(reg.is_expired(a.node_id, t0.plus_millis(60_001)).await);
        assert!(!reg.is_expired(b.node_id, t0.plus_millis(60_001)).await);
    }

    #[tokio::test]
    async fn test_reliability_clamped() {
        let reg = registry();
        let r = reg.register("g", profile("fp"), "c").await.unwrap();
        for _ in 0..100 {
            reg.scale_reliability(r.node_id, 0.5).await;
        }
        assert_eq!(reg.reliability(r.node_id).await, Some(0.5));
        for _ in 0..100 {
            reg.scale_reliability(r.node_id, 1.5).await;
        }
        assert_eq!(reg.reliability(r.node_id).await, Some(1.0));
    }

    #[tokio::test]
    async fn test_eligibility() {
        let reg = registry();
        let r = reg.register("h", profile("fp"), "c").await.unwrap();
        let render = TaskType::new("render");
        assert!(reg.is_eligible(r.node_id, &render, &TaskRequirements::none()).await);
        assert!(!reg.is_eligible(r.node_id, &render, &TaskRequirements::none().with_gpu()).await);
        assert!(!reg.is_eligible(r.node_id, &TaskType::new("ml"), &TaskRequirements::none()).await);
        reg.claim(r.node_id, TaskId::new()).await.unwrap();
        assert!(!reg.is_eligible(r.node_id, &render, &TaskRequirements::none()).await);
    }

    #[tokio::test]
    async fn test_snapshot_in_registration_order() {
        let reg = registry();
        let a = reg.register("a", profile("1"), "c").await.unwrap();
        let b = reg.register("b", profile("2"), "c").await.unwrap();
        let c = reg.register("c", profile("3"), "c").await.unwrap();
        let ids: Vec<_> = reg.snapshot().await.into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![a.node_id, b.node_id, c.node_id]);
    }

    #[tokio::test]
    async fn test_network_stats() {
        let reg = registry();
        let a = reg.register("a", profile("1"), "c").await.unwrap();
        let b = reg.register("b", profile("2").with_gpu(true), "c").await.unwrap();
        reg.claim(a.node_id, TaskId::new()).await.unwrap();
        let c = reg.register("c", profile("3"), "c").await.unwrap();
        reg.disconnect(c.node_id, DisconnectReason::Requested).await;
        let _ = b;

        let stats = reg.network_stats().await;
        assert_eq!(stats.total_nodes, 3);
        assert_eq!(stats.online_nodes, 1);
        assert_eq!(stats.processing_nodes, 1);
        assert_eq!(stats.offline_nodes, 1);
        assert_eq!(stats.total_cpu_cores, 8);
        assert_eq!(stats.gpu_nodes, 1);
        assert!((stats.average_reliability - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_prune_retained() {
        let reg = registry();
        let t0 = Timestamp::from_millis(0);
        let r = reg.register_at("a", profile("1"), "c", t0).await.unwrap();
        reg.disconnect_at(r.node_id, DisconnectReason::HeartbeatTimeout, t0).await;
        assert!(reg.prune_retained(t0.plus_millis(1_000)).await.is_empty());
        assert_eq!(reg.prune_retained(t0.plus_millis(MILLIS_PER_HOUR + 1)).await, vec![r.node_id]);
        assert_eq!(reg.reliability(r.node_id).await, None);
    }

    #[tokio::test]
    async fn test_record_completion() {
        let reg = registry();
        let r = reg.register("a", profile("1"), "c").await.unwrap();
        reg.record_completion(r.node_id, 2.5).await;
        let node = reg.get(r.node_id).await.unwrap();
        assert_eq!(node.tasks_completed, 1);
        assert_eq!(node.earnings, 2.5);
    }

    proptest::proptest! {
        #[test]
        fn prop_reliability_stays_bounded(factors in proptest::collection::vec(0.0f64..2.0, 0..64)) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let reg = registry();
                let r = reg.register("p", profile("fp"), "c").await.unwrap();
                for f in factors {
                    let rel = reg.scale_reliability(r.node_id, f).await.unwrap();
                    assert!((0.5..=1.0).contains(&rel));
                }
            });
        }
    }
}
