//! In-process swarm simulation.
//!
//! Registers a set of simulated nodes, opens their transport, submits a
//! batch of tasks and answers task frames the way each node's behavior
//! dictates. Runs until every task is terminal or the deadline passes.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use swarm_cluster::{
    Coordinator, DistributionStats, Frame, MemoryStore, MpscLink, NetworkStats, NodeMetrics, QueueStats,
    SwarmConfig, TaskSpec, WireMessage,
};
use swarm_core::{DeviceProfile, NodeId, Priority, ResultDigest, SwarmResult, TaskId};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ANSWER: &str = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=sim\r\nt=0 0\r\n";
const CANDIDATE: &str = "candidate:1 1 udp 2130706431 127.0.0.1 9 typ host";
const TASK_TYPE: &str = "render";

/// How a simulated node treats the work it is given
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Behavior {
    /// Returns the correct digest
    Honest,
    /// Returns a digest nobody else will produce
    Corrupt,
    /// Never answers
    Silent,
}

/// Simulation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Total nodes
    pub nodes: usize,
    /// Nodes that misbehave; alternately corrupt and silent
    pub faulty: usize,
    /// Tasks to submit
    pub tasks: usize,
    /// Seed for behavior, latency and task mix
    pub seed: u64,
    /// Give up after this long
    pub deadline_ms: u64,
    /// Simulated work time range
    pub work_ms: (u64, u64),
}

impl SimConfig {
    /// Create a config with a fixed seed
    #[must_use]
    pub fn new(nodes: usize, faulty: usize, tasks: usize, seed: u64) -> Self {
        Self {
            nodes,
            faulty: faulty.min(nodes),
            tasks,
            seed,
            deadline_ms: 30_000,
            work_ms: (5, 40),
        }
    }

    /// Set the deadline
    #[must_use]
    pub fn with_deadline(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = deadline_ms;
        self
    }

    fn behavior(&self, index: usize) -> Behavior {
        if index >= self.faulty {
            Behavior::Honest
        } else if index % 2 == 0 {
            Behavior::Corrupt
        } else {
            Behavior::Silent
        }
    }
}

/// Final state of a simulated node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimNodeReport {
    /// Node
    pub node_id: NodeId,
    /// Configured behavior
    pub behavior: Behavior,
    /// Final reliability, if still registered
    pub reliability: Option<f64>,
    /// Earnings
    pub earnings: f64,
}

/// What the simulation produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimReport {
    /// Tasks submitted
    pub submitted: usize,
    /// Whether every task finished before the deadline
    pub settled: bool,
    /// Wall time spent
    pub elapsed_ms: u64,
    /// Total reward paid out
    pub rewards_paid: f64,
    /// Queue counts
    pub queue: QueueStats,
    /// Node aggregates
    pub network: NetworkStats,
    /// Strategy state and outcome counters
    pub distribution: DistributionStats,
    /// Per-node outcome
    pub nodes: Vec<SimNodeReport>,
}

fn profile(index: usize, rng: &mut ChaCha8Rng) -> DeviceProfile {
    DeviceProfile::new(format!("sim-device-{index}"))
        .with_cpu_cores(rng.gen_range(1..=16))
        .with_memory_mb(rng.gen_range(2..=32) * 1_024)
        .with_bandwidth_mbps(rng.gen_range(10..=500))
        .with_gpu(rng.gen_bool(0.3))
        .with_task_type(TASK_TYPE)
}

/// Run a simulation
///
/// # Errors
///
/// Returns `InvalidConfig` for a bad scheduler config and signaling errors
/// if a simulated handshake is rejected
pub async fn run(sim: SimConfig, config: SwarmConfig) -> SwarmResult<SimReport> {
    let started = Instant::now();
    let (link, frames) = MpscLink::new();
    let store = Arc::new(MemoryStore::new());
    let coordinator = Arc::new(Coordinator::new(config, Arc::new(link), store.clone())?);
    coordinator.start();

    let mut rng = ChaCha8Rng::seed_from_u64(sim.seed);
    let mut behaviors = HashMap::new();
    for index in 0..sim.nodes {
        let owner = format!("sim-owner-{index}");
        let node = coordinator.register(&owner, profile(index, &mut rng), "sim").await?;
        coordinator.create_offer(node).await?;
        coordinator.accept_answer(node, ANSWER).await?;
        coordinator.add_candidate(node, CANDIDATE).await?;
        behaviors.insert(node, sim.behavior(index));
    }
    info!(nodes = sim.nodes, faulty = sim.faulty, tasks = sim.tasks, seed = sim.seed, "simulation started");

    let relay = tokio::spawn(relay(
        coordinator.clone(),
        frames,
        behaviors.clone(),
        sim.work_ms,
        ChaCha8Rng::seed_from_u64(sim.seed.wrapping_add(1)),
    ));

    let mut tasks = Vec::with_capacity(sim.tasks);
    for n in 0..sim.tasks {
        let priority = match rng.gen_range(0..10) {
            0 => Priority::Critical,
            1..=2 => Priority::High,
            3..=8 => Priority::Normal,
            _ => Priority::Low,
        };
        let spec = TaskSpec::new(TASK_TYPE, format!("blob://sim/{n}"), rng.gen_range(1.0..10.0)).with_priority(priority);
        tasks.push(coordinator.submit(spec).await?);
    }

    let deadline = started + Duration::from_millis(sim.deadline_ms);
    let settled = loop {
        if all_terminal(&coordinator, &tasks).await {
            break true;
        }
        if Instant::now() >= deadline {
            warn!("simulation deadline reached with tasks outstanding");
            break false;
        }
        for (node, behavior) in &behaviors {
            if *behavior == Behavior::Silent {
                continue;
            }
            let metrics = NodeMetrics { active_tasks: 1, ..NodeMetrics::default() };
            if let Err(err) = coordinator.heartbeat(*node, metrics).await {
                debug!(node = %node, error = %err, "heartbeat rejected");
            }
        }
        coordinator.optimize().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    relay.abort();
    coordinator.shutdown().await;

    let mut nodes = Vec::with_capacity(behaviors.len());
    for (node_id, behavior) in behaviors {
        let node = coordinator.registry().get(node_id).await;
        nodes.push(SimNodeReport {
            node_id,
            behavior,
            reliability: node.as_ref().map(|n| n.reliability),
            earnings: node.map_or(0.0, |n| n.earnings),
        });
    }
    nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));

    let report = SimReport {
        submitted: tasks.len(),
        settled,
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        rewards_paid: store.rewards().await.iter().map(|r| r.amount).sum(),
        queue: coordinator.queue_stats().await,
        network: coordinator.network_stats().await,
        distribution: coordinator.distribution_stats().await,
        nodes,
    };
    info!(
        completed = report.queue.completed,
        failed = report.queue.failed,
        elapsed_ms = report.elapsed_ms,
        "simulation finished"
    );
    Ok(report)
}

async fn all_terminal(coordinator: &Coordinator, tasks: &[TaskId]) -> bool {
    for task in tasks {
        match coordinator.get_status(*task).await {
            Ok(view) if view.status.is_terminal() => {}
            _ => return false,
        }
    }
    true
}

/// Answer frames on behalf of the simulated nodes
async fn relay(
    coordinator: Arc<Coordinator>,
    mut frames: mpsc::UnboundedReceiver<(NodeId, Frame)>,
    behaviors: HashMap<NodeId, Behavior>,
    work_ms: (u64, u64),
    mut rng: ChaCha8Rng,
) {
    while let Some((node, frame)) = frames.recv().await {
        let message = match WireMessage::decode(&frame.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(node = %node, error = %err, "undecodable frame");
                continue;
            }
        };
        let reply = match (message, behaviors.get(&node).copied()) {
            (_, None | Some(Behavior::Silent)) => None,
            (WireMessage::Ping { seq, sent_at }, _) => Some((0, WireMessage::Pong { seq, sent_at })),
            (WireMessage::Task { task_id, epoch, payload_ref, .. }, Some(behavior)) => {
                let digest = match behavior {
                    Behavior::Corrupt => ResultDigest::compute(format!("{payload_ref}/{node}").as_bytes()),
                    _ => ResultDigest::compute(payload_ref.as_bytes()),
                };
                let delay = rng.gen_range(work_ms.0..=work_ms.1.max(work_ms.0));
                Some((delay, WireMessage::Result { task_id, epoch, digest }))
            }
            _ => None,
        };
        let Some((delay, reply)) = reply else {
            continue;
        };

        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let bytes = match reply.encode() {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(node = %node, error = %err, "reply not encodable");
                    return;
                }
            };
            if let Err(err) = coordinator.handle_inbound(node, &bytes).await {
                debug!(node = %node, error = %err, "reply rejected");
            }
        });
    }
}
