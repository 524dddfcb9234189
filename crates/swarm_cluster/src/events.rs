//! Scheduler event bus.
//!
//! Lifecycle changes are published on a broadcast channel instead of
//! callbacks. Billing consumes [`RewardEvent`]s from here; observers and
//! tests subscribe for the rest. Publishing never blocks and never fails:
//! with no subscribers the event is simply dropped.

use crate::assignment::Strategy;
use serde::{Deserialize, Serialize};
use swarm_core::{NodeId, ResultDigest, TaskId, Timestamp};
use tokio::sync::broadcast;

/// Why a node left the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The node or its owner asked to leave
    Requested,
    /// No heartbeat within the timeout window
    HeartbeatTimeout,
    /// All transport sub-channels closed
    TransportClosed,
}

/// Credit owed to a node for a validated task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardEvent {
    /// Node to credit
    pub node_id: NodeId,
    /// Amount in reward-budget units
    pub amount: f64,
    /// Task the reward is for
    pub task_id: TaskId,
    /// When consensus accepted the task
    pub timestamp: Timestamp,
}

/// Everything the scheduler announces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SwarmEvent {
    /// Node registered or re-registered
    NodeRegistered {
        /// Node
        node: NodeId,
        /// Whether an existing record was revived
        revived: bool,
    },
    /// Node removed from the live table
    NodeDisconnected {
        /// Node
        node: NodeId,
        /// Task it held, if any
        held_task: Option<TaskId>,
        /// Why
        reason: DisconnectReason,
    },
    /// Task accepted into the queue
    TaskSubmitted {
        /// Task
        task: TaskId,
    },
    /// Task handed to a node
    TaskAssigned {
        /// Task
        task: TaskId,
        /// Node
        node: NodeId,
        /// Assignment epoch
        epoch: u64,
    },
    /// Task returned to the queue
    TaskRequeued {
        /// Task
        task: TaskId,
        /// Attempts consumed so far
        attempts: u32,
        /// Why it was requeued
        reason: String,
    },
    /// Consensus accepted a result
    TaskCompleted {
        /// Task
        task: TaskId,
        /// Accepted result digest
        digest: ResultDigest,
        /// Workers in the accepted group
        contributors: Vec<NodeId>,
    },
    /// Task reached terminal failure
    TaskFailed {
        /// Task
        task: TaskId,
        /// Attempts consumed
        attempts: u32,
        /// Generic reason
        reason: String,
    },
    /// Requester cancelled the task
    TaskCancelled {
        /// Task
        task: TaskId,
    },
    /// Reward credited
    Reward(RewardEvent),
    /// Optimizer or operator changed the selection strategy
    StrategySwitched {
        /// Previous strategy
        from: Strategy,
        /// New strategy
        to: Strategy,
    },
    /// Transport to a node opened
    PeerOpened {
        /// Node
        node: NodeId,
    },
    /// Transport to a node closed
    PeerClosed {
        /// Node
        node: NodeId,
    },
}

/// Broadcast publisher shared by all components
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SwarmEvent>,
}

impl EventBus {
    /// Create a bus retaining up to `capacity` undelivered events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event
    pub fn publish(&self, event: SwarmEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }

    /// Subscribe to future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(SwarmEvent::TaskSubmitted { task: TaskId::new() });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let task = TaskId::new();
        bus.publish(SwarmEvent::TaskCancelled { task });
        assert_eq!(rx.recv().await.unwrap(), SwarmEvent::TaskCancelled { task });
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = SwarmEvent::PeerOpened { node: NodeId::from_bytes([1; 16]) };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"peer_opened""#));
    }
}
