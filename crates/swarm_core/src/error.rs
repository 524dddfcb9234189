//! Core error types for SWARM.GRID.

use crate::id::{NodeId, TaskId};

/// Core result type
pub type SwarmResult<T> = Result<T, SwarmError>;

/// Core error type
///
/// Transient kinds (`NoEligibleNode`, `ChannelNotOpen`, `ConsensusNotReached`)
/// are recovered by the scheduler itself. Only `TaskFailed` and an exhausted
/// `SignalingError` reach external callers as failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SwarmError {
    /// Node is not registered
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// Node's assignment slot is already occupied
    #[error("Node {node} busy with task {task}")]
    NodeBusy {
        /// Node that was asked to take a second task
        node: NodeId,
        /// Task already holding the slot
        task: TaskId,
    },

    /// No node passes the eligibility filter right now
    #[error("No eligible node for task {0}")]
    NoEligibleNode(TaskId),

    /// Send attempted before the sub-channel opened
    #[error("Channel {channel} to {node} not open")]
    ChannelNotOpen {
        /// Peer node
        node: NodeId,
        /// Sub-channel name
        channel: String,
    },

    /// Collected results do not agree (yet)
    #[error("Consensus not reached for task {task} after {attempts} attempts")]
    ConsensusNotReached {
        /// Task being validated
        task: TaskId,
        /// Attempts consumed so far
        attempts: u32,
    },

    /// Task reached a terminal failure
    #[error("Task {task} failed: {reason}")]
    TaskFailed {
        /// Failed task
        task: TaskId,
        /// Generic, requester-facing reason
        reason: String,
    },

    /// Malformed offer, answer or candidate
    #[error("Signaling error with {node}: {reason}")]
    SignalingError {
        /// Peer node
        node: NodeId,
        /// What was wrong with the message
        reason: String,
    },

    /// Task is unknown to the ledger
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Task submission rejected
    #[error("Invalid task: {reason}")]
    InvalidTask {
        /// Validation failure
        reason: String,
    },

    /// Configuration value out of range
    #[error("Invalid config for {field}: {reason}")]
    InvalidConfig {
        /// Offending field
        field: String,
        /// Why it was rejected
        reason: String,
    },

    /// Wire encoding failure
    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl SwarmError {
    /// Whether the scheduler recovers from this error on its own
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoEligibleNode(_) | Self::ChannelNotOpen { .. } | Self::ConsensusNotReached { .. }
        )
    }
}

impl From<serde_json::Error> for SwarmError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encoding(err.to_string())
    }
}
