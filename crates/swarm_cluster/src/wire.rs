//! Wire messages exchanged with nodes.
//!
//! Each message travels on a fixed sub-channel and is encoded as JSON.

use serde::{Deserialize, Serialize};
use swarm_core::{ResultDigest, SwarmResult, TaskId, TaskType, Timestamp};

/// Logical sub-channel of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubChannel {
    /// Heartbeats, pings and cancellations
    Control,
    /// Task delivery
    Task,
    /// Results and progress
    Result,
}

impl SubChannel {
    /// All sub-channels in index order
    pub const ALL: [SubChannel; 3] = [SubChannel::Control, SubChannel::Task, SubChannel::Result];

    /// Position in per-peer arrays
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::Control => 0,
            Self::Task => 1,
            Self::Result => 2,
        }
    }

    /// Whether delivery is ordered and retransmitted
    #[must_use]
    pub fn is_ordered(self) -> bool {
        !matches!(self, Self::Task)
    }

    /// Label
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::Task => "task",
            Self::Result => "result",
        }
    }
}

impl std::fmt::Display for SubChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A message on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Work for the node
    Task {
        /// Task
        task_id: TaskId,
        /// Assignment epoch the node must echo back
        epoch: u64,
        /// Task type
        task_type: TaskType,
        /// Opaque payload reference
        payload_ref: String,
    },
    /// Abandon a task
    Cancel {
        /// Task
        task_id: TaskId,
        /// Assignment epoch being cancelled
        epoch: u64,
    },
    /// Latency probe
    Ping {
        /// Probe sequence
        seq: u64,
        /// When the probe left
        sent_at: Timestamp,
    },
    /// Latency probe reply
    Pong {
        /// Probe sequence being answered
        seq: u64,
        /// Echo of the probe's `sent_at`
        sent_at: Timestamp,
    },
    /// Completed work
    Result {
        /// Task
        task_id: TaskId,
        /// Assignment epoch
        epoch: u64,
        /// Digest of the output
        digest: ResultDigest,
    },
    /// Execution progress
    Progress {
        /// Task
        task_id: TaskId,
        /// Assignment epoch
        epoch: u64,
        /// Percent complete
        percent: u8,
    },
}

impl WireMessage {
    /// Sub-channel this message travels on
    #[must_use]
    pub fn channel(&self) -> SubChannel {
        match self {
            Self::Task { .. } => SubChannel::Task,
            Self::Cancel { .. } | Self::Ping { .. } | Self::Pong { .. } => SubChannel::Control,
            Self::Result { .. } | Self::Progress { .. } => SubChannel::Result,
        }
    }

    /// Encode to bytes
    ///
    /// # Errors
    ///
    /// Returns `Encoding` if serialization fails
    pub fn encode(&self) -> SwarmResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from bytes
    ///
    /// # Errors
    ///
    /// Returns `Encoding` for malformed input
    pub fn decode(bytes: &[u8]) -> SwarmResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// An encoded message bound for one sub-channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sub-channel
    pub channel: SubChannel,
    /// Per-sub-channel sequence number
    pub sequence: u64,
    /// Encoded message
    pub payload: Vec<u8>,
}
