//! SWARM.GRID Scheduling Engine
//!
//! Node registry, task ledger with redundant execution and consensus
//! acceptance, pluggable assignment strategies, and the per-node transport
//! channel manager. [`Coordinator`] wires them into one scheduling authority.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assignment;
pub mod config;
pub mod consensus;
pub mod coordinator;
pub mod events;
pub mod history;
pub mod ledger;
pub mod registry;
pub mod signaling;
pub mod store;
pub mod transport;
pub mod wire;

pub use assignment::{AssignmentEngine, Candidate, Demand, Strategy};
pub use config::{AssignmentConfig, LedgerConfig, RegistryConfig, SwarmConfig, TransportConfig};
pub use consensus::{ConsensusRule, SubmittedResult, Verdict};
pub use coordinator::{Coordinator, DistributionStats, SweepReport};
pub use events::{DisconnectReason, EventBus, RewardEvent, SwarmEvent};
pub use history::{DistributionHistory, NodeCounters, TaskTypeMetrics};
pub use ledger::{QueueStats, Task, TaskLedger, TaskSpec, TaskStatus, TaskStatusView};
pub use registry::{HeartbeatAck, NetworkStats, Node, NodeMetrics, NodeRegistry, NodeStatus};
pub use signaling::{SdpKind, SessionDescription};
pub use store::{CompletionRecord, MemoryStore, NoopStore, SessionRecord, SwarmStore};
pub use transport::{Delivery, MpscLink, PeerLink, PeerState, PeerStats, TransportChannelManager};
pub use wire::{Frame, SubChannel, WireMessage};
