//! Persistence hooks.
//!
//! The scheduler never waits on storage. Records are pushed onto a bounded
//! write-behind queue and a background task hands them to the configured
//! [`SwarmStore`]. A full queue drops the record; a failing store is logged
//! and skipped.

use crate::events::RewardEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use swarm_core::{NodeId, ResultDigest, SwarmResult, TaskId, TaskType, Timestamp};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default write-behind queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Snapshot of a node session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Node
    pub node_id: NodeId,
    /// Owner
    pub owner_id: String,
    /// Session start
    pub connected_at: Timestamp,
    /// Session end, if it ended
    pub disconnected_at: Option<Timestamp>,
    /// Reliability at the time of the record
    pub reliability: f64,
    /// Lifetime completions
    pub tasks_completed: u64,
    /// Lifetime earnings
    pub earnings: f64,
}

/// A task accepted by consensus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Task
    pub task_id: TaskId,
    /// Task type
    pub task_type: TaskType,
    /// Accepted digest
    pub digest: ResultDigest,
    /// Workers in the accepted group
    pub contributors: Vec<NodeId>,
    /// Attempts consumed
    pub attempts: u32,
    /// Acceptance time
    pub completed_at: Timestamp,
}

/// Durable sink for scheduler records
#[async_trait]
pub trait SwarmStore: Send + Sync {
    /// Persist a node session
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    async fn persist_session(&self, record: &SessionRecord) -> SwarmResult<()>;

    /// Persist a task completion
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    async fn persist_completion(&self, record: &CompletionRecord) -> SwarmResult<()>;

    /// Persist a reward ledger entry
    ///
    /// # Errors
    ///
    /// Returns error if the write fails
    async fn persist_reward(&self, reward: &RewardEvent) -> SwarmResult<()>;
}

/// Store that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStore;

#[async_trait]
impl SwarmStore for NoopStore {
    async fn persist_session(&self, _record: &SessionRecord) -> SwarmResult<()> {
        Ok(())
    }

    async fn persist_completion(&self, _record: &CompletionRecord) -> SwarmResult<()> {
        Ok(())
    }

    async fn persist_reward(&self, _reward: &RewardEvent) -> SwarmResult<()> {
        Ok(())
    }
}

/// In-memory store, for tests and the simulator
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: Mutex<Vec<SessionRecord>>,
    completions: Mutex<Vec<CompletionRecord>>,
    rewards: Mutex<Vec<RewardEvent>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions persisted so far
    pub async fn sessions(&self) -> Vec<SessionRecord> {
        self.sessions.lock().await.clone()
    }

    /// Completions persisted so far
    pub async fn completions(&self) -> Vec<CompletionRecord> {
        self.completions.lock().await.clone()
    }

    /// Rewards persisted so far
    pub async fn rewards(&self) -> Vec<RewardEvent> {
        self.rewards.lock().await.clone()
    }
}

#[async_trait]
impl SwarmStore for MemoryStore {
    async fn persist_session(&self, record: &SessionRecord) -> SwarmResult<()> {
        self.sessions.lock().await.push(record.clone());
        Ok(())
    }

    async fn persist_completion(&self, record: &CompletionRecord) -> SwarmResult<()> {
        self.completions.lock().await.push(record.clone());
        Ok(())
    }

    async fn persist_reward(&self, reward: &RewardEvent) -> SwarmResult<()> {
        self.rewards.lock().await.push(reward.clone());
        Ok(())
    }
}

/// A record waiting to be written
#[derive(Debug, Clone, PartialEq)]
pub enum StoreRecord {
    /// Node session
    Session(SessionRecord),
    /// Task completion
    Completion(CompletionRecord),
    /// Reward entry
    Reward(RewardEvent),
}

/// Producer side of the write-behind queue
#[derive(Debug)]
pub struct WriteBehind {
    sender: mpsc::Sender<StoreRecord>,
    dropped: AtomicU64,
}

impl WriteBehind {
    /// Create a queue and the receiver to drain
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StoreRecord>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender, dropped: AtomicU64::new(0) }, receiver)
    }

    /// Queue a record without waiting
    pub fn enqueue(&self, record: StoreRecord) {
        if let Err(err) = self.sender.try_send(record) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "write-behind queue rejected record");
        }
    }

    /// Records dropped because the queue was full or closed
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drain the queue into `store` until cancelled or every producer is gone
///
/// Returns the number of records written successfully.
pub async fn drain(
    store: Arc<dyn SwarmStore>,
    mut receiver: mpsc::Receiver<StoreRecord>,
    shutdown: CancellationToken,
) -> u64 {
    let mut written = 0;
    loop {
        let record = tokio::select! {
            _ = shutdown.cancelled() => break,
            record = receiver.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };
        if write(store.as_ref(), &record).await {
            written += 1;
        }
    }
    // Flush what was already queued.
    while let Ok(record) = receiver.try_recv() {
        if write(store.as_ref(), &record).await {
            written += 1;
        }
    }
    debug!(written, "write-behind drain stopped");
    written
}

async fn write(store: &dyn SwarmStore, record: &StoreRecord) -> bool {
    let result = match record {
        StoreRecord::Session(r) => store.persist_session(r).await,
        StoreRecord::Completion(r) => store.persist_completion(r).await,
        StoreRecord::Reward(r) => store.persist_reward(r).await,
    };
    match result {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "persistence failed, record dropped");
            false
        }
    }
}
