//! Transport channel manager: one logical connection per node, split into
//! control, task and result sub-channels.
//!
//! Peer lifecycle is `New -> Connecting -> Open -> Closed`. The handshake
//! follows offer/answer/candidate signaling; a peer opens once the remote
//! description has been accepted and at least one remote candidate has
//! arrived. Until then every send is buffered per sub-channel and flushed
//! in FIFO order on open.
//!
//! Encoded frames are handed to a [`PeerLink`]. Transmission is
//! fire-and-forget: the link must not block, and no send ever awaits the
//! remote side.

use crate::config::TransportConfig;
use crate::events::{EventBus, SwarmEvent};
use crate::signaling::{Candidate, SdpKind, SessionDescription};
use crate::wire::{Frame, SubChannel, WireMessage};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use swarm_core::{NodeId, SwarmError, SwarmResult, Timestamp};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Outbound side of a peer connection
pub trait PeerLink: Send + Sync {
    /// Hand a frame to the network without blocking
    ///
    /// # Errors
    ///
    /// Returns an error if the frame could not be queued
    fn transmit(&self, node: NodeId, frame: &Frame) -> SwarmResult<()>;
}

/// Broker-backed link: frames are pushed onto an unbounded channel that a
/// relay task drains
#[derive(Debug, Clone)]
pub struct MpscLink {
    sender: mpsc::UnboundedSender<(NodeId, Frame)>,
}

impl MpscLink {
    /// Create a link and the receiver the relay reads from
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(NodeId, Frame)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl PeerLink for MpscLink {
    fn transmit(&self, node: NodeId, frame: &Frame) -> SwarmResult<()> {
        self.sender
            .send((node, frame.clone()))
            .map_err(|_| SwarmError::ChannelNotOpen { node, channel: frame.channel.to_string() })
    }
}

/// Connection state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Known, no handshake yet
    New,
    /// Handshake in progress
    Connecting,
    /// All sub-channels open
    Open,
    /// Torn down
    Closed,
}

/// What happened to a send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Handed to the link
    Sent,
    /// Held until the sub-channel opens
    Buffered,
    /// Given up on after the retransmit bound
    Dropped,
}

/// Per-peer network statistics
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PeerStats {
    /// Messages handed to the link
    pub messages_sent: u64,
    /// Messages received
    pub messages_received: u64,
    /// Bytes handed to the link
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Messages waiting for a sub-channel to open
    pub buffered: usize,
    /// Messages discarded (buffer overflow or retransmit bound)
    pub dropped: u64,
    /// Retransmission attempts
    pub retransmissions: u64,
    /// Smoothed round-trip time in milliseconds
    pub rtt_ms: Option<f64>,
}

#[derive(Debug, Default)]
struct ChannelState {
    open: bool,
    next_sequence: u64,
    buffer: VecDeque<Frame>,
}

#[derive(Debug)]
struct Peer {
    state: PeerState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<Candidate>,
    channels: [ChannelState; 3],
    signaling_failures: u32,
    next_ping: u64,
    stats: PeerStats,
}

impl Peer {
    fn new() -> Self {
        Self {
            state: PeerState::New,
            local: None,
            remote: None,
            candidates: Vec::new(),
            channels: Default::default(),
            signaling_failures: 0,
            next_ping: 0,
            stats: PeerStats::default(),
        }
    }

    fn buffered(&self) -> usize {
        self.channels.iter().map(|c| c.buffer.len()).sum()
    }
}

/// Per-node multiplexed connections
pub struct TransportChannelManager {
    /// Configuration
    config: TransportConfig,
    /// Peers by node
    peers: RwLock<HashMap<NodeId, Arc<Mutex<Peer>>>>,
    /// Outbound link
    link: Arc<dyn PeerLink>,
    /// Event publisher
    events: EventBus,
}

impl TransportChannelManager {
    /// Create a manager sending through `link`
    #[must_use]
    pub fn new(config: TransportConfig, link: Arc<dyn PeerLink>, events: EventBus) -> Self {
        Self {
            config,
            peers: RwLock::new(HashMap::new()),
            link,
            events,
        }
    }

    async fn peer(&self, node: NodeId) -> Option<Arc<Mutex<Peer>>> {
        self.peers.read().await.get(&node).cloned()
    }

    async fn peer_or_new(&self, node: NodeId) -> Arc<Mutex<Peer>> {
        if let Some(peer) = self.peer(node).await {
            return peer;
        }
        self.peers
            .write()
            .await
            .entry(node)
            .or_insert_with(|| Arc::new(Mutex::new(Peer::new())))
            .clone()
    }

    /// Start a handshake as initiator
    ///
    /// A peer that was already connecting restarts its handshake.
    ///
    /// # Errors
    ///
    /// Never fails today; kept fallible to match the other signaling calls.
    pub async fn create_offer(&self, node: NodeId) -> SwarmResult<SessionDescription> {
        let peer = self.peer_or_new(node).await;
        let mut peer = peer.lock().await;
        let offer = SessionDescription::local(SdpKind::Offer, rand::random::<u64>() >> 1);
        if peer.state == PeerState::Open {
            debug!(node = %node, "renegotiating open peer");
        } else {
            peer.state = PeerState::Connecting;
            peer.remote = None;
            peer.candidates.clear();
        }
        peer.local = Some(offer.clone());
        debug!(node = %node, session = offer.session_id, "offer created");
        Ok(offer)
    }

    /// Answer a remote offer as responder
    ///
    /// # Errors
    ///
    /// Returns `SignalingError` if the offer is malformed
    pub async fn create_answer(&self, node: NodeId, offer: &str) -> SwarmResult<SessionDescription> {
        let peer = self.peer_or_new(node).await;
        let remote = match SessionDescription::parse(SdpKind::Offer, offer) {
            Ok(remote) => remote,
            Err(reason) => return Err(self.signaling_failure(node, &peer, reason).await),
        };

        let mut guard = peer.lock().await;
        let answer = SessionDescription::local(SdpKind::Answer, remote.session_id);
        if guard.state != PeerState::Open {
            guard.state = PeerState::Connecting;
        }
        guard.remote = Some(remote);
        guard.local = Some(answer.clone());
        self.try_open(node, &mut guard);
        Ok(answer)
    }

    /// Accept the responder's answer to our offer
    ///
    /// # Errors
    ///
    /// Returns `SignalingError` if no offer is outstanding or the answer is
    /// malformed
    pub async fn accept_answer(&self, node: NodeId, answer: &str) -> SwarmResult<()> {
        let Some(peer) = self.peer(node).await else {
            return Err(SwarmError::SignalingError {
                node,
                reason: "no offer outstanding".to_string(),
            });
        };
        let outstanding = {
            let guard = peer.lock().await;
            matches!(&guard.local, Some(d) if d.kind == SdpKind::Offer)
        };
        if !outstanding {
            return Err(self.signaling_failure(node, &peer, "no offer outstanding".to_string()).await);
        }
        let remote = match SessionDescription::parse(SdpKind::Answer, answer) {
            Ok(remote) => remote,
            Err(reason) => return Err(self.signaling_failure(node, &peer, reason).await),
        };

        let mut guard = peer.lock().await;
        guard.remote = Some(remote);
        self.try_open(node, &mut guard);
        Ok(())
    }

    /// Add a remote connectivity candidate
    ///
    /// # Errors
    ///
    /// Returns `SignalingError` if the peer is unknown or the candidate is
    /// malformed
    pub async fn add_candidate(&self, node: NodeId, candidate: &str) -> SwarmResult<()> {
        let Some(peer) = self.peer(node).await else {
            return Err(SwarmError::SignalingError {
                node,
                reason: "no handshake in progress".to_string(),
            });
        };
        let candidate = match Candidate::parse(candidate) {
            Ok(c) => c,
            Err(reason) => return Err(self.signaling_failure(node, &peer, reason).await),
        };

        let mut guard = peer.lock().await;
        guard.candidates.push(candidate);
        self.try_open(node, &mut guard);
        Ok(())
    }

    /// Charge a malformed signaling message against the retry budget
    async fn signaling_failure(&self, node: NodeId, peer: &Arc<Mutex<Peer>>, reason: String) -> SwarmError {
        let exhausted = {
            let mut guard = peer.lock().await;
            guard.signaling_failures += 1;
            warn!(node = %node, failures = guard.signaling_failures, %reason, "malformed signaling message");
            guard.signaling_failures >= self.config.signaling_retry_budget
        };
        if exhausted {
            self.remove_peer(node).await;
            return SwarmError::SignalingError {
                node,
                reason: format!("{reason} (retry budget exhausted)"),
            };
        }
        SwarmError::SignalingError { node, reason }
    }

    fn try_open(&self, node: NodeId, peer: &mut Peer) {
        if peer.state != PeerState::Connecting || peer.remote.is_none() || peer.candidates.is_empty() {
            return;
        }
        peer.state = PeerState::Open;
        for channel in SubChannel::ALL {
            peer.channels[channel.index()].open = true;
            while let Some(frame) = peer.channels[channel.index()].buffer.pop_front() {
                self.transmit(node, peer, frame);
            }
        }
        peer.stats.buffered = peer.buffered();
        info!(node = %node, "peer open");
        self.events.publish(SwarmEvent::PeerOpened { node });
    }

    fn transmit(&self, node: NodeId, peer: &mut Peer, frame: Frame) -> Delivery {
        let attempts = if frame.channel.is_ordered() { 1 + self.config.max_retransmits } else { 1 };
        for attempt in 0..attempts {
            if attempt > 0 {
                peer.stats.retransmissions += 1;
            }
            if self.link.transmit(node, &frame).is_ok() {
                peer.stats.messages_sent += 1;
                peer.stats.bytes_sent += frame.payload.len() as u64;
                return Delivery::Sent;
            }
        }
        peer.stats.dropped += 1;
        warn!(node = %node, channel = %frame.channel, sequence = frame.sequence, "frame dropped");
        Delivery::Dropped
    }

    /// Send a message on its sub-channel, buffering if it is not open yet
    ///
    /// Sending to an unknown node creates a peer in `New` state.
    ///
    /// # Errors
    ///
    /// Returns `Encoding` if the message cannot be serialized
    pub async fn send(&self, node: NodeId, message: &WireMessage) -> SwarmResult<Delivery> {
        let payload = message.encode()?;
        let channel = message.channel();
        let peer = self.peer_or_new(node).await;
        let mut peer = peer.lock().await;

        let state = &mut peer.channels[channel.index()];
        let frame = Frame { channel, sequence: state.next_sequence, payload };
        state.next_sequence += 1;

        if state.open {
            return Ok(self.transmit(node, &mut peer, frame));
        }

        state.buffer.push_back(frame);
        if state.buffer.len() > self.config.max_buffered {
            state.buffer.pop_front();
            peer.stats.dropped += 1;
            warn!(node = %node, %channel, "send buffer full, oldest message dropped");
        }
        peer.stats.buffered = peer.buffered();
        debug!(node = %node, %channel, "sub-channel not open, message buffered");
        Ok(Delivery::Buffered)
    }

    /// Send on the task sub-channel
    ///
    /// # Errors
    ///
    /// Returns `InvalidTask` if the message does not belong on this channel
    pub async fn send_task(&self, node: NodeId, message: &WireMessage) -> SwarmResult<Delivery> {
        self.send_on(SubChannel::Task, node, message).await
    }

    /// Send on the control sub-channel
    ///
    /// # Errors
    ///
    /// Returns `InvalidTask` if the message does not belong on this channel
    pub async fn send_control(&self, node: NodeId, message: &WireMessage) -> SwarmResult<Delivery> {
        self.send_on(SubChannel::Control, node, message).await
    }

    /// Send on the result sub-channel
    ///
    /// # Errors
    ///
    /// Returns `InvalidTask` if the message does not belong on this channel
    pub async fn send_result(&self, node: NodeId, message: &WireMessage) -> SwarmResult<Delivery> {
        self.send_on(SubChannel::Result, node, message).await
    }

    async fn send_on(&self, channel: SubChannel, node: NodeId, message: &WireMessage) -> SwarmResult<Delivery> {
        if message.channel() != channel {
            return Err(SwarmError::InvalidTask {
                reason: format!("{:?} does not travel on the {} channel", message, channel),
            });
        }
        self.send(node, message).await
    }

    /// Send a latency probe on the control channel
    ///
    /// # Errors
    ///
    /// Returns `Encoding` if the probe cannot be serialized
    pub async fn ping(&self, node: NodeId, now: Timestamp) -> SwarmResult<Delivery> {
        let seq = {
            let peer = self.peer_or_new(node).await;
            let mut peer = peer.lock().await;
            peer.next_ping += 1;
            peer.next_ping
        };
        self.send(node, &WireMessage::Ping { seq, sent_at: now }).await
    }

    /// Process an inbound frame now
    ///
    /// # Errors
    ///
    /// See [`Self::handle_inbound_at`]
    pub async fn handle_inbound(&self, node: NodeId, bytes: &[u8]) -> SwarmResult<Option<WireMessage>> {
        self.handle_inbound_at(node, bytes, Timestamp::now()).await
    }

    /// Process an inbound frame
    ///
    /// Pings are answered and pongs update the smoothed RTT here. Results
    /// and progress reports are returned for the ledger.
    ///
    /// # Errors
    ///
    /// Returns `Encoding` for malformed frames and `ChannelNotOpen` if the
    /// peer is not open
    pub async fn handle_inbound_at(
        &self,
        node: NodeId,
        bytes: &[u8],
        now: Timestamp,
    ) -> SwarmResult<Option<WireMessage>> {
        let message = WireMessage::decode(bytes)?;
        let channel = message.channel();
        let peer = self
            .peer(node)
            .await
            .ok_or_else(|| SwarmError::ChannelNotOpen { node, channel: channel.to_string() })?;
        {
            let mut peer = peer.lock().await;
            if !peer.channels[channel.index()].open {
                return Err(SwarmError::ChannelNotOpen { node, channel: channel.to_string() });
            }
            peer.stats.messages_received += 1;
            peer.stats.bytes_received += bytes.len() as u64;

            if let WireMessage::Pong { sent_at, .. } = &message {
                let sample = now.millis_since(*sent_at) as f64;
                let alpha = self.config.rtt_smoothing;
                peer.stats.rtt_ms = Some(match peer.stats.rtt_ms {
                    Some(rtt) => rtt * (1.0 - alpha) + sample * alpha,
                    None => sample,
                });
                return Ok(None);
            }
        }

        match message {
            WireMessage::Ping { seq, sent_at } => {
                self.send(node, &WireMessage::Pong { seq, sent_at }).await?;
                Ok(None)
            }
            WireMessage::Result { .. } | WireMessage::Progress { .. } => Ok(Some(message)),
            other => {
                warn!(node = %node, ?other, "unexpected inbound message");
                Ok(None)
            }
        }
    }

    /// Close one sub-channel
    ///
    /// Once all three are closed the peer is torn down. Returns whether
    /// that happened.
    pub async fn close_channel(&self, node: NodeId, channel: SubChannel) -> bool {
        let Some(peer) = self.peer(node).await else {
            return false;
        };
        let all_closed = {
            let mut peer = peer.lock().await;
            let state = &mut peer.channels[channel.index()];
            state.open = false;
            debug!(node = %node, %channel, "sub-channel closed");
            peer.state != PeerState::New && peer.channels.iter().all(|c| !c.open)
        };
        if all_closed {
            self.remove_peer(node).await;
        }
        all_closed
    }

    /// Tear a peer down and drop its buffers
    ///
    /// Returns whether a peer existed.
    pub async fn remove_peer(&self, node: NodeId) -> bool {
        let Some(peer) = self.peers.write().await.remove(&node) else {
            return false;
        };
        let mut peer = peer.lock().await;
        peer.state = PeerState::Closed;
        for state in &mut peer.channels {
            state.open = false;
            state.buffer.clear();
        }
        info!(node = %node, "peer closed");
        self.events.publish(SwarmEvent::PeerClosed { node });
        true
    }

    /// Connection state of a peer
    pub async fn peer_state(&self, node: NodeId) -> Option<PeerState> {
        let peer = self.peer(node).await?;
        let state = peer.lock().await.state;
        Some(state)
    }

    /// Whether a sub-channel is open
    pub async fn is_open(&self, node: NodeId, channel: SubChannel) -> bool {
        match self.peer(node).await {
            Some(peer) => peer.lock().await.channels[channel.index()].open,
            None => false,
        }
    }

    /// Statistics of a peer
    pub async fn peer_stats(&self, node: NodeId) -> Option<PeerStats> {
        let peer = self.peer(node).await?;
        let stats = peer.lock().await.stats.clone();
        Some(stats)
    }

    /// Smoothed RTT of every peer that has a sample
    pub async fn latencies(&self) -> HashMap<NodeId, f64> {
        let peers: Vec<_> = self.peers.read().await.iter().map(|(id, p)| (*id, p.clone())).collect();
        let mut latencies = HashMap::new();
        for (id, peer) in peers {
            if let Some(rtt) = peer.lock().await.stats.rtt_ms {
                latencies.insert(id, rtt);
            }
        }
        latencies
    }

    /// Number of known peers
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use swarm_core::{ResultDigest, TaskId, TaskType};

    const CANDIDATE: &str = "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host";
    const ANSWER: &str = "v=0\r\no=- 99 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n";

    fn manager() -> (TransportChannelManager, mpsc::UnboundedReceiver<(NodeId, Frame)>, EventBus) {
        let (link, rx) = MpscLink::new();
        let events = EventBus::default();
        let manager = TransportChannelManager::new(TransportConfig::default(), Arc::new(link), events.clone());
        (manager, rx, events)
    }

    fn task_message(n: u64) -> WireMessage {
        WireMessage::Task {
            task_id: TaskId::new(),
            epoch: n,
            task_type: TaskType::new("render"),
            payload_ref: format!("blob-{n}"),
        }
    }

    async fn open(manager: &TransportChannelManager, node: NodeId) {
        manager.create_offer(node).await.unwrap();
        manager.accept_answer(node, ANSWER).await.unwrap();
        manager.add_candidate(node, CANDIDATE).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_before_open_buffers_then_flushes_in_order() {
        let (manager, mut rx, _) = manager();
        let node = NodeId::new();
        let messages: Vec<_> = (0..5).map(task_message).collect();
        for m in &messages {
            assert_eq!(manager.send_task(node, m).await.unwrap(), Delivery::Buffered);
        }
        assert_eq!(manager.peer_state(node).await, Some(PeerState::New));
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.peer_stats(node).await.unwrap().buffered, 5);

        open(&manager, node).await;
        assert_eq!(manager.peer_state(node).await, Some(PeerState::Open));

        for expected in &messages {
            let (to, frame) = rx.try_recv().unwrap();
            assert_eq!(to, node);
            assert_eq!(&WireMessage::decode(&frame.payload).unwrap(), expected);
        }
        assert_eq!(manager.peer_stats(node).await.unwrap().buffered, 0);
        assert_eq!(manager.send_task(node, &task_message(9)).await.unwrap(), Delivery::Sent);
    }

    #[tokio::test]
    async fn test_open_requires_answer_and_candidate() {
        let (manager, _rx, events) = manager();
        let mut sub = events.subscribe();
        let node = NodeId::new();
        manager.create_offer(node).await.unwrap();
        manager.add_candidate(node, CANDIDATE).await.unwrap();
        assert_eq!(manager.peer_state(node).await, Some(PeerState::Connecting));
        manager.accept_answer(node, ANSWER).await.unwrap();
        assert_eq!(manager.peer_state(node).await, Some(PeerState::Open));
        assert_eq!(sub.recv().await.unwrap(), SwarmEvent::PeerOpened { node });
    }

    #[tokio::test]
    async fn test_responder_handshake() {
        let (manager, _rx, _) = manager();
        let node = NodeId::new();
        let offer = SessionDescription::local(SdpKind::Offer, 5);
        let answer = manager.create_answer(node, &offer.sdp).await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);
        assert_eq!(answer.session_id, 5);
        manager.add_candidate(node, CANDIDATE).await.unwrap();
        assert!(manager.is_open(node, SubChannel::Result).await);
    }

    #[tokio::test]
    async fn test_buffer_overflow_drops_oldest() {
        let (link, mut rx) = MpscLink::new();
        let config = TransportConfig { max_buffered: 2, ..TransportConfig::default() };
        let manager = TransportChannelManager::new(config, Arc::new(link), EventBus::default());
        let node = NodeId::new();
        for n in 0..4 {
            manager.send_task(node, &task_message(n)).await.unwrap();
        }
        assert_eq!(manager.peer_stats(node).await.unwrap().dropped, 2);
        open(&manager, node).await;
        let epochs: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|(_, f)| match WireMessage::decode(&f.payload).unwrap() {
                WireMessage::Task { epoch, .. } => epoch,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(epochs, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_malformed_signaling_exhausts_budget() {
        let (manager, _rx, events) = manager();
        let mut sub = events.subscribe();
        let node = NodeId::new();
        manager.create_offer(node).await.unwrap();
        for _ in 0..2 {
            let err = manager.add_candidate(node, "garbage").await.unwrap_err();
            assert!(matches!(err, SwarmError::SignalingError { .. }));
        }
        assert_eq!(manager.peer_state(node).await, Some(PeerState::Connecting));
        let err = manager.accept_answer(node, "nonsense").await.unwrap_err();
        assert!(err.to_string().contains("retry budget exhausted"));
        assert_eq!(manager.peer_state(node).await, None);
        assert_eq!(sub.recv().await.unwrap(), SwarmEvent::PeerClosed { node });
    }

    #[tokio::test]
    async fn test_wrong_channel_rejected() {
        let (manager, _rx, _) = manager();
        let err = manager
            .send_control(NodeId::new(), &task_message(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SwarmError::InvalidTask { .. }));
    }

    #[tokio::test]
    async fn test_ping_pong_updates_rtt() {
        let (manager, mut rx, _) = manager();
        let node = NodeId::new();
        open(&manager, node).await;
        manager.ping(node, Timestamp::from_millis(1_000)).await.unwrap();
        let (_, frame) = rx.try_recv().unwrap();
        let WireMessage::Ping { seq, sent_at } = WireMessage::decode(&frame.payload).unwrap() else {
            panic!("expected ping");
        };
        let pong = WireMessage::Pong { seq, sent_at }.encode().unwrap();
        manager.handle_inbound_at(node, &pong, Timestamp::from_millis(1_100)).await.unwrap();
        assert_eq!(manager.peer_stats(node).await.unwrap().rtt_ms, Some(100.0));

        let pong = WireMessage::Pong { seq, sent_at }.encode().unwrap();
        manager.handle_inbound_at(node, &pong, Timestamp::from_millis(1_200)).await.unwrap();
        let rtt = manager.peer_stats(node).await.unwrap().rtt_ms.unwrap();
        assert!((rtt - 120.0).abs() < 1e-9);
        assert_eq!(manager.latencies().await.get(&node), Some(&rtt));
    }

    #[tokio::test]
    async fn test_inbound_ping_is_answered() {
        let (manager, mut rx, _) = manager();
        let node = NodeId::new();
        open(&manager, node).await;
        let ping = WireMessage::Ping { seq: 7, sent_at: Timestamp::from_millis(3) }.encode().unwrap();
        assert!(manager.handle_inbound(node, &ping).await.unwrap().is_none());
        let (_, frame) = rx.try_recv().unwrap();
        assert_eq!(
            WireMessage::decode(&frame.payload).unwrap(),
            WireMessage::Pong { seq: 7, sent_at: Timestamp::from_millis(3) }
        );
    }

    #[tokio::test]
    async fn test_inbound_result_is_returned() {
        let (manager, _rx, _) = manager();
        let node = NodeId::new();
        let message = WireMessage::Result {
            task_id: TaskId::new(),
            epoch: 1,
            digest: ResultDigest::compute(b"out"),
        };
        let bytes = message.encode().unwrap();
        assert!(matches!(
            manager.handle_inbound(node, &bytes).await,
            Err(SwarmError::ChannelNotOpen { .. })
        ));
        open(&manager, node).await;
        assert_eq!(manager.handle_inbound(node, &bytes).await.unwrap(), Some(message));
        assert_eq!(manager.peer_stats(node).await.unwrap().messages_received, 1);
    }

    #[tokio::test]
    async fn test_closing_all_channels_tears_down() {
        let (manager, _rx, _) = manager();
        let node = NodeId::new();
        open(&manager, node).await;
        assert!(!manager.close_channel(node, SubChannel::Task).await);
        assert!(!manager.close_channel(node, SubChannel::Control).await);
        assert_eq!(manager.peer_state(node).await, Some(PeerState::Open));
        assert!(manager.close_channel(node, SubChannel::Result).await);
        assert_eq!(manager.peer_state(node).await, None);
        assert!(!manager.remove_peer(node).await);
    }

    struct FlakyLink {
        failures: AtomicU32,
    }

    impl PeerLink for FlakyLink {
        fn transmit(&self, node: NodeId, frame: &Frame) -> SwarmResult<()> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(SwarmError::ChannelNotOpen { node, channel: frame.channel.to_string() });
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ordered_channel_retransmits_task_channel_does_not() {
        let link = Arc::new(FlakyLink { failures: AtomicU32::new(2) });
        let manager = TransportChannelManager::new(TransportConfig::default(), link.clone(), EventBus::default());
        let node = NodeId::new();
        open(&manager, node).await;

        let cancel = WireMessage::Cancel { task_id: TaskId::new(), epoch: 1 };
        assert_eq!(manager.send_control(node, &cancel).await.unwrap(), Delivery::Sent);
        assert_eq!(manager.peer_stats(node).await.unwrap().retransmissions, 2);

        link.failures.store(1, Ordering::SeqCst);
        assert_eq!(manager.send_task(node, &task_message(1)).await.unwrap(), Delivery::Dropped);
        assert_eq!(manager.peer_stats(node).await.unwrap().dropped, 1);
    }
}
