//! Priority message queue
//!
//! Outbound messages are buffered in three FIFO lanes and dispatched once per
//! tick under a message-count and byte ceiling. Higher lanes always drain
//! first; whatever does not fit stays queued in order for the next tick.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

use crate::game::state::PeerId;
use crate::net::protocol::{encode, ServerMessage};
use crate::net::transport::{Delivery, Transport};

/// Dispatch priority; `High` drains first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    fn lane(self) -> usize {
        self as usize
    }
}

/// Who receives a queued message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Broadcast { exclude: Option<PeerId> },
    Peer(PeerId),
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub payload: Vec<u8>,
    pub target: Target,
    pub delivery: Delivery,
    pub priority: Priority,
}

/// Result of one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub sent: usize,
    pub bytes: usize,
    /// Addressed to peers that are no longer connected
    pub dropped: usize,
    /// Left in the queue for a later tick
    pub deferred: usize,
}

pub struct MessageQueue {
    lanes: Mutex<[VecDeque<QueuedMessage>; 3]>,
    max_messages: usize,
    max_bytes: usize,
}

impl MessageQueue {
    pub fn new(max_messages: usize, max_bytes: usize) -> Self {
        Self {
            lanes: Mutex::new([VecDeque::new(), VecDeque::new(), VecDeque::new()]),
            max_messages: max_messages.max(1),
            max_bytes,
        }
    }

    pub fn enqueue(&self, message: QueuedMessage) {
        self.lanes.lock()[message.priority.lane()].push_back(message);
    }

    /// Encode and enqueue. Encoding failures are logged and the message dropped.
    pub fn push(
        &self,
        message: &ServerMessage,
        target: Target,
        delivery: Delivery,
        priority: Priority,
    ) {
        match encode(message) {
            Ok(payload) => self.enqueue(QueuedMessage {
                payload,
                target,
                delivery,
                priority,
            }),
            Err(e) => tracing::error!("Failed to encode outbound message: {}", e),
        }
    }

    pub fn broadcast(&self, message: &ServerMessage, delivery: Delivery, priority: Priority) {
        self.push(message, Target::Broadcast { exclude: None }, delivery, priority);
    }

    pub fn broadcast_except(
        &self,
        exclude: PeerId,
        message: &ServerMessage,
        delivery: Delivery,
        priority: Priority,
    ) {
        self.push(
            message,
            Target::Broadcast {
                exclude: Some(exclude),
            },
            delivery,
            priority,
        );
    }

    pub fn to_peer(
        &self,
        peer_id: PeerId,
        message: &ServerMessage,
        delivery: Delivery,
        priority: Priority,
    ) {
        self.push(message, Target::Peer(peer_id), delivery, priority);
    }

    pub fn len(&self) -> usize {
        self.lanes.lock().iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len_at(&self, priority: Priority) -> usize {
        self.lanes.lock()[priority.lane()].len()
    }

    /// Pop the next batch that fits the ceilings. Messages for peers outside
    /// `connected` are discarded without counting against the budget. A
    /// single message larger than the byte ceiling is sent alone so the queue
    /// cannot wedge.
    fn take_batch(&self, connected: &HashSet<PeerId>) -> (Vec<QueuedMessage>, usize, usize) {
        let mut lanes = self.lanes.lock();
        let mut batch = Vec::new();
        let mut bytes = 0usize;
        let mut dropped = 0usize;

        'lanes: for lane in lanes.iter_mut() {
            while let Some(front) = lane.front() {
                if let Target::Peer(peer_id) = front.target {
                    if !connected.contains(&peer_id) {
                        lane.pop_front();
                        dropped += 1;
                        continue;
                    }
                }

                if batch.len() >= self.max_messages {
                    break 'lanes;
                }
                let size = front.payload.len();
                if !batch.is_empty() && bytes + size > self.max_bytes {
                    break 'lanes;
                }

                if let Some(message) = lane.pop_front() {
                    bytes += size;
                    batch.push(message);
                }
            }
        }

        let deferred = lanes.iter().map(VecDeque::len).sum();
        (batch, dropped, deferred)
    }

    /// Dispatch one tick's worth of messages through `transport`.
    pub fn drain(&self, transport: &dyn Transport) -> DrainStats {
        let connected: HashSet<PeerId> = transport.connected_peers().into_iter().collect();
        let (batch, mut dropped, deferred) = self.take_batch(&connected);

        let mut stats = DrainStats {
            deferred,
            ..Default::default()
        };

        for message in batch {
            match message.target {
                Target::Broadcast { exclude } => {
                    transport.broadcast(&message.payload, message.delivery, exclude);
                }
                Target::Peer(peer_id) => {
                    if let Err(e) = transport.send(peer_id, &message.payload, message.delivery) {
                        tracing::debug!("Dropping message: {}", e);
                        dropped += 1;
                        continue;
                    }
                }
            }
            stats.sent += 1;
            stats.bytes += message.payload.len();
        }

        stats.dropped = dropped;
        stats
    }
}
