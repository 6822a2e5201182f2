//! Transport abstraction
//!
//! The simulation core never talks to sockets. It sees peers through the
//! [`Transport`] trait (send / broadcast / disconnect) and receives
//! [`TransportEvent`]s over a channel that the tick loop drains.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use parking_lot::{Mutex, RwLock};

use crate::game::state::PeerId;
use crate::net::protocol::{decode, ServerMessage};

/// Delivery class requested for an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// Ordered, guaranteed
    Reliable,
    /// Best effort; may be dropped or superseded
    Unreliable,
}

/// Connection lifecycle and data events produced by a transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected { peer_id: PeerId, endpoint: SocketAddr },
    Disconnected { peer_id: PeerId, reason: String },
    Data { peer_id: PeerId, payload: Vec<u8> },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("Send channel closed for peer {0}")]
    ChannelClosed(PeerId),
}

/// Outbound side of a transport
pub trait Transport: Send + Sync {
    fn send(&self, peer_id: PeerId, payload: &[u8], delivery: Delivery)
        -> Result<(), TransportError>;

    /// Send to every connected peer except `exclude`. Returns recipients reached.
    fn broadcast(&self, payload: &[u8], delivery: Delivery, exclude: Option<PeerId>) -> usize;

    fn connected_peers(&self) -> Vec<PeerId>;

    fn is_connected(&self, peer_id: PeerId) -> bool {
        self.connected_peers().contains(&peer_id)
    }

    /// Close a peer's connection. A `Disconnected` event follows.
    fn disconnect(&self, peer_id: PeerId, reason: &str);
}

/// A payload handed to the loopback transport
#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub peer_id: PeerId,
    pub payload: Vec<u8>,
    pub delivery: Delivery,
}

/// In-process transport that records every send. Used by tests and benches.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    peers: RwLock<BTreeSet<PeerId>>,
    sent: Mutex<Vec<Delivered>>,
    disconnected: Mutex<Vec<(PeerId, String)>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, peer_id: PeerId) {
        self.peers.write().insert(peer_id);
    }

    /// Simulate the remote side going away
    pub fn drop_peer(&self, peer_id: PeerId) {
        self.peers.write().remove(&peer_id);
    }

    /// Take everything sent so far
    pub fn take_sent(&self) -> Vec<Delivered> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Take and decode everything sent to one peer, in send order
    pub fn take_messages_for(&self, peer_id: PeerId) -> Vec<ServerMessage> {
        let mut sent = self.sent.lock();
        let (mine, rest): (Vec<_>, Vec<_>) =
            sent.drain(..).partition(|d| d.peer_id == peer_id);
        *sent = rest;
        mine.into_iter()
            .filter_map(|d| decode(&d.payload).ok())
            .collect()
    }

    /// Peers closed through [`Transport::disconnect`]
    pub fn disconnected(&self) -> Vec<(PeerId, String)> {
        self.disconnected.lock().clone()
    }
}

impl Transport for LoopbackTransport {
    fn send(
        &self,
        peer_id: PeerId,
        payload: &[u8],
        delivery: Delivery,
    ) -> Result<(), TransportError> {
        if !self.peers.read().contains(&peer_id) {
            return Err(TransportError::NotConnected(peer_id));
        }
        self.sent.lock().push(Delivered {
            peer_id,
            payload: payload.to_vec(),
            delivery,
        });
        Ok(())
    }

    fn broadcast(&self, payload: &[u8], delivery: Delivery, exclude: Option<PeerId>) -> usize {
        let peers = self.peers.read();
        let mut sent = self.sent.lock();
        let mut count = 0;
        for &peer_id in peers.iter().filter(|&&p| Some(p) != exclude) {
            sent.push(Delivered {
                peer_id,
                payload: payload.to_vec(),
                delivery,
            });
            count += 1;
        }
        count
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.read().iter().copied().collect()
    }

    fn is_connected(&self, peer_id: PeerId) -> bool {
        self.peers.read().contains(&peer_id)
    }

    fn disconnect(&self, peer_id: PeerId, reason: &str) {
        self.peers.write().remove(&peer_id);
        self.disconnected.lock().push((peer_id, reason.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::encode;

    #[test]
    fn test_send_requires_connection() {
        let transport = LoopbackTransport::new();
        assert!(transport.send(1, b"x", Delivery::Reliable).is_err());

        transport.connect(1);
        assert!(transport.send(1, b"x", Delivery::Reliable).is_ok());
        assert_eq!(transport.take_sent().len(), 1);
    }

    #[test]
    fn test_broadcast_excludes_peer() {
        let transport = LoopbackTransport::new();
        transport.connect(1);
        transport.connect(2);
        transport.connect(3);

        let reached = transport.broadcast(b"hello", Delivery::Unreliable, Some(2));
        assert_eq!(reached, 2);
        let sent = transport.take_sent();
        assert!(sent.iter().all(|d| d.peer_id != 2));
    }

    #[test]
    fn test_take_messages_for_decodes_and_keeps_others() {
        let transport = LoopbackTransport::new();
        transport.connect(1);
        transport.connect(2);
        let msg = ServerMessage::Kicked {
            reason: "test".to_string(),
        };
        let bytes = encode(&msg).unwrap();
        transport.broadcast(&bytes, Delivery::Reliable, None);

        assert_eq!(transport.take_messages_for(1), vec![msg.clone()]);
        assert_eq!(transport.take_messages_for(2), vec![msg]);
        assert!(transport.take_sent().is_empty());
    }

    #[test]
    fn test_disconnect_records_reason() {
        let transport = LoopbackTransport::new();
        transport.connect(4);
        transport.disconnect(4, "kicked");
        assert!(!transport.is_connected(4));
        assert_eq!(transport.disconnected(), vec![(4, "kicked".to_string())]);
    }
}
