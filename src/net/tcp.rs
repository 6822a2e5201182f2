//! TCP transport adapter
//!
//! Each connection gets a reader task (frames → [`TransportEvent::Data`]) and
//! a writer task fed by an unbounded channel. TCP is reliable and ordered, so
//! both delivery classes travel the same stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};

use crate::game::state::PeerId;
use crate::net::framing::{read_frame, write_frame, FramingError};
use crate::net::transport::{Delivery, Transport, TransportError, TransportEvent};

struct PeerHandle {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    close: Arc<Notify>,
}

/// Outbound half of the TCP server; shared with the game session
pub struct TcpTransport {
    peers: RwLock<HashMap<PeerId, PeerHandle>>,
    next_peer_id: AtomicU64,
    events: Sender<TransportEvent>,
    max_connections: usize,
}

/// Accept loop half of the TCP server
pub struct TcpAcceptor {
    listener: TcpListener,
    transport: Arc<TcpTransport>,
}

impl TcpTransport {
    /// Bind the listener. Returns the shared transport, the accept loop to
    /// spawn, and the event stream for the tick loop.
    pub async fn bind(
        addr: SocketAddr,
        max_connections: usize,
    ) -> anyhow::Result<(Arc<Self>, TcpAcceptor, Receiver<TransportEvent>)> {
        let listener = TcpListener::bind(addr).await?;
        let (events, inbound) = crossbeam_channel::unbounded();

        let transport = Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            next_peer_id: AtomicU64::new(1),
            events,
            max_connections,
        });

        let acceptor = TcpAcceptor {
            listener,
            transport: transport.clone(),
        };

        Ok((transport, acceptor, inbound))
    }

    pub fn connection_count(&self) -> usize {
        self.peers.read().len()
    }

    fn register(&self) -> (PeerId, mpsc::UnboundedReceiver<Vec<u8>>, Arc<Notify>) {
        let peer_id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let (outbound, rx) = mpsc::unbounded_channel();
        let close = Arc::new(Notify::new());
        self.peers.write().insert(
            peer_id,
            PeerHandle {
                outbound,
                close: close.clone(),
            },
        );
        (peer_id, rx, close)
    }

    fn unregister(&self, peer_id: PeerId) {
        self.peers.write().remove(&peer_id);
    }

    fn emit(&self, event: TransportEvent) {
        if self.events.send(event).is_err() {
            tracing::warn!("Transport event dropped: tick loop is gone");
        }
    }
}

impl Transport for TcpTransport {
    fn send(
        &self,
        peer_id: PeerId,
        payload: &[u8],
        _delivery: Delivery,
    ) -> Result<(), TransportError> {
        let peers = self.peers.read();
        let handle = peers
            .get(&peer_id)
            .ok_or(TransportError::NotConnected(peer_id))?;
        handle
            .outbound
            .send(payload.to_vec())
            .map_err(|_| TransportError::ChannelClosed(peer_id))
    }

    fn broadcast(&self, payload: &[u8], _delivery: Delivery, exclude: Option<PeerId>) -> usize {
        let peers = self.peers.read();
        peers
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .filter(|(_, handle)| handle.outbound.send(payload.to_vec()).is_ok())
            .count()
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.read().keys().copied().collect()
    }

    fn is_connected(&self, peer_id: PeerId) -> bool {
        self.peers.read().contains_key(&peer_id)
    }

    fn disconnect(&self, peer_id: PeerId, reason: &str) {
        if let Some(handle) = self.peers.read().get(&peer_id) {
            tracing::info!("Closing peer {}: {}", peer_id, reason);
            handle.close.notify_one();
        }
    }
}

impl TcpAcceptor {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails
    pub async fn run(self) -> anyhow::Result<()> {
        tracing::info!("TCP transport listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, endpoint) = self.listener.accept().await?;

            if self.transport.connection_count() >= self.transport.max_connections {
                tracing::warn!(
                    "Rejecting {}: connection limit {} reached",
                    endpoint,
                    self.transport.max_connections
                );
                drop(stream);
                continue;
            }

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("set_nodelay failed for {}: {}", endpoint, e);
            }

            let transport = self.transport.clone();
            tokio::spawn(async move {
                handle_connection(transport, stream, endpoint).await;
            });
        }
    }
}

async fn handle_connection(transport: Arc<TcpTransport>, stream: TcpStream, endpoint: SocketAddr) {
    let (mut reader, mut writer) = stream.into_split();
    let (peer_id, mut outbound, close) = transport.register();

    tracing::info!("Peer {} connected from {}", peer_id, endpoint);
    transport.emit(TransportEvent::Connected { peer_id, endpoint });

    let writer_task = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &payload).await {
                tracing::debug!("Write to peer {} failed: {}", peer_id, e);
                break;
            }
        }
    });

    let reason = loop {
        tokio::select! {
            frame = read_frame(&mut reader) => match frame {
                Ok(payload) => transport.emit(TransportEvent::Data { peer_id, payload }),
                Err(FramingError::ConnectionClosed) => break "connection closed".to_string(),
                Err(e) => break e.to_string(),
            },
            _ = close.notified() => break "closed by server".to_string(),
        }
    };

    // Dropping the sender ends the writer once queued frames are written
    transport.unregister(peer_id);
    if let Err(e) = writer_task.await {
        tracing::debug!("Writer task for peer {} ended abnormally: {}", peer_id, e);
    }

    tracing::info!("Peer {} disconnected: {}", peer_id, reason);
    transport.emit(TransportEvent::Disconnected { peer_id, reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn recv_event(rx: &Receiver<TransportEvent>) -> TransportEvent {
        for _ in 0..200 {
            if let Ok(event) = rx.try_recv() {
                return event;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("No transport event received");
    }

    #[tokio::test]
    async fn test_connect_send_receive_disconnect() {
        let (transport, acceptor, events) =
            TcpTransport::bind("127.0.0.1:0".parse().unwrap(), 8).await.unwrap();
        let addr = acceptor.local_addr().unwrap();
        tokio::spawn(acceptor.run());

        let mut client = TcpStream::connect(addr).await.unwrap();

        let peer_id = match recv_event(&events).await {
            TransportEvent::Connected { peer_id, .. } => peer_id,
            other => panic!("Expected connect, got {:?}", other),
        };

        write_frame(&mut client, br#"{"type":"respawn"}"#).await.unwrap();
        match recv_event(&events).await {
            TransportEvent::Data { peer_id: from, payload } => {
                assert_eq!(from, peer_id);
                assert_eq!(payload, br#"{"type":"respawn"}"#);
            }
            other => panic!("Expected data, got {:?}", other),
        }

        transport.send(peer_id, b"pong", Delivery::Reliable).unwrap();
        let reply = read_frame(&mut client).await.unwrap();
        assert_eq!(reply, b"pong");

        transport.disconnect(peer_id, "test");
        match recv_event(&events).await {
            TransportEvent::Disconnected { peer_id: gone, .. } => assert_eq!(gone, peer_id),
            other => panic!("Expected disconnect, got {:?}", other),
        }
        assert!(!transport.is_connected(peer_id));
    }
}
