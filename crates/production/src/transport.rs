//! Transport between replicas.
//!
//! [`LocalHub`] connects replicas of one process through channels. Frames are
//! encoded exactly as they would be on a socket, so the codec is exercised
//! end to end.

use keel_types::NodeId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("{0} is not connected")]
    PeerOffline(NodeId),

    #[error("{0} is already connected")]
    AlreadyConnected(NodeId),
}

/// What a replica receives from its transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame { from: NodeId, bytes: Vec<u8> },
    /// The connection to `peer` was lost.
    PeerDisconnected(NodeId),
}

/// Sending side of a replica's connection to the pool.
pub trait Transport: Send + Sync {
    fn local(&self) -> NodeId;

    fn send(&self, to: NodeId, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Peers currently reachable.
    fn connected_peers(&self) -> Vec<NodeId>;

    /// Send to every connected peer. Individual failures are transient and
    /// only logged.
    fn broadcast(&self, frame: &[u8]) {
        for peer in self.connected_peers() {
            if let Err(e) = self.send(peer, frame.to_vec()) {
                debug!(from = %self.local(), to = %peer, error = %e, "Broadcast send failed");
            }
        }
    }
}

/// In-process switchboard.
#[derive(Debug, Default)]
pub struct LocalHub {
    endpoints: Mutex<BTreeMap<NodeId, mpsc::UnboundedSender<Inbound>>>,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect `node`. Returns its transport and inbound stream.
    pub fn connect(
        self: &Arc<Self>,
        node: NodeId,
    ) -> Result<(LocalTransport, mpsc::UnboundedReceiver<Inbound>), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut endpoints = self.endpoints.lock();
        if endpoints.get(&node).is_some_and(|existing| !existing.is_closed()) {
            return Err(TransportError::AlreadyConnected(node));
        }
        endpoints.insert(node, tx);
        debug!(%node, "Connected to hub");
        Ok((
            LocalTransport {
                hub: Arc::clone(self),
                local: node,
            },
            rx,
        ))
    }

    /// Drop `node`'s connection and tell every other endpoint.
    pub fn disconnect(&self, node: NodeId) {
        let mut endpoints = self.endpoints.lock();
        if endpoints.remove(&node).is_none() {
            return;
        }
        for tx in endpoints.values() {
            let _ = tx.send(Inbound::PeerDisconnected(node));
        }
        debug!(%node, "Disconnected from hub");
    }

    pub fn is_connected(&self, node: NodeId) -> bool {
        self.endpoints.lock().contains_key(&node)
    }

    fn deliver(&self, from: NodeId, to: NodeId, bytes: Vec<u8>) -> Result<(), TransportError> {
        let endpoints = self.endpoints.lock();
        let tx = endpoints.get(&to).ok_or(TransportError::PeerOffline(to))?;
        trace!(%from, %to, len = bytes.len(), "Frame");
        tx.send(Inbound::Frame { from, bytes })
            .map_err(|_| TransportError::PeerOffline(to))
    }

    fn peers_of(&self, node: NodeId) -> Vec<NodeId> {
        self.endpoints
            .lock()
            .keys()
            .copied()
            .filter(|&n| n != node)
            .collect()
    }
}

/// One replica's handle on a [`LocalHub`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    hub: Arc<LocalHub>,
    local: NodeId,
}

impl Transport for LocalTransport {
    fn local(&self) -> NodeId {
        self.local
    }

    fn send(&self, to: NodeId, frame: Vec<u8>) -> Result<(), TransportError> {
        self.hub.deliver(self.local, to, frame)
    }

    fn connected_peers(&self) -> Vec<NodeId> {
        self.hub.peers_of(self.local)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_reach_connected_peers() {
        let hub = LocalHub::new();
        let (a, _a_rx) = hub.connect(NodeId(0)).unwrap();
        let (_b, mut b_rx) = hub.connect(NodeId(1)).unwrap();

        a.send(NodeId(1), vec![1, 2]).unwrap();
        assert_eq!(
            b_rx.recv().await,
            Some(Inbound::Frame {
                from: NodeId(0),
                bytes: vec![1, 2]
            })
        );
        assert_eq!(
            a.send(NodeId(5), vec![]),
            Err(TransportError::PeerOffline(NodeId(5)))
        );
    }

    #[tokio::test]
    async fn test_disconnect_notifies_peers() {
        let hub = LocalHub::new();
        let (_a, a_rx) = hub.connect(NodeId(0)).unwrap();
        let (b, mut b_rx) = hub.connect(NodeId(1)).unwrap();

        hub.disconnect(NodeId(0));
        drop(a_rx);
        assert_eq!(b_rx.recv().await, Some(Inbound::PeerDisconnected(NodeId(0))));
        assert!(b.connected_peers().is_empty());

        // The slot is free again.
        assert!(hub.connect(NodeId(0)).is_ok());
    }

    #[tokio::test]
    async fn test_double_connect_rejected() {
        let hub = LocalHub::new();
        let (_a, _rx) = hub.connect(NodeId(0)).unwrap();
        assert!(matches!(
            hub.connect(NodeId(0)),
            Err(TransportError::AlreadyConnected(_))
        ));
    }
}
