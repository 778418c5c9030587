//! In-memory network of peers for tests and local demos.
//!
//! Nodes share a [`MemoryNetwork`] hub that tracks the address book, which
//! pairs of peers are connected, and which peers are unreachable. Streams are
//! `tokio::io::duplex` pairs; the far end is delivered to the remote node's
//! inbound queue as an [`InboundStream`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::address::TransportAddr;
use crate::error::TransportError;
use crate::peer::PeerId;
use crate::registry::{BoxedStream, ConnectionRegistry, DialTarget, InboundStream};

const INBOUND_QUEUE: usize = 64;
const DEFAULT_PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<PeerId, mpsc::Sender<InboundStream>>,
    addrs: HashMap<TransportAddr, PeerId>,
    links: HashSet<(PeerId, PeerId)>,
    unreachable: HashSet<PeerId>,
}

fn link_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Shared hub; cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    pipe_capacity: Option<usize>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capacity of each direction of every stream created on this network.
    pub fn with_pipe_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::default(),
            pipe_capacity: Some(capacity),
        }
    }

    /// Register a node reachable at `/memory/<peer>`.
    pub fn add_node(&self, peer: PeerId) -> Arc<MemoryNode> {
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let addr = memory_addr(&peer);
        {
            let mut state = self.state.lock();
            state.nodes.insert(peer.clone(), tx);
            state.addrs.insert(addr.clone(), peer.clone());
        }
        tracing::debug!(peer = %peer, addr = %addr, "memory node added");
        Arc::new(MemoryNode {
            peer,
            addr,
            network: self.clone(),
            incoming: Mutex::new(Some(rx)),
            allowed: RwLock::new(HashSet::new()),
            dials: AtomicUsize::new(0),
            streams: AtomicUsize::new(0),
        })
    }

    /// Drop a node from the network, severing all of its links.
    pub fn remove_node(&self, peer: &PeerId) {
        let mut state = self.state.lock();
        state.nodes.remove(peer);
        state.addrs.retain(|_, p| p != peer);
        state.links.retain(|(a, b)| a != peer && b != peer);
    }

    /// Connect two peers without counting it as a dial.
    pub fn link(&self, a: &PeerId, b: &PeerId) {
        self.state.lock().links.insert(link_key(a, b));
    }

    pub fn unlink(&self, a: &PeerId, b: &PeerId) {
        self.state.lock().links.remove(&link_key(a, b));
    }

    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state.lock().links.contains(&link_key(a, b))
    }

    /// Make dials to `peer` fail.
    pub fn set_unreachable(&self, peer: &PeerId, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(peer.clone());
        } else {
            state.unreachable.remove(peer);
        }
    }

    fn capacity(&self) -> usize {
        self.pipe_capacity.unwrap_or(DEFAULT_PIPE_CAPACITY)
    }
}

/// Address a memory node listens on.
pub fn memory_addr(peer: &PeerId) -> TransportAddr {
    TransportAddr::from_segments(["memory", peer.as_str()])
}

/// One node on a [`MemoryNetwork`].
pub struct MemoryNode {
    peer: PeerId,
    addr: TransportAddr,
    network: MemoryNetwork,
    incoming: Mutex<Option<mpsc::Receiver<InboundStream>>>,
    allowed: RwLock<HashSet<PeerId>>,
    dials: AtomicUsize,
    streams: AtomicUsize,
}

impl MemoryNode {
    pub fn addr(&self) -> &TransportAddr {
        &self.addr
    }

    /// Take the inbound stream queue. Only the first caller gets it.
    pub fn take_incoming(&self) -> Option<mpsc::Receiver<InboundStream>> {
        self.incoming.lock().take()
    }

    /// Add `peer` to this node's passive-relay allow-list.
    pub fn allow(&self, peer: &PeerId) {
        self.allowed.write().insert(peer.clone());
    }

    pub fn disconnect(&self, peer: &PeerId) {
        self.network.unlink(&self.peer, peer);
    }

    /// Number of `dial` calls made by this node.
    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Number of streams successfully opened by this node.
    pub fn stream_count(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    fn resolve(&self, target: DialTarget<'_>) -> Result<PeerId, TransportError> {
        let state = self.network.state.lock();
        let peer = match target {
            DialTarget::Peer(peer) => {
                if !state.nodes.contains_key(peer) {
                    return Err(TransportError::Unreachable(peer.to_string()));
                }
                peer.clone()
            }
            DialTarget::Addr(addr) => {
                let base = addr.without_peer().unwrap_or_else(|| addr.clone());
                let found = match state.addrs.get(&base) {
                    Some(found) => found.clone(),
                    None if addr.is_peer_only() => addr
                        .peer()
                        .filter(|p| state.nodes.contains_key(p))
                        .ok_or_else(|| TransportError::Unreachable(addr.to_string()))?,
                    None => return Err(TransportError::Unreachable(addr.to_string())),
                };
                if let Some(expected) = addr.peer()
                    && expected != found
                {
                    return Err(TransportError::Refused(found));
                }
                found
            }
        };
        if state.unreachable.contains(&peer) || state.unreachable.contains(&self.peer) {
            return Err(TransportError::Unreachable(peer.to_string()));
        }
        Ok(peer)
    }
}

#[async_trait]
impl ConnectionRegistry for MemoryNode {
    fn local_peer(&self) -> &PeerId {
        &self.peer
    }

    fn is_connected_to(&self, peer: &PeerId) -> bool {
        self.network.is_linked(&self.peer, peer)
    }

    fn is_allowed(&self, peer: &PeerId) -> bool {
        self.allowed.read().contains(peer)
    }

    async fn dial(&self, target: DialTarget<'_>) -> Result<PeerId, TransportError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let peer = self.resolve(target)?;
        if peer == self.peer {
            return Err(TransportError::Refused(peer));
        }
        self.network.link(&self.peer, &peer);
        tracing::debug!(local = %self.peer.short(), remote = %peer.short(), "memory dial");
        Ok(peer)
    }

    async fn open_stream(
        &self,
        peer: &PeerId,
        protocol: &str,
    ) -> Result<BoxedStream, TransportError> {
        let sender = {
            let state = self.network.state.lock();
            if !state.links.contains(&link_key(&self.peer, peer)) {
                return Err(TransportError::NotConnected(peer.clone()));
            }
            state
                .nodes
                .get(peer)
                .cloned()
                .ok_or_else(|| TransportError::NotConnected(peer.clone()))?
        };

        let (local, remote) = tokio::io::duplex(self.network.capacity());
        let inbound = InboundStream {
            remote: self.peer.clone(),
            protocol: protocol.to_string(),
            stream: Box::new(remote),
        };
        sender
            .send(inbound)
            .await
            .map_err(|_| TransportError::ProtocolNotSupported {
                peer: peer.clone(),
                protocol: protocol.to_string(),
            })?;
        self.streams.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(local))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn peer(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn dial_then_open_stream() {
        let net = MemoryNetwork::new();
        let a = net.add_node(peer("QmA"));
        let b = net.add_node(peer("QmB"));
        let mut inbound = b.take_incoming().unwrap();

        assert!(!a.is_connected_to(&peer("QmB")));
        let remote = a.dial(DialTarget::Addr(b.addr())).await.unwrap();
        assert_eq!(remote, peer("QmB"));
        assert!(a.is_connected_to(&remote));
        assert!(b.is_connected_to(&peer("QmA")));

        let mut stream = a.open_stream(&remote, "/test/1").await.unwrap();
        let mut incoming = inbound.recv().await.unwrap();
        assert_eq!(incoming.remote, peer("QmA"));
        assert_eq!(incoming.protocol, "/test/1");

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        incoming.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(a.dial_count(), 1);
        assert_eq!(a.stream_count(), 1);
    }

    #[tokio::test]
    async fn open_stream_requires_connection() {
        let net = MemoryNetwork::new();
        let a = net.add_node(peer("QmA"));
        let _b = net.add_node(peer("QmB"));
        let err = a.open_stream(&peer("QmB"), "/x").await.err().unwrap();
        assert!(matches!(err, TransportError::NotConnected(_)));
    }

    #[tokio::test]
    async fn unreachable_and_wrong_peer() {
        let net = MemoryNetwork::new();
        let a = net.add_node(peer("QmA"));
        let b = net.add_node(peer("QmB"));

        net.set_unreachable(&peer("QmB"), true);
        assert!(matches!(
            a.dial(DialTarget::Peer(&peer("QmB"))).await,
            Err(TransportError::Unreachable(_))
        ));
        net.set_unreachable(&peer("QmB"), false);

        let wrong = b.addr().with_peer(&peer("QmC"));
        assert!(matches!(
            a.dial(DialTarget::Addr(&wrong)).await,
            Err(TransportError::Refused(_))
        ));
        let right = b.addr().with_peer(&peer("QmB"));
        assert_eq!(
            a.dial(DialTarget::Addr(&right)).await.unwrap(),
            peer("QmB")
        );
    }

    #[tokio::test]
    async fn closed_inbound_queue_refuses_streams() {
        let net = MemoryNetwork::new();
        let a = net.add_node(peer("QmA"));
        let b = net.add_node(peer("QmB"));
        drop(b.take_incoming());
        net.link(&peer("QmA"), &peer("QmB"));
        let err = a.open_stream(&peer("QmB"), "/x").await.err().unwrap();
        assert!(matches!(err, TransportError::ProtocolNotSupported { .. }));
    }

    #[test]
    fn allow_list() {
        let net = MemoryNetwork::new();
        let a = net.add_node(peer("QmA"));
        assert!(!a.is_allowed(&peer("QmB")));
        a.allow(&peer("QmB"));
        assert!(a.is_allowed(&peer("QmB")));
    }
}
