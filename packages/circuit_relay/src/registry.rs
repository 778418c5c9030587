//! The seam between circuit relaying and the node's real transports.
//!
//! A [`ConnectionRegistry`] knows which peers this node is connected to, can
//! dial new ones, and can open a protocol stream over an existing connection.
//! Streams it hands out are already authenticated; the relay code never sees
//! TCP, WebSocket or crypto handshakes.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::address::TransportAddr;
use crate::error::TransportError;
use crate::peer::PeerId;

/// A bidirectional byte stream usable across tasks.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// What to dial: a known peer, or a transport address.
#[derive(Debug, Clone, Copy)]
pub enum DialTarget<'a> {
    Peer(&'a PeerId),
    Addr(&'a TransportAddr),
}

impl std::fmt::Display for DialTarget<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Peer(peer) => write!(f, "{peer}"),
            Self::Addr(addr) => write!(f, "{addr}"),
        }
    }
}

/// A protocol stream opened to us by a remote peer.
pub struct InboundStream {
    pub remote: PeerId,
    pub protocol: String,
    pub stream: BoxedStream,
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("remote", &self.remote)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ConnectionRegistry: Send + Sync + 'static {
    fn local_peer(&self) -> &PeerId;

    fn is_connected_to(&self, peer: &PeerId) -> bool;

    /// Peers a passive relay will serve. Nobody by default.
    fn is_allowed(&self, _peer: &PeerId) -> bool {
        false
    }

    /// Establish (or reuse) a connection; returns the authenticated remote peer.
    async fn dial(&self, target: DialTarget<'_>) -> Result<PeerId, TransportError>;

    /// Open a stream speaking `protocol` over an existing connection to `peer`.
    async fn open_stream(&self, peer: &PeerId, protocol: &str)
    -> Result<BoxedStream, TransportError>;
}
