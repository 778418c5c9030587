//! Client side: reach a destination through a relay.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, info};

use crate::address::{CircuitAddr, TransportAddr};
use crate::error::DialError;
use crate::peer::PeerId;
use crate::policy::RelayPolicy;
use crate::protocol::{PROTOCOL_ID, RelayMessage, StatusCode, read_response, write_message};
use crate::registry::{BoxedStream, ConnectionRegistry, DialTarget};

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialerConfig {
    /// Bound on the whole handshake: connect, open stream, HOP, response.
    pub dial_timeout: Duration,
    /// Send CAN_HOP on a separate stream before HOP.
    pub probe_can_hop: bool,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            probe_can_hop: false,
        }
    }
}

pub struct CircuitDialer<R: ConnectionRegistry> {
    registry: Arc<R>,
    policy: RelayPolicy,
    config: DialerConfig,
    relays: RwLock<Vec<PeerId>>,
}

impl<R: ConnectionRegistry> CircuitDialer<R> {
    pub fn new(registry: Arc<R>, policy: RelayPolicy, config: DialerConfig) -> Self {
        Self {
            registry,
            policy,
            config,
            relays: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> DialerConfig {
        self.config
    }

    /// Known HOP-capable relays, in the order they are tried.
    pub fn relays(&self) -> Vec<PeerId> {
        self.relays.read().clone()
    }

    pub fn add_relay(&self, relay: PeerId) {
        let mut relays = self.relays.write();
        if !relays.contains(&relay) {
            relays.push(relay);
        }
    }

    pub fn remove_relay(&self, relay: &PeerId) -> bool {
        let mut relays = self.relays.write();
        let before = relays.len();
        relays.retain(|r| r != relay);
        relays.len() != before
    }

    /// Open a relayed connection to `addr`'s destination.
    pub async fn dial(&self, addr: &CircuitAddr) -> Result<RelayedStream, DialError> {
        if !self.policy.may_dial_through_relay() {
            return Err(DialError::RelayDisabled);
        }
        let limit = self.config.dial_timeout;
        match tokio::time::timeout(limit, self.dial_inner(addr)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(addr = %addr, ?limit, "circuit dial timed out");
                Err(DialError::DialTimeout(limit))
            }
        }
    }

    async fn dial_inner(&self, addr: &CircuitAddr) -> Result<RelayedStream, DialError> {
        let destination = addr.destination();

        if let Some(relay_addr) = addr.relay() {
            let relay = self
                .registry
                .dial(DialTarget::Addr(relay_addr))
                .await
                .map_err(|source| DialError::RelayUnreachable {
                    relay: relay_addr.to_string(),
                    source,
                })?;
            return self.dial_via(&relay, destination).await;
        }

        let candidates: Vec<PeerId> = self
            .relays()
            .into_iter()
            .filter(|r| r != destination && self.registry.is_connected_to(r))
            .collect();
        if candidates.is_empty() {
            return Err(DialError::NoRelayAvailable);
        }

        let mut last_err = DialError::NoRelayAvailable;
        for relay in candidates {
            match self.dial_via(&relay, destination).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(relay = %relay.short(), error = %e, "relay candidate failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn dial_via(
        &self,
        relay: &PeerId,
        destination: &PeerId,
    ) -> Result<RelayedStream, DialError> {
        if self.config.probe_can_hop {
            let code = self.can_hop(relay).await?;
            if !code.is_success() {
                return Err(DialError::RelayCannotHop {
                    relay: relay.clone(),
                    code,
                });
            }
        }

        let local = self.registry.local_peer();
        let mut stream = self.registry.open_stream(relay, PROTOCOL_ID).await?;
        write_message(&mut stream, &RelayMessage::hop(local, destination)).await?;
        let response = read_response(&mut stream).await?;

        if !response.code.is_success() {
            let _ = stream.shutdown().await;
            info!(
                relay = %relay.short(),
                destination = %destination.short(),
                code = %response.code,
                "circuit rejected"
            );
            return Err(DialError::Rejected {
                relay: relay.clone(),
                code: response.code,
                message: response.message,
            });
        }

        info!(relay = %relay.short(), destination = %destination.short(), "circuit established");
        Ok(RelayedStream {
            inner: stream,
            relay: relay.clone(),
            remote: destination.clone(),
        })
    }

    async fn can_hop(&self, relay: &PeerId) -> Result<StatusCode, DialError> {
        let mut stream = self.registry.open_stream(relay, PROTOCOL_ID).await?;
        write_message(&mut stream, &RelayMessage::can_hop(self.registry.local_peer())).await?;
        let response = read_response(&mut stream).await?;
        let _ = stream.shutdown().await;
        debug!(relay = %relay.short(), code = %response.code, "CAN_HOP answered");
        Ok(response.code)
    }

    /// Ask a connected peer whether it relays for us; remember it if so.
    pub async fn probe_relay(&self, relay: &PeerId) -> Result<bool, DialError> {
        if !self.policy.may_dial_through_relay() {
            return Err(DialError::RelayDisabled);
        }
        let limit = self.config.dial_timeout;
        let code = tokio::time::timeout(limit, self.can_hop(relay))
            .await
            .map_err(|_| DialError::DialTimeout(limit))??;
        if code.is_success() {
            self.add_relay(relay.clone());
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// A connection to the destination, carried over a relay.
pub struct RelayedStream {
    inner: BoxedStream,
    relay: PeerId,
    remote: PeerId,
}

impl RelayedStream {
    pub fn relay(&self) -> &PeerId {
        &self.relay
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote
    }

    /// `/ipfs/<relay>/p2p-circuit/ipfs/<remote>`
    pub fn circuit_addr(&self) -> CircuitAddr {
        let relay = TransportAddr::from_segments(["ipfs", self.relay.as_str()]);
        CircuitAddr::new(Some(relay), self.remote.clone())
    }

    pub fn into_inner(self) -> BoxedStream {
        self.inner
    }
}

impl std::fmt::Debug for RelayedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayedStream")
            .field("relay", &self.relay)
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for RelayedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RelayedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
