//! Per-node entry point tying dialer, relay and listener together.
//!
//! Inbound relay-protocol streams are dispatched by their first message:
//! `HOP` and `CAN_HOP` go to the [`Relay`], `STOP` to the [`CircuitListener`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::address::CircuitAddr;
use crate::config::RelayConfig;
use crate::dialer::{CircuitDialer, RelayedStream};
use crate::error::DialError;
use crate::listener::{CircuitListener, RelayedConnection};
use crate::peer::PeerId;
use crate::protocol::{MessageType, PROTOCOL_ID, StatusCode};
use crate::registry::{ConnectionRegistry, InboundStream};
use crate::relay::{Relay, await_request, send_status};

pub struct RelayService<R: ConnectionRegistry> {
    registry: Arc<R>,
    config: RelayConfig,
    dialer: CircuitDialer<R>,
    relay: Relay<R>,
    listener: CircuitListener,
    cancel: CancellationToken,
}

impl<R: ConnectionRegistry> RelayService<R> {
    pub fn new(registry: Arc<R>, config: RelayConfig) -> Self {
        let local = registry.local_peer().clone();
        Self {
            dialer: CircuitDialer::new(registry.clone(), config.policy, config.dialer),
            relay: Relay::new(registry.clone(), config.policy, config.limits),
            listener: CircuitListener::new(local, config.policy, config.accept_queue),
            registry,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> RelayConfig {
        self.config
    }

    pub fn local_peer(&self) -> &PeerId {
        self.registry.local_peer()
    }

    pub fn dialer(&self) -> &CircuitDialer<R> {
        &self.dialer
    }

    pub fn relay(&self) -> &Relay<R> {
        &self.relay
    }

    pub fn listener(&self) -> &CircuitListener {
        &self.listener
    }

    pub async fn dial(&self, addr: &CircuitAddr) -> Result<RelayedStream, DialError> {
        self.dialer.dial(addr).await
    }

    pub async fn accept(&self) -> Option<RelayedConnection> {
        self.listener.accept().await
    }

    /// Serve one inbound stream to completion of its handshake.
    pub async fn handle_inbound(&self, inbound: InboundStream) {
        let InboundStream {
            remote,
            protocol,
            mut stream,
        } = inbound;
        if protocol != PROTOCOL_ID {
            debug!(peer = %remote.short(), protocol = %protocol, "ignoring non-relay stream");
            return;
        }

        let timeout = self.config.limits.request_timeout;
        let Some(msg) = await_request(&remote, &mut stream, timeout).await else {
            return;
        };

        match msg.kind {
            MessageType::Hop => {
                if let Err(e) = self.relay.handle_hop(&remote, stream, &msg).await {
                    debug!(peer = %remote.short(), error = %e, "HOP not served");
                }
            }
            MessageType::CanHop => {
                self.relay.handle_can_hop(&remote, stream).await;
            }
            MessageType::Stop => {
                self.listener.handle_stop(&remote, stream, &msg).await;
            }
            MessageType::Status => {
                debug!(peer = %remote.short(), "unsolicited STATUS");
                send_status(&mut stream, StatusCode::MalformedMessage).await;
            }
        }
    }

    /// Dispatch streams from `incoming` until it closes or the service shuts down.
    pub async fn serve(self: Arc<Self>, mut incoming: mpsc::Receiver<InboundStream>) {
        info!(peer = %self.local_peer().short(), "relay service started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = incoming.recv() => match next {
                    Some(inbound) => {
                        let service = self.clone();
                        tokio::spawn(async move {
                            service.handle_inbound(inbound).await;
                        });
                    }
                    None => break,
                }
            }
        }
        debug!(peer = %self.local_peer().short(), "relay service stopped");
    }

    /// [`serve`](Self::serve) on a background task.
    pub fn spawn(self: &Arc<Self>, incoming: mpsc::Receiver<InboundStream>) -> JoinHandle<()> {
        tokio::spawn(self.clone().serve(incoming))
    }

    /// Stop serving, abort all relayed circuits and stop accepting.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.relay.shutdown();
        self.listener.close();
    }
}
