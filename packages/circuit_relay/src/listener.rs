//! Destination side: accept connections a relay brings to us via STOP.

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::address::{CircuitAddr, TransportAddr};
use crate::peer::PeerId;
use crate::policy::RelayPolicy;
use crate::protocol::{RelayMessage, StatusCode, StopRequest, write_message};
use crate::registry::BoxedStream;
use crate::relay::send_status;

pub const DEFAULT_ACCEPT_QUEUE: usize = 32;

/// An inbound connection from `source`, carried by `relay`.
pub struct RelayedConnection {
    pub relay: PeerId,
    pub source: PeerId,
    pub stream: BoxedStream,
}

impl RelayedConnection {
    /// The address `source` is reachable at through `relay`.
    pub fn circuit_addr(&self) -> CircuitAddr {
        let relay = TransportAddr::from_segments(["ipfs", self.relay.as_str()]);
        CircuitAddr::new(Some(relay), self.source.clone())
    }
}

impl std::fmt::Debug for RelayedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayedConnection")
            .field("relay", &self.relay)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

pub struct CircuitListener {
    local: PeerId,
    policy: RelayPolicy,
    tx: mpsc::Sender<RelayedConnection>,
    rx: Mutex<mpsc::Receiver<RelayedConnection>>,
    closed: CancellationToken,
}

impl CircuitListener {
    pub fn new(local: PeerId, policy: RelayPolicy, queue: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue.max(1));
        Self {
            local,
            policy,
            tx,
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    /// Answer a STOP from `relay`, queueing the connection on success.
    ///
    /// Returns the status decided for the request.
    pub async fn handle_stop(
        &self,
        relay: &PeerId,
        mut stream: BoxedStream,
        msg: &RelayMessage,
    ) -> StatusCode {
        if !self.policy.client_enabled {
            debug!(relay = %relay.short(), "refusing STOP, relayed connections disabled");
            send_status(&mut stream, StatusCode::StopRelayRefused).await;
            return StatusCode::StopRelayRefused;
        }

        let request = match StopRequest::from_wire(msg) {
            Ok(request) => request,
            Err(code) => {
                send_status(&mut stream, code).await;
                return code;
            }
        };
        if request.destination != self.local {
            send_status(&mut stream, StatusCode::StopDstMultiaddrInvalid).await;
            return StatusCode::StopDstMultiaddrInvalid;
        }

        // A full or closed queue is refused before SUCCESS goes out.
        let slot = match self.tx.try_reserve() {
            Ok(slot) if !self.closed.is_cancelled() => Some(slot),
            _ => None,
        };
        let Some(slot) = slot else {
            debug!(relay = %relay.short(), "accept queue unavailable");
            send_status(&mut stream, StatusCode::StopRelayRefused).await;
            return StatusCode::StopRelayRefused;
        };

        if let Err(e) = write_message(&mut stream, &RelayMessage::status(StatusCode::Success)).await
        {
            debug!(relay = %relay.short(), error = %e, "relay gone before STOP answer");
            return StatusCode::Success;
        }

        info!(
            relay = %relay.short(),
            source = %request.source.short(),
            "accepted relayed connection"
        );
        slot.send(RelayedConnection {
            relay: relay.clone(),
            source: request.source,
            stream,
        });
        StatusCode::Success
    }

    /// Next relayed connection; `None` once closed and drained.
    pub async fn accept(&self) -> Option<RelayedConnection> {
        let mut rx = tokio::select! {
            _ = self.closed.cancelled() => return self.drain_one(),
            rx = self.rx.lock() => rx,
        };
        tokio::select! {
            conn = rx.recv() => conn,
            _ = self.closed.cancelled() => rx.try_recv().ok(),
        }
    }

    fn drain_one(&self) -> Option<RelayedConnection> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Stop accepting; later STOPs get `STOP_RELAY_REFUSED` and pending
    /// `accept` calls return once the queue is drained.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
