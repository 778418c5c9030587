//! Relay side: validate HOP requests, reach the destination, splice.
//!
//! ```text
//! AwaitingRequest -> Validating -> DialingDestination -> Splicing -> Closed
//!                        \______________\__ status sent ___________/
//! ```
//!
//! Every rejection writes exactly one `STATUS` frame to the source and closes.
//! On success the `SUCCESS` frame is written before any relayed byte.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HopError, ProtocolError};
use crate::peer::PeerId;
use crate::policy::RelayPolicy;
use crate::protocol::{
    self, HopRequest, PROTOCOL_ID, RelayMessage, StatusCode, read_response, write_message,
};
use crate::registry::{BoxedStream, ConnectionRegistry, DialTarget};
use crate::splice::{self, SpliceConfig, TrafficCounters};

pub const DEFAULT_MAX_CIRCUITS: usize = 64;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Resource bounds for a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLimits {
    pub max_circuits: usize,
    pub buffer_size: usize,
    /// Bound on dialing the destination and opening a stream to it.
    pub dial_timeout: Duration,
    /// Bound on reading a request or the destination's STOP answer.
    pub request_timeout: Duration,
    pub linger: Duration,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_circuits: DEFAULT_MAX_CIRCUITS,
            buffer_size: splice::DEFAULT_BUFFER_SIZE,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            linger: splice::DEFAULT_LINGER,
        }
    }
}

impl RelayLimits {
    pub fn splice_config(&self) -> SpliceConfig {
        SpliceConfig {
            buffer_size: self.buffer_size,
            linger: self.linger,
        }
    }
}

pub type CircuitId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    AwaitingRequest,
    Validating,
    DialingDestination,
    Splicing,
    Closed,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AwaitingRequest => "awaiting_request",
            Self::Validating => "validating",
            Self::DialingDestination => "dialing_destination",
            Self::Splicing => "splicing",
            Self::Closed => "closed",
        })
    }
}

/// Snapshot of one circuit held by the relay.
#[derive(Debug, Clone)]
pub struct CircuitInfo {
    pub id: CircuitId,
    pub source: PeerId,
    pub destination: PeerId,
    pub opened_at: Instant,
    pub state: CircuitState,
    pub counters: Arc<TrafficCounters>,
}

type CircuitTable = Arc<Mutex<HashMap<CircuitId, CircuitInfo>>>;

/// Owns a circuit's table entry and concurrency permit; both go on drop.
struct CircuitGuard {
    id: CircuitId,
    table: CircuitTable,
    _permit: OwnedSemaphorePermit,
}

impl CircuitGuard {
    fn set_state(&self, state: CircuitState) {
        if let Some(info) = self.table.lock().get_mut(&self.id) {
            debug!(circuit = self.id, from = %info.state, to = %state, "circuit state");
            info.state = state;
        }
    }
}

impl Drop for CircuitGuard {
    fn drop(&mut self) {
        self.table.lock().remove(&self.id);
    }
}

/// Read the first request on a relay stream.
///
/// Malformed or oversized frames are answered with `MALFORMED_MESSAGE`.
/// Returns `None` if nothing usable arrived within `timeout`.
pub async fn await_request(
    remote: &PeerId,
    stream: &mut BoxedStream,
    timeout: Duration,
) -> Option<RelayMessage> {
    match tokio::time::timeout(timeout, protocol::read_message(stream)).await {
        Ok(Ok(Some(msg))) => Some(msg),
        Ok(Ok(None)) => {
            debug!(peer = %remote.short(), "relay stream closed before request");
            None
        }
        Ok(Err(ProtocolError::TooLarge { .. } | ProtocolError::Malformed(_))) => {
            warn!(peer = %remote.short(), "malformed relay request");
            send_status(stream, StatusCode::MalformedMessage).await;
            None
        }
        Ok(Err(e)) => {
            debug!(peer = %remote.short(), error = %e, "failed to read relay request");
            None
        }
        Err(_) => {
            debug!(peer = %remote.short(), ?timeout, "relay request timed out");
            None
        }
    }
}

/// Write a status frame and close; errors are logged only.
pub(crate) async fn send_status(stream: &mut BoxedStream, code: StatusCode) {
    if let Err(e) = write_message(stream, &RelayMessage::status(code)).await {
        debug!(code = %code, error = %e, "failed to send status");
    }
    let _ = stream.shutdown().await;
}

/// The circuit-relaying half of a node.
pub struct Relay<R: ConnectionRegistry> {
    registry: Arc<R>,
    policy: RelayPolicy,
    limits: RelayLimits,
    circuits: CircuitTable,
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl<R: ConnectionRegistry> Relay<R> {
    pub fn new(registry: Arc<R>, policy: RelayPolicy, limits: RelayLimits) -> Self {
        Self {
            registry,
            policy,
            permits: Arc::new(Semaphore::new(limits.max_circuits)),
            limits,
            circuits: Arc::default(),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn policy(&self) -> RelayPolicy {
        self.policy
    }

    pub fn limits(&self) -> RelayLimits {
        self.limits
    }

    /// Circuits currently held, ordered by id.
    pub fn active_circuits(&self) -> Vec<CircuitInfo> {
        let mut circuits: Vec<_> = self.circuits.lock().values().cloned().collect();
        circuits.sort_by_key(|c| c.id);
        circuits
    }

    pub fn circuit_count(&self) -> usize {
        self.circuits.lock().len()
    }

    /// Abort every circuit and refuse new ones.
    pub fn shutdown(&self) {
        info!(circuits = self.circuit_count(), "relay shutting down");
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Answer a CAN_HOP probe from `remote`.
    pub async fn handle_can_hop(&self, remote: &PeerId, mut stream: BoxedStream) -> StatusCode {
        let allow = |p: &PeerId| self.registry.is_allowed(p);
        let code = self.policy.can_hop_status(remote, &allow);
        debug!(peer = %remote.short(), code = %code, "answering CAN_HOP");
        send_status(&mut stream, code).await;
        code
    }

    /// Serve a HOP request that arrived from `remote` on `stream`.
    ///
    /// On success the circuit is spliced on its own task and its id returned.
    pub async fn handle_hop(
        &self,
        remote: &PeerId,
        mut stream: BoxedStream,
        msg: &RelayMessage,
    ) -> Result<CircuitId, HopError> {
        if self.shutdown.is_cancelled() {
            return self.reject(remote, stream, StatusCode::HopCantSpeakRelay).await;
        }

        let request = match HopRequest::from_wire(msg, remote) {
            Ok(request) => request,
            Err(code) => return self.reject(remote, stream, code).await,
        };

        let local = self.registry.local_peer();
        let allow = |p: &PeerId| self.registry.is_allowed(p);
        let code = self.policy.may_act_as_relay_for(&request, local, &allow);
        if !code.is_success() {
            return self.reject(remote, stream, code).await;
        }

        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return self
                .reject(remote, stream, StatusCode::HopResourceLimitExceeded)
                .await;
        };

        let destination = request.destination;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let counters = Arc::new(TrafficCounters::default());
        self.circuits.lock().insert(
            id,
            CircuitInfo {
                id,
                source: remote.clone(),
                destination: destination.clone(),
                opened_at: Instant::now(),
                state: CircuitState::Validating,
                counters: counters.clone(),
            },
        );
        let guard = CircuitGuard {
            id,
            table: self.circuits.clone(),
            _permit: permit,
        };
        guard.set_state(CircuitState::DialingDestination);

        // Abandon the destination phase if the source goes away or we shut down.
        let mut probe = [0u8; 1];
        let reached = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(HopError::ShuttingDown),
            read = stream.read(&mut probe) => {
                return match read {
                    Ok(0) | Err(_) => {
                        debug!(circuit = id, "source closed while reaching destination");
                        Err(HopError::SourceClosed)
                    }
                    Ok(_) => {
                        warn!(circuit = id, "source sent data before circuit opened");
                        self.reject(remote, stream, StatusCode::MalformedMessage).await
                    }
                };
            }
            reached = self.reach_destination(remote, &destination) => reached,
        };
        let dst_stream = match reached {
            Ok(s) => s,
            Err(code) => return self.reject(remote, stream, code).await,
        };

        if let Err(e) = write_message(&mut stream, &RelayMessage::status(StatusCode::Success)).await
        {
            debug!(circuit = id, error = %e, "source gone before SUCCESS");
            return Err(HopError::SourceClosed);
        }
        guard.set_state(CircuitState::Splicing);
        info!(
            circuit = id,
            source = %remote.short(),
            destination = %destination.short(),
            "circuit opened"
        );

        let abort = self.shutdown.child_token();
        let config = self.limits.splice_config();
        tokio::spawn(async move {
            let report = splice::splice_counted(stream, dst_stream, config, abort, counters).await;
            guard.set_state(CircuitState::Closed);
            info!(
                circuit = id,
                bytes_forward = report.forward.bytes,
                bytes_backward = report.backward.bytes,
                forward_end = ?report.forward.end,
                backward_end = ?report.backward.end,
                "circuit closed"
            );
            drop(guard);
        });

        Ok(id)
    }

    /// Get a stream to `destination` on which it accepted our STOP.
    async fn reach_destination(
        &self,
        source: &PeerId,
        destination: &PeerId,
    ) -> Result<BoxedStream, StatusCode> {
        let dial_timeout = self.limits.dial_timeout;

        if !self.registry.is_connected_to(destination) {
            if !self.policy.dials_destinations() {
                debug!(destination = %destination.short(), "passive relay has no connection");
                return Err(StatusCode::HopNoConnToDst);
            }
            let dialed = tokio::time::timeout(
                dial_timeout,
                self.registry.dial(DialTarget::Peer(destination)),
            )
            .await;
            match dialed {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    debug!(destination = %destination.short(), error = %e, "destination dial failed");
                    return Err(StatusCode::HopCantDialDst);
                }
                Err(_) => {
                    debug!(destination = %destination.short(), ?dial_timeout, "destination dial timed out");
                    return Err(StatusCode::HopCantDialDst);
                }
            }
        }

        let opened = tokio::time::timeout(
            dial_timeout,
            self.registry.open_stream(destination, PROTOCOL_ID),
        )
        .await;
        let mut dst_stream = match opened {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                debug!(destination = %destination.short(), error = %e, "destination stream failed");
                return Err(StatusCode::HopCantOpenDstStream);
            }
            Err(_) => return Err(StatusCode::HopCantOpenDstStream),
        };

        let stop = RelayMessage::stop(source, destination);
        let handshake = async {
            write_message(&mut dst_stream, &stop).await?;
            Ok::<_, ProtocolError>(read_response(&mut dst_stream).await?)
        };
        match tokio::time::timeout(self.limits.request_timeout, handshake).await {
            Ok(Ok(resp)) if resp.code.is_success() => Ok(dst_stream),
            Ok(Ok(resp)) => {
                debug!(destination = %destination.short(), code = %resp.code, "destination refused STOP");
                Err(StatusCode::HopCantSpeakRelay)
            }
            Ok(Err(e)) => {
                debug!(destination = %destination.short(), error = %e, "STOP handshake failed");
                Err(StatusCode::HopCantSpeakRelay)
            }
            Err(_) => Err(StatusCode::HopCantSpeakRelay),
        }
    }

    async fn reject<T>(
        &self,
        remote: &PeerId,
        mut stream: BoxedStream,
        code: StatusCode,
    ) -> Result<T, HopError> {
        info!(peer = %remote.short(), code = %code, "HOP rejected");
        send_status(&mut stream, code).await;
        Err(HopError::Rejected(code))
    }
}
