//! Error types and stable error codes.
//!
//! Every failure in this crate is scoped to one request or one circuit; none of
//! these errors is fatal to the process. `ErrorClass` tells a caller whether a
//! different relay might help (`Policy`, `Reachability`), whether a backoff and
//! retry is reasonable (`Timeout`), or whether retrying is pointless (`Address`).

use std::time::Duration;

use crate::peer::PeerId;
use crate::protocol::StatusCode;

/// Coarse classification used by callers to pick a recovery strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or oversized address; never retried.
    Address,
    /// Relaying disabled, self-relay, allow-list miss, or relay at capacity.
    Policy,
    /// Destination or relay could not be reached.
    Reachability,
    /// A handshake or dial deadline expired.
    Timeout,
    /// The peer violated the wire protocol.
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
    #[error("invalid peer id {id:?}: {reason}")]
    InvalidPeerId { id: String, reason: String },

    #[error("peer id is {len} characters (max {max})")]
    PeerIdTooLong { len: usize, max: usize },

    #[error("invalid transport address {addr:?}: {reason}")]
    InvalidTransportAddr { addr: String, reason: String },

    #[error("transport address is {len} bytes (max {max})")]
    TransportAddrTooLong { len: usize, max: usize },

    #[error("invalid circuit address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },
}

impl AddrError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::InvalidPeerId { .. } => "invalid_peer_id",
            Self::PeerIdTooLong { .. } => "peer_id_too_long",
            Self::InvalidTransportAddr { .. } => "invalid_transport_addr",
            Self::TransportAddrTooLong { .. } => "transport_addr_too_long",
            Self::InvalidAddress { .. } => "invalid_address",
        }
    }

    /// True for the length-limit variants.
    pub fn is_too_long(&self) -> bool {
        matches!(
            self,
            Self::PeerIdTooLong { .. } | Self::TransportAddrTooLong { .. }
        )
    }
}

/// Framing and message-level failures on a relay protocol stream.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message too large: {len} bytes (max {max})")]
    TooLarge { len: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unexpected message type: expected {expected}, got {got}")]
    UnexpectedType {
        expected: &'static str,
        got: String,
    },

    #[error("stream closed before a message arrived")]
    Closed,
}

impl ProtocolError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Io(_) => "io",
            Self::TooLarge { .. } => "message_too_large",
            Self::Malformed(_) => "malformed_message",
            Self::UnexpectedType { .. } => "unexpected_message_type",
            Self::Closed => "stream_closed",
        }
    }
}

/// Failures reported by the connection registry (the underlying transports).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    #[error("no connection to {0}")]
    NotConnected(PeerId),

    #[error("{peer} does not speak {protocol}")]
    ProtocolNotSupported { peer: PeerId, protocol: String },

    #[error("connection refused by {0}")]
    Refused(PeerId),

    #[error("transport i/o: {0}")]
    Io(String),
}

impl TransportError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Unreachable(_) => "unreachable",
            Self::NotConnected(_) => "not_connected",
            Self::ProtocolNotSupported { .. } => "protocol_not_supported",
            Self::Refused(_) => "refused",
            Self::Io(_) => "transport_io",
        }
    }
}

/// Errors returned by [`CircuitDialer::dial`](crate::dialer::CircuitDialer::dial).
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("relay usage is disabled")]
    RelayDisabled,

    #[error("no relay available")]
    NoRelayAvailable,

    #[error("relay {relay} unreachable: {source}")]
    RelayUnreachable {
        relay: String,
        #[source]
        source: TransportError,
    },

    #[error("relay {relay} cannot hop: {code}")]
    RelayCannotHop { relay: PeerId, code: StatusCode },

    #[error("relay {relay} refused circuit: {code} ({message})")]
    Rejected {
        relay: PeerId,
        code: StatusCode,
        message: String,
    },

    #[error("circuit handshake timed out after {0:?}")]
    DialTimeout(Duration),

    #[error(transparent)]
    Address(#[from] AddrError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl DialError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::RelayDisabled => "relay_disabled",
            Self::NoRelayAvailable => "no_relay_available",
            Self::RelayUnreachable { .. } => "relay_unreachable",
            Self::RelayCannotHop { .. } => "relay_cannot_hop",
            Self::Rejected { .. } => "rejected",
            Self::DialTimeout(_) => "dial_timeout",
            Self::Address(e) => e.error_code(),
            Self::Transport(e) => e.error_code(),
            Self::Protocol(e) => e.error_code(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RelayDisabled | Self::RelayCannotHop { .. } => ErrorClass::Policy,
            Self::NoRelayAvailable | Self::RelayUnreachable { .. } | Self::Transport(_) => {
                ErrorClass::Reachability
            }
            Self::Rejected { code, .. } => code.class(),
            Self::DialTimeout(_) => ErrorClass::Timeout,
            Self::Address(_) => ErrorClass::Address,
            Self::Protocol(_) => ErrorClass::Protocol,
        }
    }

    /// The status code carried by a relay rejection, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::RelayCannotHop { code, .. } | Self::Rejected { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Why the relay did not open a circuit for a HOP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HopError {
    /// A status was sent back to the source.
    #[error("rejected: {0}")]
    Rejected(StatusCode),

    #[error("source stream closed before the circuit opened")]
    SourceClosed,

    #[error("relay is shutting down")]
    ShuttingDown,
}

impl HopError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Rejected(_) => "hop_rejected",
            Self::SourceClosed => "source_closed",
            Self::ShuttingDown => "shutting_down",
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Rejected(code) => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::Load(_) => "config_load",
            Self::Invalid { .. } => "config_invalid",
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(Box::new(err))
    }
}
