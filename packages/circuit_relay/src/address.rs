//! Circuit address codec.
//!
//! A circuit address names a destination peer and, optionally, the relay to reach
//! it through:
//!
//! ```text
//! /ip4/10.0.0.1/tcp/4001/ipfs/QmRelay/p2p-circuit/ipfs/QmDest   via a specific relay
//! /p2p-circuit/ipfs/QmDest                                       via any connected relay
//! ```
//!
//! Everything before `/p2p-circuit` is the relay's transport address and is handed
//! to the underlying transport unchanged. `/p2p/` is accepted as an alias of
//! `/ipfs/` on input; output always uses `/ipfs/`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AddrError;
use crate::peer::PeerId;

/// Longest transport address accepted in a circuit address or on the wire.
pub const MAX_ADDR_LEN: usize = 1024;

const CIRCUIT_MARKER: &str = "/p2p-circuit";
const CIRCUIT_SEGMENT: &str = "p2p-circuit";
const PEER_SEGMENT: &str = "ipfs";
const PEER_SEGMENT_ALIAS: &str = "p2p";

/// A multiaddr-style transport address such as `/ip4/127.0.0.1/tcp/4001`,
/// optionally ending in `/ipfs/<peer>`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TransportAddr(String);

impl TransportAddr {
    pub fn parse(s: &str) -> Result<Self, AddrError> {
        let invalid = |reason: &str| AddrError::InvalidTransportAddr {
            addr: s.to_string(),
            reason: reason.to_string(),
        };

        if s.len() > MAX_ADDR_LEN {
            return Err(AddrError::TransportAddrTooLong {
                len: s.len(),
                max: MAX_ADDR_LEN,
            });
        }
        let Some(body) = s.strip_prefix('/') else {
            return Err(invalid("must start with '/'"));
        };
        if body.is_empty() {
            return Err(invalid("no protocol segments"));
        }

        let segments: Vec<&str> = body.split('/').collect();
        let mut normalized = String::with_capacity(s.len());
        let mut i = 0;
        while i < segments.len() {
            let segment = segments[i];
            if segment.is_empty() {
                return Err(invalid("empty segment"));
            }
            if segment == CIRCUIT_SEGMENT {
                return Err(invalid("nested circuit addresses are not supported"));
            }
            if segment == PEER_SEGMENT || segment == PEER_SEGMENT_ALIAS {
                if i + 2 != segments.len() {
                    return Err(invalid("/ipfs/<peer> must be the final component"));
                }
                let peer = PeerId::parse(segments[i + 1])
                    .map_err(|e| invalid(&format!("bad peer id: {e}")))?;
                normalized.push('/');
                normalized.push_str(PEER_SEGMENT);
                normalized.push('/');
                normalized.push_str(peer.as_str());
                break;
            }
            normalized.push('/');
            normalized.push_str(segment);
            i += 1;
        }

        Ok(Self(normalized))
    }

    /// Join segments into an address. Segments must be non-empty and slash-free.
    pub(crate) fn from_segments<'a>(segments: impl IntoIterator<Item = &'a str>) -> Self {
        let mut addr = String::new();
        for segment in segments {
            addr.push('/');
            addr.push_str(segment);
        }
        Self(addr)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The peer named by a trailing `/ipfs/<id>`, if present.
    pub fn peer(&self) -> Option<PeerId> {
        let (head, id) = self.0.rsplit_once('/')?;
        if !head.ends_with(&format!("/{PEER_SEGMENT}")) {
            return None;
        }
        PeerId::parse(id).ok()
    }

    /// The address with any trailing `/ipfs/<id>` removed, or `None` when nothing
    /// but the peer component remains.
    pub fn without_peer(&self) -> Option<TransportAddr> {
        let Some(peer) = self.peer() else {
            return Some(self.clone());
        };
        let suffix_len = PEER_SEGMENT.len() + peer.as_str().len() + 2;
        let base = &self.0[..self.0.len() - suffix_len];
        (!base.is_empty()).then(|| TransportAddr(base.to_string()))
    }

    /// The address with `/ipfs/<peer>` appended, replacing any existing peer.
    pub fn with_peer(&self, peer: &PeerId) -> TransportAddr {
        let base = self.without_peer().map(|b| b.0).unwrap_or_default();
        TransportAddr(format!("{base}/{PEER_SEGMENT}/{peer}"))
    }

    /// True when the address is only `/ipfs/<id>` with no transport component.
    pub fn is_peer_only(&self) -> bool {
        self.without_peer().is_none()
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransportAddr({})", self.0)
    }
}

impl FromStr for TransportAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TransportAddr {
    type Error = AddrError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<TransportAddr> for String {
    fn from(addr: TransportAddr) -> Self {
        addr.0
    }
}

/// "Dial `destination` through `relay`" (or through any connected relay).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CircuitAddr {
    relay: Option<TransportAddr>,
    destination: PeerId,
}

impl CircuitAddr {
    pub fn new(relay: Option<TransportAddr>, destination: PeerId) -> Self {
        Self { relay, destination }
    }

    pub fn relay(&self) -> Option<&TransportAddr> {
        self.relay.as_ref()
    }

    pub fn destination(&self) -> &PeerId {
        &self.destination
    }

    /// The relay's peer id, when the relay address ends in `/ipfs/<id>`.
    pub fn relay_peer(&self) -> Option<PeerId> {
        self.relay.as_ref().and_then(TransportAddr::peer)
    }

    pub fn is_relay_less(&self) -> bool {
        self.relay.is_none()
    }
}

impl fmt::Display for CircuitAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&compose(self.relay.as_ref(), &self.destination))
    }
}

impl FromStr for CircuitAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

impl TryFrom<String> for CircuitAddr {
    type Error = AddrError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        parse(&s)
    }
}

impl From<CircuitAddr> for String {
    fn from(addr: CircuitAddr) -> Self {
        addr.to_string()
    }
}

/// Parse `[<relay>]/p2p-circuit/ipfs/<destination>`.
pub fn parse(s: &str) -> Result<CircuitAddr, AddrError> {
    let invalid = |reason: String| AddrError::InvalidAddress {
        addr: s.to_string(),
        reason,
    };

    let Some(body) = s.strip_prefix('/') else {
        return Err(invalid("must start with '/'".into()));
    };
    let segments: Vec<&str> = body.split('/').collect();
    let Some(idx) = segments.iter().position(|seg| *seg == CIRCUIT_SEGMENT) else {
        return Err(invalid("missing /p2p-circuit".into()));
    };
    let relay_part = if idx == 0 {
        String::new()
    } else {
        format!("/{}", segments[..idx].join("/"))
    };

    let destination = match &segments[idx + 1..] {
        [] => return Err(invalid("missing destination after /p2p-circuit".into())),
        [proto, id] if *proto == PEER_SEGMENT || *proto == PEER_SEGMENT_ALIAS => {
            PeerId::parse(id).map_err(|e| invalid(format!("bad destination: {e}")))?
        }
        _ => {
            return Err(invalid(
                "expected /ipfs/<peer-id> after /p2p-circuit".into(),
            ));
        }
    };

    let relay = if relay_part.is_empty() {
        None
    } else {
        Some(
            TransportAddr::parse(&relay_part)
                .map_err(|e| invalid(format!("bad relay address: {e}")))?,
        )
    };

    Ok(CircuitAddr { relay, destination })
}

/// Inverse of [`parse`]. Without a relay this yields the relay-less form, meaning
/// "try any currently connected peer offering HOP".
pub fn compose(relay: Option<&TransportAddr>, destination: &PeerId) -> String {
    let relay = relay.map(TransportAddr::as_str).unwrap_or("");
    format!("{relay}{CIRCUIT_MARKER}/{PEER_SEGMENT}/{destination}")
}
