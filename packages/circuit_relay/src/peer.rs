//! Opaque peer identifiers.
//!
//! The relay never interprets a peer id beyond equality; the textual form is the
//! base58btc encoding used in `/ipfs/<id>` address segments.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AddrError;

/// Longest peer id accepted in an address or on the wire.
pub const MAX_PEER_ID_LEN: usize = 128;

/// Stable, externally supplied identifier of a peer.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    /// Parse the base58btc textual form.
    pub fn parse(s: &str) -> Result<Self, AddrError> {
        if s.is_empty() {
            return Err(AddrError::InvalidPeerId {
                id: String::new(),
                reason: "empty".into(),
            });
        }
        if s.len() > MAX_PEER_ID_LEN {
            return Err(AddrError::PeerIdTooLong {
                len: s.len(),
                max: MAX_PEER_ID_LEN,
            });
        }
        bs58::decode(s)
            .into_vec()
            .map_err(|e| AddrError::InvalidPeerId {
                id: s.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self(s.to_string()))
    }

    /// Build a peer id from raw identity bytes (e.g. a multihash of a public key).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AddrError> {
        Self::parse(&bs58::encode(bytes).into_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for log lines.
    pub fn short(&self) -> &str {
        let start = self.0.len().saturating_sub(8);
        &self.0[start..]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl FromStr for PeerId {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PeerId {
    type Error = AddrError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<PeerId> for String {
    fn from(peer: PeerId) -> Self {
        peer.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_base58() {
        let id = PeerId::parse("QmcgpsyWgH8Y8ajJz1Cu72KnS5uo2Aa2LpzU7kinSupNKC").unwrap();
        assert_eq!(
            id.as_str(),
            "QmcgpsyWgH8Y8ajJz1Cu72KnS5uo2Aa2LpzU7kinSupNKC"
        );
        assert_eq!(id.short(), "inSupNKC");
    }

    #[test]
    fn rejects_empty_and_non_base58() {
        assert!(matches!(
            PeerId::parse(""),
            Err(AddrError::InvalidPeerId { .. })
        ));
        // '0', 'O', 'I' and 'l' are not in the bitcoin alphabet
        for bad in ["Qm0abc", "QmOabc", "QmIabc", "Qmlabc", "Qm/abc"] {
            assert!(PeerId::parse(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn rejects_oversized() {
        let long = "z".repeat(MAX_PEER_ID_LEN + 1);
        let err = PeerId::parse(&long).unwrap_err();
        assert!(err.is_too_long());
    }

    #[test]
    fn from_bytes_roundtrip() {
        let id = PeerId::from_bytes(&[7u8; 34]).unwrap();
        assert_eq!(PeerId::parse(id.as_str()).unwrap(), id);
        assert!(PeerId::from_bytes(&[]).is_err());
    }

    #[test]
    fn serde_as_string() {
        let id = PeerId::parse("QmDest").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"QmDest\"");
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<PeerId>("\"not/valid\"").is_err());
    }
}
