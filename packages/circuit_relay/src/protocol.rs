//! Relay wire protocol.
//!
//! Wire format: `[4-byte big-endian length][JSON body]`
//!
//! Body: `{ "type": "HOP", "src_peer": {"id": .., "addrs": [..]}, "dst_peer": {..},
//! "code": 100, "message": ".." }` with every field except `type` optional.
//!
//! A dialer opens a stream with [`PROTOCOL_ID`] to the relay and sends `HOP`; the
//! relay opens a stream to the destination and sends `STOP`; each side answers
//! with a single `STATUS`. After a `SUCCESS` status the stream carries raw,
//! un-framed bytes, so readers here never consume past the end of a frame.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::{MAX_ADDR_LEN, TransportAddr};
use crate::error::{AddrError, ErrorClass, ProtocolError};
use crate::peer::{MAX_PEER_ID_LEN, PeerId};

/// Protocol id negotiated for relay streams.
pub const PROTOCOL_ID: &str = "/libp2p/circuit/relay/0.1.0";

/// Maximum frame body size. Requests carry two peer records, nothing more.
pub const MAX_MESSAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Hop,
    Stop,
    Status,
    CanHop,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hop => "HOP",
            Self::Stop => "STOP",
            Self::Status => "STATUS",
            Self::CanHop => "CAN_HOP",
        }
    }
}

/// Response status carried by `STATUS` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum StatusCode {
    Success,
    HopSrcAddrTooLong,
    HopDstAddrTooLong,
    HopSrcMultiaddrInvalid,
    HopDstMultiaddrInvalid,
    HopNoConnToDst,
    HopCantDialDst,
    HopCantOpenDstStream,
    HopCantSpeakRelay,
    HopCantRelayToSelf,
    HopResourceLimitExceeded,
    StopSrcAddrTooLong,
    StopDstAddrTooLong,
    StopSrcMultiaddrInvalid,
    StopDstMultiaddrInvalid,
    StopRelayRefused,
    MalformedMessage,
    Unknown(u32),
}

impl StatusCode {
    pub fn code(&self) -> u32 {
        match self {
            Self::Success => 100,
            Self::HopSrcAddrTooLong => 220,
            Self::HopDstAddrTooLong => 221,
            Self::HopSrcMultiaddrInvalid => 250,
            Self::HopDstMultiaddrInvalid => 251,
            Self::HopNoConnToDst => 260,
            Self::HopCantDialDst => 261,
            Self::HopCantOpenDstStream => 262,
            Self::HopCantSpeakRelay => 270,
            Self::HopCantRelayToSelf => 280,
            Self::HopResourceLimitExceeded => 290,
            Self::StopSrcAddrTooLong => 320,
            Self::StopDstAddrTooLong => 321,
            Self::StopSrcMultiaddrInvalid => 350,
            Self::StopDstMultiaddrInvalid => 351,
            Self::StopRelayRefused => 390,
            Self::MalformedMessage => 400,
            Self::Unknown(code) => *code,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::HopSrcAddrTooLong => "HOP_SRC_ADDR_TOO_LONG",
            Self::HopDstAddrTooLong => "HOP_DST_ADDR_TOO_LONG",
            Self::HopSrcMultiaddrInvalid => "HOP_SRC_MULTIADDR_INVALID",
            Self::HopDstMultiaddrInvalid => "HOP_DST_MULTIADDR_INVALID",
            Self::HopNoConnToDst => "HOP_NO_CONN_TO_DST",
            Self::HopCantDialDst => "HOP_CANT_DIAL_DST",
            Self::HopCantOpenDstStream => "HOP_CANT_OPEN_DST_STREAM",
            Self::HopCantSpeakRelay => "HOP_CANT_SPEAK_RELAY",
            Self::HopCantRelayToSelf => "HOP_CANT_RELAY_TO_SELF",
            Self::HopResourceLimitExceeded => "HOP_RESOURCE_LIMIT_EXCEEDED",
            Self::StopSrcAddrTooLong => "STOP_SRC_ADDR_TOO_LONG",
            Self::StopDstAddrTooLong => "STOP_DST_ADDR_TOO_LONG",
            Self::StopSrcMultiaddrInvalid => "STOP_SRC_MULTIADDR_INVALID",
            Self::StopDstMultiaddrInvalid => "STOP_DST_MULTIADDR_INVALID",
            Self::StopRelayRefused => "STOP_RELAY_REFUSED",
            Self::MalformedMessage => "MALFORMED_MESSAGE",
            Self::Unknown(_) => "UNKNOWN",
        }
    }

    /// Human-readable text sent alongside the code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Success => "OK",
            Self::HopSrcAddrTooLong => "source address too long",
            Self::HopDstAddrTooLong => "destination address too long",
            Self::HopSrcMultiaddrInvalid => "invalid source address",
            Self::HopDstMultiaddrInvalid => "invalid destination address",
            Self::HopNoConnToDst => "no connection to destination",
            Self::HopCantDialDst => "could not dial destination",
            Self::HopCantOpenDstStream => "could not open stream to destination",
            Self::HopCantSpeakRelay => "relaying is not available",
            Self::HopCantRelayToSelf => "cannot relay to self",
            Self::HopResourceLimitExceeded => "too many active circuits",
            Self::StopSrcAddrTooLong => "source address too long",
            Self::StopDstAddrTooLong => "destination address too long",
            Self::StopSrcMultiaddrInvalid => "invalid source address",
            Self::StopDstMultiaddrInvalid => "invalid destination address",
            Self::StopRelayRefused => "relayed connections are refused",
            Self::MalformedMessage => "malformed message",
            Self::Unknown(_) => "unknown status",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Which failure class a non-success code belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::HopSrcAddrTooLong
            | Self::HopDstAddrTooLong
            | Self::HopSrcMultiaddrInvalid
            | Self::HopDstMultiaddrInvalid
            | Self::StopSrcAddrTooLong
            | Self::StopDstAddrTooLong
            | Self::StopSrcMultiaddrInvalid
            | Self::StopDstMultiaddrInvalid => ErrorClass::Address,
            Self::HopCantSpeakRelay
            | Self::HopCantRelayToSelf
            | Self::HopResourceLimitExceeded
            | Self::StopRelayRefused => ErrorClass::Policy,
            Self::HopNoConnToDst | Self::HopCantDialDst | Self::HopCantOpenDstStream => {
                ErrorClass::Reachability
            }
            Self::Success | Self::MalformedMessage | Self::Unknown(_) => ErrorClass::Protocol,
        }
    }
}

impl From<u32> for StatusCode {
    fn from(code: u32) -> Self {
        match code {
            100 => Self::Success,
            220 => Self::HopSrcAddrTooLong,
            221 => Self::HopDstAddrTooLong,
            250 => Self::HopSrcMultiaddrInvalid,
            251 => Self::HopDstMultiaddrInvalid,
            260 => Self::HopNoConnToDst,
            261 => Self::HopCantDialDst,
            262 => Self::HopCantOpenDstStream,
            270 => Self::HopCantSpeakRelay,
            280 => Self::HopCantRelayToSelf,
            290 => Self::HopResourceLimitExceeded,
            320 => Self::StopSrcAddrTooLong,
            321 => Self::StopDstAddrTooLong,
            350 => Self::StopSrcMultiaddrInvalid,
            351 => Self::StopDstMultiaddrInvalid,
            390 => Self::StopRelayRefused,
            400 => Self::MalformedMessage,
            other => Self::Unknown(other),
        }
    }
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> Self {
        code.code()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// A peer as it appears on the wire: id plus known transport addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addrs: Vec<String>,
}

impl PeerRecord {
    pub fn new(peer: &PeerId) -> Self {
        Self {
            id: peer.to_string(),
            addrs: Vec::new(),
        }
    }

    pub fn with_addrs(peer: &PeerId, addrs: &[TransportAddr]) -> Self {
        Self {
            id: peer.to_string(),
            addrs: addrs.iter().map(ToString::to_string).collect(),
        }
    }

    /// Validate the record, mapping failures to the given (too-long, invalid) codes.
    fn validate(
        &self,
        too_long: StatusCode,
        invalid: StatusCode,
    ) -> Result<(PeerId, Vec<TransportAddr>), StatusCode> {
        if self.id.len() > MAX_PEER_ID_LEN || self.addrs.iter().any(|a| a.len() > MAX_ADDR_LEN) {
            return Err(too_long);
        }
        let peer = PeerId::parse(&self.id).map_err(|_| invalid)?;
        let addrs = self
            .addrs
            .iter()
            .map(|a| TransportAddr::parse(a))
            .collect::<Result<Vec<_>, AddrError>>()
            .map_err(|_| invalid)?;
        Ok((peer, addrs))
    }
}

/// One framed relay protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src_peer: Option<PeerRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst_peer: Option<PeerRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<StatusCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RelayMessage {
    fn bare(kind: MessageType) -> Self {
        Self {
            kind,
            src_peer: None,
            dst_peer: None,
            code: None,
            message: None,
        }
    }

    pub fn hop(source: &PeerId, destination: &PeerId) -> Self {
        Self {
            src_peer: Some(PeerRecord::new(source)),
            dst_peer: Some(PeerRecord::new(destination)),
            ..Self::bare(MessageType::Hop)
        }
    }

    pub fn can_hop(source: &PeerId) -> Self {
        Self {
            src_peer: Some(PeerRecord::new(source)),
            ..Self::bare(MessageType::CanHop)
        }
    }

    pub fn stop(source: &PeerId, destination: &PeerId) -> Self {
        Self {
            src_peer: Some(PeerRecord::new(source)),
            dst_peer: Some(PeerRecord::new(destination)),
            ..Self::bare(MessageType::Stop)
        }
    }

    pub fn status(code: StatusCode) -> Self {
        Self {
            code: Some(code),
            message: Some(code.description().to_string()),
            ..Self::bare(MessageType::Status)
        }
    }

    /// Interpret this message as a response to a request.
    pub fn into_response(self) -> Result<HopResponse, ProtocolError> {
        if self.kind != MessageType::Status {
            return Err(ProtocolError::UnexpectedType {
                expected: "STATUS",
                got: self.kind.as_str().to_string(),
            });
        }
        let code = self
            .code
            .ok_or_else(|| ProtocolError::Malformed("STATUS without code".into()))?;
        Ok(HopResponse {
            code,
            message: self.message.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopKind {
    /// Capability probe: "would you relay for me?"
    CanHop,
    /// The actual relay request.
    Hop,
}

/// A validated HOP request as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopRequest {
    pub kind: HopKind,
    pub destination: PeerId,
    pub source: Option<PeerId>,
}

impl HopRequest {
    pub fn hop(destination: PeerId, source: Option<PeerId>) -> Self {
        Self {
            kind: HopKind::Hop,
            destination,
            source,
        }
    }

    /// Validate a `HOP` message received from the authenticated peer `remote`.
    ///
    /// The effective source is always `remote`; a `src_peer` naming anyone else
    /// is rejected. Length checks run before parsing.
    pub fn from_wire(msg: &RelayMessage, remote: &PeerId) -> Result<Self, StatusCode> {
        if msg.kind != MessageType::Hop {
            return Err(StatusCode::MalformedMessage);
        }
        if let Some(src) = &msg.src_peer {
            let (source, _) = src.validate(
                StatusCode::HopSrcAddrTooLong,
                StatusCode::HopSrcMultiaddrInvalid,
            )?;
            if &source != remote {
                return Err(StatusCode::HopSrcMultiaddrInvalid);
            }
        }
        let dst = msg
            .dst_peer
            .as_ref()
            .ok_or(StatusCode::HopDstMultiaddrInvalid)?;
        let (destination, _) = dst.validate(
            StatusCode::HopDstAddrTooLong,
            StatusCode::HopDstMultiaddrInvalid,
        )?;
        Ok(Self::hop(destination, Some(remote.clone())))
    }
}

/// A validated STOP request as seen by the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopRequest {
    pub source: PeerId,
    pub destination: PeerId,
}

impl StopRequest {
    pub fn from_wire(msg: &RelayMessage) -> Result<Self, StatusCode> {
        if msg.kind != MessageType::Stop {
            return Err(StatusCode::MalformedMessage);
        }
        let src = msg
            .src_peer
            .as_ref()
            .ok_or(StatusCode::StopSrcMultiaddrInvalid)?;
        let (source, _) = src.validate(
            StatusCode::StopSrcAddrTooLong,
            StatusCode::StopSrcMultiaddrInvalid,
        )?;
        let dst = msg
            .dst_peer
            .as_ref()
            .ok_or(StatusCode::StopDstMultiaddrInvalid)?;
        let (destination, _) = dst.validate(
            StatusCode::StopDstAddrTooLong,
            StatusCode::StopDstMultiaddrInvalid,
        )?;
        Ok(Self {
            source,
            destination,
        })
    }
}

/// The single response frame written back on a HOP/STOP/CAN_HOP stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopResponse {
    pub code: StatusCode,
    pub message: String,
}

/// Write one length-prefixed message.
pub async fn write_message<W>(stream: &mut W, msg: &RelayMessage) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = serde_json::to_vec(msg).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge {
            len: bytes.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let len = (bytes.len() as u32).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed message.
///
/// Returns `None` if the stream is cleanly closed before a length prefix arrives.
pub async fn read_message<R>(stream: &mut R) -> Result<Option<RelayMessage>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge {
            len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Closed
        } else {
            e.into()
        }
    })?;

    serde_json::from_slice(&buf).map_err(|e| {
        tracing::warn!(error = %e, "malformed relay message");
        ProtocolError::Malformed(e.to_string())
    })
}

/// Read a message that must be present.
pub async fn expect_message<R>(stream: &mut R) -> Result<RelayMessage, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_message(stream).await?.ok_or(ProtocolError::Closed)
}

/// Read the single `STATUS` answer to a request.
pub async fn read_response<R>(stream: &mut R) -> Result<HopResponse, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    expect_message(stream).await?.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> PeerId {
        PeerId::parse(s).unwrap()
    }

    #[test]
    fn status_codes_match_wire_values() {
        let table = [
            (StatusCode::Success, 100),
            (StatusCode::HopSrcAddrTooLong, 220),
            (StatusCode::HopDstAddrTooLong, 221),
            (StatusCode::HopSrcMultiaddrInvalid, 250),
            (StatusCode::HopDstMultiaddrInvalid, 251),
            (StatusCode::HopNoConnToDst, 260),
            (StatusCode::HopCantDialDst, 261),
            (StatusCode::HopCantOpenDstStream, 262),
            (StatusCode::HopCantSpeakRelay, 270),
            (StatusCode::HopCantRelayToSelf, 280),
            (StatusCode::StopRelayRefused, 390),
            (StatusCode::MalformedMessage, 400),
        ];
        for (code, value) in table {
            assert_eq!(code.code(), value);
            assert_eq!(StatusCode::from(value), code);
        }
        assert_eq!(StatusCode::from(999), StatusCode::Unknown(999));
        assert_eq!(StatusCode::Unknown(999).name(), "UNKNOWN");
    }

    #[test]
    fn message_json_shape() {
        let msg = RelayMessage::hop(&peer("QmSrc"), &peer("QmDest"));
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "HOP");
        assert_eq!(json["src_peer"]["id"], "QmSrc");
        assert_eq!(json["dst_peer"]["id"], "QmDest");
        assert!(json.get("code").is_none());

        let status = serde_json::to_value(RelayMessage::status(StatusCode::HopCantDialDst)).unwrap();
        assert_eq!(status["type"], "STATUS");
        assert_eq!(status["code"], 261);
    }

    #[tokio::test]
    async fn framing_leaves_trailing_bytes_untouched() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &RelayMessage::status(StatusCode::Success))
            .await
            .unwrap();
        a.write_all(b"raw bytes").await.unwrap();
        drop(a);

        let resp = read_response(&mut b).await.unwrap();
        assert!(resp.code.is_success());
        assert_eq!(resp.message, "OK");

        let mut rest = Vec::new();
        b.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"raw bytes");
    }

    #[tokio::test]
    async fn clean_close_reads_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_message(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&((MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes()))
            .await
            .unwrap();
        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn garbage_body_is_malformed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&4u32.to_be_bytes()).await.unwrap();
        a.write_all(b"{{{{").await.unwrap();
        let err = read_message(&mut b).await.unwrap_err();
        assert_eq!(err.error_code(), "malformed_message");
    }

    #[tokio::test]
    async fn truncated_body_is_closed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"{}").await.unwrap();
        drop(a);
        assert!(matches!(
            read_message(&mut b).await.unwrap_err(),
            ProtocolError::Closed
        ));
    }

    #[test]
    fn status_response_requires_status_type() {
        let err = RelayMessage::can_hop(&peer("QmSrc"))
            .into_response()
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedType { .. }));
    }

    #[test]
    fn hop_request_validation() {
        let remote = peer("QmSrc");
        let req = HopRequest::from_wire(&RelayMessage::hop(&remote, &peer("QmDest")), &remote)
            .unwrap();
        assert_eq!(req.kind, HopKind::Hop);
        assert_eq!(req.destination, peer("QmDest"));
        assert_eq!(req.source, Some(remote.clone()));

        // source omitted: the authenticated remote is used
        let mut msg = RelayMessage::hop(&remote, &peer("QmDest"));
        msg.src_peer = None;
        assert_eq!(
            HopRequest::from_wire(&msg, &remote).unwrap().source,
            Some(remote.clone())
        );

        // spoofed source
        let msg = RelayMessage::hop(&peer("QmSpoofed"), &peer("QmDest"));
        assert_eq!(
            HopRequest::from_wire(&msg, &remote),
            Err(StatusCode::HopSrcMultiaddrInvalid)
        );

        // missing destination
        let mut msg = RelayMessage::hop(&remote, &peer("QmDest"));
        msg.dst_peer = None;
        assert_eq!(
            HopRequest::from_wire(&msg, &remote),
            Err(StatusCode::HopDstMultiaddrInvalid)
        );
    }

    #[test]
    fn hop_request_length_checks_come_first() {
        let remote = peer("QmSrc");
        let mut msg = RelayMessage::hop(&remote, &peer("QmDest"));
        msg.dst_peer = Some(PeerRecord {
            id: "0".repeat(MAX_PEER_ID_LEN + 1),
            addrs: Vec::new(),
        });
        assert_eq!(
            HopRequest::from_wire(&msg, &remote),
            Err(StatusCode::HopDstAddrTooLong)
        );

        let mut msg = RelayMessage::hop(&remote, &peer("QmDest"));
        msg.src_peer = Some(PeerRecord {
            id: remote.to_string(),
            addrs: vec![format!("/dns/{}", "a".repeat(MAX_ADDR_LEN))],
        });
        assert_eq!(
            HopRequest::from_wire(&msg, &remote),
            Err(StatusCode::HopSrcAddrTooLong)
        );

        let mut msg = RelayMessage::hop(&remote, &peer("QmDest"));
        msg.dst_peer = Some(PeerRecord {
            id: "QmDest".into(),
            addrs: vec!["not-an-addr".into()],
        });
        assert_eq!(
            HopRequest::from_wire(&msg, &remote),
            Err(StatusCode::HopDstMultiaddrInvalid)
        );
    }

    #[test]
    fn stop_request_validation() {
        let req = StopRequest::from_wire(&RelayMessage::stop(&peer("QmSrc"), &peer("QmDest")))
            .unwrap();
        assert_eq!(req.source, peer("QmSrc"));
        assert_eq!(req.destination, peer("QmDest"));

        let mut msg = RelayMessage::stop(&peer("QmSrc"), &peer("QmDest"));
        msg.src_peer = Some(PeerRecord {
            id: "bad/id".into(),
            addrs: Vec::new(),
        });
        assert_eq!(
            StopRequest::from_wire(&msg),
            Err(StatusCode::StopSrcMultiaddrInvalid)
        );
        assert_eq!(
            StopRequest::from_wire(&RelayMessage::status(StatusCode::Success)),
            Err(StatusCode::MalformedMessage)
        );
    }
}
