//! Relay capability gating.
//!
//! Three switches decide what a node will do:
//! - `client_enabled`: may this node dial through relays (and accept relayed connections)?
//! - `hop.enabled`: will this node relay for others at all?
//! - `hop.active`: will it dial destinations it is not yet connected to, and
//!   relay for any source rather than just allow-listed ones?
//!
//! Decisions are pure: a policy snapshot plus a request in, a [`StatusCode`] out.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::peer::PeerId;
use crate::protocol::{HopKind, HopRequest, StatusCode};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopPolicy {
    pub enabled: bool,
    pub active: bool,
}

/// Immutable relay policy snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPolicy {
    pub client_enabled: bool,
    pub hop: HopPolicy,
}

/// How a node behaves when asked to relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    Disabled,
    /// Relay only for allow-listed sources, only to already-connected destinations.
    Passive,
    Active,
}

/// Peers a passive relay is willing to serve.
pub trait AllowList {
    fn contains(&self, peer: &PeerId) -> bool;
}

impl<F> AllowList for F
where
    F: Fn(&PeerId) -> bool,
{
    fn contains(&self, peer: &PeerId) -> bool {
        self(peer)
    }
}

impl AllowList for HashSet<PeerId> {
    fn contains(&self, peer: &PeerId) -> bool {
        HashSet::contains(self, peer)
    }
}

impl RelayPolicy {
    /// Client only: may dial through relays, will not relay.
    pub fn client() -> Self {
        Self {
            client_enabled: true,
            hop: HopPolicy::default(),
        }
    }

    pub fn relay(active: bool) -> Self {
        Self {
            client_enabled: true,
            hop: HopPolicy {
                enabled: true,
                active,
            },
        }
    }

    pub fn may_dial_through_relay(&self) -> bool {
        self.client_enabled
    }

    pub fn hop_mode(&self) -> RelayMode {
        match (self.hop.enabled, self.hop.active) {
            (false, _) => RelayMode::Disabled,
            (true, false) => RelayMode::Passive,
            (true, true) => RelayMode::Active,
        }
    }

    /// Whether a HOP `request` may be served by `local`.
    ///
    /// `SUCCESS` only means the precondition holds; the destination still has
    /// to be reached.
    pub fn may_act_as_relay_for(
        &self,
        request: &HopRequest,
        local: &PeerId,
        allow: &impl AllowList,
    ) -> StatusCode {
        if request.kind == HopKind::Hop && &request.destination == local {
            return StatusCode::HopCantRelayToSelf;
        }
        match &request.source {
            Some(source) => self.can_hop_status(source, allow),
            None => match self.hop_mode() {
                RelayMode::Active => StatusCode::Success,
                _ => StatusCode::HopCantSpeakRelay,
            },
        }
    }

    /// Answer to a CAN_HOP probe from `source`.
    pub fn can_hop_status(&self, source: &PeerId, allow: &impl AllowList) -> StatusCode {
        match self.hop_mode() {
            RelayMode::Disabled => StatusCode::HopCantSpeakRelay,
            RelayMode::Passive if !allow.contains(source) => StatusCode::HopCantSpeakRelay,
            RelayMode::Passive | RelayMode::Active => StatusCode::Success,
        }
    }

    /// Whether this node dials destinations it has no connection to.
    pub fn dials_destinations(&self) -> bool {
        self.hop_mode() == RelayMode::Active
    }
}
