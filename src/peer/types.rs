use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the session this endpoint plays.
///
/// On the relay the joiner is tagged `"caller"`, matching existing records.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    #[serde(rename = "initiator")]
    Initiator,
    #[serde(rename = "caller")]
    Joiner,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Joiner,
            Role::Joiner => Role::Initiator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Joiner => "caller",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// One side's session parameters. Opaque to the core.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Candidate as produced by the local transport, before attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateInit {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// ICE candidate as stored under `sessions/{id}/candidates/{key}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    pub from: Role,
    // Ordering/debugging only.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl IceCandidate {
    pub fn attributed(init: CandidateInit, from: Role, timestamp: i64) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            from,
            timestamp: Some(timestamp),
        }
    }
}

/// Raw connection state reported by the peer-transport engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Connection vocabulary delivered to subscribers.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PeerConnectionState {
    /// `New` carries no information for subscribers; `Closed` reads as a disconnect.
    pub fn translate(self) -> Option<ConnectionState> {
        match self {
            PeerConnectionState::New => None,
            PeerConnectionState::Connecting => Some(ConnectionState::Connecting),
            PeerConnectionState::Connected => Some(ConnectionState::Connected),
            PeerConnectionState::Disconnected | PeerConnectionState::Closed => {
                Some(ConnectionState::Disconnected)
            }
            PeerConnectionState::Failed => Some(ConnectionState::Failed),
        }
    }
}
