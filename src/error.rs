//! Error types for each collaborator seam and the session-level taxonomy.

use thiserror::Error;

/// Failures talking to the relay store.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay unavailable: {0}")]
    Unavailable(String),
    #[error("relay value encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures reported by the peer-transport engine or its data channel.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("transport initialisation failed: {0}")]
    InitFailed(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("data channel not open")]
    ChannelNotOpen,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("transport closed")]
    Closed,
}

/// Inbound frame could not be decoded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has no type tag")]
    MissingType,
    #[error("file {name} declares {size} bytes, limit is {limit}")]
    FileTooLarge { name: String, size: u64, limit: u64 },
    #[error("too many transfers in flight (limit {0})")]
    TooManyTransfers(usize),
}

/// Errors surfaced by [`PeerSession`](crate::session::PeerSession), either
/// returned from a call or published as an error event.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("relay unavailable: {0}")]
    RelayUnavailable(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("transport initialisation failed: {0}")]
    TransportInitFailed(String),
    #[error("data channel not open")]
    ChannelNotOpen,
    #[error("parse error: {0}")]
    Parse(#[from] ProtocolError),
    #[error("connection {0}")]
    ConnectionFailed(String),
    #[error("connection {0}")]
    ConnectionLost(String),
    #[error("a session is already active")]
    SessionActive,
    #[error("no active session")]
    NoSession,
    #[error("transport error: {0}")]
    Transport(TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RelayError> for SessionError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Unavailable(msg) => SessionError::RelayUnavailable(msg),
            // Our own record failed to serialise; the relay itself is fine.
            RelayError::Encode(err) => SessionError::Parse(ProtocolError::Malformed(err)),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::InitFailed(msg) => SessionError::TransportInitFailed(msg),
            TransportError::ChannelNotOpen => SessionError::ChannelNotOpen,
            other => SessionError::Transport(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_onto_taxonomy() {
        let e: SessionError = TransportError::InitFailed("no ice".into()).into();
        assert!(matches!(e, SessionError::TransportInitFailed(_)));

        let e: SessionError = TransportError::ChannelNotOpen.into();
        assert!(matches!(e, SessionError::ChannelNotOpen));

        let e: SessionError = TransportError::Closed.into();
        assert!(matches!(e, SessionError::Transport(TransportError::Closed)));
    }

    #[test]
    fn relay_errors_become_unavailable() {
        let e: SessionError = RelayError::Unavailable("offline".into()).into();
        assert!(matches!(e, SessionError::RelayUnavailable(msg) if msg == "offline"));
    }

    #[test]
    fn relay_encode_failure_is_not_an_outage() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let e: SessionError = RelayError::Encode(bad).into();
        assert!(matches!(e, SessionError::Parse(ProtocolError::Malformed(_))));
    }

    #[test]
    fn connection_errors_carry_state_name() {
        assert_eq!(
            SessionError::ConnectionFailed("failed".into()).to_string(),
            "connection failed"
        );
        assert_eq!(
            SessionError::ConnectionLost("disconnected".into()).to_string(),
            "connection disconnected"
        );
    }
}
