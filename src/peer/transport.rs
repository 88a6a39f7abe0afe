//! Peer-transport abstraction
//!
//! The core never touches NAT traversal, encryption or delivery itself. It
//! drives a [`PeerTransport`] handle and the single [`DataChannel`] on it.
//! Implementations:
//! - `webrtc` crate (production, see `peer::connection`)
//! - in-memory mock (tests, see `peer::mock`)

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::error::TransportError;
use crate::peer::types::{CandidateInit, IceCandidate, PeerConnectionState, SessionDescription};

/// Events raised by a transport handle.
pub enum TransportEvent {
    LocalCandidate(CandidateInit),
    ConnectionState(PeerConnectionState),
    /// Channel opened by the remote side (joiner path).
    DataChannel(ChannelHandle),
}

/// Lifecycle and traffic on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Close,
    Error(String),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

/// A data channel together with the stream of its events.
pub struct ChannelHandle {
    pub channel: Arc<dyn DataChannel>,
    pub events: ChannelEvents,
}

/// One ordered, reliable channel to the peer.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Send one text frame.
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    async fn close(&self);
}

/// One side's handle on the peer-transport engine.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<ChannelHandle, TransportError>;

    async fn close(&self);
}

/// Creates transport handles configured with reachability-helper servers.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[ServerConfig],
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError>;
}
