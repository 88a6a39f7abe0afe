//! `webrtc` crate adapter for the transport traits.
//!
//! Callbacks registered on `RTCPeerConnection` / `RTCDataChannel` only forward
//! into unbounded channels; the session's driver task does all the work.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::ServerConfig;
use crate::error::TransportError;
use crate::peer::transport::{
    ChannelEvent, ChannelHandle, DataChannel, PeerTransport, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::peer::types::{
    CandidateInit, IceCandidate, PeerConnectionState, SdpKind, SessionDescription,
};
use crate::utils::add_ice_url_scheme;

/// Creates `webrtc`-backed transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcTransportFactory;

impl RtcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[ServerConfig],
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        let (pc, events) = new_peer(ice_servers).await?;
        Ok((Arc::new(RtcPeerTransport { pc }), events))
    }
}

fn init_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::InitFailed(e.to_string())
}

fn negotiation_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Negotiation(e.to_string())
}

/// Build a peer connection and wire its callbacks to an event channel.
async fn new_peer(
    servers: &[ServerConfig],
) -> Result<(Arc<RTCPeerConnection>, TransportEvents), TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs().map_err(init_err)?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .map_err(init_err)?;
    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(
        api.new_peer_connection(rtc_config(servers))
            .await
            .map_err(init_err)?,
    );
    let (tx, rx) = mpsc::unbounded_channel();

    let ice_tx = tx.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let ice_tx = ice_tx.clone();
        Box::pin(async move {
            let Some(c) = cand else {
                log::debug!("ICE candidate gathering completed");
                return;
            };
            match c.to_json() {
                Ok(init) => {
                    let _ = ice_tx.send(TransportEvent::LocalCandidate(CandidateInit {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => log::warn!("Failed to serialise local candidate: {e}"),
            }
        })
    }));

    pc.on_ice_gathering_state_change(Box::new(move |state| {
        log::debug!("ICE gathering state changed to: {state:?}");
        Box::pin(async {})
    }));

    let state_tx = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        log::debug!("Peer connection state changed to: {st:?}");
        if let Some(state) = translate_state(st) {
            let _ = state_tx.send(TransportEvent::ConnectionState(state));
        }
        Box::pin(async {})
    }));

    let dc_tx = tx;
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        log::info!("Remote opened data channel '{}'", dc.label());
        let _ = dc_tx.send(TransportEvent::DataChannel(attach_channel(dc)));
        Box::pin(async {})
    }));

    Ok((pc, rx))
}

fn translate_state(st: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match st {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(negotiation_err)
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::Negotiation(format!(
            "unsupported description type {other}"
        ))),
    }
}

pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc(self.pc.create_offer(None).await.map_err(negotiation_err)?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        from_rtc(self.pc.create_answer(None).await.map_err(negotiation_err)?)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(negotiation_err)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(negotiation_err)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<ChannelHandle, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(ordered),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(init_err)?;
        log::info!("Created data channel: {label}");
        Ok(attach_channel(dc))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            log::warn!("Error closing peer connection: {e}");
        }
    }
}

/// Forward channel lifecycle and traffic into an event stream.
fn attach_channel(dc: Arc<RTCDataChannel>) -> ChannelHandle {
    let (tx, rx) = mpsc::unbounded_channel();

    let open_tx = tx.clone();
    dc.on_open(Box::new(move || {
        let _ = open_tx.send(ChannelEvent::Open);
        Box::pin(async {})
    }));

    let msg_tx = tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = msg_tx.send(ChannelEvent::Message(msg.data));
        Box::pin(async {})
    }));

    let err_tx = tx.clone();
    dc.on_error(Box::new(move |e| {
        let _ = err_tx.send(ChannelEvent::Error(e.to_string()));
        Box::pin(async {})
    }));

    dc.on_close(Box::new(move || {
        let _ = tx.send(ChannelEvent::Close);
        Box::pin(async {})
    }));

    ChannelHandle {
        channel: Arc::new(RtcDataChannel { dc }),
        events: rx,
    }
}

pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            log::warn!("Error closing data channel: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_servers_get_schemes_and_credentials() {
        let servers = vec![
            ServerConfig::stun("s", "stun.example.org:3478"),
            ServerConfig::turn("t", "turn.example.org:3478", "user", "secret"),
        ];
        let rtc = get_user_ice_servers(&servers);
        assert_eq!(rtc[0].urls, vec!["stun:stun.example.org:3478".to_string()]);
        assert!(rtc[0].username.is_empty());
        assert_eq!(rtc[1].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(rtc[1].username, "user");
        assert_eq!(rtc[1].credential, "secret");
    }

    #[test]
    fn connection_config_keeps_bundle_settings() {
        let config = rtc_config(&crate::config::default_ice_servers());
        assert_eq!(config.ice_servers.len(), 3);
        assert_eq!(config.bundle_policy, RTCBundlePolicy::MaxBundle);
        assert_eq!(config.rtcp_mux_policy, RTCRtcpMuxPolicy::Require);
    }

    #[tokio::test]
    async fn offer_has_application_section() {
        let (transport, _events) = RtcTransportFactory::new().create(&[]).await.unwrap();
        transport.create_data_channel("messages", true).await.unwrap();
        let offer = transport.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=application"));
        transport.close().await;
    }
}
