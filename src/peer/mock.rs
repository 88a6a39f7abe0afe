//! In-memory peer transport for tests and same-process demos
//!
//! [`MockNetwork`] hands out transports that find each other through the
//! descriptions they exchange: the offer/answer text names the transport that
//! produced it. Once the initiator applies the answer both sides report
//! `connected`, the joiner receives the initiator's channel and both channel
//! ends open.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::error::TransportError;
use crate::peer::transport::{
    ChannelEvent, ChannelHandle, DataChannel, PeerTransport, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::peer::types::{
    CandidateInit, IceCandidate, PeerConnectionState, SdpKind, SessionDescription,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Registry {
    // description sdp -> transport that set it locally
    by_sdp: HashMap<String, Weak<MockTransport>>,
    transports: Vec<Arc<MockTransport>>,
    rejected: HashSet<String>,
    refused_remote: Option<SdpKind>,
    fail_connection: bool,
}

/// Factory for linked in-memory transports.
pub struct MockNetwork {
    registry: Arc<Mutex<Registry>>,
    fail_init: AtomicBool,
    candidates_per_side: usize,
    next_id: AtomicU64,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following `create` fail until switched back.
    pub fn set_fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    /// Candidates with this text are refused by `add_ice_candidate`.
    pub fn reject_candidate(&self, candidate: impl Into<String>) {
        lock(&self.registry).rejected.insert(candidate.into());
    }

    /// Remote descriptions of this kind are refused by
    /// `set_remote_description`.
    pub fn reject_remote_description(&self, kind: SdpKind) {
        lock(&self.registry).refused_remote = Some(kind);
    }

    /// Linked pairs report `failed` instead of `connected` and their channels
    /// never open.
    pub fn fail_connection(&self, fail: bool) {
        lock(&self.registry).fail_connection = fail;
    }

    /// Every transport created so far, oldest first.
    pub fn transports(&self) -> Vec<Arc<MockTransport>> {
        lock(&self.registry).transports.clone()
    }
}

impl Default for MockNetwork {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            fail_init: AtomicBool::new(false),
            candidates_per_side: 3,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl TransportFactory for MockNetwork {
    async fn create(
        &self,
        ice_servers: &[ServerConfig],
    ) -> Result<(Arc<dyn PeerTransport>, TransportEvents), TransportError> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(TransportError::InitFailed("mock network refused".into()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        log::debug!("Mock transport {id} created with {} ICE servers", ice_servers.len());

        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new_cyclic(|me| MockTransport {
            id,
            me: me.clone(),
            registry: self.registry.clone(),
            candidates_per_side: self.candidates_per_side,
            events: tx,
            state: Mutex::new(PeerState::default()),
        });
        lock(&self.registry).transports.push(transport.clone());
        Ok((transport, rx))
    }
}

#[derive(Default)]
struct PeerState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_sets: usize,
    applied: Vec<String>,
    channel: Option<Arc<MockChannel>>,
    peer: Option<Weak<MockTransport>>,
    closed: bool,
}

pub struct MockTransport {
    id: u64,
    me: Weak<MockTransport>,
    registry: Arc<Mutex<Registry>>,
    candidates_per_side: usize,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<PeerState>,
}

impl MockTransport {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote candidates accepted so far, in the order they were added.
    pub fn applied_candidates(&self) -> Vec<String> {
        lock(&self.state).applied.clone()
    }

    /// How many times a remote description was successfully applied.
    pub fn remote_description_sets(&self) -> usize {
        lock(&self.state).remote_sets
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Candidate lines this transport announces.
    pub fn local_candidate_lines(&self) -> Vec<String> {
        (0..self.candidates_per_side)
            .map(|n| {
                format!(
                    "candidate:{n} 1 udp 2122260223 10.0.{}.{} {} typ host",
                    self.id,
                    n + 1,
                    50000 + n
                )
            })
            .collect()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&self, state: PeerConnectionState) {
        self.emit(TransportEvent::ConnectionState(state));
    }

    fn ensure_live(&self) -> Result<(), TransportError> {
        if lock(&self.state).closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn find(&self, sdp: &str) -> Option<Arc<MockTransport>> {
        lock(&self.registry).by_sdp.get(sdp).and_then(Weak::upgrade)
    }

    /// Both descriptions are known on both sides: open the link.
    fn connect(&self, joiner: &MockTransport) {
        log::debug!("Mock transports {} and {} connected", self.id, joiner.id);

        for side in [self, joiner] {
            side.emit_state(PeerConnectionState::Connecting);
        }

        if lock(&self.registry).fail_connection {
            for side in [self, joiner] {
                side.emit_state(PeerConnectionState::Failed);
            }
            return;
        }

        let channel = lock(&self.state).channel.clone();
        if let Some(local) = channel {
            let (remote, events) = MockChannel::new(local.label());
            MockChannel::link(&local, &remote);
            lock(&joiner.state).channel = Some(remote.clone());
            local.open();
            remote.open();
            joiner.emit(TransportEvent::DataChannel(ChannelHandle {
                channel: remote,
                events,
            }));
        }

        for side in [self, joiner] {
            side.emit_state(PeerConnectionState::Connected);
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_live()?;
        Ok(SessionDescription::offer(format!("mock-offer-{}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        self.ensure_live()?;
        if lock(&self.state).remote.is_none() {
            return Err(TransportError::Negotiation("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!("mock-answer-{}", self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.ensure_live()?;
        lock(&self.registry)
            .by_sdp
            .insert(desc.sdp.clone(), self.me.clone());
        lock(&self.state).local = Some(desc);

        // Gathering starts once a local description exists.
        for (n, line) in self.local_candidate_lines().into_iter().enumerate() {
            self.emit(TransportEvent::LocalCandidate(CandidateInit {
                candidate: line,
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            }));
            log::trace!("Mock transport {} gathered candidate {n}", self.id);
        }
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.ensure_live()?;
        if lock(&self.registry).refused_remote == Some(desc.kind) {
            return Err(TransportError::Negotiation(format!(
                "{:?} description refused",
                desc.kind
            )));
        }
        {
            let state = lock(&self.state);
            if state.remote.is_some() {
                return Err(TransportError::Negotiation(
                    "remote description already set".into(),
                ));
            }
            let expected = if state.local.is_some() {
                SdpKind::Answer
            } else {
                SdpKind::Offer
            };
            if desc.kind != expected {
                return Err(TransportError::Negotiation(format!(
                    "unexpected {:?} description",
                    desc.kind
                )));
            }
        }

        let Some(author) = self.find(&desc.sdp) else {
            return Err(TransportError::Negotiation(format!("unknown description {}", desc.sdp)));
        };

        let kind = desc.kind;
        {
            let mut state = lock(&self.state);
            state.remote = Some(desc);
            state.remote_sets += 1;
            state.peer = Some(Arc::downgrade(&author));
        }

        if kind == SdpKind::Answer {
            lock(&author.state).peer = Some(self.me.clone());
            self.connect(&author);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        self.ensure_live()?;
        if lock(&self.registry).rejected.contains(&candidate.candidate) {
            return Err(TransportError::Candidate(candidate.candidate.clone()));
        }
        let mut state = lock(&self.state);
        if state.remote.is_none() {
            return Err(TransportError::Candidate(
                "remote description not set".into(),
            ));
        }
        state.applied.push(candidate.candidate.clone());
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        ordered: bool,
    ) -> Result<ChannelHandle, TransportError> {
        self.ensure_live()?;
        if !ordered {
            return Err(TransportError::InitFailed("mock channels are ordered".into()));
        }
        let (channel, events) = MockChannel::new(label);
        lock(&self.state).channel = Some(channel.clone());
        Ok(ChannelHandle { channel, events })
    }

    async fn close(&self) {
        let (channel, peer) = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            (state.channel.take(), state.peer.take())
        };
        if let Some(channel) = channel {
            channel.close().await;
        }
        self.emit_state(PeerConnectionState::Closed);
        if let Some(peer) = peer.and_then(|p| p.upgrade()) {
            peer.emit_state(PeerConnectionState::Disconnected);
        }
    }
}

/// One end of an in-memory channel pair.
pub struct MockChannel {
    label: String,
    open: AtomicBool,
    events: mpsc::UnboundedSender<ChannelEvent>,
    peer: Mutex<Weak<MockChannel>>,
}

impl MockChannel {
    fn new(label: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            events: tx,
            peer: Mutex::new(Weak::new()),
        });
        (channel, rx)
    }

    fn link(a: &Arc<Self>, b: &Arc<Self>) {
        *lock(&a.peer) = Arc::downgrade(b);
        *lock(&b.peer) = Arc::downgrade(a);
    }

    fn open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ChannelEvent::Open);
        }
    }

    fn shut(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(ChannelEvent::Close);
        }
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen);
        }
        let peer = lock(&self.peer).upgrade().ok_or(TransportError::Closed)?;
        peer.events
            .send(ChannelEvent::Message(Bytes::from(text)))
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Closing either end closes both.
    async fn close(&self) {
        self.shut();
        let peer = lock(&self.peer).upgrade();
        if let Some(peer) = peer {
            peer.shut();
        }
    }
}
