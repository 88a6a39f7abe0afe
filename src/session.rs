//! Public session API.
//!
//! [`PeerSession`] runs at most one session at a time. Setup (`initiate`,
//! `join`) happens inline and reports failures to the caller. Once set up, a
//! driver task owns the relay subscriptions, the candidate buffer and the
//! inbound side of the channel, and handles their events one at a time.
//! Everything it observes reaches callers through [`PeerSession::subscribe`].

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::error::{ProtocolError, SessionError, TransportError};
use crate::events::{EventBus, EventStream};
use crate::peer::data_channel::{self, ChannelDispatcher};
use crate::peer::ice::CandidateBuffer;
use crate::peer::state::{NegotiationState, SessionState};
use crate::peer::transport::{
    ChannelEvent, ChannelEvents, DataChannel, PeerTransport, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::peer::types::{ConnectionState, IceCandidate, PeerConnectionState, Role, SdpKind};
use crate::relay::{RelayChange, RelayStore, Subscription};
use crate::signaling::{parse_candidate, parse_description, RelayClient};
use crate::transfer::OutgoingFile;
use crate::utils::{generate_session_id, now_millis};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply a transition, logging the ones the state machine refuses.
fn advance(state: &mut SessionState, to: NegotiationState) {
    if let Err(e) = state.advance(to) {
        log::debug!("Session {}: ignoring state change: {e}", state.id());
    }
}

/// State shared between the facade and the driver task.
struct Shared {
    state: Mutex<SessionState>,
    channel: Mutex<Option<Arc<dyn DataChannel>>>,
}

impl Shared {
    fn new(state: SessionState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(state),
            channel: Mutex::new(None),
        })
    }

    fn advance(&self, to: NegotiationState) {
        advance(&mut lock(&self.state), to);
    }

    fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        lock(&self.channel).clone()
    }
}

struct ActiveSession {
    epoch: u64,
    shared: Arc<Shared>,
    transport: Arc<dyn PeerTransport>,
    shutdown: oneshot::Sender<()>,
    driver: JoinHandle<()>,
}

/// One endpoint of a relay-negotiated peer-to-peer session.
pub struct PeerSession {
    config: SessionConfig,
    relay: RelayClient,
    factory: Arc<dyn TransportFactory>,
    bus: Arc<EventBus>,
    active: AsyncMutex<Option<ActiveSession>>,
    epoch: AtomicU64,
}

impl PeerSession {
    /// Validates `config` before anything else is touched.
    pub fn new(
        config: SessionConfig,
        relay: Arc<dyn RelayStore>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let bus = Arc::new(EventBus::new(config.event_capacity));
        Ok(Self {
            config,
            relay: RelayClient::new(relay),
            factory,
            bus,
            active: AsyncMutex::new(None),
            epoch: AtomicU64::new(0),
        })
    }

    /// New independent event subscriber. Events published before the call
    /// are not replayed.
    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Start a session as the initiator and return its identifier.
    pub async fn initiate(&self) -> Result<String, SessionError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(SessionError::SessionActive);
        }

        let id = generate_session_id();
        log::info!("Initiating session {id}");
        self.bus.reset_connection_state();

        let (transport, transport_events) = self.factory.create(&self.config.ice_servers).await?;
        let mut state = SessionState::new(id.clone(), Role::Initiator);
        advance(&mut state, NegotiationState::Offering);

        let setup = async {
            let handle = transport
                .create_data_channel(&self.config.channel_label, true)
                .await
                .map_err(|e| TransportError::InitFailed(e.to_string()))?;
            let offer = transport.create_offer().await?;
            transport.set_local_description(offer.clone()).await?;
            self.relay.publish_description(&id, &offer).await?;

            let answer = self.relay.subscribe_answer(&id).await?;
            let candidates = self.relay.subscribe_candidates(&id).await?;
            Ok::<_, SessionError>((handle, answer, candidates))
        };
        let (handle, answer, candidates) = match setup.await {
            Ok(parts) => parts,
            Err(e) => {
                log::error!("Failed to initiate session {id}: {e}");
                transport.close().await;
                if let Err(del) = self.relay.delete_session(&id).await {
                    log::debug!("Could not remove partial session record: {del}");
                }
                return Err(e);
            }
        };

        advance(&mut state, NegotiationState::AwaitingAnswer);
        let shared = Shared::new(state);
        *lock(&shared.channel) = Some(handle.channel);

        let driver = Driver {
            role: Role::Initiator,
            id: id.clone(),
            relay: self.relay.clone(),
            bus: self.bus.clone(),
            transport: transport.clone(),
            shared: shared.clone(),
            buffer: CandidateBuffer::new(Role::Initiator),
            dispatcher: ChannelDispatcher::new(),
            answer: Some(answer),
            candidates: Some(candidates),
            transport_events: Some(transport_events),
            channel_events: Some(handle.events),
        };
        *active = Some(self.start(driver, shared, transport));
        Ok(id)
    }

    /// Join the session `session_id` published by an initiator.
    pub async fn join(&self, session_id: &str) -> Result<(), SessionError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(SessionError::SessionActive);
        }

        log::info!("Joining session {session_id}");
        let offer = self
            .relay
            .fetch_offer(session_id)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(session_id.to_string()))?;
        self.bus.reset_connection_state();

        let (transport, transport_events) = self.factory.create(&self.config.ice_servers).await?;
        let mut state = SessionState::new(session_id.to_string(), Role::Joiner);
        advance(&mut state, NegotiationState::Answering);
        let mut buffer = CandidateBuffer::new(Role::Joiner);

        let setup = async {
            transport.set_remote_description(offer).await?;
            state.mark_remote_applied();
            buffer.drain(transport.as_ref()).await;

            let answer = transport.create_answer().await?;
            transport.set_local_description(answer.clone()).await?;
            self.relay.publish_description(session_id, &answer).await?;
            Ok::<_, SessionError>(self.relay.subscribe_candidates(session_id).await?)
        };
        let candidates = match setup.await {
            Ok(sub) => sub,
            Err(e) => {
                log::error!("Failed to join session {session_id}: {e}");
                transport.close().await;
                return Err(e);
            }
        };

        let shared = Shared::new(state);
        let driver = Driver {
            role: Role::Joiner,
            id: session_id.to_string(),
            relay: self.relay.clone(),
            bus: self.bus.clone(),
            transport: transport.clone(),
            shared: shared.clone(),
            buffer,
            dispatcher: ChannelDispatcher::new(),
            answer: None,
            candidates: Some(candidates),
            transport_events: Some(transport_events),
            channel_events: None,
        };
        *active = Some(self.start(driver, shared, transport));
        Ok(())
    }

    fn start(
        &self,
        driver: Driver,
        shared: Arc<Shared>,
        transport: Arc<dyn PeerTransport>,
    ) -> ActiveSession {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (shutdown, shutdown_rx) = oneshot::channel();
        let driver = tokio::spawn(driver.run(shutdown_rx));
        ActiveSession {
            epoch,
            shared,
            transport,
            shutdown,
            driver,
        }
    }

    async fn current_channel(&self) -> Option<(u64, Arc<dyn DataChannel>)> {
        let active = self.active.lock().await;
        let session = active.as_ref()?;
        Some((session.epoch, session.shared.channel()?))
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Send a text message.
    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send_payload(Value::String(text.into())).await
    }

    /// Send any serialisable value as the message payload.
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<(), SessionError> {
        let payload = serde_json::to_value(value).map_err(ProtocolError::from)?;
        self.send_payload(payload).await
    }

    async fn send_payload(&self, payload: Value) -> Result<(), SessionError> {
        let (_, channel) = self
            .current_channel()
            .await
            .ok_or(SessionError::ChannelNotOpen)?;
        data_channel::send_message(channel.as_ref(), payload).await
    }

    /// Send a file in chunks. `on_progress` gets the percentage sent after
    /// each chunk.
    ///
    /// Any failure, including a channel that is missing or not open, is
    /// returned and also published as an error event.
    pub async fn send_file<F>(
        &self,
        file: &OutgoingFile,
        on_progress: Option<F>,
    ) -> Result<(), SessionError>
    where
        F: FnMut(u8) + Send,
    {
        let current = self.current_channel().await;
        let epoch = current.as_ref().map(|(epoch, _)| *epoch);
        let result = match current {
            Some((_, channel)) => {
                data_channel::send_file(
                    channel.as_ref(),
                    file,
                    self.config.chunk_delay(),
                    on_progress,
                )
                .await
            }
            None => Err(SessionError::ChannelNotOpen),
        };

        if let Err(e) = &result {
            // A session torn down mid-transfer has already reported its end.
            if epoch.is_none_or(|epoch| self.is_current(epoch)) {
                self.bus.error(SessionError::Transport(TransportError::SendFailed(format!(
                    "file {}: {e}",
                    file.name
                ))));
            }
        }
        result
    }

    /// Tear the session down: stop listening to the relay, close the channel
    /// and the transport, and (initiator only) delete the relay record.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let Some(session) = self.active.lock().await.take() else {
            return Err(SessionError::NoSession);
        };
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let _ = session.shutdown.send(());
        if let Err(e) = session.driver.await {
            log::warn!("Session driver ended abnormally: {e}");
        }

        let channel = lock(&session.shared.channel).take();
        if let Some(channel) = channel {
            channel.close().await;
        }
        session.transport.close().await;

        let (id, delete_record) = {
            let mut state = lock(&session.shared.state);
            advance(&mut state, NegotiationState::Closed);
            (state.id().to_string(), state.take_record_deletion())
        };
        self.bus.connection_state(ConnectionState::Disconnected);

        if delete_record {
            log::info!("Deleting relay record for session {id}");
            self.relay.delete_session(&id).await?;
        }
        log::info!("Session {id} disconnected");
        Ok(())
    }

    pub async fn session_id(&self) -> Option<String> {
        let active = self.active.lock().await;
        let session = active.as_ref()?;
        let id = lock(&session.shared.state).id().to_string();
        Some(id)
    }

    pub async fn role(&self) -> Option<Role> {
        let active = self.active.lock().await;
        let session = active.as_ref()?;
        let role = lock(&session.shared.state).role();
        Some(role)
    }

    pub async fn negotiation_state(&self) -> NegotiationState {
        let active = self.active.lock().await;
        match active.as_ref() {
            Some(session) => lock(&session.shared.state).negotiation(),
            None => NegotiationState::Idle,
        }
    }

    /// Whether the data channel is open right now.
    pub async fn is_connected(&self) -> bool {
        self.current_channel()
            .await
            .is_some_and(|(_, channel)| channel.is_open())
    }

    /// Last connection state delivered to subscribers.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.bus.last_connection_state()
    }
}

async fn next_change(sub: &mut Option<Subscription>) -> Option<RelayChange> {
    match sub {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_transport_event(rx: &mut Option<TransportEvents>) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_channel_event(rx: &mut Option<ChannelEvents>) -> Option<ChannelEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Per-session event loop. Dropping it drops the relay subscriptions.
struct Driver {
    role: Role,
    id: String,
    relay: RelayClient,
    bus: Arc<EventBus>,
    transport: Arc<dyn PeerTransport>,
    shared: Arc<Shared>,
    buffer: CandidateBuffer,
    dispatcher: ChannelDispatcher,
    answer: Option<Subscription>,
    candidates: Option<Subscription>,
    transport_events: Option<TransportEvents>,
    channel_events: Option<ChannelEvents>,
}

impl Driver {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        log::debug!("Driver for session {} ({}) started", self.id, self.role);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                change = next_change(&mut self.answer) => match change {
                    Some(change) => self.on_answer(change).await,
                    None => self.answer = None,
                },
                change = next_change(&mut self.candidates) => match change {
                    Some(change) => self.on_candidate(change).await,
                    None => self.candidates = None,
                },
                event = next_transport_event(&mut self.transport_events) => match event {
                    Some(event) => self.on_transport_event(event).await,
                    None => self.transport_events = None,
                },
                event = next_channel_event(&mut self.channel_events) => match event {
                    Some(event) => self.on_channel_event(event),
                    None => self.channel_events = None,
                },
            }
        }
        self.buffer.clear();
        self.dispatcher.reset();
        log::debug!("Driver for session {} stopped", self.id);
    }

    async fn on_answer(&mut self, change: RelayChange) {
        let RelayChange::Value(Some(value)) = change else {
            return;
        };
        let Some(answer) = parse_description(value, SdpKind::Answer) else {
            return;
        };
        if !lock(&self.shared.state).mark_remote_applied() {
            log::debug!("Answer for session {} already applied, ignoring", self.id);
            return;
        }

        log::info!("Applying answer for session {}", self.id);
        match self.transport.set_remote_description(answer).await {
            Ok(()) => {
                let report = self.buffer.drain(self.transport.as_ref()).await;
                log::debug!(
                    "Buffered candidates: {} applied, {} failed",
                    report.applied,
                    report.failed
                );
            }
            Err(e) => {
                self.shared.advance(NegotiationState::Failed);
                self.bus.error(e.into());
                self.bus.report_connection(ConnectionState::Failed);
            }
        }
    }

    async fn on_candidate(&mut self, change: RelayChange) {
        if let Some(candidate) = parse_candidate(change) {
            self.buffer.offer(candidate, self.transport.as_ref()).await;
        }
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(init) => {
                let candidate = IceCandidate::attributed(init, self.role, now_millis());
                crate::logger::dump_candidate("LOCAL", &candidate);
                if let Err(e) = self.relay.append_candidate(&self.id, &candidate).await {
                    self.bus.error(e.into());
                }
            }
            TransportEvent::ConnectionState(raw) => {
                log::debug!("Peer connection state: {raw:?}");
                match raw {
                    PeerConnectionState::Connected => {
                        self.shared.advance(NegotiationState::Connected)
                    }
                    PeerConnectionState::Failed => self.shared.advance(NegotiationState::Failed),
                    PeerConnectionState::Disconnected | PeerConnectionState::Closed => {
                        self.shared.advance(NegotiationState::Closed)
                    }
                    PeerConnectionState::New | PeerConnectionState::Connecting => {}
                }
                if let Some(state) = raw.translate() {
                    self.bus.report_connection(state);
                }
            }
            TransportEvent::DataChannel(handle) => {
                log::info!("Received data channel '{}'", handle.channel.label());
                let previous = lock(&self.shared.channel).replace(handle.channel);
                if previous.is_some() {
                    log::warn!("Replacing an existing data channel");
                }
                self.channel_events = Some(handle.events);
            }
        }
    }

    fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => self.shared.advance(NegotiationState::Connected),
            ChannelEvent::Close => self.shared.advance(NegotiationState::Closed),
            ChannelEvent::Message(_) | ChannelEvent::Error(_) => {}
        }
        if !self.dispatcher.on_event(event, &self.bus) {
            log::debug!("Channel for session {} is closed", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionEvent;
    use crate::peer::mock::MockNetwork;
    use crate::relay::memory::MemoryRelay;
    use std::time::Duration;
    use tokio::time::timeout;

    fn session(relay: &Arc<MemoryRelay>, net: &Arc<MockNetwork>) -> PeerSession {
        let config = SessionConfig {
            chunk_delay_ms: 0,
            ..Default::default()
        };
        PeerSession::new(config, relay.clone(), net.clone()).unwrap()
    }

    async fn wait_connected(s: &PeerSession) {
        timeout(Duration::from_secs(5), async {
            while !s.is_connected().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session never connected");
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_up_front() {
        let config = SessionConfig {
            event_capacity: 0,
            ..Default::default()
        };
        let result = PeerSession::new(config, MemoryRelay::new(), MockNetwork::new());
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[test]
    fn refused_transition_leaves_state_alone() {
        let mut state = SessionState::new("abc".into(), Role::Joiner);
        advance(&mut state, NegotiationState::Offering);
        assert_eq!(state.negotiation(), NegotiationState::Idle);
        advance(&mut state, NegotiationState::Answering);
        advance(&mut state, NegotiationState::Closed);
        advance(&mut state, NegotiationState::Connected);
        assert_eq!(state.negotiation(), NegotiationState::Closed);
    }

    #[tokio::test]
    async fn second_initiate_is_refused() {
        let relay = MemoryRelay::new();
        let net = MockNetwork::new();
        let a = session(&relay, &net);
        a.initiate().await.unwrap();
        assert!(matches!(a.initiate().await, Err(SessionError::SessionActive)));
        assert!(matches!(a.join("x").await, Err(SessionError::SessionActive)));
        a.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn initiate_publishes_offer_and_state() {
        let relay = MemoryRelay::new();
        let net = MockNetwork::new();
        let a = session(&relay, &net);
        let id = a.initiate().await.unwrap();

        assert!(relay.contains(&format!("sessions/{id}/offer")));
        assert_eq!(a.session_id().await.as_deref(), Some(id.as_str()));
        assert_eq!(a.role().await, Some(Role::Initiator));
        assert_eq!(a.negotiation_state().await, NegotiationState::AwaitingAnswer);
        assert!(!a.is_connected().await);
        assert!(matches!(
            a.send_message("too early").await,
            Err(SessionError::ChannelNotOpen)
        ));
        a.disconnect().await.unwrap();
        assert_eq!(a.negotiation_state().await, NegotiationState::Idle);
    }

    #[tokio::test]
    async fn relay_outage_fails_setup() {
        let relay = MemoryRelay::new();
        let net = MockNetwork::new();
        let a = session(&relay, &net);
        relay.set_available(false);
        assert!(matches!(
            a.initiate().await,
            Err(SessionError::RelayUnavailable(_))
        ));
        assert!(net.transports()[0].is_closed());
        assert!(matches!(a.join("abc").await, Err(SessionError::RelayUnavailable(_))));
    }

    #[tokio::test]
    async fn transport_init_failure_surfaces() {
        let relay = MemoryRelay::new();
        let net = MockNetwork::new();
        net.set_fail_init(true);
        let a = session(&relay, &net);
        assert!(matches!(
            a.initiate().await,
            Err(SessionError::TransportInitFailed(_))
        ));
        assert!(a.session_id().await.is_none());
    }

    #[tokio::test]
    async fn both_sides_connect_and_local_candidates_reach_relay() {
        let relay = MemoryRelay::new();
        let net = MockNetwork::new();
        let a = session(&relay, &net);
        let b = session(&relay, &net);

        let id = a.initiate().await.unwrap();
        b.join(&id).await.unwrap();
        wait_connected(&a).await;
        wait_connected(&b).await;

        assert_eq!(a.negotiation_state().await, NegotiationState::Connected);
        assert_eq!(b.role().await, Some(Role::Joiner));

        // Candidate appends run on the drivers; give them a moment.
        let path = format!("sessions/{id}/candidates");
        let counts = timeout(Duration::from_secs(5), async {
            loop {
                let records = relay.get(&path).await.unwrap().unwrap_or_default();
                let count = |role: &str| {
                    records
                        .as_object()
                        .map(|m| m.values().filter(|c| c["from"] == role).count())
                        .unwrap_or(0)
                };
                let counts = (count("initiator"), count("caller"));
                if counts == (3, 3) {
                    return counts;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("candidates never reached the relay");
        assert_eq!(counts, (3, 3));

        a.disconnect().await.unwrap();
        b.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn file_without_session_fails() {
        let relay = MemoryRelay::new();
        let net = MockNetwork::new();
        let a = session(&relay, &net);
        let mut events = a.subscribe();
        let file = OutgoingFile::new("f", "", vec![0u8; 10]);

        assert!(matches!(
            a.send_file(&file, None::<fn(u8)>).await,
            Err(SessionError::ChannelNotOpen)
        ));
        assert!(matches!(
            events.try_recv(),
            Some(SessionEvent::Error(e))
                if matches!(&*e, SessionError::Transport(TransportError::SendFailed(msg)) if msg.starts_with("file f:"))
        ));
        assert!(events.try_recv().is_none());
        assert!(matches!(a.disconnect().await, Err(SessionError::NoSession)));
    }

    #[tokio::test]
    async fn disconnect_is_reported_without_error_event() {
        let relay = MemoryRelay::new();
        let net = MockNetwork::new();
        let a = session(&relay, &net);
        a.initiate().await.unwrap();
        let mut events = a.subscribe();
        a.disconnect().await.unwrap();

        let first = timeout(Duration::from_secs(1), events.recv()).await.unwrap();
        assert!(matches!(
            first,
            Some(SessionEvent::ConnectionState(ConnectionState::Disconnected))
        ));
        assert!(events.try_recv().is_none());
    }
}
