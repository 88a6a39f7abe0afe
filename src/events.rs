//! Session notifications with any number of independent subscribers.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

use crate::error::SessionError;
use crate::peer::types::ConnectionState;
use crate::transfer::ReceivedFile;

#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Payload of a `message` frame, verbatim.
    Message(String),
    File(ReceivedFile),
    ConnectionState(ConnectionState),
    Error(Arc<SessionError>),
}

pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
    last_state: Mutex<Option<ConnectionState>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            last_state: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn message(&self, text: String) {
        self.publish(SessionEvent::Message(text));
    }

    pub fn file(&self, file: ReceivedFile) {
        self.publish(SessionEvent::File(file));
    }

    pub fn error(&self, err: SessionError) {
        log::error!("Session error: {err}");
        self.publish(SessionEvent::Error(Arc::new(err)));
    }

    /// Publish a connection state unless it repeats the last one delivered.
    /// Returns whether it was published.
    pub fn connection_state(&self, state: ConnectionState) -> bool {
        {
            let mut last = self.last_state.lock().unwrap_or_else(PoisonError::into_inner);
            if *last == Some(state) {
                return false;
            }
            *last = Some(state);
        }
        log::info!("Connection state: {state}");
        self.publish(SessionEvent::ConnectionState(state));
        true
    }

    /// Publish a state from the transport or the channel. A new `failed` or
    /// `disconnected` also raises an error event naming the state.
    pub fn report_connection(&self, state: ConnectionState) {
        if !self.connection_state(state) {
            return;
        }
        match state {
            ConnectionState::Failed => {
                self.error(SessionError::ConnectionFailed(state.to_string()))
            }
            ConnectionState::Disconnected => {
                self.error(SessionError::ConnectionLost(state.to_string()))
            }
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }
    }

    pub fn last_connection_state(&self) -> Option<ConnectionState> {
        *self.last_state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget the last state so the next session starts fresh.
    pub fn reset_connection_state(&self) {
        *self.last_state.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// One subscriber's view of the bus.
pub struct EventStream {
    rx: broadcast::Receiver<SessionEvent>,
}

impl EventStream {
    /// Next event, or `None` once the bus is gone. A subscriber that falls
    /// behind skips the overwritten events.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Event subscriber lagged, skipped {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking poll; `None` when nothing is queued.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_sees_every_event_in_order() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.message("one".into());
        bus.message("two".into());

        for stream in [&mut a, &mut b] {
            for expected in ["one", "two"] {
                match stream.recv().await {
                    Some(SessionEvent::Message(m)) => assert_eq!(m, expected),
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
    }

    #[test]
    fn repeated_connection_state_is_suppressed() {
        let bus = EventBus::new(16);
        let mut s = bus.subscribe();
        assert!(bus.connection_state(ConnectionState::Connected));
        assert!(!bus.connection_state(ConnectionState::Connected));
        assert!(bus.connection_state(ConnectionState::Disconnected));

        assert!(matches!(
            s.try_recv(),
            Some(SessionEvent::ConnectionState(ConnectionState::Connected))
        ));
        assert!(matches!(
            s.try_recv(),
            Some(SessionEvent::ConnectionState(ConnectionState::Disconnected))
        ));
        assert!(s.try_recv().is_none());

        bus.reset_connection_state();
        assert!(bus.connection_state(ConnectionState::Disconnected));
    }

    #[test]
    fn loss_of_connection_raises_error_once() {
        let bus = EventBus::new(16);
        let mut s = bus.subscribe();
        bus.report_connection(ConnectionState::Connected);
        bus.report_connection(ConnectionState::Disconnected);
        bus.report_connection(ConnectionState::Disconnected);

        assert!(matches!(s.try_recv(), Some(SessionEvent::ConnectionState(ConnectionState::Connected))));
        assert!(matches!(
            s.try_recv(),
            Some(SessionEvent::ConnectionState(ConnectionState::Disconnected))
        ));
        match s.try_recv() {
            Some(SessionEvent::Error(e)) => {
                assert!(matches!(*e, SessionError::ConnectionLost(ref st) if st == "disconnected"))
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(s.try_recv().is_none());
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new(1);
        bus.error(SessionError::NoSession);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
