//! Shared setup for the in-process session tests.

#![allow(dead_code)]

use peerlink::{
    ConnectionState, EventStream, MemoryRelay, MockNetwork, PeerSession, SessionConfig,
    SessionEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

pub const WAIT: Duration = Duration::from_secs(5);

pub struct Pair {
    pub relay: Arc<MemoryRelay>,
    pub net: Arc<MockNetwork>,
    pub initiator: PeerSession,
    pub joiner: PeerSession,
}

pub fn config() -> SessionConfig {
    SessionConfig {
        chunk_delay_ms: 0,
        event_capacity: 1024,
        ..Default::default()
    }
}

pub fn endpoint(relay: &Arc<MemoryRelay>, net: &Arc<MockNetwork>) -> PeerSession {
    PeerSession::new(config(), relay.clone(), net.clone()).expect("valid config")
}

pub fn pair() -> Pair {
    peerlink::logger::init();
    let relay = MemoryRelay::new();
    let net = MockNetwork::new();
    Pair {
        initiator: endpoint(&relay, &net),
        joiner: endpoint(&relay, &net),
        relay,
        net,
    }
}

/// Wait for the first event matching `pred`.
pub async fn next_matching<F>(events: &mut EventStream, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(ev) if pred(&ev) => return ev,
                Some(_) => continue,
                None => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn wait_for_state(events: &mut EventStream, state: ConnectionState) {
    next_matching(events, |ev| matches!(ev, SessionEvent::ConnectionState(s) if *s == state)).await;
}

pub async fn wait_connected(session: &PeerSession) {
    timeout(WAIT, async {
        while !session.is_connected().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session never connected");
}

/// Everything already queued on `events`, without waiting.
pub fn drain(events: &mut EventStream) -> Vec<SessionEvent> {
    std::iter::from_fn(|| events.try_recv()).collect()
}
