//! Typed access to the relay records of one session.
//!
//! Layout:
//! - `sessions/{id}/offer`  `{type, sdp, timestamp}`
//! - `sessions/{id}/answer` `{type, sdp, timestamp}`
//! - `sessions/{id}/candidates/{auto-key}` `{candidate, sdpMid, sdpMLineIndex, from, timestamp}`

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::RelayError;
use crate::peer::types::{IceCandidate, SdpKind, SessionDescription};
use crate::relay::{RelayChange, RelayStore, Subscription};
use crate::utils::now_millis;

/// Session description as written to the relay.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SdpPayload {
    #[serde(flatten)]
    pub sdp: SessionDescription,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Clone)]
pub struct RelayClient {
    store: Arc<dyn RelayStore>,
}

pub fn session_path(id: &str) -> String {
    format!("sessions/{id}")
}

fn description_path(id: &str, kind: SdpKind) -> String {
    match kind {
        SdpKind::Offer => format!("sessions/{id}/offer"),
        SdpKind::Answer => format!("sessions/{id}/answer"),
    }
}

fn candidates_path(id: &str) -> String {
    format!("sessions/{id}/candidates")
}

impl RelayClient {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self { store }
    }

    /// Publish this side's description. Republishing overwrites.
    pub async fn publish_description(
        &self,
        id: &str,
        desc: &SessionDescription,
    ) -> Result<(), RelayError> {
        let record = SdpPayload {
            sdp: desc.clone(),
            timestamp: Some(now_millis()),
        };
        let value = serde_json::to_value(&record)?;
        self.store.put(&description_path(id, desc.kind), value).await
    }

    /// Fetch the offer for `id`; `Ok(None)` when the session does not exist
    /// or the record is unreadable.
    pub async fn fetch_offer(&self, id: &str) -> Result<Option<SessionDescription>, RelayError> {
        let value = self.store.get(&description_path(id, SdpKind::Offer)).await?;
        Ok(value.and_then(|v| parse_description(v, SdpKind::Offer)))
    }

    pub async fn subscribe_answer(&self, id: &str) -> Result<Subscription, RelayError> {
        let path = description_path(id, SdpKind::Answer);
        let handle = self.store.subscribe_value(&path).await?;
        Ok(Subscription::new(self.store.clone(), path, handle))
    }

    pub async fn append_candidate(
        &self,
        id: &str,
        candidate: &IceCandidate,
    ) -> Result<String, RelayError> {
        let value = serde_json::to_value(candidate)?;
        self.store.append(&candidates_path(id), value).await
    }

    pub async fn subscribe_candidates(&self, id: &str) -> Result<Subscription, RelayError> {
        let path = candidates_path(id);
        let handle = self.store.subscribe_children(&path).await?;
        Ok(Subscription::new(self.store.clone(), path, handle))
    }

    /// Remove the whole session record.
    pub async fn delete_session(&self, id: &str) -> Result<(), RelayError> {
        self.store.delete(&session_path(id)).await
    }
}

pub fn parse_description(value: serde_json::Value, expected: SdpKind) -> Option<SessionDescription> {
    match serde_json::from_value::<SdpPayload>(value) {
        Ok(payload) if payload.sdp.kind == expected => Some(payload.sdp),
        Ok(payload) => {
            log::warn!(
                "Ignoring description of type {:?}, expected {:?}",
                payload.sdp.kind,
                expected
            );
            None
        }
        Err(e) => {
            log::warn!("Unreadable description record: {e}");
            None
        }
    }
}

/// Decode a candidate notification; anything else on the stream is dropped.
pub fn parse_candidate(change: RelayChange) -> Option<IceCandidate> {
    match change {
        RelayChange::ChildAdded { key, value } => match serde_json::from_value(value) {
            Ok(candidate) => Some(candidate),
            Err(e) => {
                log::warn!("Unreadable candidate record {key}: {e}");
                None
            }
        },
        RelayChange::Value(_) => None,
    }
}
