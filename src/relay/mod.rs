//! Relay store abstraction
//!
//! The relay is a shared key/value store both endpoints can reach. It is only
//! used to exchange session descriptions and candidates. Paths are
//! `/`-separated; values are JSON.
//! Implementations:
//! - [`memory::MemoryRelay`] (in-process, tests and same-host demos)
//! - anything else that honours the [`RelayStore`] contract

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::RelayError;

pub type SubscriptionId = u64;

pub type ChangeStream = mpsc::UnboundedReceiver<RelayChange>;

/// One change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayChange {
    /// Current value at a watched path; `None` once deleted.
    Value(Option<Value>),
    /// New direct child under a watched path.
    ChildAdded { key: String, value: Value },
}

#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn put(&self, path: &str, value: Value) -> Result<(), RelayError>;

    async fn get(&self, path: &str) -> Result<Option<Value>, RelayError>;

    /// Store `value` under a generated, time-ordered child key of `path`.
    async fn append(&self, path: &str, value: Value) -> Result<String, RelayError>;

    /// Watch the value at `path`. The current value is delivered first.
    async fn subscribe_value(&self, path: &str)
        -> Result<(SubscriptionId, ChangeStream), RelayError>;

    /// Watch children added under `path`. Existing children are delivered
    /// first, in key order.
    async fn subscribe_children(
        &self,
        path: &str,
    ) -> Result<(SubscriptionId, ChangeStream), RelayError>;

    fn unsubscribe(&self, id: SubscriptionId);

    /// Remove `path` and everything below it.
    async fn delete(&self, path: &str) -> Result<(), RelayError>;
}

/// A live relay listener. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    path: String,
    store: Arc<dyn RelayStore>,
    changes: ChangeStream,
}

impl Subscription {
    pub fn new(
        store: Arc<dyn RelayStore>,
        path: String,
        (id, changes): (SubscriptionId, ChangeStream),
    ) -> Self {
        Self {
            id,
            path,
            store,
            changes,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Next change, or `None` once the store drops the listener.
    pub async fn recv(&mut self) -> Option<RelayChange> {
        self.changes.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        log::debug!("Unsubscribing relay listener {} on {}", self.id, self.path);
        self.store.unsubscribe(self.id);
    }
}
