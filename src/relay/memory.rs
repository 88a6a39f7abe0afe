//! In-memory relay store
//!
//! Holds values in a flat, path-ordered map and fans change notifications out
//! to listeners over unbounded channels. Two sessions sharing one
//! `Arc<MemoryRelay>` can negotiate with each other inside a single process.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::{ChangeStream, RelayChange, RelayStore, SubscriptionId};
use crate::error::RelayError;
use crate::utils::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchKind {
    Value,
    Children,
}

struct Watcher {
    path: String,
    kind: WatchKind,
    tx: mpsc::UnboundedSender<RelayChange>,
}

#[derive(Default)]
struct Inner {
    values: BTreeMap<String, Value>,
    watchers: HashMap<SubscriptionId, Watcher>,
    push_counter: u64,
}

pub struct MemoryRelay {
    inner: Mutex<Inner>,
    available: AtomicBool,
    next_id: AtomicU64,
}

impl MemoryRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulate the relay going offline (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live listeners.
    pub fn listener_count(&self) -> usize {
        self.state().watchers.len()
    }

    /// Whether anything is stored at or below `path`.
    pub fn contains(&self, path: &str) -> bool {
        let path = normalize(path);
        subtree(&self.state().values, &path).is_some()
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> Result<(), RelayError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RelayError::Unavailable("memory relay is offline".into()))
        }
    }

    fn watch(&self, path: &str, kind: WatchKind) -> (SubscriptionId, ChangeStream) {
        let path = normalize(path);
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut inner = self.state();
        match kind {
            WatchKind::Value => {
                let _ = tx.send(RelayChange::Value(subtree(&inner.values, &path)));
            }
            WatchKind::Children => {
                for (key, value) in children(&inner.values, &path) {
                    let _ = tx.send(RelayChange::ChildAdded { key, value });
                }
            }
        }
        inner.watchers.insert(id, Watcher { path, kind, tx });
        (id, rx)
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
        }
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn split_parent(path: &str) -> Option<(&str, &str)> {
    path.rsplit_once('/')
}

/// Value at `path`, assembling an object from descendants when `path` itself
/// holds nothing.
fn subtree(values: &BTreeMap<String, Value>, path: &str) -> Option<Value> {
    if let Some(v) = values.get(path) {
        return Some(v.clone());
    }

    let prefix = format!("{path}/");
    let mut root = Map::new();
    for (key, value) in values.range(prefix.clone()..) {
        let Some(rest) = key.strip_prefix(&prefix) else {
            break;
        };
        insert_nested(&mut root, rest, value.clone());
    }
    (!root.is_empty()).then_some(Value::Object(root))
}

fn insert_nested(root: &mut Map<String, Value>, rel: &str, value: Value) {
    match rel.split_once('/') {
        None => {
            root.insert(rel.to_string(), value);
        }
        Some((head, tail)) => {
            let entry = root
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(child) = entry {
                insert_nested(child, tail, value);
            }
        }
    }
}

fn children(values: &BTreeMap<String, Value>, path: &str) -> Vec<(String, Value)> {
    match subtree(values, path) {
        Some(Value::Object(map)) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        }
        _ => Vec::new(),
    }
}

impl Inner {
    fn notify(&mut self, path: &str, kind: WatchKind, change: RelayChange) {
        self.watchers.retain(|_, w| {
            if w.path != path || w.kind != kind {
                return true;
            }
            w.tx.send(change.clone()).is_ok()
        });
    }

    fn write(&mut self, path: String, value: Value) {
        let is_new_child = subtree(&self.values, &path).is_none();
        self.values.insert(path.clone(), value.clone());

        self.notify(&path, WatchKind::Value, RelayChange::Value(Some(value.clone())));
        if is_new_child {
            if let Some((parent, key)) = split_parent(&path) {
                let change = RelayChange::ChildAdded {
                    key: key.to_string(),
                    value,
                };
                self.notify(parent, WatchKind::Children, change);
            }
        }
    }
}

#[async_trait]
impl RelayStore for MemoryRelay {
    async fn put(&self, path: &str, value: Value) -> Result<(), RelayError> {
        self.ensure_available()?;
        self.state().write(normalize(path), value);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Value>, RelayError> {
        self.ensure_available()?;
        Ok(subtree(&self.state().values, &normalize(path)))
    }

    async fn append(&self, path: &str, value: Value) -> Result<String, RelayError> {
        self.ensure_available()?;
        let mut inner = self.state();
        inner.push_counter += 1;
        // Lexicographic order follows insertion order.
        let key = format!("-{:012x}{:08x}", now_millis().max(0), inner.push_counter);
        inner.write(format!("{}/{}", normalize(path), key), value);
        Ok(key)
    }

    async fn subscribe_value(
        &self,
        path: &str,
    ) -> Result<(SubscriptionId, ChangeStream), RelayError> {
        self.ensure_available()?;
        Ok(self.watch(path, WatchKind::Value))
    }

    async fn subscribe_children(
        &self,
        path: &str,
    ) -> Result<(SubscriptionId, ChangeStream), RelayError> {
        self.ensure_available()?;
        Ok(self.watch(path, WatchKind::Children))
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.state().watchers.remove(&id);
    }

    async fn delete(&self, path: &str) -> Result<(), RelayError> {
        self.ensure_available()?;
        let path = normalize(path);
        let prefix = format!("{path}/");

        let mut inner = self.state();
        inner
            .values
            .retain(|key, _| key != &path && !key.starts_with(&prefix));

        let affected: BTreeSet<String> = inner
            .watchers
            .values()
            .filter(|w| w.kind == WatchKind::Value)
            .filter(|w| w.path == path || w.path.starts_with(&prefix))
            .map(|w| w.path.clone())
            .collect();
        for watched in affected {
            inner.notify(&watched, WatchKind::Value, RelayChange::Value(None));
        }
        Ok(())
    }
}
