//! Storage collaborator boundary.
//!
//! The scheduler knows nothing about persistence. A store exposes ordinary
//! async functions (used from sagas through `call`) and, optionally, a
//! channel of [`ValueChange`] records for watched keys.
//!
//! ```ignore
//! let store = Arc::new(MemoryStore::new());
//! let changes = store.watch(&["session"]).await?;
//!
//! scheduler.run_saga(move |ctx| async move {
//!     while let Some(change) = ctx.take_channel(&changes).await? {
//!         let change = ValueChange::try_from(change)?;
//!         ctx.put(Action::new("store/CHANGED").with_payload(change.key)).await?;
//!     }
//!     Ok(Value::Null)
//! })?;
//! ```

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::channel::Channel;
use crate::sync::lock;

/// One observed change of a stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl ValueChange {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl TryFrom<Value> for ValueChange {
    type Error = serde_json::Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        serde_json::from_value(value)
    }
}

/// Key/value storage a saga can call into.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Channel emitting a serialised [`ValueChange`] whenever one of `keys`
    /// changes. An empty slice watches every key.
    async fn watch(&self, keys: &[&str]) -> Result<Channel<Value>>;
}

struct Watcher {
    keys: HashSet<String>,
    channel: Channel<Value>,
}

impl Watcher {
    fn wants(&self, key: &str) -> bool {
        self.keys.is_empty() || self.keys.contains(key)
    }
}

/// In-process [`KeyValueStore`].
#[derive(Default)]
pub struct MemoryStore {
    values: DashMap<String, Value>,
    watchers: Mutex<Vec<Watcher>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn emit(&self, key: &str, old_value: Option<Value>, new_value: Option<Value>) {
        if old_value == new_value {
            return;
        }
        let change = ValueChange {
            key: key.to_string(),
            old_value,
            new_value,
            timestamp: Utc::now(),
        }
        .to_value();

        let mut watchers = lock(&self.watchers);
        watchers.retain(|watcher| !watcher.channel.is_closed());
        for watcher in watchers.iter().filter(|w| w.wants(key)) {
            watcher.channel.put(change.clone());
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        if key.is_empty() {
            anyhow::bail!("store key must not be empty");
        }
        let old = self.values.insert(key.to_string(), value.clone());
        self.emit(key, old, Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match self.values.remove(key) {
            Some((_, old)) => self.emit(key, Some(old), None),
            None => debug!(key, "remove of missing key"),
        }
        Ok(())
    }

    async fn watch(&self, keys: &[&str]) -> Result<Channel<Value>> {
        let channel = Channel::new();
        lock(&self.watchers).push(Watcher {
            keys: keys.iter().map(|k| k.to_string()).collect(),
            channel: channel.clone(),
        });
        Ok(channel)
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        for watcher in lock(&self.watchers).drain(..) {
            watcher.channel.close();
        }
    }
}
