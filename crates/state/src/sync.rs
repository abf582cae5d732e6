// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 DbPilot Contributors
//
// This file is part of DbPilot.
//
// DbPilot is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// DbPilot is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with DbPilot. If not, see <https://www.gnu.org/licenses/>.

//! Versioned replicated key-value state with change notifications.
//!
//! Each key holds a JSON blob `StateEntry { value, version, updated_at }` at
//! `state:{ns}:{key}`. The blob is the single authoritative record: writes
//! compare-and-swap the whole blob against the exact bytes previously read,
//! so the version inside can never move backwards. A plain-integer mirror at
//! `state:{ns}:{key}:ver` is maintained best-effort for operator
//! introspection only.
//!
//! Change events go out on the namespace channel `state:{ns}:events`; every
//! instance's listener applies them to its local read cache and fans them
//! out to registered handlers.

use crate::{StateError, StateResult};
use chrono::{DateTime, Utc};
use dbpilot_store::CoordinationStore;
use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// State synchronization configuration.
///
/// ## Environment Variables (`StateConfig::from_env`)
/// - `DBPILOT_STATE_CACHE_TTL_MS` (default 5000)
/// - `DBPILOT_STATE_KEY_TTL_SECS` (default: no TTL)
/// - `DBPILOT_STATE_CAS_RETRIES` (default 16)
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// How long a locally cached read stays fresh.
    pub local_cache_ttl: Duration,
    /// Optional TTL applied to every written entry.
    pub default_key_ttl: Option<Duration>,
    /// Retry budget for unguarded writes losing the compare-and-set race.
    pub cas_retries: u32,
    /// Base pause between those retries (jittered).
    pub retry_interval: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            local_cache_ttl: Duration::from_secs(5),
            default_key_ttl: None,
            cas_retries: 16,
            retry_interval: Duration::from_millis(10),
        }
    }
}

impl StateConfig {
    /// Create configuration from environment variables, falling back to
    /// defaults for unset or unparsable values.
    pub fn from_env() -> Self {
        fn env_u64(name: &str) -> Option<u64> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }
        let defaults = Self::default();
        Self {
            local_cache_ttl: env_u64("DBPILOT_STATE_CACHE_TTL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.local_cache_ttl),
            default_key_ttl: env_u64("DBPILOT_STATE_KEY_TTL_SECS")
                .map(Duration::from_secs)
                .or(defaults.default_key_ttl),
            cas_retries: env_u64("DBPILOT_STATE_CAS_RETRIES")
                .map(|v| v as u32)
                .unwrap_or(defaults.cas_retries),
            ..defaults
        }
    }
}

/// The persisted record for one state key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    /// Application value
    pub value: serde_json::Value,
    /// Monotonic version, starts at 1 on first write
    pub version: u64,
    /// When this version was written
    pub updated_at: DateTime<Utc>,
}

/// A change notification delivered to subscribers on every instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChange {
    /// Key that changed (without the namespace prefix)
    pub key: String,
    /// Version after the change (the deleted version for deletions)
    pub version: u64,
    /// New value; `None` for deletions
    pub value: Option<serde_json::Value>,
    /// Whether the key was deleted
    #[serde(default)]
    pub deleted: bool,
}

/// Handle returned by [`StateSync::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Change handler: invoked once per observed change, each dispatch in its
/// own task.
pub type ChangeHandler = Arc<dyn Fn(StateChange) -> BoxFuture<'static, ()> + Send + Sync>;

struct CachedEntry {
    value: serde_json::Value,
    version: u64,
    cached_at: Instant,
}

/// Replicated state for one namespace.
///
/// ## Behavior
/// - Writes are versioned; readers see version-monotonic values
/// - Reads are served from a short-lived local cache kept warm by change
///   events from other instances
/// - Guarded writes (`expected_version`) surface conflicts to the caller;
///   unguarded writes retry the swap internally (last writer wins)
pub struct StateSync {
    store: Arc<dyn CoordinationStore>,
    namespace: String,
    config: StateConfig,
    channel: String,
    cache: RwLock<HashMap<String, CachedEntry>>,
    handlers: RwLock<HashMap<SubscriptionId, ChangeHandler>>,
    next_subscription: AtomicU64,
    listener_shutdown: Notify,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StateSync {
    /// Create a state handle for `namespace`. The change listener is not
    /// running until [`StateSync::start`].
    pub fn new(store: Arc<dyn CoordinationStore>, namespace: &str, config: StateConfig) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            config,
            channel: format!("state:{}:events", namespace),
            cache: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
            listener_shutdown: Notify::new(),
            listener_handle: Mutex::new(None),
        }
    }

    /// Namespace this instance serves.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Start the change listener: subscribes to the namespace channel,
    /// applies remote changes to the local cache and fans them out to
    /// registered handlers. Idempotent.
    pub async fn start(self: Arc<Self>) -> StateResult<()> {
        let mut handle = self.listener_handle.lock().await;
        if handle.is_some() {
            return Ok(());
        }

        let mut rx = self.store.subscribe(&self.channel).await?;
        let state = Arc::clone(&self);
        *handle = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = state.listener_shutdown.notified() => break,
                    msg = rx.recv() => {
                        let Some(msg) = msg else {
                            warn!(namespace = %state.namespace, "Change channel closed, listener stopping");
                            break;
                        };
                        match serde_json::from_slice::<StateChange>(&msg.payload) {
                            Ok(change) => state.handle_change(change).await,
                            Err(e) => {
                                warn!(namespace = %state.namespace, error = %e, "Dropping malformed change event");
                            }
                        }
                    }
                }
            }
            debug!(namespace = %state.namespace, "Change listener stopped");
        }));
        Ok(())
    }

    /// Stop the change listener. Already-spawned handler dispatches finish
    /// on their own.
    pub async fn shutdown(&self) {
        self.listener_shutdown.notify_waiters();
        let handle = self.listener_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Write a value.
    ///
    /// With `expected_version`, the write only applies if the stored version
    /// matches; a mismatch is [`StateError::Conflict`] and is never retried
    /// internally. Without it, the write retries the underlying swap until
    /// it lands (last writer wins by version), and transient store errors
    /// are retried within the same budget before being surfaced.
    ///
    /// `expected_version = Some(0)` means "only create", matching a key with
    /// no entry.
    ///
    /// ## Returns
    /// The new version.
    pub async fn set(
        &self,
        key: &str,
        value: serde_json::Value,
        expected_version: Option<u64>,
    ) -> StateResult<u64> {
        for attempt in 0..=self.config.cas_retries {
            match self.try_set_once(key, &value, expected_version).await {
                Ok(Some(version)) => return Ok(version),
                Ok(None) => {
                    debug!(namespace = %self.namespace, key, attempt, "Lost state swap, retrying");
                }
                // Unguarded writes ride out a transient outage within the
                // retry budget; guarded writes surface it (the caller holds
                // a version it may need to re-check anyway)
                Err(StateError::Store(e))
                    if expected_version.is_none() && attempt < self.config.cas_retries =>
                {
                    debug!(namespace = %self.namespace, key, attempt, error = %e, "Store error during set, retrying");
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(jittered(self.config.retry_interval)).await;
        }

        Err(StateError::Contention(key.to_string()))
    }

    /// One write attempt: read, version-check, swap.
    ///
    /// ## Returns
    /// `Ok(None)` when an unguarded write lost the swap to a concurrent
    /// writer and should re-read and try again.
    async fn try_set_once(
        &self,
        key: &str,
        value: &serde_json::Value,
        expected_version: Option<u64>,
    ) -> StateResult<Option<u64>> {
        let blob_key = self.blob_key(key);

        let current_bytes = self.store.get(&blob_key).await?;
        let current_version = match &current_bytes {
            Some(bytes) => serde_json::from_slice::<StateEntry>(bytes)?.version,
            None => 0,
        };

        if let Some(expected) = expected_version {
            if expected != current_version {
                return Err(StateError::Conflict {
                    expected,
                    actual: current_version,
                });
            }
        }

        let entry = StateEntry {
            value: value.clone(),
            version: current_version + 1,
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&entry)?;

        let swapped = self
            .store
            .compare_and_set(
                &blob_key,
                current_bytes.as_deref(),
                bytes,
                self.config.default_key_ttl,
            )
            .await?;

        if swapped {
            self.finish_write(key, &entry).await;
            return Ok(Some(entry.version));
        }

        // Lost the swap: a concurrent writer got in between our read and
        // write. Guarded writes surface that; unguarded writes re-read
        // and try again.
        if let Some(expected) = expected_version {
            let actual = match self.store.get(&blob_key).await? {
                Some(bytes) => serde_json::from_slice::<StateEntry>(&bytes)?.version,
                None => 0,
            };
            return Err(StateError::Conflict { expected, actual });
        }

        Ok(None)
    }

    /// Read a value with its version.
    ///
    /// Served from the local cache when fresh; any doubt costs a store
    /// round-trip, never staleness beyond `local_cache_ttl`.
    pub async fn get(&self, key: &str) -> StateResult<Option<(serde_json::Value, u64)>> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(key) {
                if cached.cached_at.elapsed() < self.config.local_cache_ttl {
                    return Ok(Some((cached.value.clone(), cached.version)));
                }
            }
        }

        match self.store.get(&self.blob_key(key)).await? {
            Some(bytes) => {
                let entry: StateEntry = serde_json::from_slice(&bytes)?;
                self.cache_put(key, entry.value.clone(), entry.version).await;
                Ok(Some((entry.value, entry.version)))
            }
            None => {
                self.cache.write().await.remove(key);
                Ok(None)
            }
        }
    }

    /// Atomically adjust the counter associated with `key`.
    ///
    /// Counters live beside the entry (`:ctr` suffix) and are independent of
    /// `set`'s versioning: increments by many instances never conflict.
    ///
    /// ## Returns
    /// The counter value after the adjustment.
    pub async fn increment(&self, key: &str, delta: i64) -> StateResult<i64> {
        Ok(self
            .store
            .increment(&format!("{}:ctr", self.blob_key(key)), delta)
            .await?)
    }

    /// Delete a key, its version mirror and its cache entry, and notify
    /// subscribers.
    ///
    /// ## Returns
    /// `Ok(true)` if the entry existed.
    pub async fn delete(&self, key: &str) -> StateResult<bool> {
        let blob_key = self.blob_key(key);

        // Grab the dying version for the deletion event
        let version = match self.store.get(&blob_key).await? {
            Some(bytes) => serde_json::from_slice::<StateEntry>(&bytes)?.version,
            None => 0,
        };

        let removed = self.store.delete(&blob_key).await?;
        let _ = self.store.delete(&format!("{}:ver", blob_key)).await;
        self.cache.write().await.remove(key);

        if removed {
            self.publish_change(StateChange {
                key: key.to_string(),
                version,
                value: None,
                deleted: true,
            })
            .await;
        }
        Ok(removed)
    }

    /// Register a change handler for this namespace.
    ///
    /// Handlers run from the listener task's dispatches, never inline with
    /// the writer, and each dispatch gets its own task so one slow handler
    /// cannot starve delivery. Delivery is at-least-once; rapid successive
    /// changes may be observed coalesced to the latest value.
    pub async fn subscribe(&self, handler: ChangeHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().await.insert(id, handler);
        id
    }

    /// Remove a previously registered handler.
    ///
    /// ## Returns
    /// `Ok(true)` if the subscription existed.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers.write().await.remove(&id).is_some()
    }

    fn blob_key(&self, key: &str) -> String {
        format!("state:{}:{}", self.namespace, key)
    }

    /// Post-swap bookkeeping: version mirror, change event, local cache.
    /// The swap already succeeded, so none of these can fail the write.
    async fn finish_write(&self, key: &str, entry: &StateEntry) {
        let mirror = format!("{}:ver", self.blob_key(key));
        if let Err(e) = self
            .store
            .set(
                &mirror,
                entry.version.to_string().into_bytes(),
                dbpilot_store::SetMode::Always,
                self.config.default_key_ttl,
            )
            .await
        {
            warn!(namespace = %self.namespace, key, error = %e, "Version mirror update failed");
        }

        self.cache_put(key, entry.value.clone(), entry.version).await;

        self.publish_change(StateChange {
            key: key.to_string(),
            version: entry.version,
            value: Some(entry.value.clone()),
            deleted: false,
        })
        .await;
    }

    async fn publish_change(&self, change: StateChange) {
        let payload = match serde_json::to_vec(&change) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(namespace = %self.namespace, error = %e, "Could not encode change event");
                return;
            }
        };
        if let Err(e) = self.store.publish(&self.channel, payload).await {
            warn!(namespace = %self.namespace, key = %change.key, error = %e, "Change event publish failed");
        }
    }

    async fn cache_put(&self, key: &str, value: serde_json::Value, version: u64) {
        let mut cache = self.cache.write().await;
        // Never regress: a concurrent event may have brought a newer version
        if let Some(existing) = cache.get(key) {
            if existing.version > version {
                return;
            }
        }
        cache.insert(
            key.to_string(),
            CachedEntry {
                value,
                version,
                cached_at: Instant::now(),
            },
        );
    }

    /// Apply one observed change: cache first, then handler fan-out.
    async fn handle_change(&self, change: StateChange) {
        if change.deleted {
            self.cache.write().await.remove(&change.key);
        } else if let Some(value) = &change.value {
            self.cache_put(&change.key, value.clone(), change.version).await;
        }

        let handlers: Vec<ChangeHandler> =
            self.handlers.read().await.values().cloned().collect();
        for handler in handlers {
            let change = change.clone();
            tokio::spawn(async move {
                handler(change).await;
            });
        }
    }
}

fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbpilot_store::testing::FlakyStore;
    use dbpilot_store::InMemoryStore;
    use tokio::sync::mpsc;

    fn test_state(store: Arc<dyn CoordinationStore>) -> Arc<StateSync> {
        Arc::new(StateSync::new(store, "cluster", StateConfig::default()))
    }

    #[tokio::test]
    async fn test_unguarded_set_rides_out_transient_store_errors() {
        let store = Arc::new(FlakyStore::new());
        let state = test_state(Arc::clone(&store) as _);

        store.fail_next(2);
        let version = state
            .set("leader", serde_json::json!("node-a"), None)
            .await
            .unwrap();
        assert_eq!(version, 1);
        let (value, _) = state.get("leader").await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!("node-a"));
    }

    #[tokio::test]
    async fn test_guarded_set_surfaces_store_errors() {
        let store = Arc::new(FlakyStore::new());
        let state = test_state(Arc::clone(&store) as _);
        state.set("flag", serde_json::json!(1), None).await.unwrap();

        store.fail_next(1);
        assert!(matches!(
            state.set("flag", serde_json::json!(2), Some(1)).await,
            Err(StateError::Store(_))
        ));
    }

    #[tokio::test]
    async fn test_set_get_round_trip_with_versions() {
        let state = test_state(Arc::new(InMemoryStore::new()));

        let v1 = state
            .set("leader", serde_json::json!("node-a"), None)
            .await
            .unwrap();
        assert_eq!(v1, 1);

        let (value, version) = state.get("leader").await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!("node-a"));
        assert_eq!(version, 1);

        let v2 = state
            .set("leader", serde_json::json!("node-b"), None)
            .await
            .unwrap();
        assert_eq!(v2, 2);
        assert!(state.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_expected_version_is_rejected() {
        let state = test_state(Arc::new(InMemoryStore::new()));
        state.set("cfg", serde_json::json!(1), None).await.unwrap();
        state.set("cfg", serde_json::json!(2), None).await.unwrap();

        let err = state
            .set("cfg", serde_json::json!(3), Some(1))
            .await
            .unwrap_err();
        match err {
            StateError::Conflict { expected, actual } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected Conflict, got {other:?}"),
        }

        // Matching version succeeds
        let v3 = state
            .set("cfg", serde_json::json!(3), Some(2))
            .await
            .unwrap();
        assert_eq!(v3, 3);
    }

    #[tokio::test]
    async fn test_expected_version_zero_means_create_only() {
        let state = test_state(Arc::new(InMemoryStore::new()));
        assert_eq!(
            state.set("fresh", serde_json::json!(1), Some(0)).await.unwrap(),
            1
        );
        assert!(matches!(
            state.set("fresh", serde_json::json!(2), Some(0)).await,
            Err(StateError::Conflict { expected: 0, actual: 1 })
        ));
    }

    #[tokio::test]
    async fn test_equal_version_writers_race_one_wins() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
        let a = test_state(Arc::clone(&store));
        let b = test_state(Arc::clone(&store));
        a.set("slot", serde_json::json!("base"), None).await.unwrap();

        let (ra, rb) = tokio::join!(
            a.set("slot", serde_json::json!("from-a"), Some(1)),
            b.set("slot", serde_json::json!("from-b"), Some(1)),
        );
        let winners = [ra.is_ok(), rb.is_ok()].iter().filter(|w| **w).count();
        assert_eq!(winners, 1, "exactly one guarded writer must win");

        let (_, version) = a.get("slot").await.unwrap().unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn test_increment_is_independent_of_versioning() {
        let state = test_state(Arc::new(InMemoryStore::new()));
        assert_eq!(state.increment("connections", 5).await.unwrap(), 5);
        assert_eq!(state.increment("connections", -2).await.unwrap(), 3);
        // The counter does not create a versioned entry
        assert!(state.get("connections").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_removes_entry_and_cache() {
        let state = test_state(Arc::new(InMemoryStore::new()));
        state.set("tmp", serde_json::json!(1), None).await.unwrap();

        assert!(state.delete("tmp").await.unwrap());
        assert!(state.get("tmp").await.unwrap().is_none());
        assert!(!state.delete("tmp").await.unwrap());
    }

    #[tokio::test]
    async fn test_cross_instance_notification_updates_cache() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
        let writer = test_state(Arc::clone(&store));
        let reader = test_state(Arc::clone(&store));
        Arc::clone(&reader).start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        reader
            .subscribe(Arc::new(move |change| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(change);
                })
            }))
            .await;

        writer
            .set("topology", serde_json::json!({"primary": "node-a"}), None)
            .await
            .unwrap();

        let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("change event should arrive")
            .unwrap();
        assert_eq!(change.key, "topology");
        assert_eq!(change.version, 1);
        assert!(!change.deleted);

        // The event warmed the reader's cache with the new value
        let (value, version) = reader.get("topology").await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!({"primary": "node-a"}));
        assert_eq!(version, 1);

        reader.shutdown().await;
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
        let state = test_state(store);
        Arc::clone(&state).start().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = state
            .subscribe(Arc::new(move |change| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(change);
                })
            }))
            .await;

        assert!(state.unsubscribe(id).await);
        assert!(!state.unsubscribe(id).await);

        state.set("k", serde_json::json!(1), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_deletion_event_invalidates_remote_cache() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
        let writer = test_state(Arc::clone(&store));
        let reader = test_state(Arc::clone(&store));
        Arc::clone(&reader).start().await.unwrap();

        writer.set("tmp", serde_json::json!(1), None).await.unwrap();
        // Warm the reader's cache
        assert!(reader.get("tmp").await.unwrap().is_some());

        let (tx, mut rx) = mpsc::unbounded_channel();
        reader
            .subscribe(Arc::new(move |change| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(change);
                })
            }))
            .await;

        writer.delete("tmp").await.unwrap();
        let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("deletion event should arrive")
            .unwrap();
        assert!(change.deleted);

        assert!(reader.get("tmp").await.unwrap().is_none());
        reader.shutdown().await;
    }
}
