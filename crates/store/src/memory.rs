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

//! In-memory coordination store implementation.
//!
//! ## Purpose
//! Single-process implementation of [`CoordinationStore`] for tests and
//! local development. All atomic guarantees are provided by holding the
//! relevant write lock for the whole critical section.
//!
//! ## Limitations
//! - Not persistent (data lost on restart)
//! - Not distributed (single process only)
//! - Lazy TTL expiry (expired entries are filtered on access, not reaped)

use crate::{CoordinationStore, SetMode, StoreError, StoreMessage, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};

/// Plain key entry with optional expiry.
#[derive(Debug, Clone)]
struct ValueEntry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn new(value: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }

    fn ttl_remaining(&self) -> Option<Duration> {
        self.expires_at
            .and_then(|exp| exp.checked_duration_since(Instant::now()))
    }
}

/// Pub/sub subscription handle held by the store.
#[derive(Debug)]
struct Subscriber {
    channel: String,
    sender: mpsc::Sender<StoreMessage>,
}

/// In-memory [`CoordinationStore`] implementation.
///
/// ## Example
/// ```rust
/// use dbpilot_store::{CoordinationStore, InMemoryStore, SetMode};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryStore::new();
/// store.set("key", b"value".to_vec(), SetMode::Always, None).await?;
/// assert_eq!(store.get("key").await?, Some(b"value".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryStore {
    values: Arc<RwLock<HashMap<String, ValueEntry>>>,
    zsets: Arc<RwLock<HashMap<String, HashMap<String, f64>>>>,
    hashes: Arc<RwLock<HashMap<String, HashMap<String, Vec<u8>>>>>,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest (score, member) pair of a sorted set, lexicographic tie-break.
    fn min_member(set: &HashMap<String, f64>) -> Option<(String, f64)> {
        set.iter()
            .min_by(|(ma, sa), (mb, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| ma.cmp(mb))
            })
            .map(|(m, s)| (m.clone(), *s))
    }

    fn parse_counter(bytes: &[u8]) -> StoreResult<i64> {
        std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| StoreError::InvalidValue("counter is not an integer".to_string()))
    }
}

#[async_trait]
impl CoordinationStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let values = self.values.read().await;
        match values.get(key) {
            Some(entry) if !entry.is_expired() => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        mode: SetMode,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut values = self.values.write().await;
        let live = values.get(key).is_some_and(|e| !e.is_expired());

        let allowed = match mode {
            SetMode::Always => true,
            SetMode::IfAbsent => !live,
            SetMode::IfPresent => live,
        };
        if !allowed {
            return Ok(false);
        }

        values.insert(key.to_string(), ValueEntry::new(value, ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        // DEL removes a key regardless of structure type
        let removed_value = {
            let mut values = self.values.write().await;
            values.remove(key).is_some_and(|e| !e.is_expired())
        };
        let removed_zset = self.zsets.write().await.remove(key).is_some();
        let removed_hash = self.hashes.write().await.remove(key).is_some();
        Ok(removed_value || removed_zset || removed_hash)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let values = self.values.read().await;
        Ok(values.get(key).is_some_and(|e| !e.is_expired()))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut values = self.values.write().await;
        let current = values
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.as_slice());

        let matches = match (current, expected) {
            (None, None) => true,
            (Some(cur), Some(exp)) => cur == exp,
            _ => false,
        };
        if !matches {
            return Ok(false);
        }

        values.insert(key.to_string(), ValueEntry::new(value, ttl));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let mut values = self.values.write().await;
        let matches = values
            .get(key)
            .filter(|e| !e.is_expired())
            .is_some_and(|e| e.value == expected);
        if matches {
            values.remove(key);
        }
        Ok(matches)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut values = self.values.write().await;
        match values.get_mut(key) {
            Some(entry) if !entry.is_expired() && entry.value == expected => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut values = self.values.write().await;
        let current = match values.get(key).filter(|e| !e.is_expired()) {
            Some(entry) => Self::parse_counter(&entry.value)?,
            None => 0,
        };
        let next = current + delta;
        values.insert(
            key.to_string(),
            ValueEntry::new(next.to_string().into_bytes(), None),
        );
        Ok(next)
    }

    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Duration>> {
        let values = self.values.read().await;
        Ok(values
            .get(key)
            .filter(|e| !e.is_expired())
            .and_then(|e| e.ttl_remaining()))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        let mut zsets = self.zsets.write().await;
        let set = zsets.entry(key.to_string()).or_default();
        Ok(set.insert(member.to_string(), score).is_none())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut zsets = self.zsets.write().await;
        Ok(zsets
            .get_mut(key)
            .is_some_and(|set| set.remove(member).is_some()))
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let zsets = self.zsets.read().await;
        Ok(zsets.get(key).and_then(|set| set.get(member).copied()))
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        let zsets = self.zsets.read().await;
        Ok(zsets.get(key).map(|set| set.len()).unwrap_or(0))
    }

    async fn zrange_below(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> StoreResult<Vec<(String, f64)>> {
        let zsets = self.zsets.read().await;
        let mut members: Vec<(String, f64)> = zsets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, score)| **score <= max_score)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|(ma, sa), (mb, sb)| {
            sa.partial_cmp(sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ma.cmp(mb))
        });
        members.truncate(limit);
        Ok(members)
    }

    async fn zpop_min(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        let mut zsets = self.zsets.write().await;
        let Some(set) = zsets.get_mut(key) else {
            return Ok(None);
        };
        let Some((member, score)) = Self::min_member(set) else {
            return Ok(None);
        };
        set.remove(&member);
        Ok(Some((member, score)))
    }

    async fn zmove_min(&self, src: &str, dst: &str, dst_score: f64) -> StoreResult<Option<String>> {
        let mut zsets = self.zsets.write().await;
        let Some(set) = zsets.get_mut(src) else {
            return Ok(None);
        };
        let Some((member, _)) = Self::min_member(set) else {
            return Ok(None);
        };
        set.remove(&member);
        zsets
            .entry(dst.to_string())
            .or_default()
            .insert(member.clone(), dst_score);
        Ok(Some(member))
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut hashes = self.hashes.write().await;
        hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Vec<u8>>> {
        let hashes = self.hashes.read().await;
        Ok(hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut hashes = self.hashes.write().await;
        Ok(hashes
            .get_mut(key)
            .is_some_and(|h| h.remove(field).is_some()))
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        let hashes = self.hashes.read().await;
        Ok(hashes.get(key).map(|h| h.len()).unwrap_or(0))
    }

    async fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let hashes = self.hashes.read().await;
        Ok(hashes
            .get(key)
            .map(|h| h.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> StoreResult<usize> {
        // Snapshot matching senders so the lock is not held across sends.
        let senders: Vec<mpsc::Sender<StoreMessage>> = {
            let subscribers = self.subscribers.read().await;
            subscribers
                .iter()
                .filter(|s| s.channel == channel && !s.sender.is_closed())
                .map(|s| s.sender.clone())
                .collect()
        };

        let mut delivered = 0;
        for sender in senders {
            let message = StoreMessage {
                channel: channel.to_string(),
                payload: payload.clone(),
            };
            // Best-effort: a full or closed buffer drops the message, the
            // subscriber re-reads authoritative state from the store. A
            // blocking send here would stall every writer behind one slow
            // subscriber.
            if sender.try_send(message).is_ok() {
                delivered += 1;
            }
        }

        // Prune dropped subscriptions.
        if delivered == 0 {
            let mut subscribers = self.subscribers.write().await;
            subscribers.retain(|s| !s.sender.is_closed());
        }

        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::Receiver<StoreMessage>> {
        let (tx, rx) = mpsc::channel(128);
        let mut subscribers = self.subscribers.write().await;
        subscribers.push(Subscriber {
            channel: channel.to_string(),
            sender: tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_modes() {
        let store = InMemoryStore::new();

        assert!(store
            .set("k", b"v1".to_vec(), SetMode::IfAbsent, None)
            .await
            .unwrap());
        // Second set-if-absent on a live key is rejected
        assert!(!store
            .set("k", b"v2".to_vec(), SetMode::IfAbsent, None)
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"v1".to_vec()));

        assert!(store
            .set("k", b"v3".to_vec(), SetMode::IfPresent, None)
            .await
            .unwrap());
        assert!(!store
            .set("missing", b"v".to_vec(), SetMode::IfPresent, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry_unblocks_if_absent() {
        let store = InMemoryStore::new();
        store
            .set(
                "k",
                b"v1".to_vec(),
                SetMode::IfAbsent,
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        // Expired entry no longer blocks acquisition
        assert!(store
            .set("k", b"v2".to_vec(), SetMode::IfAbsent, None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = InMemoryStore::new();

        assert!(store
            .compare_and_set("k", None, b"v1".to_vec(), None)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set("k", None, b"v2".to_vec(), None)
            .await
            .unwrap());
        assert!(store
            .compare_and_set("k", Some(b"v1"), b"v2".to_vec(), None)
            .await
            .unwrap());
        assert!(!store
            .compare_and_set("k", Some(b"v1"), b"v3".to_vec(), None)
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_compare_and_delete() {
        let store = InMemoryStore::new();
        store
            .set("k", b"token".to_vec(), SetMode::Always, None)
            .await
            .unwrap();

        assert!(!store.compare_and_delete("k", b"other").await.unwrap());
        assert!(store.exists("k").await.unwrap());

        assert!(store.compare_and_delete("k", b"token").await.unwrap());
        assert!(!store.exists("k").await.unwrap());

        // Second delete is a noop
        assert!(!store.compare_and_delete("k", b"token").await.unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_expire() {
        let store = InMemoryStore::new();
        store
            .set(
                "k",
                b"token".to_vec(),
                SetMode::Always,
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();

        assert!(store
            .compare_and_expire("k", b"token", Duration::from_secs(60))
            .await
            .unwrap());
        let ttl = store.ttl_remaining("k").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(30));

        assert!(!store
            .compare_and_expire("k", b"other", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_increment() {
        let store = InMemoryStore::new();
        assert_eq!(store.increment("ctr", 1).await.unwrap(), 1);
        assert_eq!(store.increment("ctr", 5).await.unwrap(), 6);
        assert_eq!(store.increment("ctr", -2).await.unwrap(), 4);
        // Counter is stored as ASCII decimal
        assert_eq!(store.get("ctr").await.unwrap(), Some(b"4".to_vec()));
    }

    #[tokio::test]
    async fn test_zset_pop_ordering() {
        let store = InMemoryStore::new();
        store.zadd("z", "c", 3.0).await.unwrap();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "b", 2.0).await.unwrap();

        assert_eq!(store.zcard("z").await.unwrap(), 3);
        assert_eq!(
            store.zpop_min("z").await.unwrap(),
            Some(("a".to_string(), 1.0))
        );
        assert_eq!(
            store.zpop_min("z").await.unwrap(),
            Some(("b".to_string(), 2.0))
        );
        assert_eq!(
            store.zpop_min("z").await.unwrap(),
            Some(("c".to_string(), 3.0))
        );
        assert_eq!(store.zpop_min("z").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zmove_min() {
        let store = InMemoryStore::new();
        store.zadd("src", "t1", 1.0).await.unwrap();
        store.zadd("src", "t2", 2.0).await.unwrap();

        let moved = store.zmove_min("src", "dst", 99.0).await.unwrap();
        assert_eq!(moved, Some("t1".to_string()));
        assert_eq!(store.zscore("dst", "t1").await.unwrap(), Some(99.0));
        assert_eq!(store.zcard("src").await.unwrap(), 1);

        assert_eq!(store.zmove_min("empty", "dst", 1.0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zrange_below() {
        let store = InMemoryStore::new();
        store.zadd("z", "a", 1.0).await.unwrap();
        store.zadd("z", "b", 5.0).await.unwrap();
        store.zadd("z", "c", 10.0).await.unwrap();

        let due = store.zrange_below("z", 5.0, 10).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].0, "a");
        assert_eq!(due[1].0, "b");
    }

    #[tokio::test]
    async fn test_hash_ops() {
        let store = InMemoryStore::new();
        store.hset("h", "f1", b"v1".to_vec()).await.unwrap();
        store.hset("h", "f2", b"v2".to_vec()).await.unwrap();

        assert_eq!(store.hget("h", "f1").await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.hlen("h").await.unwrap(), 2);
        assert!(store.hdel("h", "f1").await.unwrap());
        assert!(!store.hdel("h", "f1").await.unwrap());
        assert_eq!(store.hgetall("h").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let store = InMemoryStore::new();
        let mut rx = store.subscribe("events").await.unwrap();

        let delivered = store.publish("events", b"hello".to_vec()).await.unwrap();
        assert_eq!(delivered, 1);

        let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.channel, "events");
        assert_eq!(msg.payload, b"hello".to_vec());

        // Other channels are not delivered here
        store.publish("other", b"x".to_vec()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_drops_messages_for_full_subscriber() {
        let store = InMemoryStore::new();
        let mut rx = store.subscribe("events").await.unwrap();

        // Fill the subscriber's buffer without consuming, then keep
        // publishing; a writer must never block on a slow subscriber
        let publishes = tokio::time::timeout(Duration::from_secs(1), async {
            for i in 0..200u32 {
                store
                    .publish("events", i.to_be_bytes().to_vec())
                    .await
                    .unwrap();
            }
        })
        .await;
        assert!(publishes.is_ok(), "publish must not block on a full buffer");

        // The buffered messages arrived; the overflow was dropped
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 128);
    }
}
