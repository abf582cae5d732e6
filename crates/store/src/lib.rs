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

//! # DbPilot Coordination Store
//!
//! ## Purpose
//! Defines the atomic key-value + pub/sub store abstraction that the DbPilot
//! coordination primitives (distributed lock, task queue, state sync) are
//! built on. Any backend providing atomic CAS + TTL + atomic increment +
//! pub/sub qualifies; this trait is the portability boundary.
//!
//! ## Architecture Context
//! The store is the sole source of truth shared across DbPilot instances.
//! Everything a process keeps locally (caches, subscriber tables, retry
//! counters) is a disposable projection: losing it forces a cold refetch,
//! never corrupts store state.
//!
//! ## Backend Support
//! - **InMemory**: HashMap-based, always available, for tests and
//!   single-process runs
//! - **Redis**: distributed, with Lua scripts for the multi-key atomic
//!   primitives (feature: `redis-backend`)
//!
//! ## Examples
//!
//! ```rust
//! use dbpilot_store::{CoordinationStore, InMemoryStore, SetMode};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryStore::new();
//!
//! // Lock-style acquisition: set-if-absent with TTL
//! let acquired = store
//!     .set("lock:migrate", b"token-1".to_vec(), SetMode::IfAbsent, Some(Duration::from_secs(30)))
//!     .await?;
//! assert!(acquired);
//!
//! // Token-checked release
//! let released = store.compare_and_delete("lock:migrate", b"token-1").await?;
//! assert!(released);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;

pub mod config;
pub mod error;
pub mod memory;
pub mod testing;

#[cfg(feature = "redis-backend")]
pub mod redis;

pub use config::{create_store_from_config, create_store_from_env, BackendType, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;

#[cfg(feature = "redis-backend")]
pub use redis::RedisStore;

/// Write mode for [`CoordinationStore::set`].
///
/// Maps to Redis `SET` / `SET NX` / `SET XX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    /// Unconditional write.
    Always,
    /// Write only if the key does not exist (lock acquisition).
    IfAbsent,
    /// Write only if the key already exists.
    IfPresent,
}

/// Message delivered to a pub/sub subscriber.
#[derive(Debug, Clone)]
pub struct StoreMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload as published.
    pub payload: Vec<u8>,
}

/// Atomic key-value + pub/sub store consumed by the coordination primitives.
///
/// ## Contract
/// - Every method is atomic with respect to concurrent callers on the same
///   key, across processes and hosts.
/// - Across *different* keys there is no ordering or transactional guarantee.
/// - Transient backend failures surface as [`StoreError::Unavailable`];
///   logical misses (absent key, failed compare) are ordinary `Ok` values.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    // =========================================================================
    // Plain keys
    // =========================================================================

    /// Get value by key.
    ///
    /// ## Returns
    /// - `Ok(Some(value))` if the key exists and is not expired
    /// - `Ok(None)` otherwise
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write a value, optionally guarded by [`SetMode`] and bounded by a TTL.
    ///
    /// ## Returns
    /// - `Ok(true)` if the write was applied
    /// - `Ok(false)` if the mode guard rejected it (e.g. `IfAbsent` on a
    ///   live key); expected contention, not an error
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        mode: SetMode,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Delete a key.
    ///
    /// ## Returns
    /// `Ok(true)` if the key existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Check whether a key exists (and is not expired).
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Compare-and-set: write only if the current value matches `expected`.
    ///
    /// ## Arguments
    /// - `expected`: `None` means the key must be absent; `Some(bytes)` means
    ///   the stored value must equal `bytes` exactly
    ///
    /// ## Returns
    /// `Ok(true)` if the swap was applied, `Ok(false)` if the comparison
    /// failed (nothing written).
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Compare-and-delete: delete only if the stored value matches `expected`.
    ///
    /// A plain get + delete would race with a writer who took over the key
    /// after the caller's copy silently expired; this is the atomic form
    /// used for lock release.
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StoreResult<bool>;

    /// Refresh the TTL only if the stored value matches `expected`
    /// (lock extension).
    ///
    /// ## Returns
    /// `Ok(false)` if the value no longer matches or the key is gone; the
    /// caller has lost ownership.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Atomic counter increment (negative `delta` decrements).
    ///
    /// ## Behavior
    /// - Value is an ASCII decimal integer (Redis `INCRBY` compatible)
    /// - A missing key counts from 0
    ///
    /// ## Returns
    /// The value after the increment.
    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Remaining TTL for a key.
    ///
    /// ## Returns
    /// `Ok(None)` if the key is absent or has no TTL.
    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Duration>>;

    // =========================================================================
    // Sorted sets (queue ready/in-flight/delayed bookkeeping)
    // =========================================================================

    /// Add a member with a score, overwriting the score if present.
    ///
    /// ## Returns
    /// `Ok(true)` if the member was newly added.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool>;

    /// Remove a member.
    ///
    /// ## Returns
    /// `Ok(true)` if the member was present. Exactly one concurrent caller
    /// observes `true`; this is the election primitive the queue reaper relies on.
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Score of a member, if present.
    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>>;

    /// Number of members.
    async fn zcard(&self, key: &str) -> StoreResult<usize>;

    /// Members with score <= `max_score`, ascending, at most `limit`.
    async fn zrange_below(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> StoreResult<Vec<(String, f64)>>;

    /// Atomically pop the member with the lowest score.
    async fn zpop_min(&self, key: &str) -> StoreResult<Option<(String, f64)>>;

    /// Atomically pop the lowest-scored member of `src` and add it to `dst`
    /// with `dst_score`.
    ///
    /// Lua script on Redis, single critical section in memory. This is the
    /// queue's dequeue step: ready → in-flight with a visibility deadline.
    async fn zmove_min(&self, src: &str, dst: &str, dst_score: f64) -> StoreResult<Option<String>>;

    // =========================================================================
    // Hashes (task records, dead-letter bookkeeping)
    // =========================================================================

    /// Set a hash field.
    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> StoreResult<()>;

    /// Get a hash field.
    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Delete a hash field.
    ///
    /// ## Returns
    /// `Ok(true)` if the field existed.
    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// Number of fields in a hash.
    async fn hlen(&self, key: &str) -> StoreResult<usize>;

    /// All field/value pairs of a hash.
    async fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    // =========================================================================
    // Pub/sub (state change propagation)
    // =========================================================================

    /// Publish a payload to a channel.
    ///
    /// ## Returns
    /// Number of subscribers the message was delivered to (best effort).
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> StoreResult<usize>;

    /// Subscribe to a channel.
    ///
    /// The subscription lives until the receiver is dropped. Delivery is
    /// at-least-once from the subscriber's point of view; a slow consumer
    /// may lose messages once its buffer fills (fail open; consumers
    /// re-read authoritative state from the store).
    async fn subscribe(&self, channel: &str) -> StoreResult<Receiver<StoreMessage>>;
}
