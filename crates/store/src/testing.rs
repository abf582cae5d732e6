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

//! Test-support store wrappers.
//!
//! Lets the higher-level crates exercise their transient-failure handling
//! against an injected outage instead of a real backend.

use crate::{CoordinationStore, InMemoryStore, SetMode, StoreError, StoreMessage, StoreResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// An [`InMemoryStore`] that fails the next armed number of operations with
/// [`StoreError::Unavailable`], then behaves normally.
///
/// ## Examples
///
/// ```rust
/// use dbpilot_store::testing::FlakyStore;
/// use dbpilot_store::CoordinationStore;
///
/// # async fn example() {
/// let store = FlakyStore::new();
/// store.fail_next(1);
/// assert!(store.get("k").await.is_err());
/// assert!(store.get("k").await.is_ok());
/// # }
/// ```
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    failures: AtomicU64,
}

impl FlakyStore {
    /// Create a healthy store with no armed failures.
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            failures: AtomicU64::new(0),
        }
    }

    /// Arm the next `n` operations to fail.
    pub fn fail_next(&self, n: u64) {
        self.failures.store(n, Ordering::SeqCst);
    }

    fn trip(&self) -> StoreResult<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CoordinationStore for FlakyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.trip()?;
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        mode: SetMode,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.trip()?;
        self.inner.set(key, value, mode, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.trip()?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.trip()?;
        self.inner.exists(key).await
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.trip()?;
        self.inner.compare_and_set(key, expected, value, ttl).await
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        self.trip()?;
        self.inner.compare_and_delete(key, expected).await
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.trip()?;
        self.inner.compare_and_expire(key, expected, ttl).await
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.trip()?;
        self.inner.increment(key, delta).await
    }

    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.trip()?;
        self.inner.ttl_remaining(key).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        self.trip()?;
        self.inner.zadd(key, member, score).await
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.trip()?;
        self.inner.zrem(key, member).await
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        self.trip()?;
        self.inner.zscore(key, member).await
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        self.trip()?;
        self.inner.zcard(key).await
    }

    async fn zrange_below(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.trip()?;
        self.inner.zrange_below(key, max_score, limit).await
    }

    async fn zpop_min(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        self.trip()?;
        self.inner.zpop_min(key).await
    }

    async fn zmove_min(&self, src: &str, dst: &str, dst_score: f64) -> StoreResult<Option<String>> {
        self.trip()?;
        self.inner.zmove_min(src, dst, dst_score).await
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> StoreResult<()> {
        self.trip()?;
        self.inner.hset(key, field, value).await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Vec<u8>>> {
        self.trip()?;
        self.inner.hget(key, field).await
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.trip()?;
        self.inner.hdel(key, field).await
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        self.trip()?;
        self.inner.hlen(key).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        self.trip()?;
        self.inner.hgetall(key).await
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> StoreResult<usize> {
        self.trip()?;
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::Receiver<StoreMessage>> {
        self.trip()?;
        self.inner.subscribe(channel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_armed_failures_then_recovery() {
        let store = FlakyStore::new();
        store.fail_next(2);

        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.increment("c", 1).await.is_err());

        // Armed failures consumed; back to normal
        assert_eq!(store.increment("c", 1).await.unwrap(), 1);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
