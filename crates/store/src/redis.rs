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

//! Redis-based coordination store implementation.
//!
//! ## Purpose
//! The production backend: distributed, with native TTL (`SET PX`/`PEXPIRE`),
//! sorted sets for queue bookkeeping, and Redis pub/sub for change
//! propagation.
//!
//! ## Design Decisions
//! - **ConnectionManager**: automatic reconnection and multiplexing,
//!   cloned per operation
//! - **Namespace prefix**: multiple deployments can share one Redis instance
//! - **Lua scripts**: the value-guarded mutations (`compare_and_set`,
//!   `compare_and_delete`, `compare_and_expire`) and the cross-set move
//!   (`zmove_min`) must be single round-trip atomic; `WATCH`/`MULTI` would
//!   race under contention

use crate::{CoordinationStore, SetMode, StoreError, StoreMessage, StoreResult};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Compare-and-set: write ARGV[2] (TTL millis in ARGV[3], 0 = none) iff the
/// current value equals ARGV[1].
const CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  if tonumber(ARGV[3]) > 0 then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
  else
    redis.call('SET', KEYS[1], ARGV[2])
  end
  return 1
end
return 0
"#;

/// Compare-and-delete: delete iff the current value equals ARGV[1].
const CAD_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Compare-and-expire: refresh TTL iff the current value equals ARGV[1].
const CAX_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Pop the lowest-scored member of KEYS[1] and add it to KEYS[2] with
/// score ARGV[1].
const ZMOVE_MIN_SCRIPT: &str = r#"
local popped = redis.call('ZPOPMIN', KEYS[1])
if popped[1] then
  redis.call('ZADD', KEYS[2], ARGV[1], popped[1])
  return popped[1]
end
return false
"#;

/// Redis-backed [`CoordinationStore`].
///
/// ## Invariants
/// - All keys and channels carry the configured namespace prefix
/// - Counter values are plain `INCRBY` integers
/// - Pub/sub subscriptions run on dedicated connections (Redis protocol
///   requirement), one spawned forwarder task per subscription
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// ## Arguments
    /// * `url` - Redis connection URL (e.g. "redis://localhost:6379")
    /// * `namespace` - key prefix for isolation (e.g. "dbpilot")
    pub async fn new(url: &str, namespace: &str) -> StoreResult<Self> {
        let client = Client::open(url)
            .map_err(|e| StoreError::Config(format!("invalid Redis URL: {}", e)))?;
        let manager = client.get_tokio_connection_manager().await?;

        Ok(Self {
            client,
            manager,
            prefix: format!("{}:", namespace),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(self.prefixed(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        mode: SetMode,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.prefixed(key)).arg(value);
        match mode {
            SetMode::Always => {}
            SetMode::IfAbsent => {
                cmd.arg("NX");
            }
            SetMode::IfPresent => {
                cmd.arg("XX");
            }
        }
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        // NX/XX rejection comes back as Nil
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.prefixed(key))
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let found: i64 = redis::cmd("EXISTS")
            .arg(self.prefixed(key))
            .query_async(&mut conn)
            .await?;
        Ok(found > 0)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        // "Must be absent" is exactly SET NX
        let Some(expected) = expected else {
            return self.set(key, value, SetMode::IfAbsent, ttl).await;
        };

        let mut conn = self.conn();
        let ttl_ms = ttl.map(|t| t.as_millis() as u64).unwrap_or(0);
        let swapped: i64 = Script::new(CAS_SCRIPT)
            .key(self.prefixed(key))
            .arg(expected)
            .arg(value)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = Script::new(CAD_SCRIPT)
            .key(self.prefixed(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &[u8],
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut conn = self.conn();
        let refreshed: i64 = Script::new(CAX_SCRIPT)
            .key(self.prefixed(key))
            .arg(expected)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(refreshed > 0)
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.conn();
        let value: i64 = redis::cmd("INCRBY")
            .arg(self.prefixed(key))
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn ttl_remaining(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn();
        let millis: i64 = redis::cmd("PTTL")
            .arg(self.prefixed(key))
            .query_async(&mut conn)
            .await?;
        // -2 = no key, -1 = no TTL
        if millis < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_millis(millis as u64)))
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> StoreResult<bool> {
        let mut conn = self.conn();
        let added: i64 = redis::cmd("ZADD")
            .arg(self.prefixed(key))
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(added > 0)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("ZREM")
            .arg(self.prefixed(key))
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> StoreResult<Option<f64>> {
        let mut conn = self.conn();
        let score: Option<f64> = redis::cmd("ZSCORE")
            .arg(self.prefixed(key))
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(score)
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.conn();
        let count: i64 = redis::cmd("ZCARD")
            .arg(self.prefixed(key))
            .query_async(&mut conn)
            .await?;
        Ok(count as usize)
    }

    async fn zrange_below(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> StoreResult<Vec<(String, f64)>> {
        let mut conn = self.conn();
        let members: Vec<(String, f64)> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.prefixed(key))
            .arg("-inf")
            .arg(max_score)
            .arg("WITHSCORES")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn zpop_min(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        let mut conn = self.conn();
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(self.prefixed(key))
            .query_async(&mut conn)
            .await?;
        Ok(popped.into_iter().next())
    }

    async fn zmove_min(&self, src: &str, dst: &str, dst_score: f64) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        let moved: Option<String> = Script::new(ZMOVE_MIN_SCRIPT)
            .key(self.prefixed(src))
            .key(self.prefixed(dst))
            .arg(dst_score)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved)
    }

    async fn hset(&self, key: &str, field: &str, value: Vec<u8>) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("HSET")
            .arg(self.prefixed(key))
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = redis::cmd("HGET")
            .arg(self.prefixed(key))
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hdel(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = redis::cmd("HDEL")
            .arg(self.prefixed(key))
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        let mut conn = self.conn();
        let count: i64 = redis::cmd("HLEN")
            .arg(self.prefixed(key))
            .query_async(&mut conn)
            .await?;
        Ok(count as usize)
    }

    async fn hgetall(&self, key: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let mut conn = self.conn();
        let pairs: Vec<(String, Vec<u8>)> = redis::cmd("HGETALL")
            .arg(self.prefixed(key))
            .query_async(&mut conn)
            .await?;
        Ok(pairs)
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> StoreResult<usize> {
        let mut conn = self.conn();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(self.prefixed(channel))
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(receivers as usize)
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<mpsc::Receiver<StoreMessage>> {
        // Pub/sub needs its own connection; the manager multiplexes commands.
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        let prefixed_channel = self.prefixed(channel);
        pubsub.subscribe(&prefixed_channel).await?;

        let (tx, rx) = mpsc::channel(128);
        let prefix = self.prefix.clone();

        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg
                    .get_channel_name()
                    .strip_prefix(&prefix)
                    .unwrap_or_else(|| msg.get_channel_name())
                    .to_string();
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Dropping unreadable pub/sub payload: {}", e);
                        continue;
                    }
                };
                if tx.send(StoreMessage { channel, payload }).await.is_err() {
                    debug!("Subscriber dropped, ending pub/sub forwarder");
                    break;
                }
            }
        });

        Ok(rx)
    }
}
