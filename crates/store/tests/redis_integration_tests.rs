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

//! Integration tests against a live Redis.
//!
//! Requires `--features redis-backend` and a reachable Redis
//! (`DBPILOT_TEST_REDIS_URL`, default `redis://localhost:6379`). Each test
//! skips itself when Redis is not available, so the suite stays green on
//! machines without one.

#![cfg(feature = "redis-backend")]

use dbpilot_store::{CoordinationStore, RedisStore, SetMode};
use std::time::Duration;
use ulid::Ulid;

async fn connect() -> Option<RedisStore> {
    let url = std::env::var("DBPILOT_TEST_REDIS_URL")
        .unwrap_or_else(|_| "redis://localhost:6379".to_string());
    // Fresh namespace per test run so parallel runs never collide
    let namespace = format!("dbpilot-test-{}", Ulid::new());
    match RedisStore::new(&url, &namespace).await {
        Ok(store) => Some(store),
        Err(e) => {
            eprintln!("Skipping Redis integration test ({})", e);
            None
        }
    }
}

#[tokio::test]
async fn test_set_modes_against_redis() {
    let Some(store) = connect().await else { return };

    assert!(store
        .set("k", b"one".to_vec(), SetMode::IfAbsent, None)
        .await
        .unwrap());
    assert!(!store
        .set("k", b"two".to_vec(), SetMode::IfAbsent, None)
        .await
        .unwrap());
    assert_eq!(store.get("k").await.unwrap(), Some(b"one".to_vec()));

    assert!(store
        .set("k", b"two".to_vec(), SetMode::IfPresent, None)
        .await
        .unwrap());
    assert_eq!(store.get("k").await.unwrap(), Some(b"two".to_vec()));
    assert!(store.delete("k").await.unwrap());
}

#[tokio::test]
async fn test_compare_and_set_against_redis() {
    let Some(store) = connect().await else { return };

    // None = key must be absent
    assert!(store
        .compare_and_set("cas", None, b"v1".to_vec(), None)
        .await
        .unwrap());
    assert!(!store
        .compare_and_set("cas", None, b"v2".to_vec(), None)
        .await
        .unwrap());

    // Exact-bytes comparand
    assert!(store
        .compare_and_set("cas", Some(b"v1"), b"v2".to_vec(), None)
        .await
        .unwrap());
    assert!(!store
        .compare_and_set("cas", Some(b"v1"), b"v3".to_vec(), None)
        .await
        .unwrap());
    assert_eq!(store.get("cas").await.unwrap(), Some(b"v2".to_vec()));

    assert!(!store.compare_and_delete("cas", b"stale").await.unwrap());
    assert!(store.compare_and_delete("cas", b"v2").await.unwrap());
}

#[tokio::test]
async fn test_ttl_expiry_against_redis() {
    let Some(store) = connect().await else { return };

    store
        .set(
            "ephemeral",
            b"x".to_vec(),
            SetMode::Always,
            Some(Duration::from_millis(200)),
        )
        .await
        .unwrap();
    assert!(store.exists("ephemeral").await.unwrap());
    assert!(store.ttl_remaining("ephemeral").await.unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!store.exists("ephemeral").await.unwrap());
}

#[tokio::test]
async fn test_zmove_min_against_redis() {
    let Some(store) = connect().await else { return };

    store.zadd("src", "b", 2.0).await.unwrap();
    store.zadd("src", "a", 1.0).await.unwrap();

    let moved = store.zmove_min("src", "dst", 99.0).await.unwrap();
    assert_eq!(moved.as_deref(), Some("a"));
    assert_eq!(store.zscore("dst", "a").await.unwrap(), Some(99.0));
    assert_eq!(store.zcard("src").await.unwrap(), 1);

    assert!(store.zmove_min("empty", "dst", 1.0).await.unwrap().is_none());
    store.delete("src").await.unwrap();
    store.delete("dst").await.unwrap();
}

#[tokio::test]
async fn test_increment_against_redis() {
    let Some(store) = connect().await else { return };

    assert_eq!(store.increment("ctr", 5).await.unwrap(), 5);
    assert_eq!(store.increment("ctr", -2).await.unwrap(), 3);
    store.delete("ctr").await.unwrap();
}

#[tokio::test]
async fn test_pub_sub_against_redis() {
    let Some(store) = connect().await else { return };

    let mut rx = store.subscribe("events").await.unwrap();
    // Subscription setup races the publish; give the forwarder a beat
    tokio::time::sleep(Duration::from_millis(200)).await;

    store.publish("events", b"hello".to_vec()).await.unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message should arrive")
        .unwrap();
    assert_eq!(msg.channel, "events");
    assert_eq!(msg.payload, b"hello".to_vec());
}
