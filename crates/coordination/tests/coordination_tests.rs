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

//! End-to-end scenarios across the coordination primitives. Every test runs
//! two registries over one shared store, standing in for two DbPilot
//! instances pointed at the same backend.

use dbpilot_coordination::{CoordinationConfig, CoordinationRegistry};
use dbpilot_locks::AcquireOptions;
use dbpilot_queue::{EnqueueOptions, QueueConfig, TaskPriority, TaskStatus};
use dbpilot_state::StateError;
use dbpilot_store::{CoordinationStore, InMemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn two_instances() -> (CoordinationRegistry, CoordinationRegistry) {
    let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryStore::new());
    let config = CoordinationConfig {
        queue: QueueConfig {
            visibility_timeout: Duration::from_millis(200),
            backoff_base: Duration::from_millis(20),
            backoff_cap: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            ..QueueConfig::default()
        },
        ..CoordinationConfig::default()
    };
    (
        CoordinationRegistry::new(Arc::clone(&store), config.clone()),
        CoordinationRegistry::new(store, config),
    )
}

#[tokio::test]
async fn test_lock_race_has_one_winner() {
    let (a, b) = two_instances();
    let lock_a = a.lock_manager().lock("db:orders:failover").await;
    let lock_b = b.lock_manager().lock("db:orders:failover").await;

    let (ra, rb) = tokio::join!(
        lock_a.acquire(AcquireOptions::default()),
        lock_b.acquire(AcquireOptions::default()),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert!(
        ra.is_some() ^ rb.is_some(),
        "exactly one instance must win the lock race"
    );

    // The loser succeeds once the winner releases
    if let Some(token) = ra {
        assert!(lock_a.release(&token).await.unwrap());
        assert!(lock_b
            .acquire(AcquireOptions::default())
            .await
            .unwrap()
            .is_some());
    } else {
        assert!(lock_b.release(&rb.unwrap()).await.unwrap());
        assert!(lock_a
            .acquire(AcquireOptions::default())
            .await
            .unwrap()
            .is_some());
    }

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_cross_instance_priority_ordering() {
    let (producer, consumer) = two_instances();
    let out_queue = producer.queue("maintenance").await;
    let in_queue = consumer.queue("maintenance").await;

    out_queue
        .enqueue(
            "vacuum",
            serde_json::json!({"db": "orders"}),
            EnqueueOptions {
                priority: TaskPriority::Low,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    out_queue
        .enqueue(
            "failover",
            serde_json::json!({"db": "orders"}),
            EnqueueOptions {
                priority: TaskPriority::Critical,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let first = in_queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(first.task_type, "failover");
    let second = in_queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(second.task_type, "vacuum");

    producer.shutdown().await;
    consumer.shutdown().await;
}

#[tokio::test]
async fn test_repeated_failures_end_in_dead_letter() {
    let (a, _b) = two_instances();
    let queue = a.queue("maintenance").await;

    let id = queue
        .enqueue(
            "reindex",
            serde_json::json!({"table": "events"}),
            EnqueueOptions {
                max_retries: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut statuses = Vec::new();
    for _ in 0..2 {
        let task = queue
            .dequeue(Duration::from_secs(2))
            .await
            .unwrap()
            .expect("task should be deliverable");
        statuses.push(queue.fail(&task.task_id, "index corrupt", true).await.unwrap());
    }
    assert_eq!(statuses, vec![TaskStatus::Failed, TaskStatus::Dead]);

    let dead = queue.dead_tasks().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task_id, id);
    assert_eq!(dead[0].attempt_count, 2);

    // Operator replay gets a fresh budget
    assert!(queue.retry_dead(&id).await.unwrap());
    let task = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(task.task_id, id);
    assert_eq!(task.attempt_count, 1);

    a.shutdown().await;
}

#[tokio::test]
async fn test_cross_instance_state_notification_and_cached_read() {
    let (writer, reader) = two_instances();
    let state_w = writer.state("cluster").await.unwrap();
    let state_r = reader.state("cluster").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    state_r
        .subscribe(Arc::new(move |change| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(change);
            })
        }))
        .await;

    let version = state_w
        .set("topology", serde_json::json!({"primary": "node-b"}), None)
        .await
        .unwrap();

    let change = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("change event should reach the other instance")
        .unwrap();
    assert_eq!(change.key, "topology");
    assert_eq!(change.version, version);

    // The event warmed the reader's cache; the read observes the new value
    let (value, v) = state_r.get("topology").await.unwrap().unwrap();
    assert_eq!(value, serde_json::json!({"primary": "node-b"}));
    assert_eq!(v, version);

    writer.shutdown().await;
    reader.shutdown().await;
}

#[tokio::test]
async fn test_equal_version_guarded_writers_race() {
    let (a, b) = two_instances();
    let state_a = a.state("cluster").await.unwrap();
    let state_b = b.state("cluster").await.unwrap();

    state_a
        .set("leader", serde_json::json!("old"), None)
        .await
        .unwrap();

    let (ra, rb) = tokio::join!(
        state_a.set("leader", serde_json::json!("claim-a"), Some(1)),
        state_b.set("leader", serde_json::json!("claim-b"), Some(1)),
    );
    let winners = [&ra, &rb].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "exactly one guarded writer must win");

    let loser = if ra.is_err() { ra } else { rb };
    assert!(matches!(
        loser,
        Err(StateError::Conflict { expected: 1, actual: 2 })
    ));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_abandoned_task_is_recovered_across_instances() {
    let (worker, reaper_host) = two_instances();
    let queue_w = worker.queue("maintenance").await;
    // Creating the queue on the second instance starts its reaper too
    let _queue_r = reaper_host.queue("maintenance").await;

    queue_w
        .enqueue("backup", serde_json::json!({"db": "orders"}), Default::default())
        .await
        .unwrap();

    // Worker dequeues and "crashes" (never completes)
    let abandoned = queue_w.dequeue(Duration::ZERO).await.unwrap().unwrap();
    assert_eq!(abandoned.attempt_count, 1);

    // After the visibility timeout some instance's reaper requeues it
    let recovered = queue_w
        .dequeue(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("abandoned task should be redelivered");
    assert_eq!(recovered.task_id, abandoned.task_id);
    assert_eq!(recovered.attempt_count, 2);

    worker.shutdown().await;
    reaper_host.shutdown().await;
}

#[tokio::test]
async fn test_with_lock_serializes_sections_across_instances() {
    let (a, b) = two_instances();
    let lock_a = a.lock_manager().lock("db:orders:migration").await;
    let lock_b = b.lock_manager().lock("db:orders:migration").await;

    let ran_a = lock_a
        .with_lock(AcquireOptions::default(), false, |_token| async {
            // Holder of the lock: the other instance must be refused
            let refused = lock_b.acquire(AcquireOptions::default()).await.unwrap();
            assert!(refused.is_none());
            true
        })
        .await
        .unwrap();
    assert_eq!(ran_a, Some(true));

    // Section done, lock released: the other instance gets in
    let token = lock_b.acquire(AcquireOptions::default()).await.unwrap();
    assert!(token.is_some());

    a.shutdown().await;
    b.shutdown().await;
}
