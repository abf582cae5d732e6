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

//! The task queue proper: enqueue/dequeue/complete/fail plus the
//! visibility reaper.
//!
//! ## Persisted layout (all in the store, nothing local)
//! - `queue:{name}:ready`    - sorted set, score = tier·10^13 + enqueued-at
//!   millis (strict priority, FIFO within a tier, one pop-min)
//! - `queue:{name}:inflight` - sorted set, score = visibility deadline millis
//! - `queue:{name}:delayed`  - sorted set, score = visible-at millis
//!   (retry backoff and delayed enqueue)
//! - `queue:{name}:dead`     - sorted set, score = death time millis
//! - `queue:{name}:tasks`    - hash, task id → Task JSON

use crate::task::{EnqueueOptions, Task, TaskAttemptError, TaskPriority, TaskStatus};
use crate::{QueueError, QueueResult};
use chrono::Utc;
use dbpilot_store::CoordinationStore;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Score band separating priority tiers in the ready set. Millisecond
/// timestamps stay below this until the year ~2286, so tiers never overlap.
const PRIORITY_BAND: f64 = 1e13;

/// How many expired/due members one sweep examines.
const SWEEP_BATCH: usize = 128;

/// Queue configuration.
///
/// ## Environment Variables (`QueueConfig::from_env`)
/// - `DBPILOT_QUEUE_VISIBILITY_TIMEOUT_SECS` (default 300)
/// - `DBPILOT_QUEUE_MAX_RETRIES` (default 3)
/// - `DBPILOT_QUEUE_BACKOFF_BASE_MS` (default 1000)
/// - `DBPILOT_QUEUE_BACKOFF_CAP_MS` (default 60000)
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a dequeued task stays hidden before the reaper may requeue it.
    pub visibility_timeout: Duration,
    /// Default retry budget for enqueued tasks.
    pub max_retries: u32,
    /// Base of the exponential retry backoff.
    pub backoff_base: Duration,
    /// Upper bound on the retry backoff.
    pub backoff_cap: Duration,
    /// Sleep between dequeue polls while long-polling.
    pub poll_interval: Duration,
    /// Reaper sweep interval; `None` derives visibility_timeout / 3
    /// (clamped to [1s, 30s]).
    pub reaper_interval: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            reaper_interval: None,
        }
    }
}

impl QueueConfig {
    /// Create configuration from environment variables, falling back to
    /// defaults for unset or unparsable values.
    pub fn from_env() -> Self {
        fn env_u64(name: &str) -> Option<u64> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }
        let defaults = Self::default();
        Self {
            visibility_timeout: env_u64("DBPILOT_QUEUE_VISIBILITY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.visibility_timeout),
            max_retries: env_u64("DBPILOT_QUEUE_MAX_RETRIES")
                .map(|v| v as u32)
                .unwrap_or(defaults.max_retries),
            backoff_base: env_u64("DBPILOT_QUEUE_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_cap: env_u64("DBPILOT_QUEUE_BACKOFF_CAP_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_cap),
            ..defaults
        }
    }

    fn effective_reaper_interval(&self) -> Duration {
        self.reaper_interval.unwrap_or_else(|| {
            (self.visibility_timeout / 3)
                .max(Duration::from_secs(1))
                .min(Duration::from_secs(30))
        })
    }
}

/// Operational snapshot returned by [`TaskQueue::stats`].
///
/// Set sizes come from the store; the counters are process-local and reset
/// on restart.
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Queue name
    pub name: String,
    /// Tasks ready for delivery
    pub ready: usize,
    /// Tasks currently hidden behind a visibility deadline
    pub in_flight: usize,
    /// Tasks waiting out a retry backoff or enqueue delay
    pub delayed: usize,
    /// Tasks in the dead-letter set
    pub dead: usize,
    /// Tasks enqueued by this process
    pub enqueued: u64,
    /// Tasks completed by this process
    pub completed: u64,
    /// Failures recorded by this process
    pub failed: u64,
    /// Expired in-flight tasks this process's reaper recovered
    pub recovered: u64,
}

#[derive(Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    recovered: AtomicU64,
}

struct QueueKeys {
    ready: String,
    inflight: String,
    delayed: String,
    dead: String,
    tasks: String,
}

impl QueueKeys {
    fn new(name: &str) -> Self {
        Self {
            ready: format!("queue:{}:ready", name),
            inflight: format!("queue:{}:inflight", name),
            delayed: format!("queue:{}:delayed", name),
            dead: format!("queue:{}:dead", name),
            tasks: format!("queue:{}:tasks", name),
        }
    }
}

/// Priority task queue with visibility timeout, retry backoff and
/// dead-letter handling.
///
/// Fully stateless across restarts: every piece of queue state lives in the
/// store under `queue:{name}:*`.
pub struct TaskQueue {
    store: Arc<dyn CoordinationStore>,
    name: String,
    config: QueueConfig,
    keys: QueueKeys,
    counters: QueueCounters,
    reaper_shutdown: Notify,
    reaper_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Create a queue handle. The reaper is not running until
    /// [`TaskQueue::start`].
    pub fn new(store: Arc<dyn CoordinationStore>, name: &str, config: QueueConfig) -> Self {
        Self {
            store,
            name: name.to_string(),
            config,
            keys: QueueKeys::new(name),
            counters: QueueCounters::default(),
            reaper_shutdown: Notify::new(),
            reaper_handle: Mutex::new(None),
        }
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the background visibility reaper. Idempotent.
    pub async fn start(self: Arc<Self>) {
        let mut handle = self.reaper_handle.lock().await;
        if handle.is_some() {
            return;
        }
        let queue = Arc::clone(&self);
        let interval = self.config.effective_reaper_interval();
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                tokio::select! {
                    _ = queue.reaper_shutdown.notified() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = queue.recover_expired().await {
                            warn!(queue = %queue.name, error = %e, "Visibility sweep failed");
                        }
                    }
                }
            }
            debug!(queue = %queue.name, "Reaper stopped");
        }));
    }

    /// Stop the reaper, draining any sweep in progress.
    pub async fn shutdown(&self) {
        self.reaper_shutdown.notify_waiters();
        let handle = self.reaper_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Enqueue a task.
    ///
    /// ## Returns
    /// The new task's id.
    pub async fn enqueue(
        &self,
        task_type: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> QueueResult<String> {
        let max_retries = options.max_retries.unwrap_or(self.config.max_retries);
        let mut task = Task::new(task_type, payload, options.priority, max_retries);

        if let Some(delay) = options.delay {
            let visible_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            task.visible_at = Some(visible_at);
            self.save_task(&task).await?;
            self.store
                .zadd(
                    &self.keys.delayed,
                    &task.task_id,
                    visible_at.timestamp_millis() as f64,
                )
                .await?;
        } else {
            self.save_task(&task).await?;
            self.store
                .zadd(
                    &self.keys.ready,
                    &task.task_id,
                    ready_score(task.priority, task.enqueued_at.timestamp_millis()),
                )
                .await?;
        }

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %self.name, task_id = %task.task_id, task_type, priority = ?options.priority, "Task enqueued");
        Ok(task.task_id)
    }

    /// Dequeue the highest-priority ready task, long-polling up to `timeout`.
    ///
    /// The returned task is `InFlight` and hidden from other consumers until
    /// its visibility deadline; call [`TaskQueue::complete`] or
    /// [`TaskQueue::fail`] before then.
    ///
    /// ## Returns
    /// `Ok(None)` when nothing became ready within `timeout`; expected, not
    /// an error. Transient store errors are paced like empty polls and only
    /// surfaced once the deadline passes. `timeout = 0` never blocks and
    /// surfaces store errors immediately.
    pub async fn dequeue(&self, timeout: Duration) -> QueueResult<Option<Task>> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.dequeue_once().await {
                Ok(Some(task)) => return Ok(Some(task)),
                Ok(None) => {}
                // A transient backend outage inside the long-poll budget is
                // treated like contention, same as lock acquisition
                Err(QueueError::Store(e)) if Instant::now() < deadline => {
                    debug!(queue = %self.name, error = %e, "Store error during dequeue, retrying");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }

    /// One delivery attempt: promote due delayed tasks, then claim the
    /// lowest-scored ready task.
    async fn dequeue_once(&self) -> QueueResult<Option<Task>> {
        self.promote_due_delayed().await?;

        loop {
            let visibility_deadline = Utc::now()
                + chrono::Duration::from_std(self.config.visibility_timeout).unwrap_or_default();
            let moved = self
                .store
                .zmove_min(
                    &self.keys.ready,
                    &self.keys.inflight,
                    visibility_deadline.timestamp_millis() as f64,
                )
                .await?;
            let Some(task_id) = moved else {
                return Ok(None);
            };

            match self.load_task(&task_id).await {
                Ok(mut task) => {
                    task.status = TaskStatus::InFlight;
                    task.attempt_count += 1;
                    task.visible_at = Some(visibility_deadline);
                    self.save_task(&task).await?;
                    debug!(queue = %self.name, task_id = %task.task_id, attempt = task.attempt_count, "Task dequeued");
                    return Ok(Some(task));
                }
                Err(QueueError::TaskNotFound(_)) => {
                    // Orphaned set member (purged record); drop and keep going
                    warn!(queue = %self.name, task_id = %task_id, "Dropping orphaned queue member");
                    self.store.zrem(&self.keys.inflight, &task_id).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Mark a task as successfully completed.
    pub async fn complete(
        &self,
        task_id: &str,
        result: Option<serde_json::Value>,
    ) -> QueueResult<()> {
        let mut task = self.load_task(task_id).await?;

        // The reaper may have requeued the task if our visibility elapsed;
        // pull it out of every live set so it is not delivered again.
        self.store.zrem(&self.keys.inflight, task_id).await?;
        self.store.zrem(&self.keys.ready, task_id).await?;
        self.store.zrem(&self.keys.delayed, task_id).await?;

        task.status = TaskStatus::Done;
        task.visible_at = None;
        task.result = result;
        self.save_task(&task).await?;

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %self.name, task_id, "Task completed");
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// With `retry = true` and budget remaining, the task waits out an
    /// exponential backoff in the delayed set and is delivered again.
    /// Otherwise it goes to the dead-letter set with its full error history.
    ///
    /// ## Returns
    /// The task's resulting status ([`TaskStatus::Failed`] when it will be
    /// retried, [`TaskStatus::Dead`] otherwise).
    pub async fn fail(&self, task_id: &str, error: &str, retry: bool) -> QueueResult<TaskStatus> {
        let mut task = self.load_task(task_id).await?;
        self.store.zrem(&self.keys.inflight, task_id).await?;

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        let status = self.record_failure(&mut task, error, retry).await?;
        Ok(status)
    }

    /// Run one recovery sweep: every in-flight task whose visibility
    /// deadline has elapsed is treated as an implicit `fail(retry = true)`.
    ///
    /// The `zrem` on the expired member elects exactly one recoverer, so
    /// overlapping sweeps (or reapers on other instances) never requeue the
    /// same elapsed interval twice.
    ///
    /// ## Returns
    /// Number of tasks recovered by this sweep.
    pub async fn recover_expired(&self) -> QueueResult<usize> {
        let now_ms = Utc::now().timestamp_millis() as f64;
        let expired = self
            .store
            .zrange_below(&self.keys.inflight, now_ms, SWEEP_BATCH)
            .await?;

        let mut recovered = 0;
        for (task_id, _) in expired {
            // Lost election: another sweep got here first
            if !self.store.zrem(&self.keys.inflight, &task_id).await? {
                continue;
            }
            let mut task = match self.load_task(&task_id).await {
                Ok(task) => task,
                Err(QueueError::TaskNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            info!(queue = %self.name, task_id = %task_id, attempt = task.attempt_count, "Recovering expired in-flight task");
            self.record_failure(&mut task, "visibility timeout elapsed without completion", true)
                .await?;
            self.counters.recovered.fetch_add(1, Ordering::Relaxed);
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Tasks currently in the dead-letter set, oldest death first.
    pub async fn dead_tasks(&self) -> QueueResult<Vec<Task>> {
        let members = self
            .store
            .zrange_below(&self.keys.dead, f64::MAX, 1024)
            .await?;
        let mut tasks = Vec::with_capacity(members.len());
        for (task_id, _) in members {
            match self.load_task(&task_id).await {
                Ok(task) => tasks.push(task),
                Err(QueueError::TaskNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(tasks)
    }

    /// Replay a dead task: reset its attempt budget and put it back at the
    /// end of its priority tier.
    ///
    /// ## Returns
    /// `Ok(false)` when someone else already replayed it.
    pub async fn retry_dead(&self, task_id: &str) -> QueueResult<bool> {
        let mut task = self.load_task(task_id).await?;
        if task.status != TaskStatus::Dead {
            return Err(QueueError::InvalidStatus {
                task_id: task_id.to_string(),
                status: task.status.to_string(),
                expected: TaskStatus::Dead.to_string(),
            });
        }
        if !self.store.zrem(&self.keys.dead, task_id).await? {
            return Ok(false);
        }

        task.status = TaskStatus::Pending;
        task.attempt_count = 0;
        task.visible_at = None;
        task.enqueued_at = Utc::now(); // re-enters at the back of its tier
        self.save_task(&task).await?;
        self.store
            .zadd(
                &self.keys.ready,
                task_id,
                ready_score(task.priority, task.enqueued_at.timestamp_millis()),
            )
            .await?;
        info!(queue = %self.name, task_id, "Dead task requeued for replay");
        Ok(true)
    }

    /// Drop every task and all bookkeeping for this queue.
    ///
    /// ## Returns
    /// Number of task records removed.
    pub async fn purge(&self) -> QueueResult<usize> {
        let records = self.store.hlen(&self.keys.tasks).await?;
        self.store.delete(&self.keys.ready).await?;
        self.store.delete(&self.keys.inflight).await?;
        self.store.delete(&self.keys.delayed).await?;
        self.store.delete(&self.keys.dead).await?;
        self.store.delete(&self.keys.tasks).await?;
        info!(queue = %self.name, records, "Queue purged");
        Ok(records)
    }

    /// Operational snapshot: set sizes plus this process's counters.
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        Ok(QueueStats {
            name: self.name.clone(),
            ready: self.store.zcard(&self.keys.ready).await?,
            in_flight: self.store.zcard(&self.keys.inflight).await?,
            delayed: self.store.zcard(&self.keys.delayed).await?,
            dead: self.store.zcard(&self.keys.dead).await?,
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            recovered: self.counters.recovered.load(Ordering::Relaxed),
        })
    }

    /// Shared retry-or-dead path for explicit `fail` and reaper recovery.
    async fn record_failure(
        &self,
        task: &mut Task,
        error: &str,
        retry: bool,
    ) -> QueueResult<TaskStatus> {
        let now = Utc::now();
        task.last_error = Some(error.to_string());
        task.error_history.push(TaskAttemptError {
            attempt: task.attempt_count,
            at: now,
            error: error.to_string(),
        });

        if retry && task.can_retry() {
            let backoff = self.backoff_for(task.attempt_count);
            let visible_at = now + chrono::Duration::from_std(backoff).unwrap_or_default();
            task.status = TaskStatus::Failed;
            task.visible_at = Some(visible_at);
            self.save_task(task).await?;
            self.store
                .zadd(
                    &self.keys.delayed,
                    &task.task_id,
                    visible_at.timestamp_millis() as f64,
                )
                .await?;
            debug!(queue = %self.name, task_id = %task.task_id, backoff_ms = backoff.as_millis() as u64, "Task scheduled for retry");
            Ok(TaskStatus::Failed)
        } else {
            task.status = TaskStatus::Dead;
            task.visible_at = None;
            self.save_task(task).await?;
            self.store
                .zadd(&self.keys.dead, &task.task_id, now.timestamp_millis() as f64)
                .await?;
            warn!(queue = %self.name, task_id = %task.task_id, attempts = task.attempt_count, "Task moved to dead-letter set");
            Ok(TaskStatus::Dead)
        }
    }

    /// Move due members of the delayed set into the ready set. The `zrem`
    /// election makes each promotion happen once across instances.
    async fn promote_due_delayed(&self) -> QueueResult<()> {
        let now_ms = Utc::now().timestamp_millis() as f64;
        let due = self
            .store
            .zrange_below(&self.keys.delayed, now_ms, SWEEP_BATCH)
            .await?;

        for (task_id, _) in due {
            if !self.store.zrem(&self.keys.delayed, &task_id).await? {
                continue;
            }
            let mut task = match self.load_task(&task_id).await {
                Ok(task) => task,
                Err(QueueError::TaskNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            task.status = TaskStatus::Pending;
            task.visible_at = None;
            self.save_task(&task).await?;
            self.store
                .zadd(
                    &self.keys.ready,
                    &task_id,
                    ready_score(task.priority, task.enqueued_at.timestamp_millis()),
                )
                .await?;
        }
        Ok(())
    }

    /// Exponential backoff for the attempt that just failed, capped and
    /// jittered ±50%.
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.config.backoff_base.saturating_mul(1u32 << exp);
        let capped = raw.min(self.config.backoff_cap);
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        capped.mul_f64(factor).min(self.config.backoff_cap)
    }

    async fn load_task(&self, task_id: &str) -> QueueResult<Task> {
        let bytes = self
            .store
            .hget(&self.keys.tasks, task_id)
            .await?
            .ok_or_else(|| QueueError::TaskNotFound(task_id.to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn save_task(&self, task: &Task) -> QueueResult<()> {
        let bytes = serde_json::to_vec(task)?;
        self.store.hset(&self.keys.tasks, &task.task_id, bytes).await?;
        Ok(())
    }
}

/// Ready-set score: strict priority tiers, FIFO inside a tier.
fn ready_score(priority: TaskPriority, enqueued_at_ms: i64) -> f64 {
    priority.tier() as f64 * PRIORITY_BAND + enqueued_at_ms as f64
}
