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

//! Task model: what is persisted per task and how delivery is ordered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use ulid::Ulid;

/// Delivery priority. Strictly ordered: no lower tier is dequeued while a
/// higher tier has a ready task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskPriority {
    /// Delivered before everything else (failover, safety actions)
    Critical,
    /// Urgent operational work
    High,
    /// Default tier
    #[default]
    Normal,
    /// Background/housekeeping work
    Low,
}

impl TaskPriority {
    /// Numeric tier, 0 = most urgent. Part of the ready-set score.
    pub fn tier(self) -> u8 {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 3,
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Ready (or scheduled) for delivery
    Pending,
    /// Delivered to one consumer, hidden until its visibility deadline
    InFlight,
    /// Completed successfully; record retained for introspection
    Done,
    /// Last attempt failed; waiting out its retry backoff
    Failed,
    /// Retries exhausted (or retry declined); in the dead-letter set
    Dead,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::InFlight => "IN_FLIGHT",
            TaskStatus::Done => "DONE",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Dead => "DEAD",
        };
        f.write_str(s)
    }
}

/// One failed attempt, kept in the task's error history for operator replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAttemptError {
    /// Attempt number that failed (1-based)
    pub attempt: u32,
    /// When the failure was recorded
    pub at: DateTime<Utc>,
    /// Error description from the consumer (or the reaper)
    pub error: String,
}

/// A unit of asynchronous work, serialized as JSON in the queue's task hash.
///
/// ## Invariants
/// - `attempt_count` is monotonically non-decreasing and never exceeds
///   `max_retries` before the task reaches [`TaskStatus::Dead`]
/// - While `InFlight`, the task is visible to exactly one consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier (ULID, sortable by creation time)
    pub task_id: String,
    /// Consumer-facing task kind (e.g. "backup", "reindex")
    pub task_type: String,
    /// Arbitrary JSON payload
    pub payload: serde_json::Value,
    /// Delivery priority
    pub priority: TaskPriority,
    /// Lifecycle status
    pub status: TaskStatus,
    /// Number of delivery attempts so far (incremented on dequeue)
    pub attempt_count: u32,
    /// Attempts allowed before the task goes to the dead-letter set
    pub max_retries: u32,
    /// When the task was enqueued (FIFO position within its tier)
    pub enqueued_at: DateTime<Utc>,
    /// While in flight: the visibility deadline. While waiting out a retry
    /// backoff: when the task becomes deliverable again.
    pub visible_at: Option<DateTime<Utc>>,
    /// Most recent failure, if any
    pub last_error: Option<String>,
    /// Every failed attempt, oldest first
    #[serde(default)]
    pub error_history: Vec<TaskAttemptError>,
    /// Consumer-provided result recorded by `complete`
    pub result: Option<serde_json::Value>,
}

impl Task {
    /// Create a fresh `Pending` task.
    pub fn new(
        task_type: &str,
        payload: serde_json::Value,
        priority: TaskPriority,
        max_retries: u32,
    ) -> Self {
        Self {
            task_id: Ulid::new().to_string(),
            task_type: task_type.to_string(),
            payload,
            priority,
            status: TaskStatus::Pending,
            attempt_count: 0,
            max_retries,
            enqueued_at: Utc::now(),
            visible_at: None,
            last_error: None,
            error_history: Vec::new(),
            result: None,
        }
    }

    /// Whether another retry is allowed after the current attempt failed.
    pub fn can_retry(&self) -> bool {
        self.attempt_count < self.max_retries
    }
}

/// Options for [`crate::TaskQueue::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Delivery priority (default [`TaskPriority::Normal`])
    pub priority: TaskPriority,
    /// Retry budget override; `None` uses the queue's configured default
    pub max_retries: Option<u32>,
    /// Initial delivery delay (task starts in the delayed set)
    pub delay: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_tiers_are_strictly_ordered() {
        assert!(TaskPriority::Critical.tier() < TaskPriority::High.tier());
        assert!(TaskPriority::High.tier() < TaskPriority::Normal.tier());
        assert!(TaskPriority::Normal.tier() < TaskPriority::Low.tier());
    }

    #[test]
    fn test_task_serialization_round_trip() {
        let task = Task::new(
            "backup",
            serde_json::json!({"database": "orders"}),
            TaskPriority::High,
            3,
        );
        let json = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.task_id, task.task_id);
        assert_eq!(back.priority, TaskPriority::High);
        assert_eq!(back.status, TaskStatus::Pending);
        assert_eq!(back.attempt_count, 0);
    }

    #[test]
    fn test_can_retry_bounds() {
        let mut task = Task::new("t", serde_json::Value::Null, TaskPriority::Normal, 2);
        task.attempt_count = 1;
        assert!(task.can_retry());
        task.attempt_count = 2;
        assert!(!task.can_retry());
    }
}
