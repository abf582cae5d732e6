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

//! # DbPilot Task Queue
//!
//! ## Purpose
//! Priority-ordered, at-least-once work queue for asynchronous tasks shared
//! across DbPilot instances: backups, index rebuilds, report generation,
//! anything one instance enqueues and any instance may execute.
//!
//! ## Delivery model (SQS-style)
//! - A dequeued task is hidden from other consumers for a visibility
//!   timeout, not removed; only `complete` removes it
//! - A consumer that crashes mid-task simply lets the visibility elapse;
//!   the background reaper requeues the task (implicit `fail(retry=true)`)
//! - Delivery is therefore at-least-once, never at-most-once; consumers
//!   must be idempotent
//!
//! ## Ordering
//! Strict priority first (Critical > High > Normal > Low), FIFO within a
//! tier. No lower-priority task is dequeued while a higher one is ready.
//!
//! ## Examples
//!
//! ```rust
//! use dbpilot_queue::{EnqueueOptions, QueueConfig, TaskPriority, TaskQueue};
//! use dbpilot_store::InMemoryStore;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = TaskQueue::new(Arc::new(InMemoryStore::new()), "maintenance", QueueConfig::default());
//!
//! let id = queue
//!     .enqueue("backup", serde_json::json!({"database": "orders"}), EnqueueOptions {
//!         priority: TaskPriority::High,
//!         ..Default::default()
//!     })
//!     .await?;
//!
//! if let Some(task) = queue.dequeue(Duration::ZERO).await? {
//!     // ... do the work ...
//!     queue.complete(&task.task_id, None).await?;
//! }
//! # let _ = id;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod manager;
pub mod queue;
pub mod task;

pub use error::{QueueError, QueueResult};
pub use manager::QueueManager;
pub use queue::{QueueConfig, QueueStats, TaskQueue};
pub use task::{EnqueueOptions, Task, TaskAttemptError, TaskPriority, TaskStatus};
