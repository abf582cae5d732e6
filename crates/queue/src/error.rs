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

//! Error types for task queue operations.
//!
//! An empty queue is `Ok(None)` from dequeue, and a task hitting the
//! dead-letter set is a terminal *status*, not an error.

use dbpilot_store::StoreError;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur during queue operations.
#[derive(Error, Debug)]
pub enum QueueError {
    /// No record for the given task id
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Operation requires a different task status (e.g. retrying a live task)
    #[error("Task {task_id} has status {status}, expected {expected}")]
    InvalidStatus {
        /// Task the operation targeted
        task_id: String,
        /// Status the task actually has
        status: String,
        /// Status the operation requires
        expected: String,
    },

    /// Store operation failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Task record could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}
