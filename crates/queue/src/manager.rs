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

//! Queue registry: one shared [`TaskQueue`] handle per queue name.

use crate::queue::{QueueConfig, TaskQueue};
use dbpilot_store::CoordinationStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Hands out shared [`TaskQueue`] handles keyed by queue name and owns their
/// reaper lifecycles.
///
/// Two calls to [`QueueManager::queue`] with the same name return the same
/// handle, so per-queue reapers are started exactly once per process.
pub struct QueueManager {
    store: Arc<dyn CoordinationStore>,
    config: QueueConfig,
    queues: RwLock<HashMap<String, Arc<TaskQueue>>>,
}

impl QueueManager {
    /// Create a manager; queues it hands out share `config`.
    pub fn new(store: Arc<dyn CoordinationStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Get (or create) the queue with the given name. Creation starts the
    /// queue's background reaper.
    pub async fn queue(&self, name: &str) -> Arc<TaskQueue> {
        {
            let queues = self.queues.read().await;
            if let Some(queue) = queues.get(name) {
                return Arc::clone(queue);
            }
        }

        let mut queues = self.queues.write().await;
        // Double-check: another task may have created it while we waited
        if let Some(queue) = queues.get(name) {
            return Arc::clone(queue);
        }

        let queue = Arc::new(TaskQueue::new(
            Arc::clone(&self.store),
            name,
            self.config.clone(),
        ));
        Arc::clone(&queue).start().await;
        info!(queue = name, "Task queue created");
        queues.insert(name.to_string(), Arc::clone(&queue));
        queue
    }

    /// Names of queues this manager has created.
    pub async fn queue_names(&self) -> Vec<String> {
        self.queues.read().await.keys().cloned().collect()
    }

    /// Stop every queue's reaper. Queue state in the store is untouched.
    pub async fn shutdown(&self) {
        let queues: Vec<Arc<TaskQueue>> = self.queues.read().await.values().cloned().collect();
        for queue in queues {
            queue.shutdown().await;
        }
        info!("Queue manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbpilot_store::InMemoryStore;

    #[tokio::test]
    async fn test_same_name_returns_shared_handle() {
        let manager = QueueManager::new(Arc::new(InMemoryStore::new()), QueueConfig::default());
        let a = manager.queue("maintenance").await;
        let b = manager.queue("maintenance").await;
        assert!(Arc::ptr_eq(&a, &b));

        let c = manager.queue("reports").await;
        assert!(!Arc::ptr_eq(&a, &c));

        let mut names = manager.queue_names().await;
        names.sort();
        assert_eq!(names, vec!["maintenance", "reports"]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_reapers() {
        let manager = QueueManager::new(Arc::new(InMemoryStore::new()), QueueConfig::default());
        let queue = manager.queue("maintenance").await;
        manager.shutdown().await;
        // Reaper is gone; a second shutdown is a no-op
        queue.shutdown().await;
    }
}
