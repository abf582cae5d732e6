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

//! # DbPilot Coordination
//!
//! ## Purpose
//! One object tying the coordination primitives together over a single
//! store connection: distributed locks, task queues and replicated state.
//! The application root constructs a [`CoordinationRegistry`] and passes it
//! down; nothing here is a global.
//!
//! ## Examples
//!
//! ```rust
//! use dbpilot_coordination::{CoordinationConfig, CoordinationRegistry};
//! use dbpilot_locks::AcquireOptions;
//! use dbpilot_store::InMemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = CoordinationRegistry::new(
//!     Arc::new(InMemoryStore::new()),
//!     CoordinationConfig::default(),
//! );
//!
//! let lock = registry.lock_manager().lock("db:orders:schema").await;
//! if let Some(token) = lock.acquire(AcquireOptions::default()).await? {
//!     // ... exclusive work ...
//!     lock.release(&token).await?;
//! }
//!
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use dbpilot_locks::{LockConfig, LockManager};
use dbpilot_queue::{QueueConfig, QueueManager, TaskQueue};
use dbpilot_state::{StateConfig, StateManager, StateResult, StateSync};
use dbpilot_store::{create_store_from_env, CoordinationStore, StoreResult};
use std::sync::Arc;
use tracing::info;

/// Configuration for every primitive the registry hands out.
#[derive(Debug, Clone, Default)]
pub struct CoordinationConfig {
    /// Lock defaults (TTL, retry pacing)
    pub lock: LockConfig,
    /// Queue defaults (visibility, retry budget, backoff)
    pub queue: QueueConfig,
    /// State defaults (cache TTL, swap retry budget)
    pub state: StateConfig,
}

impl CoordinationConfig {
    /// Create configuration from environment variables (see each member
    /// config's `from_env` for the variable names).
    pub fn from_env() -> Self {
        Self {
            lock: LockConfig::from_env(),
            queue: QueueConfig::from_env(),
            state: StateConfig::from_env(),
        }
    }
}

/// Entry point for DbPilot's coordination primitives.
///
/// All primitives share the one store the registry was built over, so a
/// lock, a queue and a state namespace created here coordinate with their
/// counterparts on every other instance pointed at the same store.
pub struct CoordinationRegistry {
    store: Arc<dyn CoordinationStore>,
    lock_manager: Arc<LockManager>,
    queue_manager: Arc<QueueManager>,
    state_manager: Arc<StateManager>,
}

impl CoordinationRegistry {
    /// Build a registry over an existing store.
    pub fn new(store: Arc<dyn CoordinationStore>, config: CoordinationConfig) -> Self {
        Self {
            lock_manager: Arc::new(LockManager::new(Arc::clone(&store), config.lock)),
            queue_manager: Arc::new(QueueManager::new(Arc::clone(&store), config.queue)),
            state_manager: Arc::new(StateManager::new(Arc::clone(&store), config.state)),
            store,
        }
    }

    /// Build a registry entirely from environment variables: backend
    /// selection (`DBPILOT_STORE_BACKEND`) plus per-primitive tuning.
    pub async fn from_env() -> StoreResult<Self> {
        let store = create_store_from_env().await?;
        Ok(Self::new(store, CoordinationConfig::from_env()))
    }

    /// The store every primitive coordinates through.
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Distributed lock manager.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Get (or create) the task queue with the given name; its reaper runs
    /// until [`CoordinationRegistry::shutdown`].
    pub async fn queue(&self, name: &str) -> Arc<TaskQueue> {
        self.queue_manager.queue(name).await
    }

    /// Get (or create) the state instance for `namespace`; its change
    /// listener runs until [`CoordinationRegistry::shutdown`].
    pub async fn state(&self, namespace: &str) -> StateResult<Arc<StateSync>> {
        self.state_manager.state(namespace).await
    }

    /// Stop all background work: state listeners first (no more incoming
    /// change dispatches), then queue reapers. Locks have no background
    /// tasks of their own; held tokens simply age out via their TTLs.
    pub async fn shutdown(&self) {
        self.state_manager.shutdown().await;
        self.queue_manager.shutdown().await;
        info!("Coordination registry shut down");
    }
}
