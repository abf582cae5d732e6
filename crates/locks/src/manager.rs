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

//! Process-wide registry of named locks.

use crate::lock::{DistributedLock, LockConfig};
use dbpilot_store::CoordinationStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Hands out shared [`DistributedLock`] instances keyed by resource name.
///
/// Two callers asking for the same resource within one process get the same
/// `Arc`; across processes, coordination happens through the store anyway.
/// Owned by the application root, not a global.
pub struct LockManager {
    store: Arc<dyn CoordinationStore>,
    config: LockConfig,
    locks: RwLock<HashMap<String, Arc<DistributedLock>>>,
}

impl LockManager {
    /// Create a manager over a shared store.
    pub fn new(store: Arc<dyn CoordinationStore>, config: LockConfig) -> Self {
        Self {
            store,
            config,
            locks: RwLock::new(HashMap::new()),
        }
    }

    /// Get (or create) the lock for `resource`.
    pub async fn lock(&self, resource: &str) -> Arc<DistributedLock> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(resource) {
                return Arc::clone(lock);
            }
        }

        let mut locks = self.locks.write().await;
        Arc::clone(locks.entry(resource.to_string()).or_insert_with(|| {
            Arc::new(DistributedLock::new(
                Arc::clone(&self.store),
                resource,
                self.config.clone(),
            ))
        }))
    }
}
