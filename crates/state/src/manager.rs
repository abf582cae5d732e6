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

//! State registry: one shared [`StateSync`] handle per namespace.

use crate::sync::{StateConfig, StateSync};
use crate::StateResult;
use dbpilot_store::CoordinationStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Hands out shared [`StateSync`] handles keyed by namespace and owns their
/// listener lifecycles.
pub struct StateManager {
    store: Arc<dyn CoordinationStore>,
    config: StateConfig,
    namespaces: RwLock<HashMap<String, Arc<StateSync>>>,
}

impl StateManager {
    /// Create a manager; instances it hands out share `config`.
    pub fn new(store: Arc<dyn CoordinationStore>, config: StateConfig) -> Self {
        Self {
            store,
            config,
            namespaces: RwLock::new(HashMap::new()),
        }
    }

    /// Get (or create) the state instance for `namespace`. Creation starts
    /// the instance's change listener.
    pub async fn state(&self, namespace: &str) -> StateResult<Arc<StateSync>> {
        {
            let namespaces = self.namespaces.read().await;
            if let Some(state) = namespaces.get(namespace) {
                return Ok(Arc::clone(state));
            }
        }

        let mut namespaces = self.namespaces.write().await;
        if let Some(state) = namespaces.get(namespace) {
            return Ok(Arc::clone(state));
        }

        let state = Arc::new(StateSync::new(
            Arc::clone(&self.store),
            namespace,
            self.config.clone(),
        ));
        Arc::clone(&state).start().await?;
        info!(namespace, "State namespace created");
        namespaces.insert(namespace.to_string(), Arc::clone(&state));
        Ok(state)
    }

    /// Stop every namespace's change listener. Stored state is untouched.
    pub async fn shutdown(&self) {
        let states: Vec<Arc<StateSync>> =
            self.namespaces.read().await.values().cloned().collect();
        for state in states {
            state.shutdown().await;
        }
        info!("State manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbpilot_store::InMemoryStore;

    #[tokio::test]
    async fn test_same_namespace_returns_shared_handle() {
        let manager = StateManager::new(Arc::new(InMemoryStore::new()), StateConfig::default());
        let a = manager.state("cluster").await.unwrap();
        let b = manager.state("cluster").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = manager.state("sessions").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        manager.shutdown().await;
    }
}
