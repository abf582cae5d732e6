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

//! Configuration support for coordination store backends.
//!
//! ## Environment Variables
//! - `DBPILOT_STORE_BACKEND`: backend type (default: "in-memory")
//!   - "in-memory" | "memory" → [`crate::InMemoryStore`]
//!   - "redis" → `RedisStore` (requires the `redis-backend` feature)
//! - `DBPILOT_STORE_REDIS_URL`: Redis server URL (default: "redis://localhost:6379")
//! - `DBPILOT_STORE_REDIS_NAMESPACE`: key prefix for isolation (default: "dbpilot")

use crate::{CoordinationStore, InMemoryStore, StoreError, StoreResult};
use std::sync::Arc;

/// Backend type configuration.
#[derive(Clone, Debug)]
pub enum BackendType {
    /// In-memory backend (default, always available)
    InMemory,
    /// Redis backend (requires the `redis-backend` feature)
    Redis {
        /// Redis server URL
        url: String,
        /// Key namespace prefix
        namespace: String,
    },
}

impl Default for BackendType {
    fn default() -> Self {
        Self::InMemory
    }
}

/// Coordination store configuration.
#[derive(Clone, Debug, Default)]
pub struct StoreConfig {
    /// Backend type
    pub backend: BackendType,
}

impl StoreConfig {
    /// Create configuration from environment variables.
    ///
    /// See the module documentation for the variable list.
    pub fn from_env() -> StoreResult<Self> {
        let backend_str = std::env::var("DBPILOT_STORE_BACKEND")
            .unwrap_or_else(|_| "in-memory".to_string())
            .to_lowercase();

        let backend = match backend_str.as_str() {
            "in-memory" | "memory" => BackendType::InMemory,
            "redis" => {
                let url = std::env::var("DBPILOT_STORE_REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string());
                let namespace = std::env::var("DBPILOT_STORE_REDIS_NAMESPACE")
                    .unwrap_or_else(|_| "dbpilot".to_string());
                BackendType::Redis { url, namespace }
            }
            other => {
                return Err(StoreError::Config(format!(
                    "Unknown backend type: {}. Valid options: in-memory, redis",
                    other
                )))
            }
        };

        Ok(Self { backend })
    }

    /// Create configuration with an explicit backend.
    pub fn with_backend(backend: BackendType) -> Self {
        Self { backend }
    }
}

/// Build a store from configuration.
///
/// ## Errors
/// - [`StoreError::Config`] when the configured backend is not compiled in
/// - [`StoreError::Unavailable`] when the backend cannot be reached
pub async fn create_store_from_config(
    config: &StoreConfig,
) -> StoreResult<Arc<dyn CoordinationStore>> {
    match &config.backend {
        BackendType::InMemory => Ok(Arc::new(InMemoryStore::new())),

        #[cfg(feature = "redis-backend")]
        BackendType::Redis { url, namespace } => {
            let store = crate::RedisStore::new(url, namespace).await?;
            Ok(Arc::new(store))
        }

        #[cfg(not(feature = "redis-backend"))]
        BackendType::Redis { .. } => Err(StoreError::Config(
            "Redis backend requested but the redis-backend feature is not enabled".to_string(),
        )),
    }
}

/// Build a store from environment variables.
pub async fn create_store_from_env() -> StoreResult<Arc<dyn CoordinationStore>> {
    let config = StoreConfig::from_env()?;
    create_store_from_config(&config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_backend_is_memory() {
        let config = StoreConfig::default();
        assert!(matches!(config.backend, BackendType::InMemory));
        let store = create_store_from_config(&config).await.unwrap();
        assert!(!store.exists("anything").await.unwrap());
    }
}
