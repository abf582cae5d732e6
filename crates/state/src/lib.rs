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

//! # DbPilot State Synchronization
//!
//! ## Purpose
//! Versioned key-value state shared across DbPilot instances (cluster
//! topology, connection registries, feature flags) with change
//! notifications so every instance converges without polling.
//!
//! ## Consistency model
//! - Versions are monotonic per key; a stale guarded write is rejected with
//!   [`StateError::Conflict`], never silently applied
//! - Reads may be up to `local_cache_ttl` stale (5s default); change events
//!   keep caches warmer than that in practice
//! - Counters are a separate store-atomic facility, unversioned by design
//!
//! ## Examples
//!
//! ```rust
//! use dbpilot_state::{StateConfig, StateSync};
//! use dbpilot_store::InMemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let state = Arc::new(StateSync::new(
//!     Arc::new(InMemoryStore::new()),
//!     "cluster",
//!     StateConfig::default(),
//! ));
//! Arc::clone(&state).start().await?;
//!
//! let version = state.set("leader", serde_json::json!("node-a"), None).await?;
//! let (value, v) = state.get("leader").await?.expect("just written");
//! assert_eq!(v, version);
//! # let _ = value;
//! state.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod manager;
pub mod sync;

pub use error::{StateError, StateResult};
pub use manager::StateManager;
pub use sync::{
    ChangeHandler, StateChange, StateConfig, StateEntry, StateSync, SubscriptionId,
};
