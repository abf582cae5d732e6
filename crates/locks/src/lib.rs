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

//! # DbPilot Distributed Locks
//!
//! ## Purpose
//! TTL-bounded mutual exclusion across DbPilot instances, built on the
//! store's atomic "set-if-absent + TTL" primitive. Used to serialize
//! operations that must not run concurrently on two instances (schema
//! migrations, failover procedures, maintenance windows).
//!
//! ## Design
//! - **Ownership tokens**: every acquisition mints an opaque ULID token;
//!   release and extend are token-checked compare-and-delete /
//!   compare-and-expire, so a holder whose TTL silently expired cannot
//!   clobber the next owner
//! - **TTL expiry is the deadlock prevention**: a crashed holder's lock
//!   vanishes when its TTL elapses; no reaper needed
//! - **Contention is not an error**: a held lock surfaces as `Ok(None)`
//!   from [`DistributedLock::acquire`], never as a failure
//!
//! ## Examples
//!
//! ```rust
//! use dbpilot_locks::{AcquireOptions, LockManager};
//! use dbpilot_store::InMemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = LockManager::new(Arc::new(InMemoryStore::new()), Default::default());
//! let lock = manager.lock("schema-migration").await;
//!
//! if let Some(token) = lock.acquire(AcquireOptions::default()).await? {
//!     // ... critical section ...
//!     lock.release(&token).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod lock;
pub mod manager;

pub use error::{LockError, LockResult};
pub use lock::{AcquireOptions, DistributedLock, LockConfig, LockToken};
pub use manager::LockManager;
