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

//! Distributed lock bound to a single resource name.

use crate::{LockError, LockResult};
use chrono::{DateTime, Utc};
use dbpilot_store::{CoordinationStore, SetMode};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use ulid::Ulid;

/// Lock configuration.
///
/// ## Environment Variables (`LockConfig::from_env`)
/// - `DBPILOT_LOCK_TTL_SECS` (default 30)
/// - `DBPILOT_LOCK_RETRY_INTERVAL_MS` (default 100)
/// - `DBPILOT_LOCK_MAX_WAIT_MS` (default 30000)
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Default lease duration for an acquisition.
    pub ttl: Duration,
    /// Base interval between blocking-acquire retries (jittered ±50%).
    pub retry_interval: Duration,
    /// Default wait budget for blocking acquisition.
    pub max_wait: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retry_interval: Duration::from_millis(100),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl LockConfig {
    /// Create configuration from environment variables, falling back to
    /// defaults for unset or unparsable values.
    pub fn from_env() -> Self {
        fn env_u64(name: &str) -> Option<u64> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }
        let defaults = Self::default();
        Self {
            ttl: env_u64("DBPILOT_LOCK_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.ttl),
            retry_interval: env_u64("DBPILOT_LOCK_RETRY_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_interval),
            max_wait: env_u64("DBPILOT_LOCK_MAX_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_wait),
        }
    }
}

/// Per-acquisition options. `None` fields fall back to the lock's
/// [`LockConfig`].
#[derive(Debug, Clone, Default)]
pub struct AcquireOptions {
    /// Lease duration for this acquisition.
    pub ttl: Option<Duration>,
    /// Retry on contention until `max_wait` elapses. `false` means one
    /// attempt, immediate `None` on contention.
    pub blocking: bool,
    /// Base retry interval (jittered ±50%).
    pub retry_interval: Option<Duration>,
    /// Wait budget for blocking acquisition. `Some(0)` never blocks.
    pub max_wait: Option<Duration>,
}

impl AcquireOptions {
    /// Blocking acquisition with the given wait budget.
    pub fn blocking(max_wait: Duration) -> Self {
        Self {
            blocking: true,
            max_wait: Some(max_wait),
            ..Default::default()
        }
    }
}

/// What is persisted under `lock:{resource}` for the lifetime of the lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    token: String,
    acquired_at: DateTime<Utc>,
    ttl_secs: u64,
}

/// Proof of ownership returned by a successful acquisition.
///
/// Release and extend require the token; a token whose TTL has silently
/// expired no longer matches the stored record and both become no-ops.
#[derive(Debug, Clone)]
pub struct LockToken {
    resource: String,
    token: String,
    /// Exact bytes stored at acquisition; the comparand for the
    /// compare-and-delete / compare-and-expire store calls.
    record: Vec<u8>,
    acquired_at: DateTime<Utc>,
    ttl: Duration,
}

impl LockToken {
    /// Resource this token belongs to.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Opaque per-acquisition identifier.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the lease was acquired.
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Lease duration at acquisition.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Distributed mutual-exclusion lock for one named resource.
///
/// ## Invariant
/// At most one live (non-expired) token exists per resource, enforced by the
/// store's atomic set-if-absent with TTL.
///
/// ## Failure semantics
/// - Transient store errors during a blocking acquire are retried as
///   contention inside the wait budget, then surfaced as
///   [`LockError::Acquisition`]
/// - Release errors are logged and swallowed; the TTL bounds how long a
///   stale entry can linger
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
    resource: String,
    key: String,
    config: LockConfig,
}

impl DistributedLock {
    /// Create a lock handle for `resource`.
    pub fn new(store: Arc<dyn CoordinationStore>, resource: &str, config: LockConfig) -> Self {
        Self {
            store,
            resource: resource.to_string(),
            key: format!("lock:{}", resource),
            config,
        }
    }

    /// Resource name this lock guards.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Try to acquire the lock.
    ///
    /// ## Returns
    /// - `Ok(Some(token))` on success
    /// - `Ok(None)` when the lock is held by someone else (and the wait
    ///   budget, if any, ran out); expected contention, not an error
    /// - `Err(LockError::Acquisition)` when the store failed for the entire
    ///   attempt without ever reporting clean contention
    pub async fn acquire(&self, options: AcquireOptions) -> LockResult<Option<LockToken>> {
        let ttl = options.ttl.unwrap_or(self.config.ttl);
        let retry_interval = options.retry_interval.unwrap_or(self.config.retry_interval);
        let max_wait = options.max_wait.unwrap_or(self.config.max_wait);
        let deadline = Instant::now() + max_wait;

        let mut saw_contention = false;
        let mut last_store_error: Option<String> = None;

        loop {
            let token = Ulid::new().to_string();
            let acquired_at = Utc::now();
            let record = serde_json::to_vec(&LockRecord {
                token: token.clone(),
                acquired_at,
                ttl_secs: ttl.as_secs(),
            })?;

            match self
                .store
                .set(&self.key, record.clone(), SetMode::IfAbsent, Some(ttl))
                .await
            {
                Ok(true) => {
                    debug!(resource = %self.resource, %token, "Lock acquired");
                    return Ok(Some(LockToken {
                        resource: self.resource.clone(),
                        token,
                        record,
                        acquired_at,
                        ttl,
                    }));
                }
                Ok(false) => {
                    saw_contention = true;
                    last_store_error = None;
                    debug!(resource = %self.resource, "Lock contended");
                }
                // Treated as contention within the wait budget
                Err(e) => {
                    debug!(resource = %self.resource, error = %e, "Store error during acquire");
                    last_store_error = Some(e.to_string());
                }
            }

            if !options.blocking || Instant::now() >= deadline {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(jittered(retry_interval).min(remaining)).await;
        }

        match last_store_error {
            Some(reason) if !saw_contention => Err(LockError::Acquisition {
                resource: self.resource.clone(),
                reason,
            }),
            _ => Ok(None),
        }
    }

    /// Release the lock.
    ///
    /// Atomic compare-and-delete on the stored record: if the token no
    /// longer matches (TTL expired, someone else owns the key) this is a
    /// no-op. Idempotent; store errors are logged and swallowed since the
    /// TTL bounds staleness either way.
    ///
    /// ## Returns
    /// `Ok(true)` if this call removed the lock, `Ok(false)` on a no-op.
    pub async fn release(&self, token: &LockToken) -> LockResult<bool> {
        match self.store.compare_and_delete(&self.key, &token.record).await {
            Ok(released) => {
                debug!(resource = %self.resource, token = %token.token, released, "Lock release");
                Ok(released)
            }
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "Store error during release, relying on TTL expiry");
                Ok(false)
            }
        }
    }

    /// Extend the lease.
    ///
    /// ## Returns
    /// `Ok(false)` when the token no longer matches the stored record; the
    /// caller has lost the lock and must abort its critical section.
    pub async fn extend(&self, token: &LockToken, new_ttl: Duration) -> LockResult<bool> {
        let extended = self
            .store
            .compare_and_expire(&self.key, &token.record, new_ttl)
            .await?;
        if !extended {
            warn!(resource = %self.resource, token = %token.token, "Extend failed, lock ownership lost");
        }
        Ok(extended)
    }

    /// Whether any holder currently owns the resource.
    pub async fn is_held(&self) -> LockResult<bool> {
        Ok(self.store.exists(&self.key).await?)
    }

    /// Run `section` under the lock, releasing on every exit path, panics
    /// included (a panicking section releases from a drop guard).
    ///
    /// With `auto_extend`, a background ticker refreshes the lease at half
    /// the TTL until release. If the process is killed mid-section the TTL
    /// is the backstop that frees the lock.
    ///
    /// ## Returns
    /// `Ok(None)` when the lock could not be acquired; the section does not
    /// run in that case.
    pub async fn with_lock<T, F, Fut>(
        &self,
        options: AcquireOptions,
        auto_extend: bool,
        section: F,
    ) -> LockResult<Option<T>>
    where
        F: FnOnce(LockToken) -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(token) = self.acquire(options).await? else {
            return Ok(None);
        };

        let extender = auto_extend.then(|| {
            let store = Arc::clone(&self.store);
            let key = self.key.clone();
            let record = token.record.clone();
            let ttl = token.ttl;
            let resource = self.resource.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(ttl / 2);
                ticker.tick().await; // first tick fires immediately
                loop {
                    ticker.tick().await;
                    match store.compare_and_expire(&key, &record, ttl).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(resource = %resource, "Auto-extend lost the lock, stopping ticker");
                            break;
                        }
                        Err(e) => {
                            warn!(resource = %resource, error = %e, "Auto-extend store error");
                        }
                    }
                }
            })
        });

        let mut guard = ReleaseGuard {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
            record: token.record.clone(),
            resource: self.resource.clone(),
            extender,
            armed: true,
        };

        let result = section(token.clone()).await;

        // Normal exit: disarm the guard and release inline so errors reach
        // the caller
        guard.armed = false;
        drop(guard);
        self.release(&token).await?;

        Ok(Some(result))
    }
}

/// Releases the lock (and stops the auto-extend ticker) from `Drop` unless
/// disarmed. Covers a panic unwinding out of a `with_lock` section: `Drop`
/// cannot await, so the token-checked delete is spawned.
struct ReleaseGuard {
    store: Arc<dyn CoordinationStore>,
    key: String,
    record: Vec<u8>,
    resource: String,
    extender: Option<tokio::task::JoinHandle<()>>,
    armed: bool,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.extender.take() {
            handle.abort();
        }
        if !self.armed {
            return;
        }
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let record = std::mem::take(&mut self.record);
        let resource = std::mem::take(&mut self.resource);
        tokio::spawn(async move {
            if let Err(e) = store.compare_and_delete(&key, &record).await {
                warn!(resource = %resource, error = %e, "Release after unwind failed, TTL expiry is the backstop");
            }
        });
    }
}

/// Jitter a duration by ±50% to spread contending retries.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    base.mul_f64(factor)
}
