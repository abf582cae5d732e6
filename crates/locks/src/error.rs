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

//! Error types for distributed lock operations.
//!
//! Contention and loss of ownership are *not* errors here: acquire returns
//! `Ok(None)` on a held lock and extend returns `Ok(false)` on a lost one.
//! Errors are reserved for the store being unusable.

use dbpilot_store::StoreError;
use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Acquisition gave up: the store kept failing for the whole wait budget
    #[error("Lock acquisition failed for '{resource}': {reason}")]
    Acquisition {
        /// Resource name the acquisition targeted
        resource: String,
        /// Last underlying failure
        reason: String,
    },

    /// Store operation failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Lock record could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for LockError {
    fn from(err: serde_json::Error) -> Self {
        LockError::Serialization(err.to_string())
    }
}
