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

//! Error types for state synchronization.

use dbpilot_store::StoreError;
use thiserror::Error;

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state operations.
#[derive(Error, Debug)]
pub enum StateError {
    /// A guarded write's expected version did not match the stored version.
    /// Never retried internally; the caller must re-read and decide.
    #[error("Version conflict: expected {expected}, stored version is {actual}")]
    Conflict {
        /// Version the caller expected
        expected: u64,
        /// Version actually stored
        actual: u64,
    },

    /// An unguarded write lost the compare-and-set race more times than the
    /// retry budget allows
    #[error("Write contention on key '{0}' exceeded the retry budget")]
    Contention(String),

    /// Store operation failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// State entry could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}
