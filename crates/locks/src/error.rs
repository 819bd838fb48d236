// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of dlock.
//
// dlock is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// dlock is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with dlock. If not, see <https://www.gnu.org/licenses/>.

//! Error types for named lock sessions.

use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur while acquiring or releasing a named lock.
///
/// A timed-out acquire is not an error: [`LockSession::acquire`](crate::LockSession::acquire)
/// returns `Ok(false)` for that case.
#[derive(Error, Debug)]
pub enum LockError {
    /// A dedicated connection could not be obtained or closed
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The acquire/release call itself failed (transport fault, datastore unavailable, decode)
    #[error("Primitive execution error: {0}")]
    PrimitiveError(String),

    /// The acquire call failed and tearing down its connection failed as well
    #[error("Primitive execution error: {primitive}; connection teardown also failed: {teardown}")]
    AcquireAborted { primitive: String, teardown: String },

    /// Release without a held lock, or the datastore reports the lock is not held by this session
    #[error("Lock is not locked: {0}")]
    NotLocked(String),

    /// Acquire on a session that already holds its lock
    #[error("Lock already held by this session: {0}")]
    AlreadyHeld(String),

    /// The session's last release failed; the session must be discarded
    #[error("Session is unusable after a failed release: {0}")]
    SessionPoisoned(String),

    /// Invalid lock name
    #[error("Invalid lock name: {0}")]
    InvalidName(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl LockError {
    /// True for errors that come from the transport or datastore rather than from misuse.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LockError::ConnectionError(_) | LockError::PrimitiveError(_) | LockError::AcquireAborted { .. }
        )
    }
}

impl From<std::io::Error> for LockError {
    fn from(err: std::io::Error) -> Self {
        LockError::ConfigError(format!("IO error: {}", err))
    }
}

impl From<toml::de::Error> for LockError {
    fn from(err: toml::de::Error) -> Self {
        LockError::ConfigError(format!("TOML parse error: {}", err))
    }
}

#[cfg(feature = "mysql-backend")]
impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        LockError::ConnectionError(format!("SQL error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(LockError::ConnectionError("refused".into()).is_transport());
        assert!(LockError::PrimitiveError("broken pipe".into()).is_transport());
        assert!(LockError::AcquireAborted {
            primitive: "broken pipe".into(),
            teardown: "reset".into(),
        }
        .is_transport());
        assert!(!LockError::NotLocked("job".into()).is_transport());
        assert!(!LockError::SessionPoisoned("job".into()).is_transport());
    }

    #[test]
    fn test_acquire_aborted_reports_both_causes() {
        let err = LockError::AcquireAborted {
            primitive: "server gone away".into(),
            teardown: "connection reset".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("server gone away"));
        assert!(msg.contains("connection reset"));
    }
}
