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

//! Connection seam between a [`LockSession`](crate::LockSession) and the datastore.
//!
//! A lock's identity in the datastore is scoped to the server-side session of
//! the connection that took it. The traits here model exactly that: a source
//! that hands out one dedicated connection at a time, and a connection that can
//! run the two named-lock calls and be torn down without ever going back to an
//! idle pool.

use crate::LockResult;
use async_trait::async_trait;
use std::fmt;

/// The two datastore calls a session makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive<'a> {
    /// `try-acquire(name, timeout)`: 1 if acquired, 0 if the wait timed out
    TryAcquire { name: &'a str, timeout_secs: u32 },
    /// `release(name)`: 1 if released, 0 if not held by this session
    Release { name: &'a str },
}

impl<'a> Primitive<'a> {
    /// Lock name the call targets.
    pub fn name(&self) -> &'a str {
        match self {
            Primitive::TryAcquire { name, .. } | Primitive::Release { name } => name,
        }
    }
}

impl fmt::Display for Primitive<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Primitive::TryAcquire { name, timeout_secs } => write!(f, "try-acquire({name}, {timeout_secs})"),
            Primitive::Release { name } => write!(f, "release({name})"),
        }
    }
}

/// A dedicated connection, exclusively owned by one session while it holds a lock.
#[async_trait]
pub trait LockConnection: Send {
    /// Run a single-row, single-column call and return its scalar.
    ///
    /// `Ok(None)` is a SQL NULL. Execution and decode failures are returned as
    /// [`LockError::PrimitiveError`](crate::LockError::PrimitiveError).
    async fn query_scalar(&mut self, primitive: &Primitive<'_>) -> LockResult<Option<i64>>;

    /// Close the connection gracefully. The connection is never recycled.
    async fn close(self) -> LockResult<()>
    where
        Self: Sized;

    /// Drop the transport without a graceful close.
    ///
    /// Used where awaiting is impossible (`Drop`). The datastore still observes
    /// the session ending and releases any lock taken on it.
    fn abandon(self)
    where
        Self: Sized;
}

/// Factory for dedicated connections.
///
/// ## Contract
/// - At most one connection is checked out at any time
/// - No idle connections are retained: every checkout is a fresh datastore session
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Connection type handed out by this source.
    type Connection: LockConnection;

    /// Check out a fresh dedicated connection.
    async fn checkout(&self) -> LockResult<Self::Connection>;
}
