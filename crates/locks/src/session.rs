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

//! Lock session: one named lock bound to one dedicated connection.
//!
//! ## Purpose
//! Ties the lifetime of a named lock to the lifetime of a datastore
//! connection. If the process dies or the connection drops, the datastore ends
//! the session and releases the lock on its own, so a crashed client can never
//! leave the lock stuck.
//!
//! ## States
//! - **Idle**: no connection, lock definitely not held by this session
//! - **Held**: a live dedicated connection that holds the lock
//! - **Poisoned**: a release failed; the connection is kept untouched and the
//!   session refuses further use until it is discarded or dropped
//!
//! | From | Operation | Outcome | To |
//! |------|-----------|---------|----|
//! | Idle | acquire | acquired | Held |
//! | Idle | acquire | timed out / error | Idle |
//! | Held | release | released | Idle |
//! | Held | release | error / not held | Poisoned |
//! | Idle | release | - | Idle (`NotLocked`) |
//! | Held | acquire | - | Held (`AlreadyHeld`) |
//!
//! A session is not meant to be shared: every contender builds its own, and
//! `&mut self` on both operations enforces sequential use.

use crate::connection::{ConnectionSource, LockConnection, Primitive};
use crate::invoker::invoke;
use crate::{LockError, LockResult};
use std::fmt;
use std::mem;
use tracing::{debug, instrument};

/// Longest lock name the datastore accepts, in characters.
pub const MAX_LOCK_NAME_LEN: usize = 64;

enum SessionState<C> {
    Idle,
    Held(C),
    Poisoned(C),
}

impl<C> SessionState<C> {
    fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Held(_) => "held",
            SessionState::Poisoned(_) => "poisoned",
        }
    }
}

/// A named lock bound to a dedicated datastore connection.
///
/// ## Example
/// ```rust,no_run
/// use dlock_locks::{LockSession, memory::MemoryDatastore};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let datastore = MemoryDatastore::new();
/// let mut session = LockSession::new("checkout-job", datastore.source())?;
///
/// if session.acquire(2).await? {
///     // critical section
///     session.release().await?;
/// }
/// # Ok(())
/// # }
/// ```
pub struct LockSession<S: ConnectionSource> {
    name: String,
    source: S,
    state: SessionState<S::Connection>,
}

impl<S: ConnectionSource> LockSession<S> {
    /// Create an idle session for `name`. No connection is opened yet.
    ///
    /// ## Errors
    /// `InvalidName` if the name is empty or longer than [`MAX_LOCK_NAME_LEN`] characters.
    pub fn new(name: impl Into<String>, source: S) -> LockResult<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            source,
            state: SessionState::Idle,
        })
    }

    /// Lock name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection source this session checks out from.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// True while the session owns a connection that holds the lock.
    pub fn is_held(&self) -> bool {
        matches!(self.state, SessionState::Held(_))
    }

    /// True once a release has failed; the session must be discarded.
    pub fn is_poisoned(&self) -> bool {
        matches!(self.state, SessionState::Poisoned(_))
    }

    /// Try to acquire the lock, waiting up to `timeout_secs` inside the datastore.
    ///
    /// ## Returns
    /// - `Ok(true)`: lock held; the session keeps its dedicated connection
    /// - `Ok(false)`: timed out; the connection has been closed
    ///
    /// ## Errors
    /// - `AlreadyHeld` / `SessionPoisoned`: misuse, state unchanged
    /// - `ConnectionError`: no connection could be checked out (state unchanged),
    ///   or closing it after a timeout failed (session is idle regardless)
    /// - `PrimitiveError`: the call failed; the connection was closed before returning
    /// - `AcquireAborted`: the call failed and so did closing the connection
    #[instrument(skip(self), fields(lock_name = %self.name))]
    pub async fn acquire(&mut self, timeout_secs: u32) -> LockResult<bool> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Held(_) => return Err(LockError::AlreadyHeld(self.name.clone())),
            SessionState::Poisoned(_) => return Err(LockError::SessionPoisoned(self.name.clone())),
        }

        let mut conn = self.source.checkout().await?;
        debug!("dedicated connection checked out");

        let primitive = Primitive::TryAcquire {
            name: &self.name,
            timeout_secs,
        };
        match invoke(&mut conn, &primitive).await {
            Ok(true) => {
                self.state = SessionState::Held(conn);
                debug!("lock acquired");
                Ok(true)
            }
            Ok(false) => {
                debug!("lock not acquired within timeout, closing connection");
                conn.close().await?;
                Ok(false)
            }
            Err(err) => {
                debug!(error = %err, "acquire call failed, closing connection");
                match conn.close().await {
                    Ok(()) => Err(err),
                    Err(teardown) => Err(LockError::AcquireAborted {
                        primitive: err.to_string(),
                        teardown: teardown.to_string(),
                    }),
                }
            }
        }
    }

    /// Release the lock and close the dedicated connection.
    ///
    /// ## Errors
    /// - `NotLocked`: the session is idle (state unchanged), or the datastore
    ///   reports the lock is not held by this session (session becomes poisoned)
    /// - `PrimitiveError`: the call failed (session becomes poisoned)
    /// - `ConnectionError`: released, but closing the connection failed; the
    ///   session is idle regardless
    /// - `SessionPoisoned`: an earlier release failed
    #[instrument(skip(self), fields(lock_name = %self.name))]
    pub async fn release(&mut self) -> LockResult<()> {
        let conn = match &mut self.state {
            SessionState::Held(conn) => conn,
            SessionState::Idle => return Err(LockError::NotLocked(self.name.clone())),
            SessionState::Poisoned(_) => return Err(LockError::SessionPoisoned(self.name.clone())),
        };

        let primitive = Primitive::Release { name: &self.name };
        match invoke(conn, &primitive).await {
            Ok(true) => {
                debug!("lock released, closing connection");
                if let SessionState::Held(conn) = mem::replace(&mut self.state, SessionState::Idle) {
                    conn.close().await?;
                }
                Ok(())
            }
            Ok(false) => {
                self.poison();
                Err(LockError::NotLocked(self.name.clone()))
            }
            Err(err) => {
                self.poison();
                Err(err)
            }
        }
    }

    /// Consume the session, closing any connection it still owns.
    ///
    /// This is the way out of the poisoned state; closing the connection makes
    /// the datastore drop whatever the session may still hold.
    pub async fn discard(mut self) -> LockResult<()> {
        match mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Held(conn) | SessionState::Poisoned(conn) => conn.close().await,
            SessionState::Idle => Ok(()),
        }
    }

    fn poison(&mut self) {
        self.state = match mem::replace(&mut self.state, SessionState::Idle) {
            SessionState::Held(conn) | SessionState::Poisoned(conn) => SessionState::Poisoned(conn),
            SessionState::Idle => SessionState::Idle,
        };
        debug!(lock_name = %self.name, "release failed, session poisoned");
    }
}

impl<S: ConnectionSource> Drop for LockSession<S> {
    fn drop(&mut self) {
        // Never let a lock-holding connection outlive the session.
        if let SessionState::Held(conn) | SessionState::Poisoned(conn) = mem::replace(&mut self.state, SessionState::Idle)
        {
            debug!(lock_name = %self.name, "session dropped with a live connection, abandoning it");
            conn.abandon();
        }
    }
}

impl<S: ConnectionSource> fmt::Debug for LockSession<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockSession")
            .field("name", &self.name)
            .field("state", &self.state.label())
            .finish()
    }
}

fn validate_name(name: &str) -> LockResult<()> {
    if name.is_empty() {
        return Err(LockError::InvalidName("lock name must not be empty".into()));
    }
    let len = name.chars().count();
    if len > MAX_LOCK_NAME_LEN {
        return Err(LockError::InvalidName(format!(
            "lock name is {len} characters, at most {MAX_LOCK_NAME_LEN} allowed"
        )));
    }
    Ok(())
}
