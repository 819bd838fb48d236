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

//! In-process datastore with session-scoped named locks (for testing).
//!
//! ## Purpose
//! Lets the session state machine be exercised without a MySQL server. Every
//! checked-out [`MemoryConnection`] is its own datastore session, and the
//! named-lock calls follow `GET_LOCK` / `RELEASE_LOCK` semantics:
//!
//! - try-acquire waits up to the timeout and answers 1 or 0; a session that
//!   already holds the name gets 1 again (the hold count is incremented)
//! - release answers 1 if this session held the name, 0 if another session
//!   holds it, NULL if nobody does
//! - ending a session (close, abandon, drop or [`MemoryDatastore::kill`])
//!   releases every lock it held and wakes waiters
//!
//! ## Fault injection
//! Checkout, query and close failures can be switched on to drive the error
//! paths of [`LockSession`](crate::LockSession).

use crate::connection::{ConnectionSource, LockConnection, Primitive};
use crate::{LockError, LockResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::debug;

/// Default wait for the single connection slot.
const DEFAULT_CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct Hold {
    session_id: u64,
    count: u32,
}

#[derive(Default)]
struct Shared {
    locks: Mutex<HashMap<String, Hold>>,
    killed: Mutex<HashSet<u64>>,
    released: Notify,
    next_session: AtomicU64,
    opened: AtomicU64,
    live: AtomicUsize,
    fail_checkout: AtomicBool,
    fail_query: AtomicBool,
    fail_close: AtomicBool,
}

/// Shared in-memory lock namespace. Clones refer to the same datastore.
#[derive(Clone, Default)]
pub struct MemoryDatastore {
    shared: Arc<Shared>,
}

impl MemoryDatastore {
    /// Create an empty datastore.
    pub fn new() -> Self {
        Self::default()
    }

    /// New connection source bound to this datastore.
    pub fn source(&self) -> MemoryConnectionSource {
        MemoryConnectionSource::new(self.clone())
    }

    /// Whether any session currently holds `name`.
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks().contains_key(name)
    }

    /// Session id currently holding `name`.
    pub fn holder_of(&self, name: &str) -> Option<u64> {
        self.locks().get(name).map(|hold| hold.session_id)
    }

    /// Connections currently checked out across all sources.
    pub fn live_connections(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Total connections ever opened.
    pub fn connections_opened(&self) -> u64 {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Terminate a session from the server side, as if its client crashed.
    ///
    /// Its locks are released immediately; further calls on the connection fail.
    pub fn kill(&self, session_id: u64) {
        self.killed().insert(session_id);
        self.end_session(session_id);
        debug!(session_id, "memory datastore killed session");
    }

    /// Forget the hold on `name` without ending the owning session.
    ///
    /// The owner's next release is answered with NULL, as if the lock had been
    /// lost behind its back.
    pub fn revoke(&self, name: &str) {
        self.locks().remove(name);
        self.shared.released.notify_waiters();
    }

    /// Make every subsequent checkout fail.
    pub fn set_checkout_failure(&self, fail: bool) {
        self.shared.fail_checkout.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent named-lock call fail.
    pub fn set_query_failure(&self, fail: bool) {
        self.shared.fail_query.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent graceful close report an error. The session still ends.
    pub fn set_close_failure(&self, fail: bool) {
        self.shared.fail_close.store(fail, Ordering::SeqCst);
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, Hold>> {
        self.shared.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn killed(&self) -> MutexGuard<'_, HashSet<u64>> {
        self.shared.killed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_session(&self) -> u64 {
        self.shared.opened.fetch_add(1, Ordering::SeqCst);
        self.shared.live.fetch_add(1, Ordering::SeqCst);
        self.shared.next_session.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn ensure_alive(&self, session_id: u64) -> LockResult<()> {
        if self.killed().contains(&session_id) {
            return Err(LockError::PrimitiveError(format!(
                "session {session_id} was terminated by the server"
            )));
        }
        Ok(())
    }

    fn try_take(&self, session_id: u64, name: &str) -> bool {
        let mut locks = self.locks();
        match locks.get_mut(name) {
            None => {
                locks.insert(name.to_string(), Hold { session_id, count: 1 });
                true
            }
            Some(hold) if hold.session_id == session_id => {
                hold.count += 1;
                true
            }
            Some(_) => false,
        }
    }

    fn give_back(&self, session_id: u64, name: &str) -> Option<i64> {
        let answer = {
            let mut locks = self.locks();
            match locks.get_mut(name) {
                None => None,
                Some(hold) if hold.session_id != session_id => Some(0),
                Some(hold) => {
                    hold.count -= 1;
                    if hold.count == 0 {
                        locks.remove(name);
                    }
                    Some(1)
                }
            }
        };
        if answer == Some(1) {
            self.shared.released.notify_waiters();
        }
        answer
    }

    fn end_session(&self, session_id: u64) {
        self.locks().retain(|_, hold| hold.session_id != session_id);
        self.shared.released.notify_waiters();
    }
}

/// Connection source over a [`MemoryDatastore`] with a single checkout slot.
pub struct MemoryConnectionSource {
    datastore: MemoryDatastore,
    slot: Arc<Semaphore>,
    checkout_timeout: Duration,
}

impl MemoryConnectionSource {
    /// Create a source with one connection slot and no idle connections.
    pub fn new(datastore: MemoryDatastore) -> Self {
        Self {
            datastore,
            slot: Arc::new(Semaphore::new(1)),
            checkout_timeout: DEFAULT_CHECKOUT_TIMEOUT,
        }
    }

    /// Bound how long [`checkout`](ConnectionSource::checkout) waits for the slot.
    pub fn with_checkout_timeout(mut self, checkout_timeout: Duration) -> Self {
        self.checkout_timeout = checkout_timeout;
        self
    }

    /// The datastore this source connects to.
    pub fn datastore(&self) -> &MemoryDatastore {
        &self.datastore
    }
}

#[async_trait]
impl ConnectionSource for MemoryConnectionSource {
    type Connection = MemoryConnection;

    async fn checkout(&self) -> LockResult<MemoryConnection> {
        if self.datastore.shared.fail_checkout.load(Ordering::SeqCst) {
            return Err(LockError::ConnectionError("memory datastore refused connection".into()));
        }
        let permit = timeout(self.checkout_timeout, self.slot.clone().acquire_owned())
            .await
            .map_err(|_| LockError::ConnectionError("timed out waiting for a connection".into()))?
            .map_err(|e| LockError::ConnectionError(format!("connection source closed: {e}")))?;
        let session_id = self.datastore.open_session();
        debug!(session_id, "memory connection opened");
        Ok(MemoryConnection {
            session_id,
            datastore: self.datastore.clone(),
            _permit: permit,
        })
    }
}

/// One datastore session. Dropping it ends the session.
pub struct MemoryConnection {
    session_id: u64,
    datastore: MemoryDatastore,
    _permit: OwnedSemaphorePermit,
}

impl MemoryConnection {
    /// Server-side session id, usable with [`MemoryDatastore::kill`].
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    async fn wait_for(&self, name: &str, timeout_secs: u32) -> LockResult<Option<i64>> {
        let deadline = Instant::now() + Duration::from_secs(u64::from(timeout_secs));
        loop {
            let notified = self.datastore.shared.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.datastore.ensure_alive(self.session_id)?;
            if self.datastore.try_take(self.session_id, name) {
                return Ok(Some(1));
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(Some(0));
            }
        }
    }
}

#[async_trait]
impl LockConnection for MemoryConnection {
    async fn query_scalar(&mut self, primitive: &Primitive<'_>) -> LockResult<Option<i64>> {
        if self.datastore.shared.fail_query.load(Ordering::SeqCst) {
            return Err(LockError::PrimitiveError(format!("{primitive}: memory datastore unavailable")));
        }
        self.datastore.ensure_alive(self.session_id)?;
        match *primitive {
            Primitive::TryAcquire { name, timeout_secs } => self.wait_for(name, timeout_secs).await,
            Primitive::Release { name } => Ok(self.datastore.give_back(self.session_id, name)),
        }
    }

    async fn close(self) -> LockResult<()> {
        let fail = self.datastore.shared.fail_close.load(Ordering::SeqCst);
        let session_id = self.session_id;
        drop(self);
        if fail {
            return Err(LockError::ConnectionError(format!("failed to close session {session_id}")));
        }
        Ok(())
    }

    fn abandon(self) {
        drop(self);
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.datastore.end_session(self.session_id);
        self.datastore.killed().remove(&self.session_id);
        self.datastore.shared.live.fetch_sub(1, Ordering::SeqCst);
        debug!(session_id = self.session_id, "memory connection closed");
    }
}
