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

//! Contender tasks for the `race` and `hold` commands.

use anyhow::{Context, Result};
use dlock_locks::memory::MemoryDatastore;
use dlock_locks::mysql::MySqlLockSession;
use dlock_locks::{ConnectionSource, LockConfig, LockSession};
use std::fmt;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::info;

/// Where sessions get their connections.
pub enum Backend {
    Memory(MemoryDatastore),
    MySql(LockConfig),
}

/// What happened to one contender.
#[derive(Debug)]
pub enum Outcome {
    Acquired { waited: Duration, held: Duration },
    TimedOut { waited: Duration },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Acquired { waited, held } => {
                write!(f, "acquired after {:.1}s, held {:.1}s", waited.as_secs_f64(), held.as_secs_f64())
            }
            Outcome::TimedOut { waited } => write!(f, "gave up after {:.1}s", waited.as_secs_f64()),
        }
    }
}

/// Try once, hold on success, release, close.
async fn contend<S: ConnectionSource>(
    id: &str,
    mut session: LockSession<S>,
    timeout_secs: u32,
    hold: Duration,
) -> Result<Outcome> {
    info!(contender = id, lock_name = session.name(), "trying to acquire lock");
    let start = Instant::now();
    let acquired = session
        .acquire(timeout_secs)
        .await
        .with_context(|| format!("{id}: acquire failed"))?;
    let waited = start.elapsed();

    if !acquired {
        info!(contender = id, "did not get lock");
        return Ok(Outcome::TimedOut { waited });
    }

    info!(contender = id, "got lock, holding for {:?}", hold);
    sleep(hold).await;

    if let Err(release_err) = session.release().await {
        let mut err = anyhow::Error::new(release_err).context(format!("{id}: release failed"));
        if session.is_poisoned() {
            // Closing the connection is what actually frees the lock now.
            if let Err(discard_err) = session.discard().await {
                err = err.context(format!("{id}: closing the poisoned session failed: {discard_err}"));
            }
        }
        return Err(err);
    }
    info!(contender = id, "released lock");

    Ok(Outcome::Acquired { waited, held: hold })
}

async fn mysql_session(name: &str, config: &LockConfig) -> Result<MySqlLockSession> {
    MySqlLockSession::connect_with(name, config)
        .await
        .with_context(|| format!("Failed to create session for {name}"))
}

/// Race `contenders` independent sessions for `name`.
pub async fn race(backend: &Backend, name: &str, contenders: usize, timeout_secs: u32, hold_secs: u64) -> Result<()> {
    let hold = Duration::from_secs(hold_secs);
    let mut tasks = JoinSet::new();

    for i in 0..contenders {
        let id = format!("contender-{}", i + 1);
        match backend {
            Backend::Memory(datastore) => {
                let session = LockSession::new(name, datastore.source())?;
                tasks.spawn(async move {
                    let outcome = contend(&id, session, timeout_secs, hold).await;
                    (id, outcome)
                });
            }
            Backend::MySql(config) => {
                let session = mysql_session(name, config).await?;
                tasks.spawn(async move {
                    let outcome = contend(&id, session, timeout_secs, hold).await;
                    (id, outcome)
                });
            }
        }
    }

    let mut failures = 0;
    while let Some(joined) = tasks.join_next().await {
        let (id, outcome) = joined.context("contender task panicked")?;
        match outcome {
            Ok(outcome) => println!("{id}: {outcome}"),
            Err(e) => {
                failures += 1;
                println!("{id}: error: {e:#}");
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} contender(s) failed");
    }
    Ok(())
}

/// Take `name` once and hold it.
pub async fn hold(backend: &Backend, name: &str, timeout_secs: u32, hold_secs: u64) -> Result<()> {
    let hold = Duration::from_secs(hold_secs);
    let outcome = match backend {
        Backend::Memory(datastore) => {
            let session = LockSession::new(name, datastore.source())?;
            contend("holder", session, timeout_secs, hold).await?
        }
        Backend::MySql(config) => {
            let session = mysql_session(name, config).await?;
            contend("holder", session, timeout_secs, hold).await?
        }
    };
    println!("holder: {outcome}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_race_in_memory() {
        let backend = Backend::Memory(MemoryDatastore::new());
        race(&backend, "test", 3, 2, 0).await.unwrap();
        if let Backend::Memory(datastore) = &backend {
            assert!(!datastore.is_locked("test"));
            assert_eq!(datastore.live_connections(), 0);
        }
    }

    #[tokio::test]
    async fn test_contend_times_out_against_holder() {
        let datastore = MemoryDatastore::new();
        let mut holder = LockSession::new("test", datastore.source()).unwrap();
        assert!(holder.acquire(0).await.unwrap());

        let session = LockSession::new("test", datastore.source()).unwrap();
        let outcome = contend("c", session, 0, Duration::ZERO).await.unwrap();
        assert!(matches!(outcome, Outcome::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_hold_in_memory() {
        let backend = Backend::Memory(MemoryDatastore::new());
        hold(&backend, "test", 1, 0).await.unwrap();
        if let Backend::Memory(datastore) = &backend {
            assert!(!datastore.is_locked("test"));
            assert_eq!(datastore.live_connections(), 0);
            assert_eq!(datastore.connections_opened(), 1);
        }
    }

    #[tokio::test]
    async fn test_hold_times_out_against_holder() {
        let datastore = MemoryDatastore::new();
        let mut holder = LockSession::new("test", datastore.source()).unwrap();
        assert!(holder.acquire(0).await.unwrap());

        let backend = Backend::Memory(datastore);
        hold(&backend, "test", 0, 0).await.unwrap();
        assert!(holder.is_held());
    }

    #[tokio::test]
    async fn test_contend_reports_release_and_close_failures() {
        let datastore = MemoryDatastore::new();
        let session = LockSession::new("test", datastore.source()).unwrap();
        let task = tokio::spawn(async move { contend("c", session, 0, Duration::from_millis(200)).await });

        sleep(Duration::from_millis(50)).await;
        assert!(datastore.is_locked("test"));
        datastore.set_query_failure(true);
        datastore.set_close_failure(true);

        let err = task.await.unwrap().unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("release failed"), "{chain}");
        assert!(chain.contains("memory datastore unavailable"), "{chain}");
        assert!(chain.contains("closing the poisoned session failed"), "{chain}");
        assert!(chain.contains("failed to close session"), "{chain}");

        // The session ended even though the close reported an error.
        assert!(!datastore.is_locked("test"));
        assert_eq!(datastore.live_connections(), 0);
    }

    #[test]
    fn test_outcome_display() {
        let outcome = Outcome::Acquired {
            waited: Duration::from_millis(1500),
            held: Duration::from_secs(10),
        };
        assert_eq!(outcome.to_string(), "acquired after 1.5s, held 10.0s");
        assert_eq!(
            Outcome::TimedOut { waited: Duration::from_secs(5) }.to_string(),
            "gave up after 5.0s"
        );
    }
}
