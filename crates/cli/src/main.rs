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

//! dlock CLI
//!
//! ## Purpose
//! Demo driver for named lock sessions:
//! - Race several contenders for one lock and report who got it
//! - Take a lock and hold it, to contend against from another terminal
//!
//! Every contender builds its own session; a session is never shared.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dlock_locks::memory::MemoryDatastore;
use dlock_locks::LockConfig;
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod contend;

use contend::Backend;

#[derive(Parser)]
#[command(name = "dlock")]
#[command(about = "dlock - named MySQL locks bound to a dedicated connection", long_about = None)]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Connection string, overrides config and DLOCK_DSN
    #[arg(long, global = true)]
    dsn: Option<String>,

    /// Use an in-process datastore instead of MySQL
    #[arg(long, global = true)]
    memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Race several contenders for one lock
    Race {
        /// Lock name
        #[arg(short, long, default_value = "test")]
        name: String,

        /// Number of contenders
        #[arg(short = 'k', long, default_value_t = 2)]
        contenders: usize,

        /// Seconds each contender waits for the lock
        #[arg(short, long, default_value_t = 5)]
        timeout: u32,

        /// Seconds a winner holds the lock before releasing
        #[arg(long, default_value_t = 10)]
        hold: u64,
    },

    /// Acquire a lock once and hold it
    Hold {
        /// Lock name
        #[arg(short, long, default_value = "test")]
        name: String,

        /// Seconds to wait for the lock
        #[arg(short, long, default_value_t = 5)]
        timeout: u32,

        /// Seconds to hold the lock before releasing
        #[arg(long, default_value_t = 30)]
        hold: u64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

fn backend(cli: &Cli) -> Result<Backend> {
    if cli.memory {
        return Ok(Backend::Memory(MemoryDatastore::new()));
    }
    let mut config = LockConfig::load(cli.config.as_deref()).context("Failed to load lock config")?;
    if let Some(dsn) = &cli.dsn {
        config.dsn = dsn.clone();
    }
    tracing::info!(dsn = %config.redacted_dsn(), "using MySQL datastore");
    Ok(Backend::MySql(config))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let backend = backend(&cli)?;

    match cli.command {
        Commands::Race {
            name,
            contenders,
            timeout,
            hold,
        } => contend::race(&backend, &name, contenders, timeout, hold).await,
        Commands::Hold { name, timeout, hold } => contend::hold(&backend, &name, timeout, hold).await,
    }
}
