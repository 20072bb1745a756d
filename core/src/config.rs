//! Copyright (c) 2024-2025 Hyflux, Inc.
//!
//! This file is part of Hyflux
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU Affero General Public License as published by
//! the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! This program is distributed in the hope that it will be useful
//! but WITHOUT ANY WARRANTY; without even the implied warranty of
//! MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//! GNU Affero General Public License for more details.
//!
//! You should have received a copy of the GNU Affero General Public License
//! along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::env;
use std::ffi::OsString;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::server::daemon::DaemonConfig;

/// worker processes forked when `WORKER_COUNT` is unset
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// per-worker pool capacity when `POOL_SIZE` is unset
pub const DEFAULT_POOL_SIZE: usize = 30;

/// listen backlog, connections beyond it are refused by the kernel
pub const MAX_WAITING_REQUESTS: u32 = 1000;

/// idle lifetime of an accepted connection
pub const KEEP_ALIVE_SECS: u64 = 1800;

/// the single cleartext endpoint every worker serves
pub const BIND_ADDRESS: &str = "0.0.0.0:50051";

/// tokio threads allocated to each worker runtime
pub const DEFAULT_RUNTIME_THREADS: usize = 1;

/// what the supervisor does after forwarding a termination signal
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShutdownMode {
    /// forward the signal and return at once, workers are not awaited
    #[default]
    Detach,
    /// forward the signal, then block until every worker is reaped
    Reap,
}

impl FromStr for ShutdownMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "detach" => Ok(Self::Detach),
            "reap" | "wait" => Ok(Self::Reap),
            _ => Err(format!(
                "unknown shutdown mode: '{s}', valid options: detach, reap"
            )),
        }
    }
}

impl fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detach => write!(f, "detach"),
            Self::Reap => write!(f, "reap"),
        }
    }
}

/// supervisor configuration, read once at startup
#[derive(Clone, Debug)]
pub struct Config {
    worker_count: usize,
    pool_size: usize,
    max_waiting_requests: u32,
    keep_alive: Duration,
    bind_address: String,
    shutdown_mode: ShutdownMode,
    runtime_threads: usize,
    daemon: Option<DaemonConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            worker_count: DEFAULT_WORKER_COUNT,
            pool_size: DEFAULT_POOL_SIZE,
            max_waiting_requests: MAX_WAITING_REQUESTS,
            keep_alive: Duration::from_secs(KEEP_ALIVE_SECS),
            bind_address: BIND_ADDRESS.to_string(),
            shutdown_mode: ShutdownMode::default(),
            runtime_threads: DEFAULT_RUNTIME_THREADS,
            daemon: None,
        }
    }
}

impl Config {
    /// load `.env` if present, then read the process environment
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var_os(key))
    }

    /// build the config from any key lookup
    ///
    /// `WORKER_COUNT` & `POOL_SIZE` keep integer-prefix semantics:
    /// a value that is set but not numeric degrades to `0` instead of failing.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let get = |key: &str| lookup(key).map(|v| v.to_string_lossy().into_owned());

        let worker_count = get("WORKER_COUNT")
            .map(|raw| to_count(parse_integer_prefix(&raw)))
            .unwrap_or(DEFAULT_WORKER_COUNT);
        let pool_size = get("POOL_SIZE")
            .map(|raw| to_count(parse_integer_prefix(&raw)))
            .unwrap_or(DEFAULT_POOL_SIZE);
        if worker_count == 0 {
            warn!("WORKER_COUNT resolved to 0, no workers will be spawned");
        }
        if pool_size == 0 {
            warn!("POOL_SIZE resolved to 0, workers will not dispatch any request");
        }

        let shutdown_mode = match get("SHUTDOWN_MODE") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!("{e}, falling back to {}", ShutdownMode::default());
                ShutdownMode::default()
            }),
            None => ShutdownMode::default(),
        };

        let runtime_threads = get("RUNTIME_THREADS")
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|threads| *threads > 0)
            .unwrap_or(DEFAULT_RUNTIME_THREADS);

        let daemon = match get("DAEMONIZE") {
            Some(flag) if is_truthy(&flag) => {
                let mut daemon = DaemonConfig::default();
                if let Some(path) = get("PID_FILE") {
                    daemon = daemon.with_pid_path(&path);
                }
                if let Some(path) = get("ERROR_LOG") {
                    daemon = daemon.with_error_log(&path);
                }
                if let Some(user) = get("DAEMON_USER") {
                    daemon = daemon.with_user(&user);
                }
                if let Some(group) = get("DAEMON_GROUP") {
                    daemon = daemon.with_group(&group);
                }
                Some(daemon)
            }
            _ => None,
        };

        Config {
            worker_count,
            pool_size,
            shutdown_mode,
            runtime_threads,
            daemon,
            ..Config::default()
        }
    }

    /// set the number of worker processes
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// set the per-worker pool capacity
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// override the listening address, mostly for tests binding ephemeral ports
    pub fn with_bind_address(mut self, address: &str) -> Self {
        self.bind_address = address.to_string();
        self
    }

    /// set the connection idle lifetime
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_shutdown_mode(mut self, mode: ShutdownMode) -> Self {
        self.shutdown_mode = mode;
        self
    }

    pub fn with_runtime_threads(mut self, threads: usize) -> Self {
        self.runtime_threads = threads.max(1);
        self
    }

    pub fn with_daemon(mut self, daemon: DaemonConfig) -> Self {
        self.daemon = Some(daemon);
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn max_waiting_requests(&self) -> u32 {
        self.max_waiting_requests
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    pub fn shutdown_mode(&self) -> ShutdownMode {
        self.shutdown_mode
    }

    pub fn runtime_threads(&self) -> usize {
        self.runtime_threads
    }

    pub fn daemon(&self) -> Option<&DaemonConfig> {
        self.daemon.as_ref()
    }
}

/// leading-integer parse: skips leading whitespace, takes an optional sign,
/// then digits (single `_` separators allowed between digits).
/// anything unparsable yields `0`.
pub fn parse_integer_prefix(raw: &str) -> i64 {
    let mut chars = raw.trim_start().chars().peekable();
    let negative = match chars.peek() {
        Some('-') => {
            chars.next();
            true
        }
        Some('+') => {
            chars.next();
            false
        }
        _ => false,
    };
    let mut value: i64 = 0;
    let mut last_digit = false;
    while let Some(c) = chars.next() {
        if let Some(digit) = c.to_digit(10) {
            value = value.saturating_mul(10).saturating_add(digit as i64);
            last_digit = true;
        } else if c == '_' && last_digit && chars.peek().is_some_and(|n| n.is_ascii_digit()) {
            last_digit = false;
        } else {
            break;
        }
    }
    if negative {
        -value
    } else {
        value
    }
}

/// negative counts behave like zero iterations
fn to_count(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
