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

use std::future::Future;
use std::time::Duration;

use tokio::runtime::Builder;

use crate::error::{Error, Result};

/// a tokio runtime owned by one process
///
/// runtimes never cross a fork: the supervisor builds its runtime after the
/// last worker is spawned, and every worker builds its own after fork.
pub struct Runtime(tokio::runtime::Runtime);

impl Runtime {
    /// multi-threaded runtime used by workers to serve connections
    pub fn new(thread_name: &str, alloc_threads: usize) -> Result<Self> {
        let built_runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(alloc_threads.max(1))
            .thread_name(thread_name)
            .build()
            .map_err(Error::Runtime)?;
        Ok(Runtime(built_runtime))
    }

    /// single-threaded runtime for the supervisor control loop
    pub fn current_thread() -> Result<Self> {
        let built_runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::Runtime)?;
        Ok(Runtime(built_runtime))
    }

    /// drive a future to completion on this runtime
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.0.block_on(future)
    }

    /// runtime shutdown timeout
    pub fn shutdown(self, timeout: Duration) {
        self.0.shutdown_timeout(timeout)
    }
}
