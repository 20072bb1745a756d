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

use std::io;

use nix::unistd::Pid;
use thiserror::Error;

/// error type returned by collaborators (handlers, initializers, factories)
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// supervisor & worker errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid bind address '{0}'")]
    Address(String),

    #[error("failed to bind listener on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("listener is not bound")]
    NotBound,

    #[error("listener is already bound on {0}")]
    AlreadyBound(String),

    #[error("failed to spawn worker {id}: {source}")]
    Spawn {
        id: usize,
        #[source]
        source: nix::Error,
    },

    #[error("failed to wait on worker pid {pid}: {source}")]
    Wait {
        pid: Pid,
        #[source]
        source: nix::Error,
    },

    #[error("signal error: {0}")]
    Signal(#[source] nix::Error),

    #[error("resource initialization failed: {0}")]
    Initialize(#[source] BoxError),

    #[error("runtime error: {0}")]
    Runtime(#[source] io::Error),

    #[error("daemon error: {0}")]
    Daemon(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// result alias for supervisor operations
pub type Result<T> = std::result::Result<T, Error>;
