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

use std::fmt;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::{Error, Result};

/// 1-based ordinal of a worker within its supervisor
pub type WorkerId = usize;

/// Fork the current process.
///
/// # Safety
/// The child must only touch state it owns after fork: no runtime, lock or
/// thread created by the parent is usable there. Workers build everything
/// they need after this returns.
pub fn fork_process() -> nix::Result<ForkResult> {
    // SAFETY: see above, the supervisor forks before creating any runtime.
    unsafe { fork() }
}

/// why a worker process terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// normal exit with status code
    Exited(i32),
    /// killed by signal
    Signaled(Signal),
    /// process is still running
    StillAlive,
    /// the status could not be decoded, or the child was reaped elsewhere
    Unknown,
}

impl TerminationReason {
    /// check if this is a successful exit
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// analyze a `WaitStatus` to determine the termination reason
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}

/// supervisor-side status of a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Exited(TerminationReason),
}

/// supervisor-side record of one forked worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    pid: Pid,
    status: WorkerStatus,
}

impl WorkerHandle {
    /// record a freshly forked worker
    pub fn new(id: WorkerId, pid: Pid) -> Self {
        WorkerHandle {
            id,
            pid,
            status: WorkerStatus::Running,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn status(&self) -> &WorkerStatus {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, WorkerStatus::Running)
    }

    /// deliver a signal to the worker
    ///
    /// returns `false` without sending anything once the worker is reaped,
    /// or when the process is already gone.
    pub fn signal(&self, signal: Signal) -> Result<bool> {
        if !self.is_running() {
            return Ok(false);
        }
        match kill(self.pid, signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(Error::Signal(e)),
        }
    }

    /// reap the worker if it has exited, without blocking
    pub fn try_reap(&mut self) -> Result<Option<TerminationReason>> {
        if !self.is_running() {
            return Ok(None);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => Ok(Some(self.mark_exited(analyze_wait_status(status)))),
            Err(Errno::ECHILD) => Ok(Some(self.mark_exited(TerminationReason::Unknown))),
            Err(e) => Err(Error::Wait {
                pid: self.pid,
                source: e,
            }),
        }
    }

    /// block until the worker exits & reap it
    pub fn reap(&mut self) -> Result<TerminationReason> {
        if let WorkerStatus::Exited(reason) = &self.status {
            return Ok(reason.clone());
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => return Ok(self.mark_exited(analyze_wait_status(status))),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => return Ok(self.mark_exited(TerminationReason::Unknown)),
                Err(e) => {
                    return Err(Error::Wait {
                        pid: self.pid,
                        source: e,
                    })
                }
            }
        }
    }

    fn mark_exited(&mut self, reason: TerminationReason) -> TerminationReason {
        self.status = WorkerStatus::Exited(reason.clone());
        reason
    }
}
