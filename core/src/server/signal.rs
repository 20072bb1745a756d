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

use nix::sys::signal::{self, SigHandler, SigSet, Signal};
use tokio::signal::unix::{signal as listen, Signal as SignalStream, SignalKind};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Error, Result};

/// control messages delivered to the supervisor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// SIGINT, forwarded to workers
    Interrupt,
    /// SIGTERM, forwarded to workers
    Terminate,
    /// SIGCHLD, some worker exited & needs reaping
    ChildExited,
}

impl ControlSignal {
    /// the termination signal to forward, `None` for bookkeeping messages
    pub fn termination(&self) -> Option<Signal> {
        match self {
            Self::Interrupt => Some(Signal::SIGINT),
            Self::Terminate => Some(Signal::SIGTERM),
            Self::ChildExited => None,
        }
    }
}

/// the signals the supervisor listens to
pub struct SignalListener {
    sigint: SignalStream,
    sigterm: SignalStream,
    sigchld: SignalStream,
}

impl SignalListener {
    /// register the handlers, must be called inside a runtime
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            sigint: listen(SignalKind::interrupt())?,
            sigterm: listen(SignalKind::terminate())?,
            sigchld: listen(SignalKind::child())?,
        })
    }

    /// wait for the next signal, termination takes priority over reaping
    pub async fn wait(&mut self) -> ControlSignal {
        tokio::select! {
            biased;
            _ = self.sigterm.recv() => ControlSignal::Terminate,
            _ = self.sigint.recv() => ControlSignal::Interrupt,
            _ = self.sigchld.recv() => ControlSignal::ChildExited,
        }
    }

    /// move the listener into a task that feeds a control channel
    pub fn spawn_forwarder(mut self) -> mpsc::Receiver<ControlSignal> {
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            loop {
                let received = self.wait().await;
                debug!(?received, "control signal");
                if tx.send(received).await.is_err() {
                    // supervisor loop is gone
                    break;
                }
            }
        });

        rx
    }
}

fn termination_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set
}

/// hold SIGINT & SIGTERM pending on the calling thread
///
/// the supervisor blocks them while forking so a signal arriving mid-spawn
/// is only delivered once every worker is recorded.
pub fn block_termination() -> Result<()> {
    termination_set().thread_block().map_err(Error::Signal)
}

/// release SIGINT & SIGTERM, delivering anything held pending
pub fn unblock_termination() -> Result<()> {
    termination_set().thread_unblock().map_err(Error::Signal)
}

/// put the worker back on default termination behavior
///
/// a worker dies on SIGINT/SIGTERM without draining. dispositions survive
/// fork, so anything the parent installed is reset here.
pub fn reset_for_worker() -> Result<()> {
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: installing SIG_DFL does not run any handler code
        unsafe { signal::signal(sig, SigHandler::SigDfl) }.map_err(Error::Signal)?;
    }
    unblock_termination()
}
