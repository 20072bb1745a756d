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
use std::net::SocketAddr;
use std::sync::Arc;

use derivative::Derivative;
use nix::sys::signal::Signal;
use nix::unistd::ForkResult;
use tracing::{error, info, warn};

use crate::config::{Config, ShutdownMode};
use crate::error::{Error, Result};
use crate::network::listener::Listener;
use crate::server::daemon::daemonize_server;
use crate::server::process::{fork_process, TerminationReason, WorkerHandle, WorkerId};
use crate::server::runtime::Runtime;
use crate::server::signal::{
    block_termination, reset_for_worker, unblock_termination, SignalListener,
};
use crate::server::worker::Worker;
use crate::service::handler::{RequestHandler, ResourceInitializer};

/// exit code of a worker whose initialization or accept loop failed
const WORKER_FAILURE_EXIT: i32 = 1;

/// how the control loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// every worker exited on its own
    AllExited,
    /// a termination signal was received & forwarded
    Signalled(Signal),
}

/// the top-level controller of the worker pool
///
/// owns the listener, the ordered worker records & the configuration.
/// workers are never respawned: one that dies leaves the pool smaller
/// until the supervisor is restarted.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Supervisor<H, R> {
    config: Config,
    #[derivative(Debug = "ignore")]
    handler: Arc<H>,
    #[derivative(Debug = "ignore")]
    initializer: R,
    listener: Option<Listener>,
    workers: Vec<WorkerHandle>,
}

impl<H, R> Supervisor<H, R>
where
    H: RequestHandler,
    R: ResourceInitializer,
{
    pub fn new(config: Config, handler: H, initializer: R) -> Self {
        Supervisor {
            config,
            handler: Arc::new(handler),
            initializer,
            listener: None,
            workers: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// every worker ever spawned, in spawn order
    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    /// workers not yet reaped
    pub fn active_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_running()).count()
    }

    /// the bound address of the listener
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .as_ref()
            .ok_or(Error::NotBound)?
            .local_addr()
    }

    /// run the whole lifecycle: bind, spawn, then handle signals until shutdown
    ///
    /// returns once every worker exited on its own, or once a termination
    /// signal was forwarded (and, in reap mode, every worker was reaped).
    pub fn start(mut self) -> Result<Shutdown> {
        info!(
            workers = self.config.worker_count(),
            pool_size = self.config.pool_size(),
            address = self.config.bind_address(),
            shutdown = %self.config.shutdown_mode(),
            "starting supervisor"
        );
        if let Some(daemon) = self.config.daemon() {
            daemonize_server(daemon)?;
        }
        self.bind()?;
        // held until the control loop listens, see SignalListener
        block_termination()?;
        if let Err(e) = self.spawn_workers() {
            unblock_termination()?;
            return Err(e);
        }

        let runtime = Runtime::current_thread()?;
        let shutdown = runtime.block_on(self.control_loop())?;
        runtime.shutdown(std::time::Duration::from_secs(0));

        match shutdown {
            Shutdown::AllExited => info!("all workers exited, supervisor stopping"),
            Shutdown::Signalled(signal) => match self.config.shutdown_mode() {
                ShutdownMode::Detach => {
                    info!(%signal, "supervisor exiting without waiting for workers")
                }
                ShutdownMode::Reap => {
                    info!(%signal, "waiting for workers to exit");
                    self.wait_all()?;
                    info!("all workers reaped, supervisor stopping");
                }
            },
        }
        Ok(shutdown)
    }

    /// bind the shared listener, exactly once
    pub fn bind(&mut self) -> Result<SocketAddr> {
        if let Some(listener) = &self.listener {
            return Err(Error::AlreadyBound(listener.address().to_string()));
        }
        let listener = Listener::bind(
            self.config.bind_address(),
            self.config.max_waiting_requests(),
        )?;
        let local = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(local)
    }

    /// fork `worker_count` workers sharing the bound listener
    ///
    /// a failed fork is fatal: the workers spawned so far are terminated
    /// & reaped before the error is returned.
    pub fn spawn_workers(&mut self) -> Result<()> {
        if self.listener.is_none() {
            return Err(Error::NotBound);
        }
        let first = self.workers.len() + 1;
        for id in first..first + self.config.worker_count() {
            match self.spawn_worker(id) {
                Ok(handle) => {
                    info!(worker = id, pid = %handle.pid(), "worker spawned");
                    self.workers.push(handle);
                }
                Err(e) => {
                    error!(worker = id, "failed to spawn worker: {e}");
                    self.abort_spawned();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn spawn_worker(&mut self, id: WorkerId) -> Result<WorkerHandle> {
        match fork_process().map_err(|source| Error::Spawn { id, source })? {
            ForkResult::Parent { child } => Ok(WorkerHandle::new(id, child)),
            ForkResult::Child => {
                let code = self.run_child(id);
                // skip exit handlers & buffers inherited from the supervisor
                unsafe { libc::_exit(code) }
            }
        }
    }

    /// body of the forked process, never returns to the caller
    fn run_child(&mut self, id: WorkerId) -> i32 {
        // siblings belong to the supervisor, not to this worker
        self.workers.clear();
        if let Err(e) = reset_for_worker() {
            error!(worker = id, "failed to restore signal handling: {e}");
            return WORKER_FAILURE_EXIT;
        }
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => return WORKER_FAILURE_EXIT,
        };
        let mut worker = Worker::new(id, self.config.clone(), Arc::clone(&self.handler));
        match worker.run(listener, &mut self.initializer) {
            Ok(()) => 0,
            Err(e) => {
                error!(worker = id, "worker exiting: {e}");
                WORKER_FAILURE_EXIT
            }
        }
    }

    /// terminate & reap whatever was spawned before a fatal error
    fn abort_spawned(&mut self) {
        if let Err(e) = self.forward_signal(Signal::SIGTERM) {
            error!("failed to terminate spawned workers: {e}");
        }
        if let Err(e) = self.wait_all() {
            error!("failed to reap spawned workers: {e}");
        }
    }

    /// send `signal` to every recorded worker that is still running
    ///
    /// exited workers are reaped first & skipped. returns how many workers
    /// the signal was delivered to.
    pub fn forward_signal(&mut self, signal: Signal) -> Result<usize> {
        self.reap_exited()?;
        let mut delivered = 0;
        for worker in self.workers.iter().filter(|w| w.is_running()) {
            match worker.signal(signal) {
                Ok(true) => delivered += 1,
                Ok(false) => info!(worker = worker.id(), "worker already gone"),
                // keep going, the remaining workers still get the signal
                Err(e) => warn!(
                    worker = worker.id(),
                    pid = %worker.pid(),
                    "failed to forward {signal}: {e}"
                ),
            }
        }
        info!(%signal, delivered, "signal forwarded to workers");
        Ok(delivered)
    }

    /// reap every worker that already exited, without blocking
    pub fn reap_exited(&mut self) -> Result<Vec<(WorkerId, TerminationReason)>> {
        let mut reaped = Vec::new();
        for worker in self.workers.iter_mut() {
            if let Some(reason) = worker.try_reap()? {
                warn!(worker = worker.id(), pid = %worker.pid(), "worker {reason}, not respawning");
                reaped.push((worker.id(), reason));
            }
        }
        Ok(reaped)
    }

    /// block until every running worker exits, reaping them in spawn order
    pub fn wait_all(&mut self) -> Result<Vec<(WorkerId, TerminationReason)>> {
        let mut reaped = Vec::new();
        for worker in self.workers.iter_mut().filter(|w| w.is_running()) {
            let reason = worker.reap()?;
            info!(worker = worker.id(), pid = %worker.pid(), "worker {reason}");
            reaped.push((worker.id(), reason));
        }
        Ok(reaped)
    }

    /// consume control signals until shutdown
    async fn control_loop(&mut self) -> Result<Shutdown> {
        let mut control = SignalListener::new()
            .map_err(Error::Runtime)?
            .spawn_forwarder();
        // handlers exist now, anything that arrived while spawning is delivered
        unblock_termination()?;
        // children that exited before SIGCHLD was observed
        self.reap_exited()?;
        loop {
            if self.active_workers() == 0 {
                return Ok(Shutdown::AllExited);
            }
            let received = control.recv().await.ok_or_else(|| {
                Error::Runtime(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "signal channel closed",
                ))
            })?;
            match received.termination() {
                Some(signal) => {
                    info!(%signal, "termination signal received");
                    self.forward_signal(signal)?;
                    return Ok(Shutdown::Signalled(signal));
                }
                None => {
                    self.reap_exited()?;
                }
            }
        }
    }
}
