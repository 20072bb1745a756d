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
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::network::connection::Connection;
use crate::network::listener::Listener;
use crate::network::sockopt::{set_tcp_keepalive, set_tcp_nodelay, TcpKeepAliveConfig};
use crate::server::process::WorkerId;
use crate::server::runtime::Runtime;
use crate::service::handler::{RequestHandler, ResourceInitializer};

/// back off before accepting again when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// lifecycle of a worker process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    /// running the resource initializer
    Initializing,
    /// accepting & dispatching connections
    Serving,
    /// never entered: workers do not drain, a signal kills them outright
    Draining,
    /// the accept loop ended or initialization failed
    Stopped,
}

/// one serving unit, running inside its own forked process
pub struct Worker<H> {
    id: WorkerId,
    config: Config,
    handler: Arc<H>,
    state: ServerState,
}

impl<H: RequestHandler> Worker<H> {
    pub fn new(id: WorkerId, config: Config, handler: Arc<H>) -> Self {
        Worker {
            id,
            config,
            handler,
            state: ServerState::Initializing,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// initialize worker resources, then serve the listener until it fails
    ///
    /// blocks the calling thread, it builds the worker runtime itself and
    /// must not be called from inside another runtime. a listener that stops
    /// accepting is a normal end of service, only failures to initialize or
    /// to set up the runtime are errors.
    pub fn run<R: ResourceInitializer>(
        &mut self,
        listener: Listener,
        initializer: &mut R,
    ) -> Result<()> {
        let pid = std::process::id();
        self.state = ServerState::Initializing;
        info!(worker = self.id, pid, "worker initializing");
        if let Err(e) = initializer.initialize(self.config.pool_size()) {
            self.state = ServerState::Stopped;
            error!(worker = self.id, pid, "resource initialization failed: {e}");
            return Err(Error::Initialize(e));
        }

        let thread_name = format!("worker-{}", self.id);
        let runtime = match Runtime::new(&thread_name, self.config.runtime_threads()) {
            Ok(runtime) => runtime,
            Err(e) => {
                self.state = ServerState::Stopped;
                return Err(e);
            }
        };
        let served = runtime.block_on(self.serve(listener));
        self.state = ServerState::Stopped;
        // no draining, in-flight connections are dropped with the runtime
        runtime.shutdown(Duration::from_secs(0));
        info!(worker = self.id, pid, "worker stopped");
        served
    }

    /// the accept loop, returns once the listener fails for good
    async fn serve(&mut self, listener: Listener) -> Result<()> {
        let listener = listener.into_tokio()?;
        // at most pool_size connections in flight, the rest wait in the backlog
        let permits = Arc::new(Semaphore::new(self.config.pool_size()));
        self.state = ServerState::Serving;
        info!(
            worker = self.id,
            pool_size = self.config.pool_size(),
            "worker serving"
        );
        loop {
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|e| Error::Runtime(io::Error::new(io::ErrorKind::Other, e)))?;
            let connection = match self.accept(&listener).await {
                Ok(Some(connection)) => connection,
                Ok(None) => continue,
                Err(e) => {
                    error!(worker = self.id, "accept failed, stopping worker: {e}");
                    return Ok(());
                }
            };
            let span = info_span!("connection", worker = self.id, peer = %connection.peer_addr());
            let handler = Arc::clone(&self.handler);
            let idle = connection.idle_watch();
            tokio::spawn(
                async move {
                    debug!("dispatching connection");
                    // dropping the handler future closes its connection
                    tokio::select! {
                        _ = handler.handle(connection) => {}
                        _ = idle.expired() => debug!("connection idle past keep-alive, closing"),
                    }
                    drop(permit);
                }
                .instrument(span),
            );
        }
    }

    /// accept one connection, `Ok(None)` for errors worth retrying
    async fn accept(&self, listener: &TcpListener) -> io::Result<Option<Connection>> {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                return match e.raw_os_error() {
                    Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS)
                    | Some(libc::ENOMEM) => {
                        warn!(worker = self.id, "accept out of resources: {e}");
                        sleep(ACCEPT_BACKOFF).await;
                        Ok(None)
                    }
                    _ if is_transient(&e) => {
                        debug!(worker = self.id, "transient accept error: {e}");
                        Ok(None)
                    }
                    _ => Err(e),
                };
            }
        };
        // socket options are best effort, a failure only degrades the connection
        let fd = stream.as_raw_fd();
        if let Err(e) = set_tcp_nodelay(fd, true) {
            debug!(%peer, "failed to set nodelay: {e}");
        }
        if let Err(e) = set_tcp_keepalive(fd, &TcpKeepAliveConfig::default()) {
            debug!(%peer, "failed to set tcp keepalive: {e}");
        }
        Ok(Some(Connection::new(stream, peer, self.config.keep_alive())))
    }
}

/// errors caused by one peer, the listener itself is fine
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || matches!(e.raw_os_error(), Some(libc::EPROTO) | Some(libc::EPERM))
}
