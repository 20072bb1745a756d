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
use std::net::{SocketAddr, TcpListener as StdTcpListener, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::{Error, Result};

/// the listening endpoint shared by every worker
///
/// bound once by the supervisor before any fork, every worker inherits
/// the same underlying socket & accepts on it independently.
#[derive(Debug)]
pub struct Listener {
    /// the address the listener was asked to bind
    address: String,
    /// the bound std socket, blocking until a worker converts it
    inner: StdTcpListener,
}

impl Listener {
    /// bind a cleartext tcp listener with the given accept backlog
    pub fn bind(address: &str, backlog: u32) -> Result<Self> {
        let bind_error = |source: io::Error| Error::Bind {
            address: address.to_string(),
            source,
        };
        // create socket address from string
        let socket_address = address
            .to_socket_addrs()
            .map_err(|_| Error::Address(address.to_string()))?
            .next()
            .ok_or_else(|| Error::Address(address.to_string()))?;
        let socket = Socket::new(
            Domain::for_address(socket_address),
            Type::STREAM,
            Some(Protocol::TCP),
        )
        .map_err(bind_error)?;
        // reuseaddr lets a restarted supervisor bind while old sockets sit in TIME_WAIT,
        // it does not allow two live listeners on the same address
        socket.set_reuse_address(true).map_err(bind_error)?;
        socket.bind(&socket_address.into()).map_err(bind_error)?;
        // the backlog is the only admission control, beyond it connections are refused
        let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
        socket.listen(backlog).map_err(bind_error)?;
        let inner: StdTcpListener = socket.into();
        info!(address, local = ?inner.local_addr().ok(), "listener bound");
        Ok(Listener {
            address: address.to_string(),
            inner,
        })
    }

    /// the configured address
    pub fn address(&self) -> &str {
        &self.address
    }

    /// the address actually bound, useful when binding port 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.local_addr()?)
    }

    /// register the inherited socket with the current tokio runtime
    ///
    /// must be called from inside the worker's runtime, after fork.
    pub fn into_tokio(self) -> Result<TcpListener> {
        self.inner.set_nonblocking(true)?;
        Ok(TcpListener::from_std(self.inner)?)
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
