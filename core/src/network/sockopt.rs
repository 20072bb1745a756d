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

use libc::{self, c_int, c_void, socklen_t};
use std::{
    io::{self, Error},
    mem,
    os::unix::io::RawFd,
    time::Duration,
};

/// wrapper used to set socket options
fn set_socket_option<T: Copy>(
    fd: RawFd,
    level: c_int,
    optname: c_int,
    value: &T,
) -> io::Result<()> {
    let result = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };

    if result == -1 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// read back an integer socket option
fn get_socket_option(fd: RawFd, level: c_int, optname: c_int) -> io::Result<c_int> {
    let mut value: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            level,
            optname,
            &mut value as *mut c_int as *mut c_void,
            &mut len,
        )
    };

    if result == -1 {
        Err(Error::last_os_error())
    } else {
        Ok(value)
    }
}

/// TCP keep-alive config
#[derive(Clone, Debug)]
pub struct TcpKeepAliveConfig {
    /// The time a connection needs to be idle before TCP begins sending out keep-alive probes.
    pub idle: Duration,
    /// The number of seconds between TCP keep-alive probes.
    pub interval: Duration,
    /// The maximum number of TCP keep-alive probes to send before giving up and killing the connection
    pub count: usize,
}

impl TcpKeepAliveConfig {
    /// make a new TCP keep-alive config
    pub fn new(idle_secs: u64, interval_secs: u64, count: usize) -> Self {
        TcpKeepAliveConfig {
            idle: Duration::from_secs(idle_secs),
            interval: Duration::from_secs(interval_secs),
            count,
        }
    }
}

impl Default for TcpKeepAliveConfig {
    /// probe a silent peer after a minute, give up after five missed probes
    fn default() -> Self {
        TcpKeepAliveConfig {
            idle: Duration::from_secs(60),
            interval: Duration::from_secs(10),
            count: 5,
        }
    }
}

/// apply the given TCP keep-alive config
pub fn set_tcp_keepalive(fd: RawFd, config: &TcpKeepAliveConfig) -> io::Result<()> {
    set_keepalive_flag(fd, true)?;
    set_keepalive_idle(fd, config.idle)?;
    set_keepalive_interval(fd, config.interval)?;
    set_keepalive_count(fd, config.count)
}

/// set the TCP keep-alive flag
pub fn set_keepalive_flag(fd: RawFd, val: bool) -> io::Result<()> {
    set_socket_option(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, &(val as c_int))
}

/// Set the TCP keepalive idle time in seconds.
pub fn set_keepalive_idle(fd: RawFd, idle_secs: Duration) -> io::Result<()> {
    set_socket_option(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_KEEPIDLE,
        &(idle_secs.as_secs() as c_int),
    )
}

/// Set the TCP keepalive probe interval in seconds.
pub fn set_keepalive_interval(fd: RawFd, interval_secs: Duration) -> io::Result<()> {
    set_socket_option(
        fd,
        libc::IPPROTO_TCP,
        libc::TCP_KEEPINTVL,
        &(interval_secs.as_secs() as c_int),
    )
}

/// Set the TCP keepalive probe count.
pub fn set_keepalive_count(fd: RawFd, count: usize) -> io::Result<()> {
    set_socket_option(fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, &(count as c_int))
}

/// Set TCP_NODELAY flag (Nagle's algorithm).
/// When enabled, small writes are sent immediately instead of being coalesced.
pub fn set_tcp_nodelay(fd: RawFd, enable: bool) -> io::Result<()> {
    set_socket_option(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, &(enable as c_int))
}

/// whether SO_KEEPALIVE is enabled on the socket
pub fn keepalive_enabled(fd: RawFd) -> io::Result<bool> {
    get_socket_option(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE).map(|v| v != 0)
}

/// whether TCP_NODELAY is enabled on the socket
pub fn nodelay_enabled(fd: RawFd) -> io::Result<bool> {
    get_socket_option(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY).map(|v| v != 0)
}
