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
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, Instant, Sleep};

/// an accepted downstream connection handed to the request handler
///
/// every successful read or write pushes the idle deadline forward,
/// once the connection stays silent for the keep-alive duration any
/// pending io fails with `TimedOut`.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    keep_alive: Duration,
    idle: Pin<Box<Sleep>>,
    /// deadline shared with every `IdleWatch` of this connection
    deadline: Arc<Mutex<Instant>>,
}

impl Connection {
    /// wrap an accepted stream
    pub fn new(stream: TcpStream, peer: SocketAddr, keep_alive: Duration) -> Self {
        let deadline = Instant::now() + keep_alive;
        Connection {
            stream,
            peer,
            keep_alive,
            idle: Box::pin(sleep_until(deadline)),
            deadline: Arc::new(Mutex::new(deadline)),
        }
    }

    /// a watch on the idle deadline that does not borrow the connection
    pub fn idle_watch(&self) -> IdleWatch {
        IdleWatch {
            deadline: Arc::clone(&self.deadline),
        }
    }

    /// the remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// the idle lifetime of this connection
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// access the underlying stream, io on it bypasses the idle tracking
    pub fn get_ref(&self) -> &TcpStream {
        &self.stream
    }

    /// push the idle deadline forward
    fn touch(&mut self) {
        let deadline = Instant::now() + self.keep_alive;
        self.idle.as_mut().reset(deadline);
        *self.deadline.lock() = deadline;
    }

    /// check whether the idle deadline elapsed while io is pending
    fn poll_idle(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        match self.idle.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(io::Error::new(
                io::ErrorKind::TimedOut,
                "connection idle timeout",
            )),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// resolves once a connection went a whole keep-alive without io
///
/// covers handlers that hold a connection without reading or writing,
/// the io path alone only notices the deadline while io is pending.
#[derive(Clone)]
pub struct IdleWatch {
    deadline: Arc<Mutex<Instant>>,
}

impl IdleWatch {
    pub async fn expired(&self) {
        loop {
            let deadline = *self.deadline.lock();
            if Instant::now() >= deadline {
                return;
            }
            sleep_until(deadline).await;
        }
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.stream).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.touch();
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_idle(cx).map(Err),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.stream).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.touch();
                Poll::Ready(result)
            }
            Poll::Pending => this.poll_idle(cx).map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn connected_pair(keep_alive: Duration) -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let client = TcpStream::connect(address).await.unwrap();
        let (stream, peer) = listener.accept().await.unwrap();
        (Connection::new(stream, peer, keep_alive), client)
    }

    #[tokio::test]
    async fn test_read_write_through() {
        let (mut conn, mut client) = connected_pair(Duration::from_secs(5)).await;
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        conn.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert!(conn.peer_addr().ip().is_loopback());
    }

    #[tokio::test]
    async fn test_idle_connection_times_out() {
        let (mut conn, _client) = connected_pair(Duration::from_millis(50)).await;
        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_activity_extends_deadline() {
        let (mut conn, mut client) = connected_pair(Duration::from_millis(200)).await;
        let mut buf = [0u8; 1];
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            client.write_all(b"x").await.unwrap();
            conn.read_exact(&mut buf).await.unwrap();
        }
        // total elapsed exceeds the keep-alive, but no single gap did
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn test_idle_watch_fires_without_io() {
        let (conn, _client) = connected_pair(Duration::from_millis(50)).await;
        let watch = conn.idle_watch();
        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(5), watch.expired())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_idle_watch_follows_activity() {
        let (mut conn, mut client) = connected_pair(Duration::from_millis(200)).await;
        let watch = conn.idle_watch();
        let started = Instant::now();
        let mut buf = [0u8; 1];
        tokio::time::sleep(Duration::from_millis(150)).await;
        client.write_all(b"x").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();

        watch.expired().await;
        // the read at ~150ms moved the deadline to ~350ms
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
