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

use std::process::ExitCode;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

use prefork_core::network::connection::Connection;
use prefork_core::{logging, Config, NoopInitializer, RequestHandler, Supervisor};

/// placeholder echo service: logs what the peer sent & does nothing else
struct EchoService;

#[async_trait]
impl RequestHandler for EchoService {
    async fn handle(&self, mut connection: Connection) {
        let peer = connection.peer_addr();
        let mut buffer = BytesMut::with_capacity(4096);
        loop {
            match connection.read_buf(&mut buffer).await {
                Ok(0) => break,
                Ok(read) => {
                    info!(%peer, read, request = ?buffer.split().freeze(), "echo request");
                }
                Err(e) => {
                    warn!(%peer, "connection closed: {e}");
                    break;
                }
            }
        }
    }
}

fn main() -> ExitCode {
    logging::init();
    let config = Config::from_env();
    let supervisor = Supervisor::new(config, EchoService, NoopInitializer);
    match supervisor.start() {
        Ok(shutdown) => {
            info!(?shutdown, "exiting program");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("supervisor failed: {e}");
            ExitCode::FAILURE
        }
    }
}
