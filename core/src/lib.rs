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

//! prefork: bind one listener, fork a fixed pool of workers that share it,
//! and forward termination signals from the supervisor to every worker.

pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod pool;
pub mod server;
pub mod service;

pub use config::{Config, ShutdownMode};
pub use error::{BoxError, Error, Result};
pub use server::supervisor::Supervisor;
pub use service::handler::{NoopInitializer, RequestHandler, ResourceInitializer};
