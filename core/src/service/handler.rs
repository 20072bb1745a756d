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

use async_trait::async_trait;

use crate::error::BoxError;
use crate::network::connection::Connection;

/// the request serving interface
///
/// invoked once per accepted connection inside the worker that accepted it.
/// the supervisor never inspects the outcome, errors are the handler's concern.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// serve a single downstream connection
    async fn handle(&self, connection: Connection);
}

/// the per-worker resource hook
///
/// called exactly once in every worker, after fork & before serving.
/// anything opened before fork (pooled connections, clients) is invalid in the
/// child and has to be dropped & rebuilt here. a failure terminates that worker.
pub trait ResourceInitializer {
    fn initialize(&mut self, pool_size: usize) -> Result<(), BoxError>;
}

/// initializer for services without process-local resources
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopInitializer;

impl ResourceInitializer for NoopInitializer {
    fn initialize(&mut self, _pool_size: usize) -> Result<(), BoxError> {
        Ok(())
    }
}

impl<F> ResourceInitializer for F
where
    F: FnMut(usize) -> Result<(), BoxError>,
{
    fn initialize(&mut self, pool_size: usize) -> Result<(), BoxError> {
        self(pool_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_initializer() {
        assert!(NoopInitializer.initialize(30).is_ok());
    }

    #[test]
    fn test_closure_initializer_receives_pool_size() {
        let mut seen = Vec::new();
        let mut init = |size: usize| -> Result<(), BoxError> {
            seen.push(size);
            Ok(())
        };
        init.initialize(10).unwrap();
        drop(init);
        assert_eq!(seen, vec![10]);
    }

    #[test]
    fn test_closure_initializer_failure() {
        let mut init = |_: usize| -> Result<(), BoxError> { Err("no database".into()) };
        let err = init.initialize(1).unwrap_err();
        assert_eq!(err.to_string(), "no database");
    }
}
