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

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::BoxError;
use crate::service::handler::ResourceInitializer;

/// a fixed capacity pool of worker-local resources
///
/// every resource is built up front, checkouts hand out a guard
/// that puts the resource back when dropped.
pub struct ResourcePool<T> {
    /// idle resources
    idle: ArrayQueue<T>,
    /// woken whenever a resource is returned
    available: Notify,
    /// total resources owned by the pool, detached ones excluded
    capacity: AtomicUsize,
}

impl<T> ResourcePool<T> {
    /// build a pool filled with `capacity` resources from the factory
    pub fn build<F>(capacity: usize, mut factory: F) -> Result<Self, BoxError>
    where
        F: FnMut() -> Result<T, BoxError>,
    {
        if capacity == 0 {
            return Err("resource pool capacity must be positive".into());
        }
        let idle = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let resource = factory()?;
            // the queue is sized to capacity, a push can not overflow here
            let _ = idle.push(resource);
        }
        Ok(ResourcePool {
            idle,
            available: Notify::new(),
            capacity: AtomicUsize::new(capacity),
        })
    }

    /// total resources owned by the pool
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// resources currently not checked out
    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    /// take a resource if one is idle
    pub fn try_get(&self) -> Option<Pooled<'_, T>> {
        self.idle.pop().map(|resource| Pooled {
            pool: self,
            resource: Some(resource),
        })
    }

    /// take a resource, waiting for a checkout to be returned if none is idle
    pub async fn get(&self) -> Pooled<'_, T> {
        loop {
            let notified = self.available.notified();
            if let Some(resource) = self.try_get() {
                return resource;
            }
            notified.await;
        }
    }

    /// hand a resource back to the idle queue
    fn put_back(&self, resource: T) {
        if self.idle.push(resource).is_ok() {
            self.available.notify_one();
        }
    }
}

/// a checked out resource, returned to its pool on drop
pub struct Pooled<'a, T> {
    pool: &'a ResourcePool<T>,
    resource: Option<T>,
}

impl<T> Pooled<'_, T> {
    /// remove the resource from the pool for good, e.g. a broken connection
    ///
    /// the pool capacity shrinks by one.
    pub fn detach(mut self) -> T {
        self.pool.capacity.fetch_sub(1, Ordering::AcqRel);
        // resource is only taken here or in drop
        self.resource.take().expect("resource present until detached")
    }
}

impl<T> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource.as_ref().expect("resource present until detached")
    }
}

impl<T> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("resource present until detached")
    }
}

impl<T> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.put_back(resource);
        }
    }
}

/// shared handle to the pool of the current process
///
/// the handler & the initializer hold clones of the same slot,
/// the initializer fills it after fork and the handler reads from it.
pub struct PoolSlot<T> {
    inner: Arc<RwLock<Option<Arc<ResourcePool<T>>>>>,
}

impl<T> Clone for PoolSlot<T> {
    fn clone(&self) -> Self {
        PoolSlot {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for PoolSlot<T> {
    fn default() -> Self {
        PoolSlot {
            inner: Arc::new(RwLock::new(None)),
        }
    }
}

impl<T> PoolSlot<T> {
    /// new empty slot
    pub fn new() -> Self {
        Self::default()
    }

    /// the current pool, `None` before initialization
    pub fn get(&self) -> Option<Arc<ResourcePool<T>>> {
        self.inner.read().clone()
    }

    /// install a pool, returning the one it replaced
    pub fn replace(&self, pool: ResourcePool<T>) -> Option<Arc<ResourcePool<T>>> {
        self.inner.write().replace(Arc::new(pool))
    }

    /// empty the slot
    pub fn take(&self) -> Option<Arc<ResourcePool<T>>> {
        self.inner.write().take()
    }
}

/// resource initializer that rebuilds a worker-local pool after fork
///
/// any pool inherited from the parent is dropped first, then a fresh one of
/// `pool_size` resources is built with the factory.
pub struct PooledInitializer<T, F> {
    slot: PoolSlot<T>,
    factory: F,
}

impl<T, F> PooledInitializer<T, F>
where
    F: FnMut() -> Result<T, BoxError>,
{
    pub fn new(slot: PoolSlot<T>, factory: F) -> Self {
        PooledInitializer { slot, factory }
    }
}

impl<T, F> ResourceInitializer for PooledInitializer<T, F>
where
    F: FnMut() -> Result<T, BoxError>,
{
    fn initialize(&mut self, pool_size: usize) -> Result<(), BoxError> {
        if let Some(inherited) = self.slot.take() {
            debug!(
                capacity = inherited.capacity(),
                "discarding pool inherited across fork"
            );
        }
        let pool = ResourcePool::build(pool_size, &mut self.factory)?;
        self.slot.replace(pool);
        info!(pool_size, "resource pool established");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn counter_factory() -> impl FnMut() -> Result<usize, BoxError> {
        let mut next = 0;
        move || {
            next += 1;
            Ok(next)
        }
    }

    #[test]
    fn test_build_fills_pool() {
        let pool = ResourcePool::build(3, counter_factory()).unwrap();
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.idle(), 3);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(ResourcePool::build(0, counter_factory()).is_err());
    }

    #[test]
    fn test_factory_error_propagates() {
        let result = ResourcePool::<u8>::build(2, || Err("refused".into()));
        assert_eq!(result.err().unwrap().to_string(), "refused");
    }

    #[test]
    fn test_checkout_returns_on_drop() {
        let pool = ResourcePool::build(2, counter_factory()).unwrap();
        {
            let a = pool.try_get().unwrap();
            let b = pool.try_get().unwrap();
            assert_ne!(*a, *b);
            assert!(pool.try_get().is_none());
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_detach_shrinks_pool() {
        let pool = ResourcePool::build(2, counter_factory()).unwrap();
        let resource = pool.try_get().unwrap().detach();
        assert!(resource >= 1);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.capacity(), 1);

        // a plain checkout keeps its place in the pool
        drop(pool.try_get().unwrap());
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_get_waits_for_return() {
        let pool = Arc::new(ResourcePool::build(1, counter_factory()).unwrap());
        let held = pool.try_get().unwrap().detach();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let resource = *pool.get().await;
                resource
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.put_back(held);
        assert_eq!(waiter.await.unwrap(), held);
    }

    #[test]
    fn test_initializer_replaces_inherited_pool() {
        let slot = PoolSlot::new();
        slot.replace(ResourcePool::build(1, || Ok(0usize)).unwrap());
        let inherited = slot.get().unwrap();

        let mut init = PooledInitializer::new(slot.clone(), counter_factory());
        init.initialize(4).unwrap();

        let pool = slot.get().unwrap();
        assert!(!Arc::ptr_eq(&pool, &inherited));
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.idle(), 4);
    }
}
