// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::buffer::{BufferCache, BufferHandle, BufferMode};
use super::unit::{Work, WorkState};
use crate::network::Connection;
use crate::service::WorkPoolConfig;
use crate::{AppError, AppResult};

#[derive(Debug)]
pub(crate) struct PoolInner {
    free: Mutex<Vec<WorkState>>,
    outstanding: AtomicUsize,
    capacity: usize,
    buffers: Arc<BufferCache>,
    response_mode: BufferMode,
    aux_mode: BufferMode,
    /// request buffers above this capacity are not kept for reuse
    retain_limit: usize,
}

impl PoolInner {
    pub(crate) fn allocate_response(&self, size: usize) -> BufferHandle {
        BufferHandle::allocate(self.response_mode, size, &self.buffers)
    }

    pub(crate) fn allocate_aux(&self, size: usize) -> BufferHandle {
        BufferHandle::allocate(self.aux_mode, size, &self.buffers)
    }

    pub(crate) fn recycle(&self, mut state: WorkState) {
        state.response.release();
        state.aux_payload.release();
        state.transform = None;
        if state.request.capacity() > self.retain_limit {
            state.request = Default::default();
        } else {
            state.request.clear();
        }
        state.write_locked = false;
        state.multi_response = false;
        state.cancel = None;
        state.links.reset();

        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(state);
        }
        drop(free);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded pool of work units shared by every connection of a server.
#[derive(Debug, Clone)]
pub struct WorkPool {
    inner: Arc<PoolInner>,
}

impl WorkPool {
    pub fn new(config: &WorkPoolConfig) -> Self {
        let mode = |cached: bool| {
            if cached {
                BufferMode::Pooled
            } else {
                BufferMode::Owned
            }
        };
        debug!(
            "work pool capacity {}, response buffers {} bytes",
            config.capacity, config.response_buffer_size
        );
        WorkPool {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
                capacity: config.capacity,
                buffers: Arc::new(BufferCache::new(
                    config.response_buffer_size,
                    config.buffer_cache_limit,
                )),
                response_mode: mode(config.cache_response_buffers),
                aux_mode: mode(config.cache_aux_buffers),
                retain_limit: config.response_buffer_size,
            }),
        }
    }

    /// A cleared unit bound to `conn`, or `None` when every unit is out.
    pub fn acquire(&self, conn: Arc<Connection>) -> Option<Work> {
        let capacity = self.inner.capacity;
        self.inner
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < capacity).then_some(n + 1)
            })
            .ok()?;
        let state = self.inner.free.lock().pop().unwrap_or_default();
        trace!("work acquired for connection {}", conn.id());
        Some(Work::new(conn, state, self.inner.clone()))
    }

    /// Same as dropping the unit.
    pub fn release(&self, work: Work) {
        drop(work);
    }

    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn cached_buffers(&self) -> usize {
        self.inner.buffers.cached()
    }

    /// Tears the pool down. Refused while any unit is still out.
    pub fn destroy(self) -> AppResult<()> {
        let outstanding = self.outstanding();
        if outstanding > 0 {
            return Err(AppError::IllegalState(format!(
                "work pool destroyed with {} units outstanding",
                outstanding
            )));
        }
        let freed = std::mem::take(&mut *self.inner.free.lock()).len();
        debug!("work pool destroyed, {} cached units freed", freed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::{test_config, test_connection};
    use crate::work::LockMode;
    use bytes::BytesMut;

    fn pool(capacity: usize) -> WorkPool {
        let mut config = test_config().work_pool;
        config.capacity = capacity;
        config.response_buffer_size = 1024;
        WorkPool::new(&config)
    }

    #[test]
    fn test_acquire_after_release_is_clean() -> AppResult<()> {
        let pool = pool(1);
        let conn = test_connection();

        let mut work = pool.acquire(conn.clone()).unwrap();
        work.set_request(BytesMut::from(&b"request"[..]));
        work.alloc_response(64)?.extend_from_slice(b"response");
        work.set_lock_mode(LockMode::Exclusive);
        work.set_multi_response(true);
        work.links_mut().request = Some(3);
        work.links_mut().file = Some(9);
        work.links_mut().interim = Some(1);
        pool.release(work);
        assert_eq!(pool.outstanding(), 0);

        let work = pool.acquire(conn).unwrap();
        assert!(work.links().is_empty());
        assert!(work.request().is_empty());
        assert!(work.response().is_empty());
        assert!(work.aux_payload().is_empty());
        assert!(work.transform().is_none());
        assert!(!work.write_locked());
        assert!(!work.is_multi_response());
        assert_eq!(work.async_id(), None);
        Ok(())
    }

    #[test]
    fn test_capacity_bound() {
        let pool = pool(2);
        let conn = test_connection();
        let a = pool.acquire(conn.clone());
        let b = pool.acquire(conn.clone());
        assert!(a.is_some() && b.is_some());
        assert!(pool.acquire(conn.clone()).is_none());

        drop(a);
        assert!(pool.acquire(conn).is_some());
    }

    #[test]
    fn test_destroy_refused_while_outstanding() {
        let pool = pool(4);
        let work = pool.acquire(test_connection());
        assert!(matches!(
            pool.clone().destroy(),
            Err(AppError::IllegalState(_))
        ));
        drop(work);
        assert!(pool.destroy().is_ok());
    }

    #[test]
    fn test_response_buffers_go_back_to_cache() -> AppResult<()> {
        let pool = pool(4);
        let mut work = pool.acquire(test_connection()).unwrap();
        work.alloc_response(100)?;
        drop(work);
        assert_eq!(pool.cached_buffers(), 1);

        let mut work = pool.acquire(test_connection()).unwrap();
        assert!(matches!(
            work.alloc_response(0x0100_0000),
            Err(AppError::AllocationFailed(_))
        ));
        Ok(())
    }

    #[test]
    fn test_running_counter_released_once() {
        let pool = pool(4);
        let conn = test_connection();
        let mut work = pool.acquire(conn.clone()).unwrap();
        work.mark_running();
        work.mark_running();
        assert_eq!(conn.running_requests(), 1);
        drop(work);
        assert_eq!(conn.running_requests(), 0);
    }
}
