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

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::trace;

/// Free list of equally sized response buffers shared by every work unit.
#[derive(Debug)]
pub struct BufferCache {
    buffer_size: usize,
    limit: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl BufferCache {
    pub fn new(buffer_size: usize, limit: usize) -> Self {
        BufferCache {
            buffer_size,
            limit,
            free: Mutex::new(Vec::with_capacity(limit)),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// A cleared buffer with at least `size` bytes of capacity. Requests larger
    /// than the size class bypass the cache.
    pub fn get(&self, size: usize) -> BytesMut {
        if size <= self.buffer_size {
            if let Some(buf) = self.free.lock().pop() {
                return buf;
            }
            return BytesMut::with_capacity(self.buffer_size);
        }
        BytesMut::with_capacity(size)
    }

    pub fn put(&self, mut buf: BytesMut) {
        if buf.capacity() < self.buffer_size {
            trace!("dropping undersized buffer of {} bytes", buf.capacity());
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.limit {
            free.push(buf);
        }
    }

    pub fn cached(&self) -> usize {
        self.free.lock().len()
    }
}

/// How a response-side buffer is given back once the work unit is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    Pooled,
    Owned,
}

/// A response or auxiliary payload buffer. The variant alone decides what
/// `release` does with the memory; a handle dropped without `release` is
/// simply freed.
pub enum BufferHandle {
    Pooled(BytesMut, Arc<BufferCache>),
    Owned(BytesMut),
}

impl Default for BufferHandle {
    fn default() -> Self {
        BufferHandle::Owned(BytesMut::new())
    }
}

impl BufferHandle {
    pub fn allocate(mode: BufferMode, size: usize, cache: &Arc<BufferCache>) -> Self {
        match mode {
            BufferMode::Pooled => BufferHandle::Pooled(cache.get(size), cache.clone()),
            BufferMode::Owned => BufferHandle::Owned(BytesMut::with_capacity(size)),
        }
    }

    /// Wraps an already filled buffer, e.g. file data handed over by a reader.
    pub fn from_owned(buf: BytesMut) -> Self {
        BufferHandle::Owned(buf)
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    pub fn is_allocated(&self) -> bool {
        match self {
            BufferHandle::Pooled(..) => true,
            BufferHandle::Owned(buf) => buf.capacity() > 0,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            BufferHandle::Pooled(buf, _) | BufferHandle::Owned(buf) => &buf[..],
        }
    }

    pub fn buf_mut(&mut self) -> &mut BytesMut {
        match self {
            BufferHandle::Pooled(buf, _) | BufferHandle::Owned(buf) => buf,
        }
    }

    /// Gives the memory back: pooled buffers return to their cache, owned
    /// buffers are freed.
    pub fn release(&mut self) {
        match std::mem::take(self) {
            BufferHandle::Pooled(buf, cache) => cache.put(buf),
            BufferHandle::Owned(buf) => drop(buf),
        }
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferHandle::Pooled(buf, _) => write!(f, "Pooled({} bytes)", buf.len()),
            BufferHandle::Owned(buf) => write!(f, "Owned({} bytes)", buf.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_pooled_buffer_returns_to_cache() {
        let cache = Arc::new(BufferCache::new(1024, 4));
        let mut handle = BufferHandle::allocate(BufferMode::Pooled, 100, &cache);
        handle.buf_mut().put_slice(b"response");
        assert_eq!(handle.len(), 8);
        assert_eq!(cache.cached(), 0);

        handle.release();
        assert!(!handle.is_allocated());
        assert_eq!(cache.cached(), 1);

        // recycled buffer comes back cleared
        let again = cache.get(10);
        assert!(again.is_empty());
        assert!(again.capacity() >= 1024);
    }

    #[test]
    fn test_owned_buffer_bypasses_cache() {
        let cache = Arc::new(BufferCache::new(1024, 4));
        let mut handle = BufferHandle::allocate(BufferMode::Owned, 100, &cache);
        handle.release();
        assert_eq!(cache.cached(), 0);
    }

    #[test]
    fn test_cache_limit_and_oversized() {
        let cache = Arc::new(BufferCache::new(64, 2));
        for _ in 0..3 {
            cache.put(BytesMut::with_capacity(64));
        }
        assert_eq!(cache.cached(), 2);

        let big = cache.get(4096);
        assert!(big.capacity() >= 4096);
        assert_eq!(cache.cached(), 2);
    }
}
