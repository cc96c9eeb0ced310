use std::collections::BTreeSet;

use parking_lot::Mutex;
use tracing::warn;

use crate::{AppError, AppResult};

/// Hands out the lowest free identifier in `[start, start + capacity)`.
#[derive(Debug)]
pub struct IdAllocator {
    name: &'static str,
    start: u64,
    capacity: u64,
    inner: Mutex<IdState>,
}

#[derive(Debug, Default)]
struct IdState {
    /// first id never handed out so far
    next_fresh: u64,
    /// released ids below `next_fresh`
    free: BTreeSet<u64>,
    in_use: u64,
}

impl IdAllocator {
    pub fn new(name: &'static str, start: u64, capacity: u64) -> Self {
        IdAllocator {
            name,
            start,
            capacity,
            inner: Mutex::new(IdState {
                next_fresh: start,
                ..Default::default()
            }),
        }
    }

    pub fn acquire(&self) -> AppResult<u64> {
        let mut state = self.inner.lock();
        if let Some(id) = state.free.pop_first() {
            state.in_use += 1;
            return Ok(id);
        }
        if state.next_fresh - self.start >= self.capacity {
            return Err(AppError::IdExhausted(format!(
                "{}: all {} ids in use",
                self.name, self.capacity
            )));
        }
        let id = state.next_fresh;
        state.next_fresh += 1;
        state.in_use += 1;
        Ok(id)
    }

    pub fn release(&self, id: u64) {
        let mut state = self.inner.lock();
        if id < self.start || id >= state.next_fresh || state.free.contains(&id) {
            warn!("{}: release of id {} that is not held", self.name, id);
            return;
        }
        state.free.insert(id);
        state.in_use -= 1;

        // fold the tail back so a drained allocator is compact again
        while state.next_fresh > self.start {
            let last = state.next_fresh - 1;
            if !state.free.remove(&last) {
                break;
            }
            state.next_fresh = last;
        }
    }

    pub fn in_use(&self) -> u64 {
        self.inner.lock().in_use
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_free_id_first() -> AppResult<()> {
        let ida = IdAllocator::new("test", 1, 8);
        assert_eq!(ida.acquire()?, 1);
        assert_eq!(ida.acquire()?, 2);
        assert_eq!(ida.acquire()?, 3);
        ida.release(2);
        assert_eq!(ida.acquire()?, 2);
        assert_eq!(ida.acquire()?, 4);
        Ok(())
    }

    #[test]
    fn test_exhaust_and_recover() -> AppResult<()> {
        let ida = IdAllocator::new("test", 1, 4);
        let ids: Vec<u64> = (0..4).map(|_| ida.acquire()).collect::<AppResult<_>>()?;
        assert!(matches!(ida.acquire(), Err(AppError::IdExhausted(_))));

        for id in ids {
            ida.release(id);
        }
        assert_eq!(ida.in_use(), 0);
        for _ in 0..4 {
            ida.acquire()?;
        }
        assert!(ida.acquire().is_err());
        Ok(())
    }

    #[test]
    fn test_released_tail_folds_back() -> AppResult<()> {
        let ida = IdAllocator::new("test", 1, 8);
        for _ in 0..5 {
            ida.acquire()?;
        }
        ida.release(4);
        ida.release(1);
        ida.release(5);
        {
            let state = ida.inner.lock();
            assert_eq!(state.next_fresh, 4);
            assert_eq!(state.free.iter().copied().collect::<Vec<_>>(), vec![1]);
        }
        ida.release(3);
        ida.release(2);
        {
            let state = ida.inner.lock();
            assert_eq!(state.next_fresh, 1);
            assert!(state.free.is_empty());
        }
        assert_eq!(ida.in_use(), 0);
        assert_eq!(ida.acquire()?, 1);
        Ok(())
    }

    #[test]
    fn test_double_release_ignored() -> AppResult<()> {
        let ida = IdAllocator::new("test", 1, 2);
        let a = ida.acquire()?;
        let _b = ida.acquire()?;
        ida.release(a);
        ida.release(a);
        ida.release(99);
        assert_eq!(ida.in_use(), 1);

        // only one slot came back, not two
        ida.acquire()?;
        assert!(ida.acquire().is_err());
        Ok(())
    }
}
