//! Work units: one per request, drawn from a bounded pool and returned to it
//! when dropped.

pub use buffer::{BufferCache, BufferHandle, BufferMode};
pub use lock_mode::{classify_request, lock_mode_for, LockMode};
pub use pool::WorkPool;
pub use unit::{Work, WorkLinks};

mod buffer;
mod lock_mode;
mod pool;
mod unit;
