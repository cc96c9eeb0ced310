pub use id_allocator::IdAllocator;
pub use worker_pool::{WorkQueue, WorkSender};

mod id_allocator;
mod worker_pool;
