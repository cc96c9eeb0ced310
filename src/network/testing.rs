//! In-memory transport for unit tests.

use std::io::IoSlice;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Connection, Transport};
use crate::service::{ServerConfig, ShutdownNotifier};
use crate::{AppError, AppResult};

static NEXT_TEST_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
pub(crate) struct MemorySink {
    written: Mutex<Vec<Vec<u8>>>,
    fail: AtomicBool,
    disconnected: AtomicBool,
}

impl MemorySink {
    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().clone()
    }

    pub(crate) fn fail_writes(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub(crate) struct MemoryTransport {
    sink: Arc<MemorySink>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn prepare(&self) -> AppResult<()> {
        Ok(())
    }

    async fn read(&self, _conn: &Connection, _buf: &mut [u8]) -> AppResult<usize> {
        Err(AppError::Shutdown)
    }

    async fn writev(&self, iov: &[IoSlice<'_>], total_len: usize) -> AppResult<usize> {
        if self.sink.fail.load(Ordering::SeqCst) {
            return Err(AppError::DetailedIo("broken pipe".into()));
        }
        let message: Vec<u8> = iov.iter().flat_map(|s| s.iter().copied()).collect();
        assert_eq!(message.len(), total_len);
        self.sink.written.lock().push(message);
        Ok(total_len)
    }

    async fn disconnect(&self) {
        self.sink.disconnected.store(true, Ordering::SeqCst);
    }
}

pub(crate) fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.work_pool.capacity = 64;
    config.session.max_async_ids = 64;
    config
}

pub(crate) fn memory_connection(config: &ServerConfig) -> (Arc<Connection>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::default());
    let transport = MemoryTransport { sink: sink.clone() };
    let conn = Connection::new(
        NEXT_TEST_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
        SocketAddr::from((Ipv4Addr::LOCALHOST, 50000)),
        Box::new(transport),
        config,
        ShutdownNotifier::new().subscribe(),
    );
    (Arc::new(conn), sink)
}

pub(crate) fn test_connection() -> Arc<Connection> {
    memory_connection(&test_config()).0
}
