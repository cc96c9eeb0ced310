use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::network::ConnectionRegistry;
use crate::request::{handle_work, ConnectionOps};
use crate::utils::WorkQueue;
use crate::work::{Work, WorkPool};
use crate::AppResult;

use super::config::ServerConfig;
use super::server::{bind, Acceptor, ServerContext};
use super::shutdown::ShutdownNotifier;

/// A running server and everything it owns.
///
/// Start-up brings the parts up in dependency order: work pool, work queue,
/// listening socket, acceptor. [`SmbServer::stop`] takes them down in the
/// reverse order.
pub struct SmbServer {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    pool: WorkPool,
    queue: WorkQueue<Work>,
    notify_shutdown: ShutdownNotifier,
    paused: Arc<AtomicBool>,
    acceptor: JoinHandle<AppResult<()>>,
    shutdown_complete_tx: mpsc::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

impl SmbServer {
    pub async fn start<O: ConnectionOps>(config: ServerConfig, ops: Arc<O>) -> AppResult<SmbServer> {
        config.validate()?;
        let config = Arc::new(config);

        let pool = WorkPool::new(&config.work_pool);

        let handler_config = &config.request_handler_pool;
        let handler_ops = ops.clone();
        let queue = WorkQueue::new(
            handler_config.channel_capacity,
            handler_config.worker_count(),
            Duration::from_millis(handler_config.monitor_interval_ms),
            move |work: Work| {
                let ops = handler_ops.clone();
                async move { handle_work(ops.as_ref(), work).await }
            },
        );

        let listener = match bind(&config.network) {
            Ok(listener) => listener,
            Err(e) => {
                error!("failed to start server: {}", e);
                queue.drain_and_destroy().await;
                pool.destroy()?;
                return Err(e);
            }
        };
        let local_addr = listener.local_addr()?;

        let notify_shutdown = ShutdownNotifier::new();
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let registry = Arc::new(ConnectionRegistry::new());
        let paused = Arc::new(AtomicBool::new(false));

        let acceptor = Acceptor {
            listener,
            limit_connections: Arc::new(Semaphore::new(config.network.max_connections)),
            paused: paused.clone(),
            shutdown_complete_tx: shutdown_complete_tx.clone(),
            ctx: Arc::new(ServerContext {
                config: config.clone(),
                pool: pool.clone(),
                work_tx: queue.sender(),
                registry: registry.clone(),
                ops,
                shutdown: notify_shutdown.subscribe(),
            }),
        };
        let acceptor = tokio::spawn(acceptor.run());
        info!("server started on {}", local_addr);

        Ok(SmbServer {
            local_addr,
            registry,
            pool,
            queue,
            notify_shutdown,
            paused,
            acceptor,
            shutdown_complete_tx,
            shutdown_complete_rx,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// While paused the acceptor leaves pending connections in the backlog.
    pub fn pause_accept(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn outstanding_work(&self) -> usize {
        self.pool.outstanding()
    }

    /// Graceful shutdown sequence:
    /// 1. the acceptor stops and the listening socket is closed
    /// 2. every connection is marked exiting; each connection task waits for
    ///    its running requests, calls `terminate`, and disconnects
    /// 3. once every connection task has dropped its `shutdown_complete_tx`,
    ///    the work queue is drained and its workers torn down
    /// 4. the work pool is destroyed, which fails if a unit leaked
    pub async fn stop(self) -> AppResult<()> {
        let SmbServer {
            registry,
            pool,
            queue,
            notify_shutdown,
            acceptor,
            shutdown_complete_tx,
            mut shutdown_complete_rx,
            ..
        } = self;

        notify_shutdown.notify();
        match acceptor.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("acceptor failed: {}", e),
            Err(e) => error!("acceptor task failed: {}", e),
        }
        debug!("acceptor stopped, listening socket closed");

        registry.stop_all();
        drop(shutdown_complete_tx);
        let _ = shutdown_complete_rx.recv().await;
        debug!("all connections closed");

        queue.drain_and_destroy().await;
        pool.destroy()?;
        info!("server shutdown complete");
        Ok(())
    }
}
