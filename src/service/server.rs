use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::time::{self, Duration};
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::network::{
    Connection, ConnectionRegistry, SessionHeader, SessionMessageType, TcpTransport,
    SESSION_HEADER_SIZE,
};
use crate::request::{
    ConnectionOps, Smb2Command, Smb2Header, SMB2_FLAGS_SERVER_TO_REDIR, SMB2_HEADER_SIZE,
    STATUS_INSUFFICIENT_RESOURCES,
};
use crate::utils::WorkSender;
use crate::work::{Work, WorkPool};
use crate::{AppError, AppResult};

use super::config::{NetworkConfig, ServerConfig};
use super::Shutdown;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// how long one accept waits before the loop looks at its flags again
const ACCEPT_POLL: Duration = Duration::from_millis(100);
/// accept retry while the server is told to pause
const PAUSED_POLL: Duration = Duration::from_secs(1);
const DISCARD_CHUNK: usize = 4096;

/// What every connection task shares.
pub(crate) struct ServerContext<O> {
    pub(crate) config: Arc<ServerConfig>,
    pub(crate) pool: WorkPool,
    pub(crate) work_tx: WorkSender<Work>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) ops: Arc<O>,
    pub(crate) shutdown: Shutdown,
}

/// Creates the listening socket: address reuse, the configured interfaces,
/// the fixed backlog.
pub(crate) fn bind(config: &NetworkConfig) -> AppResult<TcpListener> {
    let listen_address = format!("{}:{}", config.ip, config.port);
    let addr: SocketAddr = listen_address
        .parse()
        .map_err(|e| AppError::InvalidValue(format!("listen address {}: {}", listen_address, e)))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    bind_interfaces(&socket, &config.interfaces)?;

    socket.bind(addr).map_err(|e| {
        AppError::DetailedIo(format!("failed to bind {}: {}", listen_address, e))
    })?;
    let listener = socket.listen(config.backlog)?;
    info!("tcp server listening on {}", listener.local_addr()?);
    Ok(listener)
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_interfaces(socket: &TcpSocket, interfaces: &[String]) -> AppResult<()> {
    for iface in interfaces {
        match socket.bind_device(Some(iface.as_bytes())) {
            Ok(()) => debug!("listening socket bound to {}", iface),
            Err(e) if e.raw_os_error() == Some(19) => {
                // ENODEV
                warn!("interface {} cannot take a bound socket, skipped", iface);
            }
            Err(e) => {
                return Err(AppError::DetailedIo(format!(
                    "failed to bind socket to {}: {}",
                    iface, e
                )))
            }
        }
    }
    Ok(())
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_interfaces(_socket: &TcpSocket, interfaces: &[String]) -> AppResult<()> {
    if !interfaces.is_empty() {
        warn!("binding to interfaces is not supported here, listening on all");
    }
    Ok(())
}

/// Accept loop. Runs as its own task and owns the listening socket, which
/// is closed when the task ends.
pub(crate) struct Acceptor<O> {
    pub(crate) listener: TcpListener,
    pub(crate) limit_connections: Arc<Semaphore>,
    pub(crate) paused: Arc<AtomicBool>,
    pub(crate) shutdown_complete_tx: mpsc::Sender<()>,
    pub(crate) ctx: Arc<ServerContext<O>>,
}

impl<O: ConnectionOps> Acceptor<O> {
    pub(crate) async fn run(self) -> AppResult<()> {
        let mut shutdown = self.ctx.shutdown.clone();
        let mut backoff = 1;

        while !shutdown.is_shutdown() {
            if self.paused.load(Ordering::Acquire) {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = time::sleep(PAUSED_POLL) => continue,
                }
            }

            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = self.limit_connections.clone().acquire_owned() => permit
                    .map_err(|e| AppError::IllegalState(format!("connection limit: {}", e)))?,
            };

            let accepted = tokio::select! {
                _ = shutdown.recv() => break,
                accepted = time::timeout(ACCEPT_POLL, self.listener.accept()) => accepted,
            };

            match accepted {
                // nothing pending
                Err(_) => continue,
                Ok(Ok((socket, peer_addr))) => {
                    backoff = 1;
                    self.spawn_connection(socket, peer_addr, permit);
                }
                Ok(Err(err)) => {
                    if backoff > 64 {
                        return Err(AppError::DetailedIo(format!(
                            "accept tcp server error: {}",
                            err
                        )));
                    }
                    warn!("accept failed: {}, retry in {}s", err, backoff);
                    time::sleep(Duration::from_secs(backoff)).await;
                    backoff *= 2;
                }
            }
        }
        debug!("acceptor exit");
        Ok(())
    }

    fn spawn_connection(&self, socket: TcpStream, peer_addr: SocketAddr, permit: OwnedSemaphorePermit) {
        let network = &self.ctx.config.network;
        if let Err(e) = socket.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", peer_addr, e);
        }
        let transport = TcpTransport::new(socket, network.recv_timeout(), network.send_timeout());

        let connection_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(
            connection_id,
            peer_addr,
            Box::new(transport),
            &self.ctx.config,
            self.ctx.shutdown.clone(),
        ));
        self.ctx.registry.register(conn.clone());

        let handler = ConnectionHandler {
            conn,
            ctx: self.ctx.clone(),
            _shutdown_complete_tx: self.shutdown_complete_tx.clone(),
        };
        let span = info_span!("conn", id = connection_id, port = peer_addr.port());
        tokio::spawn(
            async move {
                info!("new connection from {}", peer_addr);
                if let Err(err) = handler.run().await {
                    error!("connection error: {}", err);
                }
                // whether gracefully or unexpectedly closed, release connection
                drop(permit);
            }
            .instrument(span),
        );
    }
}

/// Read loop of one connection.
pub(crate) struct ConnectionHandler<O> {
    conn: Arc<Connection>,
    ctx: Arc<ServerContext<O>>,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl<O: ConnectionOps> ConnectionHandler<O> {
    pub(crate) async fn run(self) -> AppResult<()> {
        let result = self.read_loop().await;
        self.teardown().await;
        result
    }

    async fn read_loop(&self) -> AppResult<()> {
        self.conn.transport().prepare().await?;
        let mut shutdown = self.ctx.shutdown.clone();

        while self.conn.is_alive() {
            let message = tokio::select! {
                message = self.read_message() => message,
                _ = shutdown.recv() => {
                    debug!("connection handler exit read loop after recv shutdown signal");
                    break;
                }
                _ = self.conn.exiting().cancelled() => break,
            };

            match message {
                Ok(Some(work)) => self.queue_work(work).await,
                Ok(None) => {}
                Err(AppError::Shutdown) => {
                    debug!("connection is shutting down");
                    break;
                }
                Err(AppError::ReconnectNeeded) => {
                    debug!("transport failed, status {}", self.conn.status());
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        debug!("connection handler exit read loop");
        Ok(())
    }

    /// Reads one message. `None` for keep-alives, foreign message types and
    /// requests dropped for lack of a work unit.
    async fn read_message(&self) -> AppResult<Option<Work>> {
        let mut raw = [0u8; SESSION_HEADER_SIZE];
        self.conn.read(&mut raw).await?;
        let header = SessionHeader::parse(raw, self.conn.max_message_size())?;

        match header.kind {
            SessionMessageType::SessionMessage => {}
            SessionMessageType::KeepAlive => {
                trace!("keep-alive");
                self.conn.touch();
                return Ok(None);
            }
            SessionMessageType::Other(kind) => {
                debug!("discarding session message of type {:#04x}", kind);
                self.discard(header.length).await?;
                return Ok(None);
            }
        }
        if header.length == 0 {
            return Ok(None);
        }

        let Some(mut work) = self.ctx.pool.acquire(self.conn.clone()) else {
            warn!(
                "{}",
                AppError::AllocationFailed(format!(
                    "no work unit for a {} byte request, request refused",
                    header.length
                ))
            );
            self.refuse(header.length).await?;
            return Ok(None);
        };
        self.conn.read(work.request_buf(header.length)).await?;
        self.conn.touch();
        trace!("read request of {} bytes", header.length);
        Ok(Some(work))
    }

    /// Consumes a request no work unit was left for and answers it with
    /// STATUS_INSUFFICIENT_RESOURCES. Cancels and unparsable requests get
    /// no answer.
    async fn refuse(&self, length: usize) -> AppResult<()> {
        let mut head = [0u8; SMB2_HEADER_SIZE];
        let head_len = length.min(SMB2_HEADER_SIZE);
        self.conn.read(&mut head[..head_len]).await?;
        self.discard(length - head_len).await?;

        let Ok(request) = Smb2Header::peek(&head[..head_len]) else {
            return Ok(());
        };
        if request.command == Smb2Command::Cancel {
            return Ok(());
        }
        let _ = self.conn.consume_credits(request.credit_charge.max(1));
        let mut response = BytesMut::with_capacity(SMB2_HEADER_SIZE);
        Smb2Header {
            credit_charge: request.credit_charge,
            command: request.command,
            credit_request: self.conn.grant_credits(request.credit_request.max(1)),
            flags: SMB2_FLAGS_SERVER_TO_REDIR,
            next_command: 0,
            message_id: request.message_id,
        }
        .encode(STATUS_INSUFFICIENT_RESOURCES, &mut response);
        self.conn.send_parts(&[&response[..]]).await?;
        Ok(())
    }

    async fn discard(&self, mut length: usize) -> AppResult<()> {
        let mut scratch = [0u8; DISCARD_CHUNK];
        while length > 0 {
            let chunk = length.min(DISCARD_CHUNK);
            self.conn.read(&mut scratch[..chunk]).await?;
            length -= chunk;
        }
        Ok(())
    }

    async fn queue_work(&self, mut work: Work) {
        work.mark_running();
        self.conn.enqueue_request(&mut work);
        if let Err(work) = self.ctx.work_tx.enqueue(work).await {
            debug!("work queue is shut down, request released");
            self.ctx.pool.release(work);
        }
    }

    async fn teardown(&self) {
        self.conn.set_exiting();
        self.conn.release_parked();
        self.conn.wait_idle().await;
        if let Err(e) = self.ctx.ops.terminate(&self.conn).await {
            warn!("terminate failed: {}", e);
        }
        self.conn.disconnect().await;
        self.ctx.registry.unregister(self.conn.id());
        info!(
            "connection closed after {} requests",
            self.conn.stats().requests_served()
        );
    }
}

impl<O> Drop for ConnectionHandler<O> {
    fn drop(&mut self) {
        debug!("connection handler dropped");
    }
}
