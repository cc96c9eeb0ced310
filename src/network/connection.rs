use std::collections::BTreeMap;
use std::fmt;
use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tokio::sync::{Notify, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::credits::Credits;
use super::frame::{SessionHeader, SESSION_HEADER_SIZE};
use super::status::ConnectionStatus;
use super::transport::Transport;
use crate::request::Smb2Command;
use crate::service::{ServerConfig, Shutdown};
use crate::utils::IdAllocator;
use crate::work::{LockMode, Work, WorkLinks};
use crate::{AppError, AppResult};

/// Async ids start at 1, 0 never goes on the wire.
const FIRST_ASYNC_ID: u64 = 1;

/// Session security negotiated by the command layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityContext {
    pub signing_required: bool,
    pub encrypt_responses: bool,
    pub session_key: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct ConnectionStats {
    requests_served: AtomicU64,
    open_files: AtomicU64,
}

impl ConnectionStats {
    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::Relaxed)
    }

    pub fn open_files(&self) -> u64 {
        self.open_files.load(Ordering::Acquire)
    }

    pub fn request_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn file_opened(&self) {
        self.open_files.fetch_add(1, Ordering::AcqRel);
    }

    pub fn file_closed(&self) {
        let _ = self
            .open_files
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// What the connection remembers about a queued request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub message_id: u64,
    pub command: Smb2Command,
    pub async_id: Option<u64>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct RequestLists {
    next_entry: u64,
    /// in arrival order
    requests: BTreeMap<u64, PendingRequest>,
    /// keyed by async id
    async_requests: BTreeMap<u64, PendingRequest>,
}

/// Work units that outlived their `process` call, keyed by async id.
#[derive(Debug, Default)]
struct ParkedWork {
    /// set by teardown, nothing is parked afterwards
    closed: bool,
    works: BTreeMap<u64, Work>,
}

/// Holds the serialization lock for one request and gives it back on drop.
pub enum RequestGuard<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

impl RequestGuard<'_> {
    pub fn mode(&self) -> LockMode {
        match self {
            RequestGuard::Shared(_) => LockMode::Shared,
            RequestGuard::Exclusive(_) => LockMode::Exclusive,
        }
    }
}

impl fmt::Debug for RequestGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestGuard({:?})", self.mode())
    }
}

/// Server side state of one accepted client.
///
/// Each piece of mutable state sits behind its own lock: status, credits and
/// the request lists are short parking_lot critical sections, never held
/// across an await. `srv_lock` is the only lock held while a command runs.
pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    connected_at: DateTime<Local>,
    transport: Box<dyn Transport>,

    status: Mutex<ConnectionStatus>,
    dialect: AtomicU16,
    security: Mutex<SecurityContext>,
    credits: Mutex<Credits>,

    requests: Mutex<RequestLists>,
    async_ida: IdAllocator,
    parked: Mutex<ParkedWork>,
    parked_notify: Notify,

    req_running: AtomicUsize,
    idle: Notify,
    srv_lock: RwLock<()>,

    last_active: Mutex<Instant>,
    stats: ConnectionStats,
    deadtime: Option<Duration>,
    max_message_size: usize,

    server_shutdown: Shutdown,
    exiting: CancellationToken,
    disconnected: AtomicBool,
}

impl Connection {
    pub fn new(
        id: u64,
        peer_addr: SocketAddr,
        transport: Box<dyn Transport>,
        config: &ServerConfig,
        server_shutdown: Shutdown,
    ) -> Self {
        Connection {
            id,
            peer_addr,
            connected_at: Local::now(),
            transport,
            status: Mutex::new(ConnectionStatus::New),
            dialect: AtomicU16::new(0),
            security: Mutex::new(SecurityContext::default()),
            credits: Mutex::new(Credits::new(config.session.max_credits)),
            requests: Mutex::new(RequestLists::default()),
            async_ida: IdAllocator::new("async id", FIRST_ASYNC_ID, config.session.max_async_ids),
            parked: Mutex::new(ParkedWork::default()),
            parked_notify: Notify::new(),
            req_running: AtomicUsize::new(0),
            idle: Notify::new(),
            srv_lock: RwLock::new(()),
            last_active: Mutex::new(Instant::now()),
            stats: ConnectionStats::default(),
            deadtime: config.network.deadtime(),
            max_message_size: config.network.max_message_size,
            server_shutdown,
            exiting: CancellationToken::new(),
            disconnected: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected_at(&self) -> DateTime<Local> {
        self.connected_at
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn dialect(&self) -> u16 {
        self.dialect.load(Ordering::Acquire)
    }

    pub fn set_dialect(&self, dialect: u16) {
        self.dialect.store(dialect, Ordering::Release);
    }

    pub fn security(&self) -> SecurityContext {
        self.security.lock().clone()
    }

    pub fn set_security(&self, security: SecurityContext) {
        *self.security.lock() = security;
    }

    // ---- status ----

    pub fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    /// Moves to `next` if the state machine allows it.
    pub fn set_status(&self, next: ConnectionStatus) -> AppResult<()> {
        let mut status = self.status.lock();
        if !status.can_transition_to(next) {
            return Err(AppError::IllegalState(format!(
                "connection {}: {} -> {}",
                self.id, *status, next
            )));
        }
        if *status != next {
            debug!("connection {}: {} -> {}", self.id, *status, next);
        }
        *status = next;
        Ok(())
    }

    /// Flags a fatal transport error. An exiting connection stays exiting.
    pub fn mark_need_reconnect(&self) {
        let mut status = self.status.lock();
        if status.can_transition_to(ConnectionStatus::NeedReconnect) {
            if *status != ConnectionStatus::NeedReconnect {
                debug!("connection {}: {} -> NEED_RECONNECT", self.id, *status);
            }
            *status = ConnectionStatus::NeedReconnect;
        }
    }

    pub fn set_exiting(&self) {
        let mut status = self.status.lock();
        if *status != ConnectionStatus::Exiting {
            debug!("connection {}: {} -> EXITING", self.id, *status);
            *status = ConnectionStatus::Exiting;
        }
        drop(status);
        self.exiting.cancel();
    }

    /// Fires once the connection is told to exit.
    pub fn exiting(&self) -> &CancellationToken {
        &self.exiting
    }

    pub fn is_exiting(&self) -> bool {
        self.status() == ConnectionStatus::Exiting
    }

    /// Whether the read loop may keep going.
    pub fn is_alive(&self) -> bool {
        if self.status() == ConnectionStatus::Exiting
            || self.server_shutdown.is_shutdown()
            || self.disconnected.load(Ordering::Acquire)
        {
            return false;
        }
        if self.stats.open_files() > 0 {
            return true;
        }
        match self.deadtime {
            Some(deadtime) if self.last_active.lock().elapsed() > deadtime => {
                debug!("connection {} idle for more than {:?}", self.id, deadtime);
                false
            }
            _ => true,
        }
    }

    pub fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn last_active(&self) -> Instant {
        *self.last_active.lock()
    }

    // ---- credits ----

    pub fn credits(&self) -> Credits {
        self.credits.lock().clone()
    }

    pub fn grant_credits(&self, requested: u16) -> u16 {
        self.credits.lock().grant(requested)
    }

    pub fn consume_credits(&self, charge: u16) -> AppResult<()> {
        self.credits.lock().consume(charge)
    }

    pub fn set_max_credits(&self, max: u16) {
        self.credits.lock().set_max(max);
    }

    // ---- serialization lock ----

    pub async fn lock_request(&self, mode: LockMode) -> RequestGuard<'_> {
        match mode {
            LockMode::Shared => RequestGuard::Shared(self.srv_lock.read().await),
            LockMode::Exclusive => RequestGuard::Exclusive(self.srv_lock.write().await),
        }
    }

    // ---- running requests ----

    pub fn running_requests(&self) -> usize {
        self.req_running.load(Ordering::Acquire)
    }

    pub(crate) fn begin_request(&self) {
        self.req_running.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_request(&self) {
        if self.req_running.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Resolves once no request of this connection is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.req_running.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    // ---- request lists ----

    /// Records the work as in flight. Cancel requests are never queued, they
    /// only point at other entries.
    pub fn enqueue_request(&self, work: &mut Work) {
        let Some(header) = work.header() else {
            trace!("connection {}: unparsable request not queued", self.id);
            return;
        };
        if header.command == Smb2Command::Cancel {
            return;
        }
        let pending = PendingRequest {
            message_id: header.message_id,
            command: header.command,
            async_id: None,
            cancel: work.cancel_token(),
        };

        let mut lists = self.requests.lock();
        let entry = lists.next_entry;
        lists.next_entry += 1;
        lists.requests.insert(entry, pending);
        work.links_mut().request = Some(entry);
    }

    /// Removes the work from the request lists. A work that still owes more
    /// responses stays queued and `false` is returned.
    pub fn try_dequeue_request(&self, work: &mut Work) -> bool {
        if work.is_multi_response() {
            return false;
        }
        self.unlink(work.links_mut());
        true
    }

    pub(crate) fn unlink(&self, links: &mut WorkLinks) {
        if links.request.is_none() && links.async_request.is_none() {
            return;
        }
        let mut lists = self.requests.lock();
        if let Some(entry) = links.request.take() {
            lists.requests.remove(&entry);
        }
        if let Some(async_id) = links.async_request.take() {
            lists.async_requests.remove(&async_id);
        }
    }

    /// Turns the work into an async request. On `IdExhausted` the caller
    /// answers synchronously instead.
    pub fn set_async(&self, work: &mut Work) -> AppResult<u64> {
        if let Some(async_id) = work.async_id() {
            return Ok(async_id);
        }
        let header = work.header().ok_or_else(|| {
            AppError::InvalidOperation("async handling of an unparsable request".into())
        })?;
        let async_id = self.async_ida.acquire()?;
        let pending = PendingRequest {
            message_id: header.message_id,
            command: header.command,
            async_id: Some(async_id),
            cancel: work.cancel_token(),
        };

        let mut lists = self.requests.lock();
        if let Some(entry) = work.links().request {
            if let Some(queued) = lists.requests.get_mut(&entry) {
                queued.async_id = Some(async_id);
            }
        }
        lists.async_requests.insert(async_id, pending);
        drop(lists);

        work.set_async_id(async_id);
        work.links_mut().async_request = Some(async_id);
        trace!("connection {}: request {} is async {}", self.id, header.message_id, async_id);
        Ok(async_id)
    }

    pub(crate) fn release_async_id(&self, async_id: u64) {
        self.async_ida.release(async_id);
    }

    /// Signals the async request with this id. Returns false if none is
    /// pending.
    pub fn cancel_async(&self, async_id: u64) -> bool {
        match self.requests.lock().async_requests.get(&async_id) {
            Some(pending) => {
                pending.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels the queued request with this message id.
    pub fn cancel_request(&self, message_id: u64) -> bool {
        let lists = self.requests.lock();
        match lists.requests.values().find(|p| p.message_id == message_id) {
            Some(pending) => {
                pending.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.requests.lock().requests.values().cloned().collect()
    }

    pub fn pending_async_requests(&self) -> Vec<PendingRequest> {
        self.requests.lock().async_requests.values().cloned().collect()
    }

    pub fn async_ids_in_use(&self) -> u64 {
        self.async_ida.in_use()
    }

    // ---- parked work ----

    /// Keeps a work that still owes a response after its `process` call,
    /// under its async id. A work that is not async yet gets an id first.
    /// Returns `None` when the work could not be kept and was released.
    pub fn park(&self, mut work: Work) -> Option<u64> {
        let async_id = match work.async_id() {
            Some(async_id) => async_id,
            None => match self.set_async(&mut work) {
                Ok(async_id) => async_id,
                Err(e) => {
                    warn!("connection {}: cannot keep pending request: {}", self.id, e);
                    return None;
                }
            },
        };

        let mut parked = self.parked.lock();
        if parked.closed {
            drop(parked);
            trace!("connection {}: exiting, async {} released", self.id, async_id);
            return None;
        }
        parked.works.insert(async_id, work);
        drop(parked);
        self.parked_notify.notify_waiters();
        Some(async_id)
    }

    /// Takes the parked work with this async id back.
    pub fn take_async(&self, async_id: u64) -> Option<Work> {
        self.parked.lock().works.remove(&async_id)
    }

    /// Like `take_async`, but waits for a work that is about to be parked.
    /// Resolves to `None` once the connection stops keeping work.
    pub async fn claim_async(&self, async_id: u64) -> Option<Work> {
        loop {
            let notified = self.parked_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut parked = self.parked.lock();
                if let Some(work) = parked.works.remove(&async_id) {
                    return Some(work);
                }
                if parked.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn parked_requests(&self) -> usize {
        self.parked.lock().works.len()
    }

    /// Cancels and releases every parked work and refuses later ones.
    pub(crate) fn release_parked(&self) {
        let works = {
            let mut parked = self.parked.lock();
            parked.closed = true;
            std::mem::take(&mut parked.works)
        };
        self.parked_notify.notify_waiters();
        if !works.is_empty() {
            debug!("connection {}: releasing {} pending requests", self.id, works.len());
        }
        for (_, mut work) in works {
            work.cancel_token().cancel();
        }
    }

    // ---- transport ----

    pub async fn read(&self, buf: &mut [u8]) -> AppResult<usize> {
        self.transport.read(self, buf).await
    }

    /// Sends the framed response of `work`. A failed send leaves the
    /// connection in NEED_RECONNECT.
    pub async fn write(&self, work: &Work) -> AppResult<usize> {
        let transform = work.transform().unwrap_or(&[]);
        self.send_parts(&[transform, work.response(), work.aux_payload()])
            .await
    }

    /// Sends `parts` as one framed message. Nothing is sent when they are
    /// all empty.
    pub async fn send_parts(&self, parts: &[&[u8]]) -> AppResult<usize> {
        let payload_len: usize = parts.iter().map(|part| part.len()).sum();
        if payload_len == 0 {
            return Ok(0);
        }
        let header = SessionHeader::encode(payload_len)?;

        let mut iov = Vec::with_capacity(parts.len() + 1);
        iov.push(IoSlice::new(&header));
        for part in parts.iter().filter(|part| !part.is_empty()) {
            iov.push(IoSlice::new(part));
        }
        let total_len = SESSION_HEADER_SIZE + payload_len;

        match self.transport.writev(&iov, total_len).await {
            Ok(sent) => {
                trace!("connection {}: sent {} bytes", self.id, sent);
                Ok(sent)
            }
            Err(e) => {
                warn!("connection {}: failed to send response: {}", self.id, e);
                self.mark_need_reconnect();
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            self.transport.disconnect().await;
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("status", &self.status())
            .field("running", &self.running_requests())
            .finish()
    }
}

impl PendingRequest {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::{memory_connection, test_connection, test_config};
    use crate::request::{Smb2Header, SMB2_HEADER_SIZE};
    use crate::work::WorkPool;
    use bytes::BytesMut;
    use std::sync::Arc;

    fn request(command: Smb2Command, message_id: u64) -> BytesMut {
        let mut buf = BytesMut::with_capacity(SMB2_HEADER_SIZE);
        Smb2Header {
            credit_charge: 1,
            command,
            credit_request: 1,
            flags: 0,
            next_command: 0,
            message_id,
        }
        .encode(0, &mut buf);
        buf
    }

    fn work_for(pool: &WorkPool, conn: &Arc<Connection>, command: Smb2Command, id: u64) -> Work {
        let mut work = pool.acquire(conn.clone()).unwrap();
        work.set_request(request(command, id));
        work
    }

    #[test]
    fn test_status_machine() -> AppResult<()> {
        let conn = test_connection();
        assert!(conn.set_status(ConnectionStatus::Good).is_err());
        conn.set_status(ConnectionStatus::NeedNegotiate)?;
        conn.set_status(ConnectionStatus::Good)?;
        conn.mark_need_reconnect();
        assert_eq!(conn.status(), ConnectionStatus::NeedReconnect);
        assert!(conn.is_alive());

        conn.set_exiting();
        conn.mark_need_reconnect();
        assert_eq!(conn.status(), ConnectionStatus::Exiting);
        assert!(conn.set_status(ConnectionStatus::New).is_err());
        assert!(!conn.is_alive());
        assert!(conn.exiting().is_cancelled());
        Ok(())
    }

    #[test]
    fn test_deadtime_ignored_with_open_files() {
        let mut config = test_config();
        config.network.deadtime_secs = 1;
        let conn = memory_connection(&config).0;
        *conn.last_active.lock() = Instant::now() - Duration::from_secs(5);
        assert!(!conn.is_alive());

        conn.stats().file_opened();
        assert!(conn.is_alive());
        conn.stats().file_closed();
        conn.touch();
        assert!(conn.is_alive());
    }

    #[test]
    fn test_request_lists() {
        let conn = test_connection();
        let pool = WorkPool::new(&test_config().work_pool);

        let mut read = work_for(&pool, &conn, Smb2Command::Read, 7);
        let mut cancel = work_for(&pool, &conn, Smb2Command::Cancel, 8);
        conn.enqueue_request(&mut read);
        conn.enqueue_request(&mut cancel);
        assert_eq!(conn.pending_requests().len(), 1);
        assert_eq!(conn.pending_requests()[0].message_id, 7);

        read.set_multi_response(true);
        assert!(!conn.try_dequeue_request(&mut read));
        assert_eq!(conn.pending_requests().len(), 1);

        read.set_multi_response(false);
        assert!(conn.try_dequeue_request(&mut read));
        assert!(conn.pending_requests().is_empty());
        assert!(read.links().is_empty());
    }

    #[test]
    fn test_async_request_cancel_and_release() -> AppResult<()> {
        let conn = test_connection();
        let pool = WorkPool::new(&test_config().work_pool);

        let mut notify = work_for(&pool, &conn, Smb2Command::ChangeNotify, 3);
        conn.enqueue_request(&mut notify);
        let async_id = conn.set_async(&mut notify)?;
        assert_eq!(async_id, FIRST_ASYNC_ID);
        assert_eq!(conn.set_async(&mut notify)?, async_id);
        assert_eq!(conn.pending_async_requests().len(), 1);

        let token = notify.cancel_token();
        assert!(conn.cancel_async(async_id));
        assert!(token.is_cancelled());
        assert!(!conn.cancel_async(async_id + 1));

        drop(notify);
        assert!(conn.pending_async_requests().is_empty());
        assert!(conn.pending_requests().is_empty());
        assert_eq!(conn.async_ids_in_use(), 0);
        Ok(())
    }

    #[test]
    fn test_async_ids_exhausted_then_recovered() -> AppResult<()> {
        let mut config = test_config();
        config.session.max_async_ids = 4;
        let conn = memory_connection(&config).0;
        let pool = WorkPool::new(&config.work_pool);

        for round in 0..3 {
            let mut held = Vec::new();
            for i in 0..4 {
                let mut work = work_for(&pool, &conn, Smb2Command::Lock, round * 10 + i);
                conn.set_async(&mut work)?;
                held.push(work);
            }
            let mut extra = work_for(&pool, &conn, Smb2Command::Lock, 99);
            assert!(matches!(
                conn.set_async(&mut extra),
                Err(AppError::IdExhausted(_))
            ));
            assert_eq!(extra.async_id(), None);
            drop(held);
            assert_eq!(conn.async_ids_in_use(), 0);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_wait_idle_waits_for_running_work() {
        let conn = test_connection();
        conn.begin_request();
        conn.begin_request();

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.wait_idle().await })
        };
        tokio::task::yield_now().await;
        conn.end_request();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        conn.end_request();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conn.running_requests(), 0);
    }

    #[tokio::test]
    async fn test_write_frames_response() -> AppResult<()> {
        let (conn, sink) = memory_connection(&test_config());
        let pool = WorkPool::new(&test_config().work_pool);
        let mut work = work_for(&pool, &conn, Smb2Command::Echo, 1);
        work.alloc_response(8)?.extend_from_slice(b"response");
        work.set_aux_payload(BytesMut::from(&b"aux"[..]));

        let sent = conn.write(&work).await?;
        assert_eq!(sent, SESSION_HEADER_SIZE + 11);
        let written = sink.written();
        assert_eq!(written.len(), 1);
        assert_eq!(&written[0][..4], &[0, 0, 0, 11]);
        assert_eq!(&written[0][4..], b"responseaux");
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_write_needs_reconnect() {
        let (conn, sink) = memory_connection(&test_config());
        let pool = WorkPool::new(&test_config().work_pool);
        let mut work = work_for(&pool, &conn, Smb2Command::Echo, 1);
        work.alloc_response(4).unwrap().extend_from_slice(b"resp");

        sink.fail_writes();
        assert!(conn.write(&work).await.is_err());
        assert_eq!(conn.status(), ConnectionStatus::NeedReconnect);
    }

    #[tokio::test]
    async fn test_disconnect_reaches_transport_once() {
        let (conn, sink) = memory_connection(&test_config());
        assert!(conn.is_alive());
        conn.disconnect().await;
        conn.disconnect().await;
        assert!(sink.is_disconnected());
        assert!(conn.is_disconnected());
        assert!(!conn.is_alive());
    }

    #[tokio::test]
    async fn test_serialization_lock_modes() {
        let conn = test_connection();
        let first = conn.lock_request(LockMode::Shared).await;
        let second = conn.lock_request(LockMode::Shared).await;
        assert_eq!(first.mode(), LockMode::Shared);

        let exclusive = tokio::time::timeout(
            Duration::from_millis(20),
            conn.lock_request(LockMode::Exclusive),
        )
        .await;
        assert!(exclusive.is_err());

        drop(first);
        drop(second);
        let guard = conn.lock_request(LockMode::Exclusive).await;
        assert_eq!(guard.mode(), LockMode::Exclusive);
    }
}
