use std::sync::Arc;

use bytes::BytesMut;
use tokio_util::sync::CancellationToken;

use super::buffer::BufferHandle;
use super::pool::PoolInner;
use super::LockMode;
use crate::network::Connection;
use crate::request::Smb2Header;
use crate::service::MAX_STREAM_PROT_LEN;
use crate::{AppError, AppResult};

/// List memberships of a work unit. Each is the key of the entry in the
/// owning collection, `None` when not linked.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkLinks {
    /// entry in the connection's request list
    pub request: Option<u64>,
    /// async id in the connection's async request list
    pub async_request: Option<u64>,
    /// entry in an open file's pending lock list
    pub file: Option<u64>,
    /// pending interim response
    pub interim: Option<u64>,
}

impl WorkLinks {
    pub fn is_empty(&self) -> bool {
        self.request.is_none()
            && self.async_request.is_none()
            && self.file.is_none()
            && self.interim.is_none()
    }

    pub fn reset(&mut self) {
        *self = WorkLinks::default();
    }
}

/// The recyclable part of a work unit.
#[derive(Debug, Default)]
pub(crate) struct WorkState {
    pub(crate) request: BytesMut,
    pub(crate) response: BufferHandle,
    pub(crate) aux_payload: BufferHandle,
    pub(crate) transform: Option<BytesMut>,
    pub(crate) write_locked: bool,
    pub(crate) async_id: Option<u64>,
    pub(crate) multi_response: bool,
    pub(crate) counted: bool,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) links: WorkLinks,
}

/// One request in flight.
///
/// Dropping a `Work` is its release: it leaves the connection's lists, gives
/// its async id back, stops counting as running, and returns its buffers and
/// its state to the pool.
#[derive(Debug)]
pub struct Work {
    conn: Arc<Connection>,
    state: WorkState,
    pool: Arc<PoolInner>,
}

impl Work {
    pub(crate) fn new(conn: Arc<Connection>, state: WorkState, pool: Arc<PoolInner>) -> Self {
        Work { conn, state, pool }
    }

    pub fn conn(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn request(&self) -> &[u8] {
        &self.state.request
    }

    pub fn set_request(&mut self, request: BytesMut) {
        self.state.request = request;
    }

    /// Zeroed request buffer of `len` bytes for the socket read to fill,
    /// reusing the capacity the unit kept from its previous request.
    pub fn request_buf(&mut self, len: usize) -> &mut [u8] {
        self.state.request.clear();
        self.state.request.resize(len, 0);
        &mut self.state.request[..]
    }

    pub fn header(&self) -> Option<Smb2Header> {
        Smb2Header::peek(&self.state.request).ok()
    }

    pub fn response(&self) -> &[u8] {
        self.state.response.as_slice()
    }

    /// Allocates the response buffer, giving back any earlier one first.
    pub fn alloc_response(&mut self, size: usize) -> AppResult<&mut BytesMut> {
        check_size("response", size)?;
        self.state.response.release();
        self.state.response = self.pool.allocate_response(size);
        Ok(self.state.response.buf_mut())
    }

    pub fn response_mut(&mut self) -> &mut BytesMut {
        self.state.response.buf_mut()
    }

    pub fn aux_payload(&self) -> &[u8] {
        self.state.aux_payload.as_slice()
    }

    pub fn alloc_aux_payload(&mut self, size: usize) -> AppResult<&mut BytesMut> {
        check_size("aux payload", size)?;
        self.state.aux_payload.release();
        self.state.aux_payload = self.pool.allocate_aux(size);
        Ok(self.state.aux_payload.buf_mut())
    }

    /// Hands over an already filled payload, e.g. data read from a file.
    pub fn set_aux_payload(&mut self, payload: BytesMut) {
        self.state.aux_payload.release();
        self.state.aux_payload = BufferHandle::from_owned(payload);
    }

    pub fn transform(&self) -> Option<&[u8]> {
        self.state.transform.as_deref()
    }

    pub fn set_transform(&mut self, transform: BytesMut) {
        self.state.transform = Some(transform);
    }

    pub fn write_locked(&self) -> bool {
        self.state.write_locked
    }

    pub fn set_lock_mode(&mut self, mode: LockMode) {
        self.state.write_locked = mode == LockMode::Exclusive;
    }

    pub fn async_id(&self) -> Option<u64> {
        self.state.async_id
    }

    pub(crate) fn set_async_id(&mut self, async_id: u64) {
        self.state.async_id = Some(async_id);
    }

    pub fn is_multi_response(&self) -> bool {
        self.state.multi_response
    }

    pub fn set_multi_response(&mut self, multi_response: bool) {
        self.state.multi_response = multi_response;
    }

    /// Token fired when the client cancels this request.
    pub fn cancel_token(&mut self) -> CancellationToken {
        self.state
            .cancel
            .get_or_insert_with(CancellationToken::new)
            .clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state
            .cancel
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    pub fn links(&self) -> &WorkLinks {
        &self.state.links
    }

    pub fn links_mut(&mut self) -> &mut WorkLinks {
        &mut self.state.links
    }

    /// Counts this work as running on its connection until it is dropped.
    pub fn mark_running(&mut self) {
        if !self.state.counted {
            self.state.counted = true;
            self.conn.begin_request();
        }
    }
}

fn check_size(what: &str, size: usize) -> AppResult<()> {
    if size > MAX_STREAM_PROT_LEN {
        return Err(AppError::AllocationFailed(format!(
            "{} of {} bytes exceeds {}",
            what, size, MAX_STREAM_PROT_LEN
        )));
    }
    Ok(())
}

impl Drop for Work {
    fn drop(&mut self) {
        let mut state = std::mem::take(&mut self.state);
        self.conn.unlink(&mut state.links);
        if let Some(async_id) = state.async_id.take() {
            self.conn.release_async_id(async_id);
        }
        if state.counted {
            state.counted = false;
            self.conn.end_request();
        }
        self.pool.recycle(state);
    }
}
