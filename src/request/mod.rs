use std::future::Future;
use std::sync::Arc;

use crate::network::Connection;
use crate::work::Work;
use crate::AppResult;

mod basic_ops;
mod command;
mod processor;

pub use basic_ops::BasicOps;
pub use command::{
    Smb2Command, Smb2Header, SMB2_FLAGS_ASYNC_COMMAND, SMB2_FLAGS_SERVER_TO_REDIR,
    SMB2_HEADER_SIZE, SMB2_PROTO_ID, STATUS_CANCELLED, STATUS_INSUFFICIENT_RESOURCES,
    STATUS_INVALID_PARAMETER, STATUS_NOT_SUPPORTED, STATUS_PENDING, STATUS_SUCCESS,
};
pub use processor::{complete_async, handle_work};

/// What the core does with a work unit once `process` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The response is final. The work is released after it is sent, unless
    /// it is flagged multi-response.
    Done,
    /// The response is an interim one. After it is sent the work is parked
    /// on its connection under its async id, without the serialization lock,
    /// until `Connection::take_async` or `claim_async` hands it back for
    /// `complete_async`.
    Pending,
}

/// The command layer plugged into the connection core.
///
/// `process` runs with the connection's serialization lock held in the mode
/// the request was classified for, and leaves the response in the work's
/// buffers. Everything about command contents lives on this side.
pub trait ConnectionOps: Send + Sync + 'static {
    fn process(&self, work: &mut Work) -> impl Future<Output = AppResult<Disposition>> + Send;

    /// Called once when the connection task is about to release the
    /// connection, after every request on it has finished.
    fn terminate(&self, conn: &Arc<Connection>) -> impl Future<Output = AppResult<()>> + Send;
}
