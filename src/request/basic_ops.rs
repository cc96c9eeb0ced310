use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::command::{
    Smb2Command, Smb2Header, SMB2_FLAGS_ASYNC_COMMAND, SMB2_FLAGS_SERVER_TO_REDIR,
    SMB2_HEADER_SIZE, STATUS_CANCELLED, STATUS_INSUFFICIENT_RESOURCES, STATUS_INVALID_PARAMETER,
    STATUS_NOT_SUPPORTED, STATUS_PENDING, STATUS_SUCCESS,
};
use super::processor::complete_async;
use super::{ConnectionOps, Disposition};
use crate::network::{Connection, ConnectionStatus};
use crate::work::Work;
use crate::{AppError, AppResult};

/// SMB 3.1.1
const NEGOTIATED_DIALECT: u16 = 0x0311;

/// Minimal command layer: drives a connection through negotiation and
/// session setup and answers every request with a bare response header.
/// Nothing here ever changes, so a change notify only completes when it is
/// cancelled.
#[derive(Debug, Default, Clone)]
pub struct BasicOps;

impl BasicOps {
    pub fn new() -> Self {
        BasicOps
    }

    fn execute(&self, conn: &Connection, header: &Smb2Header) -> u32 {
        let next = match header.command {
            Smb2Command::Negotiate => {
                conn.set_dialect(NEGOTIATED_DIALECT);
                Some(ConnectionStatus::NeedNegotiate)
            }
            Smb2Command::SessionSetup => Some(ConnectionStatus::Good),
            Smb2Command::Echo => None,
            other => {
                trace!("connection {}: {:?} not supported", conn.id(), other);
                return STATUS_NOT_SUPPORTED;
            }
        };

        match next.map(|status| conn.set_status(status)) {
            Some(Err(e)) => {
                debug!("connection {}: {}", conn.id(), e);
                STATUS_INVALID_PARAMETER
            }
            _ => STATUS_SUCCESS,
        }
    }

    fn cancel(&self, conn: &Connection, work: &Work, header: &Smb2Header) {
        let found = match Smb2Header::peek_async_id(work.request()) {
            Some(async_id) => conn.cancel_async(async_id),
            None => conn.cancel_request(header.message_id),
        };
        if !found {
            trace!("connection {}: nothing to cancel for {}", conn.id(), header.message_id);
        }
    }

    /// Answers STATUS_PENDING and leaves a task waiting for the cancel.
    fn watch_changes(
        &self,
        work: &mut Work,
        header: &Smb2Header,
        granted: u16,
    ) -> AppResult<Disposition> {
        let conn = work.conn().clone();
        let async_id = match conn.set_async(work) {
            Ok(async_id) => async_id,
            Err(AppError::IdExhausted(e)) => {
                debug!("connection {}: {}", conn.id(), e);
                respond(work, header, granted, STATUS_INSUFFICIENT_RESOURCES, None)?;
                return Ok(Disposition::Done);
            }
            Err(e) => return Err(e),
        };
        respond(work, header, granted, STATUS_PENDING, Some(async_id))?;

        let cancel = work.cancel_token();
        let header = header.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            let Some(mut work) = conn.claim_async(async_id).await else {
                return;
            };
            match respond(&mut work, &header, 0, STATUS_CANCELLED, Some(async_id)) {
                Ok(()) => complete_async(work).await,
                Err(e) => warn!("connection {}: async {}: {}", conn.id(), async_id, e),
            }
        });
        Ok(Disposition::Pending)
    }
}

fn respond(
    work: &mut Work,
    request: &Smb2Header,
    granted: u16,
    status: u32,
    async_id: Option<u64>,
) -> AppResult<()> {
    let response = Smb2Header {
        credit_charge: request.credit_charge,
        command: request.command,
        credit_request: granted,
        flags: (request.flags & SMB2_FLAGS_ASYNC_COMMAND) | SMB2_FLAGS_SERVER_TO_REDIR,
        next_command: 0,
        message_id: request.message_id,
    };
    let buf = work.alloc_response(SMB2_HEADER_SIZE)?;
    match async_id {
        Some(async_id) => response.encode_async(status, async_id, buf),
        None => response.encode(status, buf),
    }
    Ok(())
}

impl ConnectionOps for BasicOps {
    async fn process(&self, work: &mut Work) -> AppResult<Disposition> {
        let header = Smb2Header::peek(work.request())?;
        let conn = work.conn().clone();

        if header.command == Smb2Command::Cancel {
            // no response to a cancel
            self.cancel(&conn, work, &header);
            return Ok(Disposition::Done);
        }

        if let Err(e) = conn.consume_credits(header.credit_charge.max(1)) {
            warn!("connection {}: {}", conn.id(), e);
        }
        let granted = conn.grant_credits(header.credit_request.max(1));

        if header.command == Smb2Command::ChangeNotify {
            return self.watch_changes(work, &header, granted);
        }
        let status = self.execute(&conn, &header);
        respond(work, &header, granted, status, None)?;
        Ok(Disposition::Done)
    }

    async fn terminate(&self, conn: &Arc<Connection>) -> AppResult<()> {
        if conn.running_requests() > 0 {
            return Err(AppError::IllegalState(format!(
                "connection {} terminated with {} running requests",
                conn.id(),
                conn.running_requests()
            )));
        }
        debug!(
            "connection {} terminated after {} requests",
            conn.id(),
            conn.stats().requests_served()
        );
        Ok(())
    }
}
