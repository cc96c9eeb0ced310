use std::sync::Arc;

use tracing::{trace, warn};

use super::{ConnectionOps, Disposition};
use crate::network::Connection;
use crate::work::{classify_request, Work};

/// Runs one request on a worker: classify, execute under the serialization
/// lock, send the response, then release or park the work.
pub async fn handle_work<O: ConnectionOps>(ops: &O, mut work: Work) {
    let conn = work.conn().clone();
    let mode = classify_request(work.request());
    work.set_lock_mode(mode);

    let disposition = {
        let _guard = conn.lock_request(mode).await;
        trace!("connection {}: processing request under {:?} lock", conn.id(), mode);
        match ops.process(&mut work).await {
            Ok(disposition) => disposition,
            Err(e) => {
                warn!("connection {}: request failed: {}", conn.id(), e);
                Disposition::Done
            }
        }
    };

    send_response(&conn, &work).await;
    match disposition {
        Disposition::Done => finish(&conn, work),
        Disposition::Pending => {
            if let Some(async_id) = conn.park(work) {
                trace!("connection {}: async {} pending", conn.id(), async_id);
            }
        }
    }
}

/// Sends the response a parked work was given after `take_async` or
/// `claim_async`, then releases it. A work still flagged multi-response goes
/// back to its connection.
pub async fn complete_async(work: Work) {
    let conn = work.conn().clone();
    send_response(&conn, &work).await;
    finish(&conn, work);
}

async fn send_response(conn: &Arc<Connection>, work: &Work) {
    if let Err(e) = conn.write(work).await {
        trace!("connection {}: response dropped: {}", conn.id(), e);
    }
}

fn finish(conn: &Arc<Connection>, mut work: Work) {
    if conn.try_dequeue_request(&mut work) {
        conn.stats().request_served();
        return;
    }
    trace!("connection {}: work owes more responses", conn.id());
    conn.park(work);
}
