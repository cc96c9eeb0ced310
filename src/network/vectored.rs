// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Exact-length scatter-gather reads.
//!
//! This is the only place raw socket failures are observed. Transient
//! conditions (`WouldBlock`) are absorbed here with a short randomized
//! backoff; everything else comes back as [`AppError::Shutdown`] or
//! [`AppError::ReconnectNeeded`] and the caller treats it as fatal for the
//! current message.

use std::future::Future;
use std::io::{self, IoSliceMut};
use std::time::Duration;

use rand::Rng;
use tokio::net::tcp::OwnedReadHalf;
use tokio::time;
use tracing::{debug, trace};

use crate::network::{Connection, ConnectionStatus};
use crate::{AppError, AppResult};

/// One receive attempt into a scatter-gather list.
pub trait RecvVectored: Send {
    fn recv_vectored(
        &mut self,
        bufs: &mut [IoSliceMut<'_>],
    ) -> impl Future<Output = io::Result<usize>> + Send;
}

/// Read half of an accepted TCP socket with the receive timeout applied to
/// every attempt.
#[derive(Debug)]
pub struct TcpReceiver {
    half: OwnedReadHalf,
    timeout: Duration,
}

impl TcpReceiver {
    pub fn new(half: OwnedReadHalf, timeout: Duration) -> Self {
        TcpReceiver { half, timeout }
    }
}

impl RecvVectored for TcpReceiver {
    /// An expired receive timeout reports `WouldBlock`, so an idle peer only
    /// costs a liveness check per timeout period.
    async fn recv_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        match time::timeout(self.timeout, self.half.readable()).await {
            Err(_) => return Err(io::ErrorKind::WouldBlock.into()),
            Ok(Err(e)) => return Err(e),
            Ok(Ok(())) => {}
        }
        // readiness can be spurious, WouldBlock goes back to the caller
        self.half.try_read_vectored(bufs)
    }
}

/// Owns the socket's receive side plus the iovec list reused across calls.
#[derive(Debug)]
pub struct VectoredReader<S> {
    socket: S,
    iov: Vec<IoSliceMut<'static>>,
    nr_iov: usize,
}

/// Carries the allocation of an emptied iovec list over to a new lifetime.
fn recycle<'a, 'b>(mut iov: Vec<IoSliceMut<'a>>) -> Vec<IoSliceMut<'b>> {
    iov.clear();
    iov.into_iter().map(|_| -> IoSliceMut<'b> { unreachable!() }).collect()
}

impl<S: RecvVectored> VectoredReader<S> {
    pub fn new(socket: S) -> Self {
        VectoredReader {
            socket,
            iov: Vec::new(),
            nr_iov: 0,
        }
    }

    /// largest segment count the iovec list has been sized for
    pub fn nr_iov(&self) -> usize {
        self.nr_iov
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// Reads exactly `buf.len()` bytes.
    pub async fn read(&mut self, conn: &Connection, buf: &mut [u8]) -> AppResult<usize> {
        let to_read = buf.len();
        self.readv(conn, &mut [buf], to_read).await
    }

    /// Reads exactly `to_read` bytes spread over `bufs` in order. Either the
    /// full length is read or an error is returned, never a short count.
    pub async fn readv(
        &mut self,
        conn: &Connection,
        bufs: &mut [&mut [u8]],
        to_read: usize,
    ) -> AppResult<usize> {
        let room: usize = bufs.iter().map(|b| b.len()).sum();
        if to_read > room {
            return Err(AppError::InvalidValue(format!(
                "cannot read {} bytes into {} bytes of buffers",
                to_read, room
            )));
        }

        if bufs.len() > self.nr_iov {
            self.nr_iov = bufs.len();
        }
        let mut iov = recycle(std::mem::take(&mut self.iov));
        iov.reserve(self.nr_iov);

        let mut left = to_read;
        for buf in bufs.iter_mut() {
            if left == 0 {
                break;
            }
            let take = buf.len().min(left);
            iov.push(IoSliceMut::new(&mut buf[..take]));
            left -= take;
        }

        let result = self.read_loop(conn, &mut iov, to_read).await;
        self.iov = recycle(iov);
        result
    }

    async fn read_loop(
        &mut self,
        conn: &Connection,
        iov: &mut [IoSliceMut<'_>],
        to_read: usize,
    ) -> AppResult<usize> {
        let mut total_read = 0;
        let mut remaining = iov;

        while total_read < to_read {
            if !conn.is_alive() {
                debug!("connection {} is not alive, abandon read", conn.id());
                return Err(AppError::Shutdown);
            }
            if conn.status() == ConnectionStatus::NeedReconnect {
                return Err(AppError::ReconnectNeeded);
            }

            let result = self.socket.recv_vectored(remaining).await;

            let length = match result {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    debug!("receive interrupted on connection {}", conn.id());
                    return Err(AppError::Shutdown);
                }
                _ if conn.status() == ConnectionStatus::NeedReconnect => {
                    return Err(AppError::ReconnectNeeded);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let pause = rand::thread_rng().gen_range(1000..=2000);
                    time::sleep(Duration::from_micros(pause)).await;
                    continue;
                }
                Ok(0) => {
                    debug!("peer closed connection {}", conn.id());
                    conn.mark_need_reconnect();
                    return Err(AppError::ReconnectNeeded);
                }
                Err(e) => {
                    debug!("receive failed on connection {}: {}", conn.id(), e);
                    conn.mark_need_reconnect();
                    return Err(AppError::ReconnectNeeded);
                }
                Ok(length) => length,
            };

            total_read += length;
            IoSliceMut::advance_slices(&mut remaining, length);
            trace!("read {} of {} bytes", total_read, to_read);
        }
        Ok(total_read)
    }
}
