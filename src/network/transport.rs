use std::fmt::Debug;
use std::io::IoSlice;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;
use tracing::debug;

use super::vectored::{TcpReceiver, VectoredReader};
use super::Connection;
use crate::{AppError, AppResult};

/// Byte-stream carrier underneath a [`Connection`]. A new carrier only has
/// to provide these four operations.
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    async fn prepare(&self) -> AppResult<()>;

    /// Fills `buf` completely or fails.
    async fn read(&self, conn: &Connection, buf: &mut [u8]) -> AppResult<usize>;

    /// Sends every slice in order; `total_len` is the sum of their lengths.
    async fn writev(&self, iov: &[IoSlice<'_>], total_len: usize) -> AppResult<usize>;

    async fn disconnect(&self);
}

#[derive(Debug)]
pub struct TcpTransport {
    reader: Mutex<VectoredReader<TcpReceiver>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    send_timeout: Duration,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, recv_timeout: Duration, send_timeout: Duration) -> Self {
        let (read_half, write_half) = stream.into_split();
        TcpTransport {
            reader: Mutex::new(VectoredReader::new(TcpReceiver::new(
                read_half,
                recv_timeout,
            ))),
            writer: Mutex::new(Some(write_half)),
            send_timeout,
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn prepare(&self) -> AppResult<()> {
        if let Some(writer) = self.writer.lock().await.as_ref() {
            writer.as_ref().set_nodelay(true)?;
        }
        Ok(())
    }

    async fn read(&self, conn: &Connection, buf: &mut [u8]) -> AppResult<usize> {
        self.reader.lock().await.read(conn, buf).await
    }

    async fn writev(&self, iov: &[IoSlice<'_>], total_len: usize) -> AppResult<usize> {
        let sum: usize = iov.iter().map(|s| s.len()).sum();
        if sum != total_len {
            return Err(AppError::InvalidValue(format!(
                "writev of {} bytes announced as {}",
                sum, total_len
            )));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(AppError::Shutdown)?;

        let mut slices: Vec<IoSlice<'_>> = iov.to_vec();
        let mut remaining = &mut slices[..];
        let mut sent = 0;
        while sent < total_len {
            let length = match time::timeout(self.send_timeout, writer.write_vectored(remaining)).await
            {
                Err(_) => {
                    return Err(AppError::DetailedIo(format!(
                        "send timed out after {:?}",
                        self.send_timeout
                    )))
                }
                Ok(result) => result?,
            };
            if length == 0 {
                return Err(AppError::DetailedIo("peer stopped accepting data".into()));
            }
            sent += length;
            IoSlice::advance_slices(&mut remaining, length);
        }
        Ok(sent)
    }

    async fn disconnect(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("socket shutdown failed: {}", e);
            }
        }
    }
}
