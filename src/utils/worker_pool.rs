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

use std::any::Any;
use std::future::Future;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Bounded queue drained by a fixed set of worker tasks. A monitor task
/// restarts workers that died from a panic.
#[derive(Debug)]
pub struct WorkQueue<T> {
    request_tx: async_channel::Sender<T>,
    request_rx: async_channel::Receiver<T>,
    stop_monitor: CancellationToken,
    monitor: JoinHandle<Vec<Worker>>,
}

/// Cloneable producer side of a [`WorkQueue`].
#[derive(Debug)]
pub struct WorkSender<T> {
    request_tx: async_channel::Sender<T>,
}

impl<T> Clone for WorkSender<T> {
    fn clone(&self) -> Self {
        WorkSender {
            request_tx: self.request_tx.clone(),
        }
    }
}

impl<T> WorkSender<T> {
    /// Waits for room in the queue. The item comes back if the queue is
    /// already shut down and the caller has to release it itself.
    pub async fn enqueue(&self, item: T) -> Result<(), T> {
        self.request_tx.send(item).await.map_err(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.request_tx.is_closed()
    }

    pub fn len(&self) -> usize {
        self.request_tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.request_tx.is_empty()
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> WorkQueue<T> {
    pub fn new<F, Fut>(
        capacity: usize,
        num_workers: usize,
        monitor_interval: Duration,
        handler: F,
    ) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (request_tx, request_rx) = async_channel::bounded(capacity);

        let workers: Vec<Worker> = (0..num_workers)
            .map(|id| spawn_worker(id, request_rx.clone(), handler.clone()))
            .collect();
        debug!("work queue started with {} workers", num_workers);

        let stop_monitor = CancellationToken::new();
        let monitor = tokio::spawn(monitor_workers(
            workers,
            request_rx.clone(),
            handler,
            monitor_interval,
            stop_monitor.clone(),
        ));

        WorkQueue {
            request_tx,
            request_rx,
            stop_monitor,
            monitor,
        }
    }

    pub fn sender(&self) -> WorkSender<T> {
        WorkSender {
            request_tx: self.request_tx.clone(),
        }
    }

    /// Stops taking new items, lets the workers finish everything already
    /// queued, then tears the workers down.
    pub async fn drain_and_destroy(self) {
        self.request_tx.close();

        self.stop_monitor.cancel();
        let workers = match self.monitor.await {
            Ok(workers) => workers,
            Err(e) => {
                error!("work queue monitor failed: {}", e);
                Vec::new()
            }
        };

        for worker in workers {
            if let Err(e) = worker.handle.await {
                report_failure(worker.id, e);
            }
        }

        // left behind only if the last workers died mid-drain
        let mut dropped = 0;
        while self.request_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("work queue dropped {} items nobody processed", dropped);
        }
        debug!("work queue destroyed");
    }
}

fn spawn_worker<T, F, Fut>(id: usize, request_rx: async_channel::Receiver<T>, handler: F) -> Worker
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        debug!("worker {} started", id);
        while let Ok(item) = request_rx.recv().await {
            handler(item).await;
        }
        debug!("worker {} exited", id);
    });
    Worker { id, handle }
}

async fn monitor_workers<T, F, Fut>(
    mut workers: Vec<Worker>,
    request_rx: async_channel::Receiver<T>,
    handler: F,
    interval: Duration,
    stop: CancellationToken,
) -> Vec<Worker>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Clone + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut ticker = time::interval(interval);
    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                debug!("worker monitor received stop signal");
                break;
            }
            _ = ticker.tick() => {}
        }

        let mut alive = Vec::with_capacity(workers.len());
        for worker in workers.drain(..) {
            if !worker.handle.is_finished() {
                alive.push(worker);
                continue;
            }
            match worker.handle.await {
                // queue closed, nothing left to do
                Ok(()) => debug!("worker {} finished", worker.id),
                Err(e) => {
                    report_failure(worker.id, e);
                    if request_rx.is_closed() && request_rx.is_empty() {
                        continue;
                    }
                    warn!("worker {} failed, restarting", worker.id);
                    alive.push(spawn_worker(worker.id, request_rx.clone(), handler.clone()));
                }
            }
        }
        workers = alive;
    }
    workers
}

fn report_failure(id: usize, e: JoinError) {
    if e.is_panic() {
        let payload = e.into_panic();
        error!("worker {} panicked with message: {}", id, panic_message(&*payload));
    } else {
        error!("worker {} failed: {}", id, e);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_drain_processes_everything_queued() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let queue = WorkQueue::new(64, 4, Duration::from_secs(5), move |n: u64| {
            let counter = counter.clone();
            async move {
                time::sleep(Duration::from_millis(n % 5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let sender = queue.sender();
        for n in 0..50 {
            assert!(sender.enqueue(n).await.is_ok());
        }
        queue.drain_and_destroy().await;
        assert_eq!(done.load(Ordering::SeqCst), 50);

        // closed queue hands the item back
        assert_eq!(sender.enqueue(7).await, Err(7));
        assert!(sender.is_closed());
    }

    #[tokio::test]
    async fn test_panicked_worker_is_restarted() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let queue = WorkQueue::new(16, 1, Duration::from_millis(10), move |n: u32| {
            let counter = counter.clone();
            async move {
                if n == 0 {
                    panic!("bad request");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let sender = queue.sender();
        sender.enqueue(0).await.unwrap();
        for n in 1..=3 {
            sender.enqueue(n).await.unwrap();
        }

        time::timeout(Duration::from_secs(2), async {
            while done.load(Ordering::SeqCst) < 3 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        queue.drain_and_destroy().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }
}
