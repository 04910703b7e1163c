//! Bounded pool of workers executing [`Task`]s from a shared queue.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::BlobCacheError;
use crate::task::Task;

pub struct WorkerPool {
    tx: mpsc::Sender<Arc<dyn Task>>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one) sharing a queue of `size` slots.
    pub fn new(size: usize, cancel: CancellationToken) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<Arc<dyn Task>>(size);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(task) = next else {
                            break;
                        };
                        let (start, end) = task.range();
                        let status = task.execute(&cancel).await;
                        trace!(worker, start, end, ?status, "Task finished");
                    }
                })
            })
            .collect();

        Self {
            tx,
            workers,
            cancel,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task, waiting for a free slot. Fails with
    /// [`BlobCacheError::Cancelled`] once the request is cancelled.
    pub async fn submit(&self, task: Arc<dyn Task>) -> Result<(), BlobCacheError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BlobCacheError::Cancelled),
            permit = self.tx.reserve() => {
                let permit = permit.map_err(|_| BlobCacheError::PoolClosed)?;
                permit.send(task);
                Ok(())
            }
        }
    }

    /// Stop accepting tasks, let the workers drain the queue and wait for
    /// every in-flight execution.
    pub async fn shutdown(self) {
        let Self { tx, workers, .. } = self;
        drop(tx);
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "Pool worker terminated abnormally");
            }
        }
    }
}
