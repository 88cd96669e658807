//! Fixed-size worker pool for pairwise analysis jobs.
//!
//! Sized from the host CPU count with a quarter held back for the rest of
//! the process (stream consumer, HTTP handlers). Jobs are plain closures;
//! they run on worker tasks that drain a bounded queue, so a caller
//! submitting into a full queue is back-pressured instead of buffering
//! without bound.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A unit of work executed by the pool.
pub type Job = Box<dyn FnOnce(&CancellationToken) + Send + 'static>;

/// Errors raised by pool operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool was cancelled or closed before the job could be queued.
    #[error("worker pool is closed")]
    Closed,
}

/// Fixed-size task executor over a bounded queue.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Creates a pool sized from the host CPU count:
    /// `max(1, ncpu - ncpu / 4)` workers over a queue of twice that
    /// capacity.
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        let total = num_cpus::get();
        let size = std::cmp::max(1, total - total / 4);
        Self::with_size(size, cancel)
    }

    /// Creates a pool with an explicit worker count.
    #[must_use]
    pub fn with_size(size: usize, cancel: CancellationToken) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(size * 2);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut receiver = receiver.lock().await;
                            tokio::select! {
                                () = cancel.cancelled() => break,
                                job = receiver.recv() => job,
                            }
                        };
                        match job {
                            Some(job) => job(&cancel),
                            None => break,
                        }
                    }
                    tracing::trace!(worker = id, "worker stopped");
                })
            })
            .collect();

        tracing::info!(workers = size, queue = size * 2, "worker pool started");

        Self {
            sender: Mutex::new(Some(sender)),
            cancel,
            workers: Mutex::new(workers),
            size,
        }
    }

    /// Queues a job, waiting for queue space if the pool is saturated.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] if the pool has been closed or its
    /// cancellation token has fired.
    pub async fn submit(&self, job: Job) -> Result<(), PoolError> {
        let sender = {
            let guard = self.sender.lock().await;
            guard.as_ref().cloned().ok_or(PoolError::Closed)?
        };

        tokio::select! {
            () = self.cancel.cancelled() => Err(PoolError::Closed),
            sent = sender.send(job) => sent.map_err(|_| PoolError::Closed),
        }
    }

    /// Stops intake, cancels workers, and waits for them to finish.
    pub async fn close(&self) {
        self.sender.lock().await.take();
        self.cancel.cancel();

        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            let _ = worker.await;
        }
    }

    /// Number of workers in the pool.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn executes_submitted_jobs() {
        let pool = WorkerPool::with_size(2, CancellationToken::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::channel::<()>(16);

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            let done_tx = done_tx.clone();
            pool.submit(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.try_send(());
            }))
            .await
            .unwrap();
        }

        for _ in 0..10 {
            done_rx.recv().await.unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);

        pool.close().await;
    }

    #[tokio::test]
    async fn submit_after_close_fails() {
        let pool = WorkerPool::with_size(1, CancellationToken::new());
        pool.close().await;

        let result = pool.submit(Box::new(|_| {})).await;
        assert!(matches!(result, Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn cancellation_rejects_submissions() {
        let cancel = CancellationToken::new();
        let pool = WorkerPool::with_size(1, cancel.clone());
        cancel.cancel();

        let result = pool.submit(Box::new(|_| {})).await;
        assert!(matches!(result, Err(PoolError::Closed)));

        pool.close().await;
    }

    #[tokio::test]
    async fn close_waits_for_in_flight_jobs() {
        let pool = WorkerPool::with_size(1, CancellationToken::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let slow_counter = Arc::clone(&counter);
        pool.submit(Box::new(move |_| {
            std::thread::sleep(std::time::Duration::from_millis(50));
            slow_counter.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

        pool.close().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cpu_sizing_reserves_a_quarter() {
        let total = num_cpus::get();
        let expected = std::cmp::max(1, total - total / 4);

        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();
        let pool = WorkerPool::new(CancellationToken::new());
        assert_eq!(pool.size(), expected);
        runtime.block_on(pool.close());
    }
}
