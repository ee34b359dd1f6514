//! Bounded dispatch of handler tasks.
//!
//! Every inbound packet is handled on its own task, but the number of
//! concurrently live handler tasks is capped so a flood of requests cannot
//! exhaust memory. Dispatch is non-blocking: when the pool is full the
//! caller gets an error, logs it, and drops the packet.

use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Semaphore, TryAcquireError};
use tracing::warn;

/// Default cap on concurrently executing workers
pub const DEFAULT_WORKER_CAP: usize = 1024;

/// Dispatch failures
#[derive(Error, Debug, PartialEq, Eq)]
pub enum WorkerError {
    /// All workers are busy
    #[error("worker pool exhausted ({0} tasks)")]
    Exhausted(usize),

    /// The pool has been stopped
    #[error("worker pool stopped")]
    Stopped,
}

/// Bounded pool of execution workers
#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    cap: usize,
    running: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Create a pool capped at `cap` concurrent tasks
    pub fn new(cap: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(cap)),
            cap,
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Dispatch a future onto the pool.
    ///
    /// A panic inside the future is caught and logged at the worker
    /// boundary; it never propagates to the dispatcher.
    pub fn go<F>(&self, fut: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Err(WorkerError::Exhausted(self.cap)),
            Err(TryAcquireError::Closed) => return Err(WorkerError::Stopped),
        };

        let running = Arc::clone(&self.running);
        running.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(panic) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                warn!("worker panicked: {}", panic_message(&panic));
            }
            running.fetch_sub(1, Ordering::Relaxed);
        });
        Ok(())
    }

    /// Stop the pool; subsequent dispatches fail with [`WorkerError::Stopped`].
    ///
    /// Already-running workers are left to finish.
    pub fn stop(&self) {
        self.permits.close();
    }

    /// Number of currently executing workers
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Relaxed)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_CAP)
    }
}

/// Best-effort extraction of a panic payload message
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
