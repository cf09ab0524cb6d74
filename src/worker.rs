//! Worker pool draining the completion port.
//!
//! A fixed set of OS threads repeatedly calls
//! [`dispatch`](crate::port::PortHandle::dispatch) and hands every
//! completion to a caller-supplied handler. A completion carrying
//! [`SHUTDOWN_KEY`](crate::ops::SHUTDOWN_KEY) makes the receiving thread
//! exit its loop.
//!
//! The pool provides **no serialization**: the handler runs on whichever
//! worker picked the completion up and must tolerate concurrent invocation.
//!
//! `stop()` clears the running flag and joins. Without shutdown packets a
//! worker only notices the flag on its next dispatch timeout (one second),
//! so callers that need prompt joins post [`thread_count`](WorkerPool::thread_count)
//! shutdown packets first — the server facade does exactly that.

use crate::error::{Error, ErrorKind, Result};
use crate::ops::{CompletionResult, SHUTDOWN_KEY};
use crate::port::PortHandle;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long a worker blocks in dispatch before re-checking the running flag.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(1);

/// The completion handler invoked by worker threads.
pub type CompletionHandler = Arc<dyn Fn(CompletionResult) + Send + Sync>;

struct PoolInner {
    running: AtomicBool,
    live_threads: AtomicUsize,
}

/// A fixed pool of threads draining a completion port.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a stopped pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                running: AtomicBool::new(false),
                live_threads: AtomicUsize::new(0),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawns `thread_count` workers (0 = available parallelism, minimum 1)
    /// draining `port` into `handler`.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::AlreadyRunning`] if the pool is running;
    /// [`ErrorKind::NotInitialized`] if the port has been closed.
    pub fn start<F>(&self, port: &PortHandle, handler: F, thread_count: usize) -> Result<()>
    where
        F: Fn(CompletionResult) + Send + Sync + 'static,
    {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            tracing::warn!("worker pool already running");
            return Err(Error::new(ErrorKind::AlreadyRunning));
        }
        if !port.is_open() {
            self.inner.running.store(false, Ordering::Release);
            return Err(Error::new(ErrorKind::NotInitialized));
        }

        let count = if thread_count == 0 {
            thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            thread_count
        };

        let handler: CompletionHandler = Arc::new(handler);
        let mut threads = self.threads.lock().expect("worker pool lock poisoned");
        threads.reserve(count);
        for index in 0..count {
            let inner = Arc::clone(&self.inner);
            let port = port.clone();
            let handler = Arc::clone(&handler);
            let thread = thread::Builder::new()
                .name(format!("portside-worker-{index}"))
                .spawn(move || {
                    inner.live_threads.fetch_add(1, Ordering::AcqRel);
                    worker_loop(&inner, &port, &handler);
                    inner.live_threads.fetch_sub(1, Ordering::AcqRel);
                })
                .expect("failed to spawn worker thread");
            threads.push(thread);
        }
        tracing::info!(threads = count, "worker pool started");
        Ok(())
    }

    /// Clears the running flag and joins every worker. Idempotent.
    ///
    /// Workers exit on their next dispatch timeout unless shutdown packets
    /// were posted, so this may take up to one second per straggler.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut threads = self.threads.lock().expect("worker pool lock poisoned");
        for thread in threads.drain(..) {
            let _ = thread.join();
        }
        tracing::info!("worker pool stopped");
    }

    /// Returns true while the pool is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Number of live worker threads.
    ///
    /// Callers posting shutdown packets post exactly this many.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.inner.live_threads.load(Ordering::Acquire)
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("running", &self.is_running())
            .field("threads", &self.thread_count())
            .finish()
    }
}

fn worker_loop(inner: &PoolInner, port: &PortHandle, handler: &CompletionHandler) {
    tracing::debug!("worker thread started");
    while inner.running.load(Ordering::Acquire) {
        let Some(result) = port.dispatch(DISPATCH_TIMEOUT) else {
            continue;
        };
        if result.completion_key == SHUTDOWN_KEY {
            tracing::debug!("worker received shutdown signal");
            break;
        }
        handler(result);
    }
    tracing::debug!("worker thread exiting");
}
