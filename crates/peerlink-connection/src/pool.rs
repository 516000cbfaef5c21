use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use peerlink_common::{PeerlinkError, Result};
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::warn;

/// Executes incoming requests off the stream reader threads.
///
/// Jobs run on the blocking pool of a tokio runtime: the runtime given in
/// the connection options, or a private one owned by the pool. The pool
/// counts jobs in flight so a closing connection can wait for them.
pub(crate) struct WorkerPool {
    runtime: Option<Runtime>,
    handle: Handle,
    in_flight: Mutex<usize>,
    idle: Condvar,
}

struct InFlight<'a>(&'a WorkerPool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut count = self.0.in_flight.lock();
        *count -= 1;
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

impl WorkerPool {
    pub(crate) fn new(executor: Option<Handle>, max_threads: usize) -> Result<Self> {
        let (runtime, handle) = match executor {
            Some(handle) => (None, handle),
            None => {
                let runtime = Builder::new_multi_thread()
                    .worker_threads(1)
                    .max_blocking_threads(max_threads.max(1))
                    .thread_name("peerlink-worker")
                    .build()
                    .map_err(|e| {
                        PeerlinkError::Transport(format!("Failed to start worker pool: {}", e))
                    })?;
                let handle = runtime.handle().clone();
                (Some(runtime), handle)
            }
        };
        Ok(Self {
            runtime,
            handle,
            in_flight: Mutex::new(0),
            idle: Condvar::new(),
        })
    }

    /// Runs `job` on a worker thread.
    pub(crate) fn execute<F>(self: &std::sync::Arc<Self>, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.in_flight.lock() += 1;
        let pool = self.clone();
        self.handle.spawn_blocking(move || {
            let _in_flight = InFlight(&pool);
            job();
        });
    }

    pub(crate) fn in_flight(&self) -> usize {
        *self.in_flight.lock()
    }

    /// Blocks until no job is running, or `timeout` elapses.
    ///
    /// Returns `true` if the pool drained.
    pub(crate) fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.in_flight.lock();
        while *count > 0 {
            match deadline {
                Some(deadline) => {
                    if self.idle.wait_until(&mut count, deadline).timed_out() {
                        return *count == 0;
                    }
                }
                None => self.idle.wait(&mut count),
            }
        }
        true
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let in_flight = *self.in_flight.lock();
        if in_flight > 0 {
            warn!(in_flight, "Dropping worker pool with jobs still running");
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
