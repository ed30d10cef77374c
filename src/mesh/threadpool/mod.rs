//! A pool of worker threads, for data plane work too heavy to run
//! on the event loop, e.g. serializing transaction service snapshots.
//!
//! The loop thread either fires and forgets with `execute`, or blocks
//! on the result with `execute_join`; the latter is the norm, since
//! the loop never resumes with offloaded work still in flight.

#[cfg(feature = "threadpool_crossbeam")]
use threadpool_crossbeam_channel::ThreadPool as Pool;

#[cfg(not(feature = "threadpool_crossbeam"))]
compile_error!("Please enable one threadpool backend feature (e.g. threadpool_crossbeam).");

use crate::mesh::error::*;

/// A fixed size thread pool.
pub struct ThreadPool {
    inner: Pool,
}

impl ThreadPool {
    /// Creates a new pool with `num_threads` workers.
    pub fn new(num_threads: usize) -> Self {
        ThreadPool {
            inner: Pool::new(num_threads.max(1)),
        }
    }

    /// Runs `job` on some worker thread.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.execute(job);
    }

    /// Runs `job` on a worker thread and blocks until its
    /// return value is available.
    pub fn execute_join<F, R>(&self, job: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.inner.execute(move || {
            // a dropped receiver just means the caller went away
            tx.send(job()).unwrap_or(());
        });
        rx.recv().wrapped(ErrorKind::Threadpool)
    }

    /// Waits for all queued jobs to finish.
    pub fn join(&self) {
        self.inner.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_join_returns_value() {
        let pool = ThreadPool::new(2);
        let out = pool.execute_join(|| 21 * 2).unwrap();
        assert_eq!(42, out);
    }

    #[test]
    fn test_execute_runs_jobs() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let pool = ThreadPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert_eq!(8, counter.load(Ordering::SeqCst));
    }
}
