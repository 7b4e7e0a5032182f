//! # Seine Executor - Delegated Work Off the Loop
//!
//! Event loop threads must never block: handlers that need heavy CPU work
//! (a TLS handshake computation, compression, a slow lookup) hand it to a
//! [`WorkerPool`] and get the result posted back to their loop as an
//! ordinary task.
//!
//! ```rust,no_run
//! use seine_transport::EventLoopBuilder;
//! use seine_executor::WorkerPoolBuilder;
//!
//! let event_loop = EventLoopBuilder::new().name("io").spawn().unwrap();
//! let workers = WorkerPoolBuilder::new().name("crypto").workers(2).build().unwrap();
//!
//! workers.execute_then(
//!     &event_loop,
//!     || expensive_digest(b"payload"),
//!     |digest| {
//!         // runs back on the event loop thread
//!         println!("digest ready: {digest:?}");
//!     },
//! );
//! # fn expensive_digest(_data: &[u8]) -> [u8; 4] { [0; 4] }
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

use std::io;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::trace;
use seine_transport::EventLoop;

type Job = Box<dyn FnOnce() + Send>;

/// Configures a [`WorkerPool`], builder-style.
pub struct WorkerPoolBuilder {
    name: String,
    workers: usize,
}

impl Default for WorkerPoolBuilder {
    fn default() -> Self {
        WorkerPoolBuilder::new()
    }
}

impl WorkerPoolBuilder {
    /// Defaults: two workers named `seine-worker`.
    pub fn new() -> Self {
        WorkerPoolBuilder {
            name: "seine-worker".to_string(),
            workers: 2,
        }
    }

    /// Base name for the worker threads (`{name}-{i}`).
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Number of worker threads.
    pub fn workers(mut self, workers: usize) -> Self {
        assert!(workers > 0, "a worker pool needs at least one thread");
        self.workers = workers;
        self
    }

    /// Spawns the workers.
    pub fn build(self) -> io::Result<WorkerPool> {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(self.workers);
        for i in 0..self.workers {
            let rx = Arc::clone(&rx);
            let handle = std::thread::Builder::new()
                .name(format!("{}-{i}", self.name))
                .spawn(move || worker_main(&rx))?;
            handles.push(handle);
        }
        Ok(WorkerPool {
            inner: Arc::new(PoolShared {
                tx: Mutex::new(Some(tx)),
                handles: Mutex::new(handles),
            }),
        })
    }
}

fn worker_main(rx: &Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = {
            let guard = rx.lock().expect("worker queue poisoned");
            guard.recv()
        };
        match job {
            Ok(job) => job(),
            // All senders gone: the pool shut down.
            Err(_) => break,
        }
    }
    trace!("worker thread exiting");
}

struct PoolShared {
    tx: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// A fixed pool of worker threads for blocking or CPU-bound jobs.
/// Cheap to clone; shared across handlers and loops.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolShared>,
}

impl WorkerPool {
    /// Runs `job` on some worker. Jobs submitted after shutdown are
    /// dropped.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let guard = self.inner.tx.lock().expect("worker pool poisoned");
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(Box::new(job));
        } else {
            log::warn!("job submitted to a worker pool that already shut down; dropped");
        }
    }

    /// Runs `job` on a worker and posts `callback(result)` back to
    /// `event_loop` as a task, preserving the loop-confinement rule.
    pub fn execute_then<T, F, C>(&self, event_loop: &EventLoop, job: F, callback: C)
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
        C: FnOnce(T) + Send + 'static,
    {
        let event_loop = event_loop.clone();
        self.execute(move || {
            let result = job();
            event_loop.submit(move || callback(result));
        });
    }

    /// Stops accepting jobs and joins the workers after the queue drains.
    pub fn shutdown_gracefully(&self) {
        drop(self.inner.tx.lock().expect("worker pool poisoned").take());
        let handles = std::mem::take(&mut *self.inner.handles.lock().expect("worker pool poisoned"));
        for handle in handles {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seine_transport::EventLoopBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn jobs_run_on_worker_threads() {
        let pool = WorkerPoolBuilder::new().name("test-pool").workers(3).build().unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            pool.execute(move || {
                let _ = tx.send(i);
            });
        }
        let mut got: Vec<i32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..20).collect::<Vec<_>>());
        pool.shutdown_gracefully();
    }

    #[test]
    fn completions_land_back_on_the_loop() {
        let event_loop = EventLoopBuilder::new().name("cb-loop").spawn().unwrap();
        let pool = WorkerPoolBuilder::new().workers(1).build().unwrap();
        let (tx, rx) = mpsc::channel();
        let ev = event_loop.clone();
        pool.execute_then(
            &event_loop,
            || 6 * 7,
            move |answer| {
                let _ = tx.send((answer, ev.in_event_loop()));
            },
        );
        let (answer, on_loop) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(answer, 42);
        assert!(on_loop, "callback must run on the event loop thread");
        pool.shutdown_gracefully();
        event_loop.shutdown_gracefully();
    }

    #[test]
    fn shutdown_drains_queued_jobs() {
        let pool = WorkerPoolBuilder::new().workers(1).build().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown_gracefully();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}
