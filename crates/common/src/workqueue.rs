//! Deferred work execution
//!
//! Completion paths must never call back into themselves synchronously, so
//! anything that would re-enter (flow-control resume, power transitions,
//! device resets) is posted to a [`WorkQueue`] and run later on another
//! execution context.

use crate::channel::{EventSender, create_event_bridge};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// A unit of deferred work
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executor for deferred jobs
pub trait WorkQueue: Send + Sync {
    /// Queue `job` for later execution; never runs it on the calling stack
    fn schedule(&self, job: Job) -> crate::Result<()>;
}

/// Work queue backed by dedicated OS threads
pub struct ThreadWorkQueue {
    tx: EventSender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadWorkQueue {
    /// Spawn `threads` workers named `{name}-{n}`
    pub fn new(name: &str, threads: usize, capacity: usize) -> crate::Result<Self> {
        let (tx, rx) = create_event_bridge::<Job>(capacity);
        let mut workers = Vec::with_capacity(threads.max(1));

        for n in 0..threads.max(1) {
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, n))
                .spawn(move || {
                    while let Ok(job) = rx.recv_blocking() {
                        job();
                    }
                    debug!("Work queue thread exiting");
                })?;
            workers.push(handle);
        }

        Ok(Self { tx, workers })
    }

    /// Stop accepting jobs, run what is queued and join the workers
    pub fn shutdown(mut self) {
        self.tx.close();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("Work queue thread panicked");
            }
        }
    }
}

impl WorkQueue for ThreadWorkQueue {
    /// Fails instead of waiting when the backlog is at capacity
    fn schedule(&self, job: Job) -> crate::Result<()> {
        self.tx.try_send(job).map_err(|_| {
            if self.tx.is_closed() {
                crate::Error::Channel("work queue closed".to_string())
            } else {
                crate::Error::Channel("work queue full".to_string())
            }
        })
    }
}

impl Drop for ThreadWorkQueue {
    fn drop(&mut self) {
        // Workers finish the backlog and exit on their own
        self.tx.close();
    }
}

/// Work queue running jobs on the Tokio blocking pool
#[derive(Clone)]
pub struct TokioWorkQueue {
    handle: tokio::runtime::Handle,
}

impl TokioWorkQueue {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime of the calling context
    pub fn current() -> crate::Result<Self> {
        tokio::runtime::Handle::try_current()
            .map(Self::new)
            .map_err(|e| crate::Error::Other(e.to_string()))
    }
}

impl WorkQueue for TokioWorkQueue {
    fn schedule(&self, job: Job) -> crate::Result<()> {
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }
}
