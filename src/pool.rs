//! Work tracker / thread pool (interface) — spec §4.10, §4.8.
//!
//! The core only needs a place to hand off best-effort background work
//! (prefetch, write-back); it never depends on completion for correctness.
//! Grounded on spec §9's "replace global mutable state... with
//! dependency-injected instances" redesign flag: no process-wide singleton,
//! the pool is constructed by the caller and passed into the archive handle.

use std::sync::Arc;

use crossbeam_channel::bounded;

type Job = Box<dyn FnOnce() + Send>;

/// Contract the archive handle consumes for asynchronous, non-essential work.
pub trait WorkTracker: Send + Sync {
    fn spawn(&self, job: Box<dyn FnOnce() + Send>);
}

/// Default implementation: a small fixed-size worker pool over a bounded
/// channel. Jobs submitted past capacity run inline rather than blocking the
/// caller, since nothing here is load-bearing for correctness.
pub struct ThreadPoolWorkTracker {
    tx: crossbeam_channel::Sender<Job>,
}

impl ThreadPoolWorkTracker {
    pub fn new(workers: usize) -> Arc<Self> {
        let (tx, rx) = bounded::<Job>(256);
        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            std::thread::spawn(move || {
                while let Ok(job) = rx.recv() {
                    job();
                }
            });
        }
        Arc::new(ThreadPoolWorkTracker { tx })
    }
}

impl WorkTracker for ThreadPoolWorkTracker {
    fn spawn(&self, job: Box<dyn FnOnce() + Send>) {
        if let Err(err) = self.tx.try_send(job) {
            // pool saturated or torn down: this work is strictly an
            // optimization, so run it synchronously rather than dropping it.
            log::debug!("work tracker unavailable, running job inline");
            err.into_inner()();
        }
    }
}

/// A tracker that runs everything inline; used in tests and single-threaded
/// embeddings where a background pool isn't wanted.
pub struct InlineWorkTracker;

impl WorkTracker for InlineWorkTracker {
    fn spawn(&self, job: Box<dyn FnOnce() + Send>) {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn inline_tracker_runs_synchronously() {
        let tracker = InlineWorkTracker;
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        tracker.spawn(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn thread_pool_tracker_eventually_runs_job() {
        let tracker = ThreadPoolWorkTracker::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        tracker.spawn(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        for _ in 0..100 {
            if counter.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
