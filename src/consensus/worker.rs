//! Single-threaded FIFO task workers.
//!
//! The DAG manager runs three of these (`verify`, `sync`, `storage`), each
//! the sole writer of its structures. Submission never blocks; tasks cross
//! workers by submitting follow-up tasks, never by waiting on another queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A named worker thread draining a FIFO job queue.
pub struct Worker {
    name: &'static str,
    sender: Mutex<Option<Sender<Job>>>,
    /// Jobs queued or currently running.
    pending: Arc<AtomicUsize>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let thread_pending = Arc::clone(&pending);
        let handle = std::thread::Builder::new()
            .name(format!("braid-{name}"))
            .spawn(move || {
                for job in rx {
                    job();
                    thread_pending.fetch_sub(1, Ordering::AcqRel);
                }
                tracing::debug!(worker = name, "worker queue closed");
            })
            .expect("spawning a worker thread");
        Worker {
            name,
            sender: Mutex::new(Some(tx)),
            pending,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a job. Non-blocking; jobs submitted after `stop` are dropped.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => {
                self.pending.fetch_add(1, Ordering::AcqRel);
                if tx.send(Box::new(job)).is_err() {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    tracing::warn!(worker = self.name, "job dropped: worker stopped");
                }
            }
            None => {
                tracing::warn!(worker = self.name, "job dropped: worker stopped");
            }
        }
    }

    /// True when no job is queued or running.
    pub fn is_idle(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }

    /// Close the queue and join the thread. Queued jobs finish first.
    pub fn stop(&self) {
        let tx = self.sender.lock().take();
        drop(tx);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn jobs_run_in_submission_order() {
        let worker = Worker::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100u32 {
            let order = Arc::clone(&order);
            worker.execute(move || order.lock().push(i));
        }
        worker.stop();
        assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn idle_after_drain() {
        let worker = Worker::new("test");
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            worker.execute(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        while !worker.is_idle() {
            std::thread::yield_now();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn execute_after_stop_is_a_noop() {
        let worker = Worker::new("test");
        worker.stop();
        worker.execute(|| panic!("must not run"));
        assert!(worker.is_idle());
    }
}
