//! A fixed-size pool of worker threads that run "concurrent" callbacks off
//! the dispatcher thread.
//!
//! There's no `rayon`/`threadpool` dependency in play here, so this is a
//! small hand-rolled pool: a bounded set of threads pull closures off a
//! shared [`crossbeam::channel`] and run them. It exists only to keep
//! concurrent callbacks from blocking the dispatcher's timing loop; it is
//! not a general-purpose executor.

use crossbeam::channel::{self, Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A snapshot of the pool's current activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPoolStats {
    /// Workers currently executing a job.
    pub active: usize,
    /// Configured pool size.
    pub max_workers: usize,
    /// Jobs submitted but not yet finished (running + queued).
    pub active_futures: usize,
}

pub struct WorkerPool {
    sender: Sender<Job>,
    handles: Vec<JoinHandle<()>>,
    running: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_workers: usize,
}

impl WorkerPool {
    /// Spawns `max_workers` threads, each blocked on the shared job channel.
    pub fn start(max_workers: usize) -> Self {
        let (sender, receiver): (Sender<Job>, Receiver<Job>) = channel::unbounded();
        let running = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let handles = (0..max_workers)
            .map(|worker_index| {
                let receiver = receiver.clone();
                let running = Arc::clone(&running);
                let in_flight = Arc::clone(&in_flight);
                thread::Builder::new()
                    .name(format!("baton-worker-{worker_index}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            running.fetch_add(1, Ordering::SeqCst);
                            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
                            if let Err(panic) = result {
                                log::error!(
                                    "worker callback panicked: {}",
                                    panic_message(&panic)
                                );
                            }
                            running.fetch_sub(1, Ordering::SeqCst);
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                        }
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self {
            sender,
            handles,
            running,
            in_flight,
            max_workers,
        }
    }

    /// Submits `job` to the pool. Never blocks: the channel is unbounded.
    pub fn submit(&self, job: Job) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        // The only way this send fails is if every worker thread has
        // panicked past recovery and dropped its receiver, which
        // `catch_unwind` above prevents.
        let _ = self.sender.send(job);
    }

    pub fn stats(&self) -> ThreadPoolStats {
        ThreadPoolStats {
            active: self.running.load(Ordering::SeqCst),
            max_workers: self.max_workers,
            active_futures: self.in_flight.load(Ordering::SeqCst),
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Closes the job channel and detaches every worker thread.
    ///
    /// Workers are not joined here: a callback that never returns would
    /// otherwise make shutdown block indefinitely, which contradicts the
    /// transport's bounded-stop contract. Callers are expected to have
    /// already waited for `in_flight_count() == 0` up to the grace period
    /// before calling this.
    pub fn shutdown(self) {
        drop(self.sender);
        for handle in self.handles {
            drop(handle);
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[test]
    fn submitted_jobs_run() {
        let pool = WorkerPool::start(2);
        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = Arc::clone(&flag);
        pool.submit(Box::new(move || flag_clone.store(true, Ordering::SeqCst)));

        for _ in 0..100 {
            if flag.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(flag.load(Ordering::SeqCst));
        pool.shutdown();
    }

    #[test]
    fn panicking_job_does_not_kill_the_pool() {
        let pool = WorkerPool::start(1);
        pool.submit(Box::new(|| panic!("boom")));

        let flag = Arc::new(AtomicBool::new(false));
        let flag_clone = Arc::clone(&flag);
        pool.submit(Box::new(move || flag_clone.store(true, Ordering::SeqCst)));

        for _ in 0..100 {
            if flag.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(flag.load(Ordering::SeqCst));
        pool.shutdown();
    }
}
