//! Deferred-work pool ("kibbutz") and per-owner job accounting.
//!
//! The kibbutz is a fixed set of worker threads fed by an unbounded channel.
//! Work that must not run on the caller's thread (prefetch, expensive
//! partial eviction, checkpoint clone writes) is queued here. Owners that
//! need to wait for "their" jobs only (a cachefile being closed, a
//! checkpoint waiting for its clone writes) count them with
//! [`BackgroundJobs`].

use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::{Error, Result};

/// A unit of deferred work.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed pool of background workers.
pub(crate) struct Kibbutz {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Kibbutz {
    /// Start `threads` workers.
    pub(crate) fn new(threads: usize, name: &str) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(threads);

        for i in 0..threads {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || {
                    for job in receiver.iter() {
                        job();
                    }
                })?;
            workers.push(handle);
        }

        debug!(threads, "kibbutz started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a job. After shutdown the job is handed back to the caller.
    pub(crate) fn enqueue(&self, job: Job) -> std::result::Result<(), Job> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => sender.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }

    /// Stop accepting jobs, let the queue drain, and join the workers.
    pub(crate) fn shutdown(&self) {
        // Dropping the sender ends every worker's receive loop once the
        // queue is empty.
        self.sender.lock().take();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("kibbutz worker panicked");
            }
        }
    }
}

#[derive(Debug, Default)]
struct JobState {
    running: usize,
    closed: bool,
}

/// Counter of outstanding background jobs for one owner.
#[derive(Debug, Default)]
pub(crate) struct BackgroundJobs {
    state: Mutex<JobState>,
    cond: Condvar,
}

impl BackgroundJobs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a job. Fails once the owner has been closed.
    pub(crate) fn add(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::invalid_state("background jobs are closed"));
        }
        state.running += 1;
        Ok(())
    }

    /// Mark one job finished.
    pub(crate) fn remove(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.running > 0, "background job count underflow");
        state.running = state.running.saturating_sub(1);
        if state.running == 0 {
            self.cond.notify_all();
        }
    }

    /// Block until no job is outstanding.
    pub(crate) fn wait_for_zero(&self) {
        let mut state = self.state.lock();
        while state.running > 0 {
            self.cond.wait(&mut state);
        }
    }

    /// Refuse new jobs, then wait for the outstanding ones.
    pub(crate) fn wait_and_close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        while state.running > 0 {
            self.cond.wait(&mut state);
        }
    }

    /// Jobs currently outstanding.
    #[cfg(test)]
    pub(crate) fn running(&self) -> usize {
        self.state.lock().running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_kibbutz_runs_jobs() {
        let kibbutz = Kibbutz::new(3, "test-kibbutz").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let jobs = Arc::new(BackgroundJobs::new());

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            let jobs_ref = Arc::clone(&jobs);
            jobs.add().unwrap();
            let queued = kibbutz.enqueue(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                jobs_ref.remove();
            }));
            assert!(queued.is_ok());
        }

        jobs.wait_for_zero();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        kibbutz.shutdown();
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let kibbutz = Kibbutz::new(1, "test-drain").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            let _ = kibbutz.enqueue(Box::new(move || {
                std::thread::sleep(Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        kibbutz.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_enqueue_after_shutdown_returns_job() {
        let kibbutz = Kibbutz::new(1, "test-closed").unwrap();
        kibbutz.shutdown();

        let ran = Arc::new(AtomicUsize::new(0));
        let ran_ref = Arc::clone(&ran);
        let job = kibbutz
            .enqueue(Box::new(move || {
                ran_ref.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap_err();
        job();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_background_jobs_close() {
        let jobs = Arc::new(BackgroundJobs::new());
        jobs.add().unwrap();
        assert_eq!(jobs.running(), 1);

        let closer = {
            let jobs = Arc::clone(&jobs);
            std::thread::spawn(move || jobs.wait_and_close())
        };
        std::thread::sleep(Duration::from_millis(10));
        assert!(!closer.is_finished());

        jobs.remove();
        closer.join().unwrap();
        assert!(jobs.add().is_err());
    }
}
