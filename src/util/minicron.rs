//! Periodic background thread ("minicron").
//!
//! A minicron owns one named thread that wakes up every `period`, or as soon
//! as it is signalled. A `None` period means the thread only runs when
//! signalled. The thread body is supplied by the owner and is expected to
//! loop on [`Minicron::wait_for_next_tick`]:
//!
//! ```text
//! while cron.wait_for_next_tick() {
//!     do_work();
//! }
//! ```

use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::Result;

#[derive(Debug)]
struct CronState {
    period: Option<Duration>,
    signaled: bool,
    shutdown: bool,
}

/// A periodic worker thread.
pub(crate) struct Minicron {
    name: String,
    state: Mutex<CronState>,
    cond: Condvar,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Minicron {
    pub(crate) fn new(name: impl Into<String>, period: Option<Duration>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(CronState {
                period,
                signaled: false,
                shutdown: false,
            }),
            cond: Condvar::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the thread running `body`.
    pub(crate) fn start(&self, body: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new().name(self.name.clone()).spawn(body)?;
        *self.handle.lock() = Some(handle);
        debug!(name = %self.name, "background thread started");
        Ok(())
    }

    /// Wait for the next period or signal. Returns `false` on shutdown.
    pub(crate) fn wait_for_next_tick(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return false;
            }
            if state.signaled {
                state.signaled = false;
                return true;
            }
            match state.period {
                None => self.cond.wait(&mut state),
                Some(period) => {
                    if self.cond.wait_for(&mut state, period).timed_out() {
                        return !state.shutdown;
                    }
                }
            }
        }
    }

    /// Wake the thread for one run.
    pub(crate) fn signal(&self) {
        let mut state = self.state.lock();
        state.signaled = true;
        self.cond.notify_all();
    }

    /// Change the period. Takes effect immediately.
    pub(crate) fn set_period(&self, period: Option<Duration>) {
        let mut state = self.state.lock();
        state.period = period;
        self.cond.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn period(&self) -> Option<Duration> {
        self.state.lock().period
    }

    /// Stop the thread and join it. Idempotent.
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            state.shutdown = true;
            self.cond.notify_all();
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(name = %self.name, "background thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn counting_cron(period: Option<Duration>) -> (Arc<Minicron>, Arc<AtomicUsize>) {
        let cron = Arc::new(Minicron::new("test-cron", period));
        let ticks = Arc::new(AtomicUsize::new(0));
        let body_cron = Arc::clone(&cron);
        let body_ticks = Arc::clone(&ticks);
        cron.start(move || {
            while body_cron.wait_for_next_tick() {
                body_ticks.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
        (cron, ticks)
    }

    fn wait_until(deadline: Duration, f: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        f()
    }

    #[test]
    fn test_periodic_ticks() {
        let (cron, ticks) = counting_cron(Some(Duration::from_millis(5)));
        assert!(wait_until(Duration::from_secs(5), || ticks.load(Ordering::SeqCst) >= 3));
        cron.shutdown();
    }

    #[test]
    fn test_signal_only_when_disabled() {
        let (cron, ticks) = counting_cron(None);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        cron.signal();
        assert!(wait_until(Duration::from_secs(5), || ticks.load(Ordering::SeqCst) == 1));
        cron.shutdown();
    }

    #[test]
    fn test_set_period_enables_ticks() {
        let (cron, ticks) = counting_cron(None);
        assert_eq!(cron.period(), None);
        cron.set_period(Some(Duration::from_millis(5)));
        assert!(wait_until(Duration::from_secs(5), || ticks.load(Ordering::SeqCst) >= 2));
        cron.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (cron, _ticks) = counting_cron(Some(Duration::from_secs(60)));
        let start = Instant::now();
        cron.shutdown();
        cron.shutdown();
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
