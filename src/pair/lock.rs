//! Per-pair read/write lock.
//!
//! Unlike a plain rwlock the holder is not tied to a guard: a pin acquired on
//! one call is released by a later unpin, possibly from another thread. The
//! lock also records whether a writer is doing expensive work so that
//! non-blocking callers can decide to back off instead of waiting.
//!
//! Writers have priority: once a writer is queued, new readers wait.

use parking_lot::{Condvar, Mutex};

use crate::types::LockMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteIntent {
    Cheap,
    Expensive,
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: Option<WriteIntent>,
    queued_writers: usize,
    queued_readers: usize,
}

impl LockState {
    fn can_read(&self) -> bool {
        self.writer.is_none() && self.queued_writers == 0
    }

    fn can_write(&self) -> bool {
        self.writer.is_none() && self.readers == 0
    }
}

/// Read/write lock with cheap and expensive write intents.
#[derive(Debug, Default)]
pub(crate) struct PairLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl PairLock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A lock that starts out held in `mode` by the creating thread.
    pub(crate) fn new_locked(mode: LockMode) -> Self {
        let lock = Self::new();
        let acquired = lock.try_lock(mode);
        debug_assert!(acquired);
        lock
    }

    /// Block until the lock is held in `mode`.
    pub(crate) fn lock(&self, mode: LockMode) {
        let mut state = self.state.lock();
        match intent_of(mode) {
            None => {
                state.queued_readers += 1;
                while !state.can_read() {
                    self.cond.wait(&mut state);
                }
                state.queued_readers -= 1;
                state.readers += 1;
            }
            Some(intent) => {
                state.queued_writers += 1;
                while !state.can_write() {
                    self.cond.wait(&mut state);
                }
                state.queued_writers -= 1;
                state.writer = Some(intent);
            }
        }
    }

    /// Acquire the lock in `mode` only if that needs no waiting.
    pub(crate) fn try_lock(&self, mode: LockMode) -> bool {
        let mut state = self.state.lock();
        match intent_of(mode) {
            None if state.can_read() => {
                state.readers += 1;
                true
            }
            Some(intent) if state.can_write() => {
                state.writer = Some(intent);
                true
            }
            _ => false,
        }
    }

    /// Release a hold acquired in `mode`.
    pub(crate) fn unlock(&self, mode: LockMode) {
        let mut state = self.state.lock();
        if mode.is_write() {
            debug_assert!(state.writer.is_some(), "write unlock of a pair not write-locked");
            state.writer = None;
        } else {
            debug_assert!(state.readers > 0, "read unlock of a pair not read-locked");
            state.readers = state.readers.saturating_sub(1);
        }
        drop(state);
        self.cond.notify_all();
    }

    /// Turn a cheap write hold into an expensive one. The caller must be
    /// the current writer.
    pub(crate) fn upgrade_to_expensive(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer.is_some(), "upgrade without a write hold");
        state.writer = Some(WriteIntent::Expensive);
    }

    /// Atomically turn the caller's write hold into a read hold.
    pub(crate) fn downgrade_to_read(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.writer.is_some(), "downgrade without a write hold");
        state.writer = None;
        state.readers += 1;
        drop(state);
        self.cond.notify_all();
    }

    /// Whether a writer currently holds the lock for expensive work.
    pub(crate) fn is_expensive(&self) -> bool {
        self.state.lock().writer == Some(WriteIntent::Expensive)
    }

    /// Whether a writer currently holds the lock for cheap work.
    pub(crate) fn is_write_cheap(&self) -> bool {
        self.state.lock().writer == Some(WriteIntent::Cheap)
    }

    /// Holders plus waiters.
    pub(crate) fn users(&self) -> usize {
        let state = self.state.lock();
        state.readers
            + usize::from(state.writer.is_some())
            + state.queued_writers
            + state.queued_readers
    }

    /// Whether anyone holds the lock.
    pub(crate) fn is_locked(&self) -> bool {
        let state = self.state.lock();
        state.readers > 0 || state.writer.is_some()
    }

    #[cfg(test)]
    fn readers(&self) -> usize {
        self.state.lock().readers
    }
}

fn intent_of(mode: LockMode) -> Option<WriteIntent> {
    match mode {
        LockMode::Read => None,
        LockMode::WriteCheap => Some(WriteIntent::Cheap),
        LockMode::WriteExpensive => Some(WriteIntent::Expensive),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_readers_share() {
        let lock = PairLock::new();
        assert!(lock.try_lock(LockMode::Read));
        assert!(lock.try_lock(LockMode::Read));
        assert_eq!(lock.readers(), 2);
        assert!(!lock.try_lock(LockMode::WriteCheap));
        lock.unlock(LockMode::Read);
        lock.unlock(LockMode::Read);
        assert!(lock.try_lock(LockMode::WriteCheap));
    }

    #[test]
    fn test_writers_exclude_everyone() {
        let lock = PairLock::new_locked(LockMode::WriteCheap);
        assert!(!lock.try_lock(LockMode::Read));
        assert!(!lock.try_lock(LockMode::WriteCheap));
        assert!(!lock.try_lock(LockMode::WriteExpensive));
        assert!(!lock.is_expensive());
        assert!(lock.is_write_cheap());

        lock.upgrade_to_expensive();
        assert!(lock.is_expensive());
        lock.unlock(LockMode::WriteExpensive);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_downgrade_keeps_lock_held() {
        let lock = PairLock::new_locked(LockMode::WriteExpensive);
        lock.downgrade_to_read();
        assert!(lock.try_lock(LockMode::Read));
        assert!(!lock.try_lock(LockMode::WriteCheap));
        lock.unlock(LockMode::Read);
        lock.unlock(LockMode::Read);
        assert!(!lock.is_locked());
    }

    #[test]
    fn test_queued_writer_blocks_new_readers() {
        let lock = Arc::new(PairLock::new());
        lock.lock(LockMode::Read);

        let acquired = Arc::new(AtomicBool::new(false));
        let writer = {
            let lock = Arc::clone(&lock);
            let acquired = Arc::clone(&acquired);
            thread::spawn(move || {
                lock.lock(LockMode::WriteExpensive);
                acquired.store(true, Ordering::SeqCst);
                lock.unlock(LockMode::WriteExpensive);
            })
        };

        while lock.users() < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        // A writer is queued behind the reader: new readers must not jump it.
        assert!(!lock.try_lock(LockMode::Read));
        assert!(!acquired.load(Ordering::SeqCst));

        lock.unlock(LockMode::Read);
        writer.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert!(lock.try_lock(LockMode::Read));
    }

    #[test]
    fn test_blocking_lock_waits_for_writer() {
        let lock = Arc::new(PairLock::new_locked(LockMode::WriteExpensive));
        let reader = {
            let lock = Arc::clone(&lock);
            thread::spawn(move || {
                lock.lock(LockMode::Read);
                lock.unlock(LockMode::Read);
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());
        lock.unlock(LockMode::WriteExpensive);
        reader.join().unwrap();
        assert_eq!(lock.users(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        TryRead,
        TryWrite(bool),
        ReleaseRead,
        ReleaseWrite,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::TryRead),
            any::<bool>().prop_map(Op::TryWrite),
            Just(Op::ReleaseRead),
            Just(Op::ReleaseWrite),
        ]
    }

    proptest! {
        // Driving the lock only through operations a well-behaved pin owner
        // may perform never produces a negative count or a reader/writer mix.
        #[test]
        fn prop_counts_stay_consistent(ops in proptest::collection::vec(op_strategy(), 1..200)) {
            let lock = PairLock::new();
            let mut readers = 0usize;
            let mut writer: Option<LockMode> = None;

            for op in ops {
                match op {
                    Op::TryRead => {
                        let ok = lock.try_lock(LockMode::Read);
                        prop_assert_eq!(ok, writer.is_none());
                        if ok { readers += 1; }
                    }
                    Op::TryWrite(expensive) => {
                        let mode = if expensive { LockMode::WriteExpensive } else { LockMode::WriteCheap };
                        let ok = lock.try_lock(mode);
                        prop_assert_eq!(ok, writer.is_none() && readers == 0);
                        if ok { writer = Some(mode); }
                    }
                    Op::ReleaseRead => {
                        if readers > 0 {
                            lock.unlock(LockMode::Read);
                            readers -= 1;
                        }
                    }
                    Op::ReleaseWrite => {
                        if let Some(mode) = writer.take() {
                            lock.unlock(mode);
                        }
                    }
                }
                prop_assert_eq!(lock.readers(), readers);
                prop_assert_eq!(lock.is_expensive(), writer == Some(LockMode::WriteExpensive));
                prop_assert!(!(readers > 0 && writer.is_some()));
            }
        }
    }
}
