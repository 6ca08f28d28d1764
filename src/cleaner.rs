//! Cleaner: writes dirty pairs in the background.
//!
//! Each pass runs `iterations` rounds. A round looks at the next few pairs
//! under the cleaner hand and writes back the dirty, unpinned one with the
//! largest cache pressure, so later evictions find it clean.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::cachetable::Core;
use crate::ops::FlushArgs;
use crate::options::Options;
use crate::pair::{present_mut, Pair};
use crate::types::LockMode;
use crate::util::Minicron;
use crate::Result;

/// Pairs examined per cleaner round.
const CLEANER_BATCH: usize = 8;

pub(crate) struct Cleaner {
    iterations: AtomicUsize,
    pass: Mutex<()>,
    pub(crate) cron: Minicron,
}

impl Cleaner {
    pub(crate) fn new(options: &Options) -> Self {
        Self {
            iterations: AtomicUsize::new(options.cleaner_iterations),
            pass: Mutex::new(()),
            cron: Minicron::new("cachetable-cleaner", options.cleaner_period),
        }
    }

    pub(crate) fn iterations(&self) -> usize {
        self.iterations.load(Ordering::Relaxed)
    }

    pub(crate) fn set_iterations(&self, iterations: usize) {
        self.iterations.store(iterations, Ordering::Relaxed);
    }
}

impl<V: Send + Sync + 'static> Core<V> {
    pub(crate) fn start_cleaner_thread(self: &Arc<Self>) -> Result<()> {
        let core = Arc::clone(self);
        self.cleaner.cron.start(move || {
            while core.cleaner.cron.wait_for_next_tick() {
                core.run_cleaner();
            }
        })
    }

    /// One cleaner pass. Returns the number of pairs written.
    pub(crate) fn run_cleaner(&self) -> usize {
        let _pass = self.cleaner.pass.lock();
        let mut written = 0;

        for _ in 0..self.cleaner.iterations() {
            let batch = self.directory.next_for_cleaning(CLEANER_BATCH);
            if batch.is_empty() {
                break;
            }

            let best = batch
                .into_iter()
                .filter(|p| p.pin_count() == 0 && !p.lock.is_locked())
                .filter_map(|p| {
                    let meta = p.meta.lock();
                    let eligible = meta.dirty && Pair::<V>::is_writable_in_background(&meta);
                    let pressure = meta.attr.cache_pressure_size;
                    drop(meta);
                    eligible.then_some((pressure, p))
                })
                .max_by_key(|(pressure, _)| *pressure);

            if let Some((_, pair)) = best {
                if self.clean_pair(&pair) {
                    written += 1;
                }
            }
        }

        if written > 0 {
            trace!(written, "cleaner pass");
        }
        written
    }

    fn clean_pair(&self, pair: &Pair<V>) -> bool {
        if !pair.lock.try_lock(LockMode::WriteExpensive) {
            return false;
        }
        let written = self.write_for_cleaner(pair);
        pair.lock.unlock(LockMode::WriteExpensive);
        written
    }

    fn write_for_cleaner(&self, pair: &Pair<V>) -> bool {
        let attr = {
            let meta = pair.meta.lock();
            if !meta.dirty || !Pair::<V>::is_writable_in_background(&meta) {
                return false;
            }
            meta.attr
        };
        let Some(cf) = self.cachefile(pair.key.file_id) else {
            return false;
        };

        let args = FlushArgs {
            key: pair.key,
            fullhash: pair.fullhash,
            attr,
            write_me: true,
            keep_me: true,
            for_checkpoint: false,
            is_clone: false,
        };
        let result = {
            let mut value = pair.value.write();
            pair.ops.flush(cf.file(), present_mut(&mut value), &args)
        };
        match result {
            Ok(()) => {
                pair.meta.lock().dirty = false;
                self.metrics.cleaner_writes.inc();
                trace!(key = %pair.key, "cleaned");
                true
            }
            Err(e) => {
                self.record_background_error("cleaner write", pair.key, e);
                false
            }
        }
    }
}
