//! Memory accounting and eviction.
//!
//! The evictor keeps cache usage (`current + cloned + reserved`) under the
//! configured size limit. It runs on its own thread, woken periodically or
//! by clients that push usage over the high watermark, and sweeps the clock
//! ring until usage, less the bytes already being freed, falls to the low
//! watermark.
//!
//! Each visited pair is either skipped (busy, pending a checkpoint),
//! aged (clock count decremented, possibly partially evicted), or fully
//! evicted (written first if dirty).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::cachefile::CacheFile;
use crate::cachetable::Core;
use crate::ops::{EvictionCost, FlushArgs};
use crate::options::Options;
use crate::pair::{present, present_mut, Pair, CLOCK_SATURATION};
use crate::types::LockMode;
use crate::util::Minicron;
use crate::Result;

/// Size accounting plus the evictor thread.
pub(crate) struct Evictor {
    size_current: AtomicI64,
    size_reserved: AtomicI64,
    size_cloned: AtomicI64,
    /// Bytes that expensive partial evictions in flight will free.
    size_evicting: AtomicI64,
    size_limit: i64,
    low_watermark: i64,
    high_watermark: i64,
    /// Serializes eviction passes.
    pass: Mutex<()>,
    pub(crate) cron: Minicron,
}

impl Evictor {
    pub(crate) fn new(options: &Options) -> Self {
        Self {
            size_current: AtomicI64::new(0),
            size_reserved: AtomicI64::new(0),
            size_cloned: AtomicI64::new(0),
            size_evicting: AtomicI64::new(0),
            size_limit: options.size_limit as i64,
            low_watermark: options.low_watermark() as i64,
            high_watermark: options.high_watermark() as i64,
            pass: Mutex::new(()),
            cron: Minicron::new("cachetable-evictor", options.evictor_period),
        }
    }

    pub(crate) fn add_current(&self, delta: i64) {
        self.size_current.fetch_add(delta, Ordering::SeqCst);
    }

    pub(crate) fn add_cloned(&self, delta: i64) {
        self.size_cloned.fetch_add(delta, Ordering::SeqCst);
    }

    pub(crate) fn size_current(&self) -> i64 {
        self.size_current.load(Ordering::SeqCst)
    }

    pub(crate) fn size_reserved(&self) -> i64 {
        self.size_reserved.load(Ordering::SeqCst)
    }

    pub(crate) fn size_cloned(&self) -> i64 {
        self.size_cloned.load(Ordering::SeqCst)
    }

    /// Bytes charged against the limit.
    pub(crate) fn usage(&self) -> i64 {
        self.size_current() + self.size_cloned() + self.size_reserved()
    }

    pub(crate) fn over_high_watermark(&self) -> bool {
        self.usage() > self.high_watermark
    }

    fn needs_eviction(&self) -> bool {
        self.usage() - self.size_evicting.load(Ordering::SeqCst) > self.low_watermark
    }

    /// Reserve `fraction` of the unreserved budget, capped at `upper_bound`.
    pub(crate) fn reserve(&self, fraction: f64, upper_bound: usize) -> usize {
        let fraction = fraction.clamp(0.0, 1.0);
        let available = (self.size_limit - self.size_reserved()).max(0);
        let amount = ((available as f64 * fraction) as usize).min(upper_bound);
        self.size_reserved.fetch_add(amount as i64, Ordering::SeqCst);
        amount
    }

    pub(crate) fn release_reserved(&self, bytes: usize) {
        let prev = self.size_reserved.fetch_sub(bytes as i64, Ordering::SeqCst);
        debug_assert!(prev >= bytes as i64, "released more memory than reserved");
    }
}

impl<V: Send + Sync + 'static> Core<V> {
    pub(crate) fn start_evictor_thread(self: &Arc<Self>) -> Result<()> {
        let core = Arc::clone(self);
        self.evictor.cron.start(move || {
            while core.evictor.cron.wait_for_next_tick() {
                let evicted = core.run_eviction();
                if evicted > 0 {
                    trace!(evicted, "eviction pass");
                }
            }
        })
    }

    /// One eviction pass. Returns the number of pairs fully or partially
    /// evicted.
    pub(crate) fn run_eviction(self: &Arc<Self>) -> usize {
        let _pass = self.evictor.pass.lock();

        // Every pair can be visited enough times to age it out, plus one.
        let mut budget = self.directory.len() * (CLOCK_SATURATION as usize + 2) + 1;
        let mut evicted = 0;
        while budget > 0 && self.evictor.needs_eviction() {
            budget -= 1;
            let Some(pair) = self.directory.next_for_eviction() else {
                break;
            };
            if self.visit_for_eviction(&pair) {
                evicted += 1;
            }
        }

        if self.evictor.needs_eviction() && evicted == 0 && self.directory.len() > 0 {
            debug!(
                usage = self.evictor.usage(),
                low_watermark = self.evictor.low_watermark,
                "eviction pass made no progress"
            );
        }
        evicted
    }

    fn visit_for_eviction(self: &Arc<Self>, pair: &Arc<Pair<V>>) -> bool {
        if !pair.lock.try_lock(LockMode::WriteExpensive) {
            return false;
        }

        let (skip, aged) = {
            let mut meta = pair.meta.lock();
            if !Pair::<V>::is_writable_in_background(&meta) {
                (true, false)
            } else if meta.clock_count > 0 {
                meta.clock_count -= 1;
                (false, true)
            } else {
                (false, false)
            }
        };
        if skip {
            pair.lock.unlock(LockMode::WriteExpensive);
            return false;
        }

        let Some(cf) = self.cachefile(pair.key.file_id) else {
            pair.lock.unlock(LockMode::WriteExpensive);
            return false;
        };

        if aged {
            // Unlocks the pair itself; an expensive estimate finishes on the
            // kibbutz.
            return self.maybe_partial_evict(pair, &cf);
        }

        let evicted = match self.evict_pair_locked(pair, &cf, false) {
            Ok(evicted) => evicted,
            Err(e) => {
                self.record_background_error("eviction write", pair.key, e);
                false
            }
        };
        pair.lock.unlock(LockMode::WriteExpensive);
        evicted
    }

    /// Ask the pair whether part of it can be dropped. The caller holds
    /// the pair `WriteExpensive`; the lock is released here, or by the
    /// background job for expensive estimates.
    fn maybe_partial_evict(self: &Arc<Self>, pair: &Arc<Pair<V>>, cf: &Arc<CacheFile>) -> bool {
        let attr = pair.attr();
        let estimate = {
            let value = pair.value.read();
            pair.ops.partial_eviction_estimate(present(&value), attr)
        };
        if estimate.bytes_freed == 0 {
            pair.lock.unlock(LockMode::WriteExpensive);
            return false;
        }

        match estimate.cost {
            EvictionCost::Cheap => {
                self.partial_evict_locked(pair);
                pair.lock.unlock(LockMode::WriteExpensive);
            }
            EvictionCost::Expensive => {
                let bytes = estimate.bytes_freed as i64;
                self.evictor.size_evicting.fetch_add(bytes, Ordering::SeqCst);
                let core = Arc::clone(self);
                let job_pair = Arc::clone(pair);
                self.run_in_background(
                    cf,
                    Box::new(move || {
                        core.partial_evict_locked(&job_pair);
                        core.evictor.size_evicting.fetch_sub(bytes, Ordering::SeqCst);
                        job_pair.lock.unlock(LockMode::WriteExpensive);
                    }),
                );
            }
        }
        true
    }

    fn partial_evict_locked(&self, pair: &Pair<V>) {
        let old = pair.attr();
        let result = {
            let mut value = pair.value.write();
            pair.ops.partial_evict(present_mut(&mut value), old)
        };
        match result {
            Ok(new) => {
                self.set_attr(pair, new);
                self.metrics.partial_evictions.inc();
                self.metrics
                    .partial_eviction_bytes
                    .add(old.size.saturating_sub(new.size) as u64);
                trace!(key = %pair.key, old = old.size, new = new.size, "partial eviction");
            }
            Err(e) => warn!(key = %pair.key, error = %e, "partial eviction failed"),
        }
    }

    /// Write the pair if dirty, then remove and free it. The caller holds
    /// the pair `WriteExpensive` and keeps holding it.
    ///
    /// One flush call does both: `write_me` iff dirty, `keep_me = false`.
    /// The pair stays in the directory until that call succeeds, so a
    /// failed write leaves it resident and dirty. Lookups that queued on
    /// the lock meanwhile find it evicted and fetch the written image.
    ///
    /// Without `force` the pair stays if anyone else can still reach it.
    /// Returns whether it was removed.
    pub(crate) fn evict_pair_locked(
        self: &Arc<Self>,
        pair: &Arc<Pair<V>>,
        cf: &CacheFile,
        force: bool,
    ) -> Result<bool> {
        let pending = {
            let meta = pair.meta.lock();
            if meta.evicted || meta.fetching {
                return Ok(false);
            }
            meta.checkpoint_pending
        };
        if pending {
            let _pending = self.checkpointer.pending_lock.read();
            self.checkpoint_locked_pair(pair, true);
        }

        let (dirty, clone_pending, attr) = {
            let meta = pair.meta.lock();
            (meta.dirty, meta.clone_pending, meta.attr)
        };
        if !force && (clone_pending || !pair.is_unused(1)) {
            return Ok(false);
        }

        {
            let mut value = pair.value.write();
            let args = FlushArgs {
                key: pair.key,
                fullhash: pair.fullhash,
                attr,
                write_me: dirty,
                keep_me: false,
                for_checkpoint: false,
                is_clone: false,
            };
            pair.ops.flush(cf.file(), present_mut(&mut value), &args)?;
            value.take();
        }

        self.directory.remove(pair);
        pair.meta.lock().dirty = false;
        self.evictor.add_current(-(attr.size as i64));
        if dirty {
            self.metrics.evictions_dirty.inc();
        } else {
            self.metrics.evictions_clean.inc();
        }
        trace!(key = %pair.key, dirty, "evicted");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionsBuilder;

    fn evictor(limit: usize) -> Evictor {
        let options = OptionsBuilder::new()
            .size_limit(limit)
            .watermarks(0.5, 1.0)
            .evictor_period(None)
            .build()
            .unwrap();
        Evictor::new(&options)
    }

    #[test]
    fn test_usage_sums_components() {
        let ev = evictor(1000);
        ev.add_current(300);
        ev.add_cloned(100);
        assert_eq!(ev.reserve(0.5, usize::MAX), 500);
        assert_eq!(ev.usage(), 900);
        assert!(!ev.over_high_watermark());

        ev.add_current(200);
        assert!(ev.over_high_watermark());
        assert!(ev.needs_eviction());
    }

    #[test]
    fn test_evicting_bytes_count_as_freed() {
        let ev = evictor(1000);
        ev.add_current(800);
        assert!(ev.needs_eviction());
        ev.size_evicting.fetch_add(400, Ordering::SeqCst);
        assert!(!ev.needs_eviction());
    }

    #[test]
    fn test_reserve_is_bounded() {
        let ev = evictor(1000);
        assert_eq!(ev.reserve(0.5, 100), 100);
        assert_eq!(ev.reserve(2.0, usize::MAX), 900);
        assert_eq!(ev.reserve(0.5, usize::MAX), 0);

        ev.release_reserved(1000);
        assert_eq!(ev.size_reserved(), 0);
    }
}
