//! Cachetable - the top-level block cache.
//!
//! The cachetable ties together:
//! - the pair directory and clock ring
//! - the evictor, cleaner and checkpoint background threads
//! - the kibbutz worker pool for deferred work
//! - the registry of open cachefiles
//!
//! # Thread Safety
//!
//! A `Cachetable` is shared between threads through `Arc`. Every public
//! operation may be called concurrently. Pins are owned by [`PinGuard`]s
//! which may be sent to other threads, or detached into a [`PairHandle`].
//!
//! # Pin protocol
//!
//! ```text
//! MISS -> FETCHING -> AVAILABLE (partial | full) -> PINNED -> UNPINNED
//! ```
//!
//! A miss inserts a placeholder pair whose lock is held `WriteExpensive` by
//! the inserting thread, so concurrent requesters for the same block queue
//! on the pair lock and the fetch callback runs once.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::cachefile::{BlockFile, CacheFile, CacheFileHooks, Job, Kibbutz};
use crate::checkpoint::{CheckpointStats, Checkpointer};
use crate::cleaner::Cleaner;
use crate::directory::{Directory, Lookup};
use crate::evictor::Evictor;
use crate::metrics::{CachetableMetrics, CachetableStatus, Timer};
use crate::ops::{BlockOps, FlushArgs};
use crate::options::Options;
use crate::pair::{
    present, present_mut, DependentPair, Pair, PairHandle, PairState, PinGuard, Unlockers,
};
use crate::types::{BlockKey, BlockNum, Dirtiness, FileId, LockMode, PairAttr};
use crate::util::Minicron;
use crate::{Error, Result};

#[derive(Default)]
struct FileRegistry {
    by_id: HashMap<FileId, Arc<CacheFile>>,
    by_path: HashMap<PathBuf, FileId>,
    next_id: u32,
}

/// State shared by the cachetable handle, pin guards and background
/// threads.
pub(crate) struct Core<V> {
    pub(crate) options: Options,
    pub(crate) directory: Directory<V>,
    pub(crate) evictor: Evictor,
    pub(crate) cleaner: Cleaner,
    pub(crate) checkpointer: Checkpointer,
    pub(crate) checkpoint_cron: Minicron,
    pub(crate) kibbutz: Kibbutz,
    pub(crate) metrics: CachetableMetrics,
    files: RwLock<FileRegistry>,
    bg_error: Mutex<Option<Error>>,
    closed: AtomicBool,
}

impl<V: Send + Sync + 'static> Core<V> {
    fn new(options: Options) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            directory: Directory::new(options.directory_shards, options.initial_buckets),
            evictor: Evictor::new(&options),
            cleaner: Cleaner::new(&options),
            checkpointer: Checkpointer::new(),
            checkpoint_cron: Minicron::new("cachetable-checkpoint", options.checkpoint_period),
            kibbutz: Kibbutz::new(options.kibbutz_threads, "cachetable-kibbutz")?,
            metrics: CachetableMetrics::new(),
            files: RwLock::new(FileRegistry::default()),
            bg_error: Mutex::new(None),
            closed: AtomicBool::new(false),
            options,
        })
    }

    fn start_background_threads(self: &Arc<Self>) -> Result<()> {
        self.start_evictor_thread()?;
        self.start_cleaner_thread()?;
        self.start_checkpoint_thread()?;
        Ok(())
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::CachetableClosed)
        } else {
            Ok(())
        }
    }

    // === Cachefile registry ===

    pub(crate) fn cachefile(&self, id: FileId) -> Option<Arc<CacheFile>> {
        self.files.read().by_id.get(&id).cloned()
    }

    pub(crate) fn open_cachefiles(&self) -> Vec<Arc<CacheFile>> {
        self.files
            .read()
            .by_id
            .values()
            .filter(|cf| cf.is_open())
            .cloned()
            .collect()
    }

    fn check_registered(&self, cf: &Arc<CacheFile>) -> Result<()> {
        match self.cachefile(cf.id()) {
            Some(found) if Arc::ptr_eq(&found, cf) => Ok(()),
            _ => Err(Error::NotFound(format!(
                "cachefile {} is not registered",
                cf.path().display()
            ))),
        }
    }

    fn open_cachefile(
        &self,
        path: &Path,
        hooks: Option<Arc<dyn CacheFileHooks>>,
    ) -> Result<Arc<CacheFile>> {
        self.check_open()?;
        let lookup_path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        let mut files = self.files.write();
        if let Some(existing) = files
            .by_path
            .get(&lookup_path)
            .and_then(|id| files.by_id.get(id))
        {
            if !existing.is_open() {
                return Err(Error::Busy(format!(
                    "cachefile {} is closing",
                    lookup_path.display()
                )));
            }
            return Ok(Arc::clone(existing));
        }

        let file = BlockFile::open(&lookup_path, self.options.block_size)?;
        let canonical = std::fs::canonicalize(&lookup_path).unwrap_or(lookup_path);

        files.next_id += 1;
        let id = FileId(files.next_id);
        let cf = Arc::new(CacheFile::new(id, canonical.clone(), file, hooks));
        files.by_path.insert(canonical, id);
        files.by_id.insert(id, Arc::clone(&cf));

        debug!(file_id = id.0, path = %cf.path().display(), "cachefile opened");
        Ok(cf)
    }

    fn unregister(&self, cf: &CacheFile) {
        let mut files = self.files.write();
        files.by_id.remove(&cf.id());
        files.by_path.remove(cf.path());
    }

    // === Errors and accounting ===

    pub(crate) fn record_background_error(&self, context: &str, key: BlockKey, err: Error) {
        error!(%key, error = %err, "{} failed", context);
        let mut slot = self.bg_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn take_background_error(&self) -> Option<Error> {
        self.bg_error.lock().take()
    }

    /// Replace a pair's attribute and account the difference.
    pub(crate) fn set_attr(&self, pair: &Pair<V>, attr: PairAttr) {
        let old = {
            let mut meta = pair.meta.lock();
            std::mem::replace(&mut meta.attr, attr)
        };
        self.evictor
            .add_current(attr.size as i64 - old.size as i64);
    }

    pub(crate) fn maybe_signal_evictor(&self) {
        if self.evictor.over_high_watermark() {
            self.evictor.cron.signal();
        }
    }

    fn try_again(&self) -> Error {
        self.metrics.try_again.inc();
        Error::TryAgain
    }

    /// Queue `job` on the kibbutz on behalf of `cf`. Runs it inline when
    /// the file no longer accepts jobs or the pool is shut down.
    pub(crate) fn run_in_background(&self, cf: &Arc<CacheFile>, job: Job) {
        if cf.jobs.add().is_err() {
            job();
            return;
        }
        let owner = Arc::clone(cf);
        let wrapped: Job = Box::new(move || {
            job();
            owner.jobs.remove();
        });
        if let Err(job) = self.kibbutz.enqueue(wrapped) {
            job();
        }
    }

    // === Fetch ===

    /// Run the fetch callback for a freshly inserted placeholder. On
    /// failure the placeholder is removed and its lock released.
    fn fetch_pair(&self, cf: &CacheFile, pair: &Arc<Pair<V>>) -> Result<()> {
        let fetched = {
            let _timer = Timer::new(&self.metrics.miss_time);
            pair.ops.fetch(cf.file(), pair.key, pair.fullhash)
        };
        self.metrics.misses.inc();

        match fetched {
            Ok(fetched) => {
                *pair.value.write() = Some(fetched.value);
                {
                    let mut meta = pair.meta.lock();
                    meta.attr = fetched.attr;
                    meta.dirty = fetched.dirty.is_dirty();
                    meta.fetching = false;
                }
                self.evictor.add_current(fetched.attr.size as i64);
                trace!(key = %pair.key, size = fetched.attr.size, "fetched");
                Ok(())
            }
            Err(e) => {
                warn!(key = %pair.key, error = %e, "fetch failed");
                pair.meta.lock().fetching = false;
                self.directory.remove(pair);
                pair.lock.unlock(LockMode::WriteExpensive);
                Err(e)
            }
        }
    }

    /// Run a partial fetch. The caller holds the pair `WriteExpensive`.
    fn partial_fetch_locked(
        &self,
        cf: &CacheFile,
        pair: &Pair<V>,
        ops: &Arc<dyn BlockOps<V>>,
    ) -> Result<()> {
        let old = pair.attr();
        let new = {
            let mut value = pair.value.write();
            ops.partial_fetch(cf.file(), present_mut(&mut value), old)?
        };
        self.set_attr(pair, new);
        self.metrics.partial_fetches.inc();
        trace!(key = %pair.key, old = old.size, new = new.size, "partial fetch");
        Ok(())
    }

    fn partial_fetch_required(pair: &Pair<V>, ops: &Arc<dyn BlockOps<V>>) -> bool {
        let value = pair.value.read();
        ops.partial_fetch_required(present(&value))
    }

    /// Bring a hit up to the state `ops` asks for. The caller holds the pair
    /// in `mode`. Returns the mode now held, or `None` if the pair was
    /// evicted while the lock was being upgraded (nothing is held then).
    fn finish_hit(
        &self,
        cf: &CacheFile,
        pair: &Arc<Pair<V>>,
        ops: &Arc<dyn BlockOps<V>>,
        mode: LockMode,
    ) -> Result<Option<LockMode>> {
        if !Self::partial_fetch_required(pair, ops) {
            return Ok(Some(mode));
        }

        if mode.is_write() {
            pair.lock.upgrade_to_expensive();
            if let Err(e) = self.partial_fetch_locked(cf, pair, ops) {
                pair.lock.unlock(LockMode::WriteExpensive);
                return Err(e);
            }
            return Ok(Some(LockMode::WriteExpensive));
        }

        // Readers cannot upgrade in place: trade the read lock for an
        // expensive write lock, then downgrade once the value is complete.
        pair.refs.fetch_add(1, Ordering::SeqCst);
        pair.lock.unlock(LockMode::Read);
        pair.lock.lock(LockMode::WriteExpensive);
        pair.release_ref();

        if pair.is_evicted() {
            pair.lock.unlock(LockMode::WriteExpensive);
            return Ok(None);
        }
        if Self::partial_fetch_required(pair, ops) {
            if let Err(e) = self.partial_fetch_locked(cf, pair, ops) {
                pair.lock.unlock(LockMode::WriteExpensive);
                return Err(e);
            }
        }
        pair.lock.downgrade_to_read();
        Ok(Some(LockMode::Read))
    }

    // === Pin ===

    fn pin(
        self: &Arc<Self>,
        cf: &Arc<CacheFile>,
        block: BlockNum,
        fullhash: u32,
        ops: &Arc<dyn BlockOps<V>>,
        mode: LockMode,
        dependents: &[DependentPair<'_, V>],
    ) -> Result<PinGuard<V>> {
        let key = cf.key(block);
        debug_assert_eq!(fullhash, key.fullhash(), "caller fullhash disagrees for {}", key);

        loop {
            self.check_open()?;
            cf.check_open()?;

            let make = || Pair::new_fetching(key, fullhash, Arc::clone(ops));
            let (pair, held) = match self.directory.lookup_or_insert(&key, fullhash, make) {
                Lookup::Inserted(pair) => {
                    self.fetch_pair(cf, &pair)?;
                    // A fetch leaves the lock expensive; only readers step down.
                    let held = if mode.is_write() {
                        LockMode::WriteExpensive
                    } else {
                        pair.lock.downgrade_to_read();
                        LockMode::Read
                    };
                    (pair, held)
                }
                Lookup::Found(pair) => {
                    pair.lock.lock(mode);
                    pair.release_ref();
                    if pair.is_evicted() {
                        pair.lock.unlock(mode);
                        continue;
                    }
                    match self.finish_hit(cf, &pair, ops, mode)? {
                        Some(held) => (pair, held),
                        None => continue,
                    }
                }
            };

            pair.touch();
            self.checkpoint_dependents(&pair, held, dependents);
            self.maybe_signal_evictor();
            return Ok(PinGuard::new(Arc::clone(self), pair, held));
        }
    }

    fn pin_nonblocking(
        self: &Arc<Self>,
        cf: &Arc<CacheFile>,
        block: BlockNum,
        fullhash: u32,
        ops: &Arc<dyn BlockOps<V>>,
        mode: LockMode,
        unlockers: &mut Unlockers<'_>,
    ) -> Result<PinGuard<V>> {
        let key = cf.key(block);
        debug_assert_eq!(fullhash, key.fullhash(), "caller fullhash disagrees for {}", key);

        loop {
            self.check_open()?;
            cf.check_open()?;

            let make = || Pair::new_fetching(key, fullhash, Arc::clone(ops));
            let pair = match self.directory.lookup_or_insert(&key, fullhash, make) {
                Lookup::Inserted(pair) => {
                    unlockers.run();
                    self.fetch_pair(cf, &pair)?;
                    pair.lock.unlock(LockMode::WriteExpensive);
                    self.maybe_signal_evictor();
                    return Err(self.try_again());
                }
                Lookup::Found(pair) => pair,
            };

            if !pair.lock.try_lock(mode) {
                if pair.lock.is_expensive() {
                    unlockers.run();
                    pair.lock.lock(mode);
                    pair.release_ref();
                    pair.lock.unlock(mode);
                    return Err(self.try_again());
                }
                // Cheap holders finish quickly; wait for them.
                pair.lock.lock(mode);
            }
            pair.release_ref();

            if pair.is_evicted() {
                pair.lock.unlock(mode);
                continue;
            }

            if Self::partial_fetch_required(&pair, ops) {
                unlockers.run();
                if mode.is_write() {
                    pair.lock.upgrade_to_expensive();
                } else {
                    pair.refs.fetch_add(1, Ordering::SeqCst);
                    pair.lock.unlock(LockMode::Read);
                    pair.lock.lock(LockMode::WriteExpensive);
                    pair.release_ref();
                }
                let result = if !pair.is_evicted() && Self::partial_fetch_required(&pair, ops) {
                    self.partial_fetch_locked(cf, &pair, ops)
                } else {
                    Ok(())
                };
                pair.lock.unlock(LockMode::WriteExpensive);
                result?;
                return Err(self.try_again());
            }

            pair.touch();
            self.checkpoint_dependents(&pair, mode, &[]);
            return Ok(PinGuard::new(Arc::clone(self), pair, mode));
        }
    }

    fn maybe_pin(
        self: &Arc<Self>,
        cf: &Arc<CacheFile>,
        block: BlockNum,
        fullhash: u32,
        mode: LockMode,
        clean_only: bool,
    ) -> Option<PinGuard<V>> {
        if self.check_open().is_err() || !cf.is_open() {
            return None;
        }
        let key = cf.key(block);
        let pair = self.directory.lookup(&key, fullhash)?;
        if !pair.lock.try_lock(mode) {
            pair.release_ref();
            return None;
        }
        pair.release_ref();

        let usable = {
            let meta = pair.meta.lock();
            !meta.evicted && !meta.fetching && !(clean_only && meta.dirty)
        };
        if !usable {
            pair.lock.unlock(mode);
            return None;
        }

        pair.touch();
        self.checkpoint_dependents(&pair, mode, &[]);
        Some(PinGuard::new(Arc::clone(self), pair, mode))
    }

    #[allow(clippy::too_many_arguments)]
    fn put(
        self: &Arc<Self>,
        cf: &Arc<CacheFile>,
        block: BlockNum,
        fullhash: u32,
        value: V,
        attr: PairAttr,
        ops: &Arc<dyn BlockOps<V>>,
        dependents: &[DependentPair<'_, V>],
    ) -> Result<PinGuard<V>> {
        self.check_open()?;
        cf.check_open()?;
        let key = cf.key(block);
        debug_assert_eq!(fullhash, key.fullhash(), "caller fullhash disagrees for {}", key);

        let pair = Arc::new(Pair::new_put(key, fullhash, value, attr, Arc::clone(ops)));
        if self.directory.insert(Arc::clone(&pair)).is_err() {
            return Err(Error::AlreadyExists(key));
        }
        self.evictor.add_current(attr.size as i64);
        self.metrics.puts.inc();
        trace!(%key, size = attr.size, "put");

        pair.touch();
        self.checkpoint_dependents(&pair, LockMode::WriteCheap, dependents);
        self.maybe_signal_evictor();
        Ok(PinGuard::new(Arc::clone(self), pair, LockMode::WriteCheap))
    }

    fn prefetch(
        self: &Arc<Self>,
        cf: &Arc<CacheFile>,
        block: BlockNum,
        fullhash: u32,
        ops: &Arc<dyn BlockOps<V>>,
    ) -> Result<bool> {
        self.check_open()?;
        cf.check_open()?;
        let key = cf.key(block);
        debug_assert_eq!(fullhash, key.fullhash(), "caller fullhash disagrees for {}", key);

        let make = || Pair::new_fetching(key, fullhash, Arc::clone(ops));
        match self.directory.lookup_or_insert(&key, fullhash, make) {
            Lookup::Inserted(pair) => {
                self.metrics.prefetches.inc();
                let core = Arc::clone(self);
                let file = Arc::clone(cf);
                self.run_in_background(
                    cf,
                    Box::new(move || {
                        if core.fetch_pair(&file, &pair).is_ok() {
                            pair.lock.unlock(LockMode::WriteExpensive);
                            core.maybe_signal_evictor();
                        }
                    }),
                );
                Ok(true)
            }
            Lookup::Found(pair) => {
                let locked = pair.lock.try_lock(LockMode::WriteExpensive);
                pair.release_ref();
                if !locked {
                    return Ok(false);
                }
                if pair.is_evicted() || !Self::partial_fetch_required(&pair, ops) {
                    pair.lock.unlock(LockMode::WriteExpensive);
                    return Ok(false);
                }

                self.metrics.prefetches.inc();
                let core = Arc::clone(self);
                let file = Arc::clone(cf);
                let ops = Arc::clone(ops);
                self.run_in_background(
                    cf,
                    Box::new(move || {
                        if let Err(e) = core.partial_fetch_locked(&file, &pair, &ops) {
                            warn!(key = %pair.key, error = %e, "prefetch partial fetch failed");
                        }
                        pair.lock.unlock(LockMode::WriteExpensive);
                    }),
                );
                Ok(true)
            }
        }
    }

    /// Mark declared-dirty dependents dirty, then discharge the checkpoint
    /// obligations of the newly pinned pair and of every dependent.
    fn checkpoint_dependents(
        self: &Arc<Self>,
        pair: &Arc<Pair<V>>,
        held: LockMode,
        dependents: &[DependentPair<'_, V>],
    ) {
        if !held.is_write() && dependents.is_empty() {
            return;
        }

        let _pending = self.checkpointer.pending_lock.read();
        for dep in dependents {
            debug_assert!(
                dep.guard.mode().is_write(),
                "dependent {} is not write-pinned",
                dep.guard.key()
            );
            if dep.dirty.is_dirty() {
                dep.guard.pair().meta.lock().mark_dirty();
            }
        }
        if held.is_write() {
            self.checkpoint_locked_pair(pair, true);
        }
        for dep in dependents {
            self.checkpoint_locked_pair(dep.guard.pair(), true);
        }
    }

    // === Unpin ===

    pub(crate) fn unpin_pair(
        &self,
        pair: &Pair<V>,
        mode: LockMode,
        dirty: Dirtiness,
        attr: Option<PairAttr>,
    ) {
        if dirty.is_dirty() {
            pair.meta.lock().mark_dirty();
        }
        if let Some(attr) = attr {
            self.set_attr(pair, attr);
        }
        pair.remove_pin();
        pair.lock.unlock(mode);
        self.maybe_signal_evictor();
    }

    pub(crate) fn unpin_and_remove(self: &Arc<Self>, pair: &Arc<Pair<V>>, mode: LockMode) -> Result<()> {
        if !mode.is_write() {
            self.unpin_pair(pair, mode, Dirtiness::Clean, None);
            return Err(Error::invalid_state(format!(
                "unpin_and_remove of {} requires a write pin",
                pair.key
            )));
        }

        {
            let _pending = self.checkpointer.pending_lock.read();
            self.checkpoint_locked_pair(pair, true);
        }

        self.directory.remove(pair);
        match self.cachefile(pair.key.file_id) {
            Some(cf) => self.free_pair_value(pair, &cf),
            None => {
                pair.value.write().take();
                let size = pair.attr().size;
                self.evictor.add_current(-(size as i64));
            }
        }
        pair.meta.lock().dirty = false;
        pair.remove_pin();
        pair.lock.unlock(mode);
        trace!(key = %pair.key, "removed");
        Ok(())
    }

    /// Drop a removed pair's value through the flush callback and stop
    /// charging for it.
    pub(crate) fn free_pair_value(&self, pair: &Pair<V>, cf: &CacheFile) {
        let attr = pair.attr();
        if let Some(mut value) = pair.value.write().take() {
            let args = FlushArgs {
                key: pair.key,
                fullhash: pair.fullhash,
                attr,
                write_me: false,
                keep_me: false,
                for_checkpoint: false,
                is_clone: false,
            };
            if let Err(e) = pair.ops.flush(cf.file(), &mut value, &args) {
                warn!(key = %pair.key, error = %e, "free callback failed");
            }
        }
        self.evictor.add_current(-(attr.size as i64));
    }

    // === Cachefile teardown ===

    fn flush_cachefile(self: &Arc<Self>, cf: &Arc<CacheFile>) -> Result<usize> {
        self.check_registered(cf)?;
        cf.jobs.wait_for_zero();

        let mut evicted = 0;
        let mut first_error = None;
        for pair in self.directory.pairs_of_file(cf.id()) {
            if !pair.lock.try_lock(LockMode::WriteExpensive) {
                debug!(key = %pair.key, "flush skipped pinned pair");
                continue;
            }
            match self.evict_pair_locked(&pair, cf, false) {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(key = %pair.key, error = %e, "flush write failed");
                    first_error.get_or_insert(e);
                }
            }
            pair.lock.unlock(LockMode::WriteExpensive);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(evicted),
        }
    }

    fn close_cachefile(self: &Arc<Self>, cf: &Arc<CacheFile>) -> Result<()> {
        self.check_registered(cf)?;
        cf.mark_for_close()?;

        // New checkpoints skip files that are not open.
        self.wait_for_checkpoint_idle();
        cf.jobs.wait_for_zero();

        let pinned = self.count_pinned(cf);
        if pinned > 0 {
            cf.reopen();
            return Err(Error::Busy(format!(
                "{} pairs of {} are still pinned",
                pinned,
                cf.path().display()
            )));
        }
        cf.jobs.wait_and_close();

        let mut first_error = None;
        for pair in self.directory.pairs_of_file(cf.id()) {
            pair.lock.lock(LockMode::WriteExpensive);
            if !pair.is_evicted() {
                if let Err(e) = self.evict_pair_locked(&pair, cf, true) {
                    error!(key = %pair.key, error = %e, "write on close failed, dropping block");
                    first_error.get_or_insert(e);
                    if self.directory.remove(&pair) {
                        self.free_pair_value(&pair, cf);
                    }
                }
            }
            pair.lock.unlock(LockMode::WriteExpensive);
        }

        if let Some(hooks) = cf.hooks() {
            if let Err(e) = hooks.close(cf.file()) {
                first_error.get_or_insert(e);
            }
            hooks.free();
        }

        if let Err(e) = cf.file().close() {
            first_error.get_or_insert(e);
        }
        if cf.unlink_on_close() {
            if let Err(e) = std::fs::remove_file(cf.path()) {
                first_error.get_or_insert(e.into());
            }
        }

        self.unregister(cf);
        cf.set_closed();
        debug!(file_id = cf.id().0, path = %cf.path().display(), "cachefile closed");

        match first_error.or_else(|| self.take_background_error()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // === Inspection ===

    fn key_state(&self, cf: &CacheFile, block: BlockNum, fullhash: u32) -> Option<PairState> {
        let pair = self.directory.peek(&cf.key(block), fullhash)?;
        let meta = pair.meta.lock();
        if meta.fetching || meta.evicted {
            return None;
        }
        drop(meta);
        Some(pair.state())
    }

    pub(crate) fn count_pinned(&self, cf: &CacheFile) -> usize {
        self.directory
            .pairs_of_file(cf.id())
            .iter()
            .filter(|p| p.pin_count() > 0)
            .count()
    }

    fn refresh_gauges(&self) {
        self.metrics.size_current.set(self.evictor.size_current());
        self.metrics.size_reserved.set(self.evictor.size_reserved());
        self.metrics.size_cloned.set(self.evictor.size_cloned());
        self.metrics.pairs.set(self.directory.len() as i64);
    }

    fn verify(&self) -> Result<()> {
        self.directory.verify().map_err(Error::Internal)?;

        let resident: i64 = self
            .directory
            .all_pairs()
            .iter()
            .filter_map(|p| {
                let meta = p.meta.lock();
                let size = meta.attr.size as i64;
                let fetching = meta.fetching;
                drop(meta);
                (!fetching).then_some(size)
            })
            .sum();
        let accounted = self.evictor.size_current();
        if resident != accounted {
            return Err(Error::internal(format!(
                "pairs hold {} bytes, accounting says {}",
                resident, accounted
            )));
        }
        Ok(())
    }

    // === Shutdown ===

    fn close(self: &Arc<Self>) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.evictor.cron.shutdown();
        self.cleaner.cron.shutdown();
        self.checkpoint_cron.shutdown();
        self.wait_for_checkpoint_idle();

        let mut first_error = None;
        let files: Vec<_> = self.files.read().by_id.values().cloned().collect();
        for cf in files {
            if let Err(e) = self.close_cachefile(&cf) {
                warn!(path = %cf.path().display(), error = %e, "closing cachefile at shutdown failed");
                first_error.get_or_insert(e);
            }
        }

        self.kibbutz.shutdown();
        debug!("cachetable closed");

        match first_error.or_else(|| self.take_background_error()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A concurrent, disk-backed cache of pinnable blocks.
///
/// `V` is the in-memory form of a block. How it is read, written, cloned and
/// shrunk is decided by the [`BlockOps`] passed with every pin.
pub struct Cachetable<V: Send + Sync + 'static> {
    core: Arc<Core<V>>,
}

impl<V: Send + Sync + 'static> Cachetable<V> {
    /// Create a cachetable and start its background threads.
    pub fn new(options: Options) -> Result<Arc<Self>> {
        let core = Arc::new(Core::new(options)?);
        core.start_background_threads()?;
        debug!(
            size_limit = core.options.size_limit,
            shards = core.options.directory_shards,
            "cachetable created"
        );
        Ok(Arc::new(Self { core }))
    }

    /// The options this cachetable was created with.
    pub fn options(&self) -> &Options {
        &self.core.options
    }

    // === Cachefiles ===

    /// Open a cachefile, creating the file if missing. Opening a path that
    /// is already open returns the existing cachefile.
    pub fn open_cachefile(&self, path: impl AsRef<Path>) -> Result<Arc<CacheFile>> {
        self.core.open_cachefile(path.as_ref(), None)
    }

    /// Open a cachefile with lifecycle hooks.
    pub fn open_cachefile_with_hooks(
        &self,
        path: impl AsRef<Path>,
        hooks: Arc<dyn CacheFileHooks>,
    ) -> Result<Arc<CacheFile>> {
        self.core.open_cachefile(path.as_ref(), Some(hooks))
    }

    /// Close a cachefile: write back or discard every pair, run the close
    /// and free hooks, and release the file.
    ///
    /// Fails with [`Error::Busy`] (leaving the file open) if any of its
    /// pairs is pinned. Waits for an in-flight checkpoint, so calling it
    /// while this thread holds a pin may deadlock.
    pub fn close_cachefile(&self, cf: &Arc<CacheFile>) -> Result<()> {
        self.core.close_cachefile(cf)
    }

    /// Write every dirty pair of the file and evict the unpinned ones.
    /// Returns the number of pairs evicted.
    pub fn flush_cachefile(&self, cf: &Arc<CacheFile>) -> Result<usize> {
        self.core.flush_cachefile(cf)
    }

    // === Pins ===

    /// Pin a block, fetching it on a miss. Blocks until the pin is granted.
    pub fn get_and_pin(
        &self,
        cf: &Arc<CacheFile>,
        block: BlockNum,
        fullhash: u32,
        ops: &Arc<dyn BlockOps<V>>,
        mode: LockMode,
    ) -> Result<PinGuard<V>> {
        self.core.pin(cf, block, fullhash, ops, mode, &[])
    }

    /// Pin a block while holding write pins on `dependents`.
    ///
    /// If a checkpoint is pending on the block or any dependent, they are
    /// cloned or written before this returns, so their checkpoint images
    /// stay consistent with each other.
    pub fn get_and_pin_with_dependents(
        &self,
        cf: &Arc<CacheFile>,
        block: BlockNum,
        fullhash: u32,
        ops: &Arc<dyn BlockOps<V>>,
        mode: LockMode,
        dependents: &[DependentPair<'_, V>],
    ) -> Result<PinGuard<V>> {
        self.core.pin(cf, block, fullhash, ops, mode, dependents)
    }

    /// Pin a block without waiting on I/O.
    ///
    /// Returns [`Error::TryAgain`] after running `unlockers` when the pin
    /// would need a fetch, a partial fetch, or has to wait for an expensive
    /// holder. The needed work is done (or waited for) before returning, so
    /// a retry is likely to succeed.
    pub fn get_and_pin_nonblocking(
        &self,
        cf: &Arc<CacheFile>,
        block: BlockNum,
        fullhash: u32,
        ops: &Arc<dyn BlockOps<V>>,
        mode: LockMode,
        unlockers: &mut Unlockers<'_>,
    ) -> Result<PinGuard<V>> {
        self.core
            .pin_nonblocking(cf, block, fullhash, ops, mode, unlockers)
    }

    /// Pin a block only if it is resident and its lock is free.
    pub fn maybe_get_and_pin(
        &self,
        cf: &Arc<CacheFile>,
        block: BlockNum,
        fullhash: u32,
        mode: LockMode,
    ) -> Option<PinGuard<V>> {
        self.core.maybe_pin(cf, block, fullhash, mode, false)
    }

    /// Like [`maybe_get_and_pin`](Self::maybe_get_and_pin), but only if the
    /// block is also clean.
    pub fn maybe_get_and_pin_clean(
        &self,
        cf: &Arc<CacheFile>,
        block: BlockNum,
        fullhash: u32,
        mode: LockMode,
    ) -> Option<PinGuard<V>> {
        self.core.maybe_pin(cf, block, fullhash, mode, true)
    }

    /// Insert a new dirty block, returned pinned `WriteCheap`.
    ///
    /// Fails with [`Error::AlreadyExists`] if the block is resident.
    pub fn put(
        &self,
        cf: &Arc<CacheFile>,
        block: BlockNum,
        fullhash: u32,
        value: V,
        attr: PairAttr,
        ops: &Arc<dyn BlockOps<V>>,
    ) -> Result<PinGuard<V>> {
        self.core
            .put(cf, block, fullhash, value, attr, ops, &[])
    }

    /// [`put`](Self::put) with dependent pairs; see
    /// [`get_and_pin_with_dependents`](Self::get_and_pin_with_dependents).
    #[allow(clippy::too_many_arguments)]
    pub fn put_with_dependents(
        &self,
        cf: &Arc<CacheFile>,
        block: BlockNum,
        fullhash: u32,
        value: V,
        attr: PairAttr,
        ops: &Arc<dyn BlockOps<V>>,
        dependents: &[DependentPair<'_, V>],
    ) -> Result<PinGuard<V>> {
        self.core
            .put(cf, block, fullhash, value, attr, ops, dependents)
    }

    /// Start fetching a block (or the missing part of it) in the
    /// background. Returns whether any work was scheduled.
    pub fn prefetch(
        &self,
        cf: &Arc<CacheFile>,
        block: BlockNum,
        fullhash: u32,
        ops: &Arc<dyn BlockOps<V>>,
    ) -> Result<bool> {
        self.core.prefetch(cf, block, fullhash, ops)
    }

    /// Release a pin detached with [`PinGuard::release`].
    pub fn unpin(&self, handle: PairHandle<V>, dirty: Dirtiness, attr: Option<PairAttr>) {
        self.core.unpin_pair(&handle.pair, handle.mode, dirty, attr);
    }

    // === Checkpoints ===

    /// Start a checkpoint: mark every dirty pair of every open cachefile
    /// checkpoint-pending. Waits for a running checkpoint to finish first.
    /// Returns the checkpoint id.
    pub fn begin_checkpoint(&self) -> Result<u64> {
        self.core.begin_checkpoint()
    }

    /// Write every still-pending pair and finish the checkpoint.
    pub fn end_checkpoint(&self) -> Result<CheckpointStats> {
        self.core.end_checkpoint()
    }

    /// Run a full checkpoint. Also reports a background write error
    /// recorded since the last checkpoint.
    ///
    /// Must not be called while holding a pin: the checkpoint waits for
    /// that pin's lock.
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        self.core.checkpoint()
    }

    // === Background work ===

    /// Run one eviction pass on the calling thread. Returns the number of
    /// pairs fully or partially evicted.
    pub fn run_eviction(&self) -> usize {
        self.core.run_eviction()
    }

    /// Wake the evictor thread.
    pub fn signal_evictor(&self) {
        self.core.evictor.cron.signal();
    }

    /// Run one cleaner pass on the calling thread. Returns the number of
    /// pairs written.
    pub fn run_cleaner(&self) -> usize {
        self.core.run_cleaner()
    }

    /// Change the evictor period (`None`: run only when signalled).
    pub fn set_evictor_period(&self, period: Option<Duration>) {
        self.core.evictor.cron.set_period(period);
    }

    /// Change the cleaner period (`None` disables it).
    pub fn set_cleaner_period(&self, period: Option<Duration>) {
        self.core.cleaner.cron.set_period(period);
    }

    /// Change how many pairs the cleaner writes per pass.
    pub fn set_cleaner_iterations(&self, iterations: usize) {
        self.core.cleaner.set_iterations(iterations);
    }

    /// Change the automatic checkpoint period (`None` disables it).
    pub fn set_checkpoint_period(&self, period: Option<Duration>) {
        self.core.checkpoint_cron.set_period(period);
    }

    /// Reserve `fraction` of the unreserved budget, at most `upper_bound`
    /// bytes. Returns the amount reserved.
    pub fn reserve_memory(&self, fraction: f64, upper_bound: usize) -> usize {
        let reserved = self.core.evictor.reserve(fraction, upper_bound);
        self.core.maybe_signal_evictor();
        reserved
    }

    /// Return memory obtained from [`reserve_memory`](Self::reserve_memory).
    pub fn release_reserved_memory(&self, bytes: usize) {
        self.core.evictor.release_reserved(bytes);
    }

    // === Inspection ===

    /// State of a resident block.
    pub fn key_state(&self, cf: &CacheFile, block: BlockNum, fullhash: u32) -> Option<PairState> {
        self.core.key_state(cf, block, fullhash)
    }

    /// Number of pinned pairs of `cf`.
    pub fn count_pinned(&self, cf: &CacheFile) -> usize {
        self.core.count_pinned(cf)
    }

    /// Bytes currently charged by resident pairs.
    pub fn size_current(&self) -> usize {
        self.core.evictor.size_current().max(0) as usize
    }

    /// Number of resident pairs.
    pub fn len(&self) -> usize {
        self.core.directory.len()
    }

    /// Whether no pair is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot.
    pub fn status(&self) -> CachetableStatus {
        self.core.refresh_gauges();
        self.core.metrics.status(self.core.options.size_limit)
    }

    /// Live metrics.
    pub fn metrics(&self) -> &CachetableMetrics {
        &self.core.metrics
    }

    /// Prometheus text exposition of the metrics.
    pub fn to_prometheus(&self) -> String {
        self.core.refresh_gauges();
        self.core.metrics.to_prometheus()
    }

    /// Check internal consistency. Meant for quiescent cachetables.
    pub fn verify(&self) -> Result<()> {
        self.core.verify()
    }

    /// First background write error since the last checkpoint, if any.
    pub fn background_error(&self) -> Option<Error> {
        self.core.bg_error.lock().clone()
    }

    /// Stop background threads, close every open cachefile and shut the
    /// worker pool down. Idempotent; also run on drop. Like
    /// [`Cachetable::checkpoint`], must not be called while holding a pin.
    pub fn close(&self) -> Result<()> {
        self.core.close()
    }
}

impl<V: Send + Sync + 'static> Drop for Cachetable<V> {
    fn drop(&mut self) {
        if let Err(e) = self.core.close() {
            warn!(error = %e, "cachetable close on drop failed");
        }
    }
}

impl<V: Send + Sync + 'static> std::fmt::Debug for Cachetable<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cachetable")
            .field("pairs", &self.core.directory.len())
            .field("size_current", &self.core.evictor.size_current())
            .field("size_limit", &self.core.options.size_limit)
            .finish()
    }
}

/// Files a checkpoint covers.
pub(crate) fn file_ids(files: &[Arc<CacheFile>]) -> HashSet<FileId> {
    files.iter().map(|cf| cf.id()).collect()
}
