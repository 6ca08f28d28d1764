//! Checkpoints.
//!
//! A checkpoint writes a consistent image of every block that was dirty when
//! it began:
//!
//! 1. `begin_checkpoint` marks each dirty pair of each open cachefile
//!    checkpoint-pending. Marking happens under the exclusive side of the
//!    pending lock, so no writer can slip a modification in between.
//! 2. Any write pin of a pending pair first discharges the obligation: the
//!    value is cloned (written later on the kibbutz) or written in place,
//!    while the pin's holder waits.
//! 3. `end_checkpoint` writes whatever is still pending and waits for the
//!    clone writes.
//!
//! Only one checkpoint runs at a time. A second `begin_checkpoint` waits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cachefile::{BackgroundJobs, CacheFile};
use crate::cachetable::{file_ids, Core};
use crate::ops::{Cloned, FlushArgs};
use crate::pair::{present_mut, Pair};
use crate::types::LockMode;
use crate::{Error, Result};

/// Outcome of a completed checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Checkpoint id, increasing from 1.
    pub id: u64,
    /// Pairs marked pending at begin.
    pub pairs_pending: usize,
    /// Pending pairs cloned by writers (or at begin).
    pub pairs_cloned: u64,
    /// Pairs and clones written for the checkpoint.
    pub pairs_written: u64,
    /// Time from begin to end.
    pub duration: Duration,
}

struct ActiveCheckpoint {
    id: u64,
    started: Instant,
    files: Vec<Arc<CacheFile>>,
    pairs_pending: usize,
}

enum Phase {
    Idle,
    InProgress(ActiveCheckpoint),
}

/// Checkpoint coordination state.
pub(crate) struct Checkpointer {
    phase: Mutex<Phase>,
    idle: Condvar,
    /// Writers discharging pending obligations hold this shared; begin
    /// holds it exclusively while marking.
    pub(crate) pending_lock: RwLock<()>,
    clone_jobs: BackgroundJobs,
    next_id: AtomicU64,
    first_error: Mutex<Option<Error>>,
    cloned: AtomicU64,
    written: AtomicU64,
}

impl Checkpointer {
    pub(crate) fn new() -> Self {
        Self {
            phase: Mutex::new(Phase::Idle),
            idle: Condvar::new(),
            pending_lock: RwLock::new(()),
            clone_jobs: BackgroundJobs::new(),
            next_id: AtomicU64::new(0),
            first_error: Mutex::new(None),
            cloned: AtomicU64::new(0),
            written: AtomicU64::new(0),
        }
    }

    fn record_error(&self, err: Error) {
        let mut slot = self.first_error.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn finish(&self) {
        *self.phase.lock() = Phase::Idle;
        self.idle.notify_all();
    }
}

impl<V: Send + Sync + 'static> Core<V> {
    pub(crate) fn start_checkpoint_thread(self: &Arc<Self>) -> Result<()> {
        let core = Arc::clone(self);
        self.checkpoint_cron.start(move || {
            while core.checkpoint_cron.wait_for_next_tick() {
                if let Err(e) = core.checkpoint() {
                    warn!(error = %e, "periodic checkpoint failed");
                }
            }
        })
    }

    pub(crate) fn wait_for_checkpoint_idle(&self) {
        let mut phase = self.checkpointer.phase.lock();
        while matches!(*phase, Phase::InProgress(_)) {
            self.checkpointer.idle.wait(&mut phase);
        }
    }

    pub(crate) fn begin_checkpoint(self: &Arc<Self>) -> Result<u64> {
        self.check_open()?;

        let (id, files) = {
            let mut phase = self.checkpointer.phase.lock();
            while matches!(*phase, Phase::InProgress(_)) {
                self.checkpointer.idle.wait(&mut phase);
            }
            let id = self.checkpointer.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let files = self.open_cachefiles();
            *phase = Phase::InProgress(ActiveCheckpoint {
                id,
                started: Instant::now(),
                files: files.clone(),
                pairs_pending: 0,
            });
            (id, files)
        };
        self.checkpointer.first_error.lock().take();
        self.checkpointer.cloned.store(0, Ordering::SeqCst);
        self.checkpointer.written.store(0, Ordering::SeqCst);

        let pending = {
            let _marking = self.checkpointer.pending_lock.write();

            for cf in &files {
                if let Some(hooks) = cf.hooks() {
                    if let Err(e) = hooks.begin_checkpoint(cf.id(), id) {
                        warn!(checkpoint = id, file_id = cf.id().0, error = %e, "begin hook failed");
                        self.metrics.checkpoints_failed.inc();
                        self.checkpointer.finish();
                        return Err(e);
                    }
                }
            }

            let ids = file_ids(&files);
            let mut pending = Vec::new();
            for pair in self.directory.all_pairs() {
                if !ids.contains(&pair.key.file_id) {
                    continue;
                }
                let mut meta = pair.meta.lock();
                if meta.dirty && !meta.fetching && !meta.evicted {
                    meta.checkpoint_pending = true;
                    drop(meta);
                    pending.push(pair);
                }
            }
            pending
        };

        // Pairs held cheap right now would otherwise make end_checkpoint
        // wait behind their holders; clone them up front.
        for pair in &pending {
            if pair.lock.is_write_cheap() {
                let _pending = self.checkpointer.pending_lock.read();
                self.checkpoint_locked_pair(pair, false);
            }
        }

        if let Phase::InProgress(active) = &mut *self.checkpointer.phase.lock() {
            active.pairs_pending = pending.len();
        }
        debug!(checkpoint = id, files = files.len(), pending = pending.len(), "checkpoint begun");
        Ok(id)
    }

    pub(crate) fn end_checkpoint(self: &Arc<Self>) -> Result<CheckpointStats> {
        let (id, started, files, pairs_pending) = match &*self.checkpointer.phase.lock() {
            Phase::InProgress(active) => (
                active.id,
                active.started,
                active.files.clone(),
                active.pairs_pending,
            ),
            Phase::Idle => {
                return Err(Error::invalid_state(
                    "end_checkpoint called without begin_checkpoint",
                ))
            }
        };

        let pending: Vec<_> = self
            .directory
            .all_pairs()
            .into_iter()
            .filter(|p| p.meta.lock().checkpoint_pending)
            .collect();
        for pair in &pending {
            pair.lock.lock(LockMode::WriteExpensive);
            if pair.is_evicted() {
                pair.meta.lock().checkpoint_pending = false;
            } else {
                let _pending = self.checkpointer.pending_lock.read();
                self.checkpoint_locked_pair(pair, true);
            }
            pair.lock.unlock(LockMode::WriteExpensive);
        }
        self.checkpointer.clone_jobs.wait_for_zero();

        let mut result = match self.checkpointer.first_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        if result.is_ok() {
            for cf in &files {
                if let Some(hooks) = cf.hooks() {
                    if let Err(e) = hooks.checkpoint_complete(cf.id(), id) {
                        result = Err(e);
                        break;
                    }
                }
            }
        }

        let duration = started.elapsed();
        self.metrics.checkpoint_time.observe(duration.as_micros() as u64);
        self.checkpointer.finish();

        match result {
            Ok(()) => {
                self.metrics.checkpoints_taken.inc();
                let stats = CheckpointStats {
                    id,
                    pairs_pending,
                    pairs_cloned: self.checkpointer.cloned.load(Ordering::SeqCst),
                    pairs_written: self.checkpointer.written.load(Ordering::SeqCst),
                    duration,
                };
                info!(
                    checkpoint = id,
                    pending = stats.pairs_pending,
                    cloned = stats.pairs_cloned,
                    written = stats.pairs_written,
                    "checkpoint complete"
                );
                Ok(stats)
            }
            Err(e) => {
                warn!(checkpoint = id, error = %e, "checkpoint failed");
                self.metrics.checkpoints_failed.inc();
                Err(e)
            }
        }
    }

    /// Begin and end a checkpoint. A background write error recorded
    /// before it is reported once the checkpoint itself succeeds.
    pub(crate) fn checkpoint(self: &Arc<Self>) -> Result<CheckpointStats> {
        self.begin_checkpoint()?;
        let stats = self.end_checkpoint()?;
        match self.take_background_error() {
            Some(e) => Err(e),
            None => Ok(stats),
        }
    }

    /// Discharge the checkpoint obligation of a pair the caller holds
    /// exclusively (or, at begin, one held cheap by someone else). The
    /// caller holds the pending lock shared.
    ///
    /// Clones if the block supports it; otherwise writes in place when
    /// `allow_write_in_place`. Failures are recorded against the running
    /// checkpoint and leave the pair dirty.
    pub(crate) fn checkpoint_locked_pair(self: &Arc<Self>, pair: &Arc<Pair<V>>, allow_write_in_place: bool) {
        if !pair.meta.lock().checkpoint_pending {
            return;
        }

        let mut value = pair.value.write();
        let mut meta = pair.meta.lock();
        if !meta.checkpoint_pending {
            return;
        }
        if !meta.dirty || meta.evicted {
            meta.checkpoint_pending = false;
            return;
        }

        if let Some(cloned) = pair.ops.clone_value(present_mut(&mut value)) {
            meta.checkpoint_pending = false;
            meta.clone_pending = true;
            meta.dirtied_since_clone = false;
            drop(meta);
            pair.ops.checkpoint_complete(present_mut(&mut value));
            drop(value);

            self.evictor.add_cloned(cloned.attr.size as i64);
            self.metrics.clones.inc();
            self.checkpointer.cloned.fetch_add(1, Ordering::SeqCst);
            self.schedule_clone_write(pair, cloned);
            return;
        }

        if !allow_write_in_place {
            return;
        }

        let args = FlushArgs {
            key: pair.key,
            fullhash: pair.fullhash,
            attr: meta.attr,
            write_me: true,
            keep_me: true,
            for_checkpoint: true,
            is_clone: false,
        };
        drop(meta);

        let Some(cf) = self.cachefile(pair.key.file_id) else {
            self.checkpointer
                .record_error(Error::internal(format!("no cachefile for pending pair {}", pair.key)));
            return;
        };
        match pair.ops.flush(cf.file(), present_mut(&mut value), &args) {
            Ok(()) => {
                pair.ops.checkpoint_complete(present_mut(&mut value));
                let mut meta = pair.meta.lock();
                meta.dirty = false;
                meta.checkpoint_pending = false;
                drop(meta);
                self.metrics.checkpoint_writes.inc();
                self.checkpointer.written.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                warn!(key = %pair.key, error = %e, "checkpoint write failed");
                pair.meta.lock().checkpoint_pending = false;
                self.checkpointer.record_error(e);
            }
        }
    }

    fn schedule_clone_write(self: &Arc<Self>, pair: &Arc<Pair<V>>, cloned: Cloned<V>) {
        let Some(cf) = self.cachefile(pair.key.file_id) else {
            self.finish_clone_write(pair, cloned.attr.size, Err(Error::internal(format!(
                "no cachefile for cloned pair {}",
                pair.key
            ))));
            return;
        };

        if self.checkpointer.clone_jobs.add().is_err() {
            self.write_clone(&cf, pair, cloned);
            return;
        }
        let core = Arc::clone(self);
        let job_cf = Arc::clone(&cf);
        let job_pair = Arc::clone(pair);
        self.run_in_background(
            &cf,
            Box::new(move || {
                core.write_clone(&job_cf, &job_pair, cloned);
                core.checkpointer.clone_jobs.remove();
            }),
        );
    }

    fn write_clone(&self, cf: &CacheFile, pair: &Pair<V>, mut cloned: Cloned<V>) {
        let args = FlushArgs {
            key: pair.key,
            fullhash: pair.fullhash,
            attr: cloned.attr,
            write_me: true,
            keep_me: false,
            for_checkpoint: true,
            is_clone: true,
        };
        let result = pair.ops.flush(cf.file(), &mut cloned.value, &args);
        self.finish_clone_write(pair, cloned.attr.size, result);
    }

    fn finish_clone_write(&self, pair: &Pair<V>, size: usize, result: Result<()>) {
        {
            let mut meta = pair.meta.lock();
            // Clean only once the image is on disk and nothing newer exists.
            if result.is_ok() && !meta.dirtied_since_clone {
                meta.dirty = false;
            }
            meta.clone_pending = false;
            meta.dirtied_since_clone = false;
        }
        self.evictor.add_cloned(-(size as i64));

        match result {
            Ok(()) => {
                self.metrics.checkpoint_writes.inc();
                self.checkpointer.written.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                warn!(key = %pair.key, error = %e, "clone write failed");
                self.checkpointer.record_error(e);
            }
        }
    }
}
