//! Cache entries ("pairs").
//!
//! A pair binds a [`BlockKey`] to its in-memory value and the bookkeeping
//! the cache needs: memory attribution, dirtiness, checkpoint state and the
//! clock recency count. Pairs are shared as `Arc<Pair<V>>` between the
//! directory, the clock ring, pin guards and background jobs; they never
//! point back at their cachefile or cachetable.
//!
//! Locks inside a pair are taken in this order:
//! `lock` (pair lock) -> `value` -> `meta`.

mod guard;
mod lock;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::ops::BlockOps;
use crate::types::{BlockKey, LockMode, PairAttr};

pub use guard::{DependentPair, PairHandle, PinGuard, Unlockers};
pub(crate) use lock::PairLock;

/// Clock counts saturate here.
pub(crate) const CLOCK_SATURATION: u8 = 15;

/// Mutable bookkeeping of a pair.
#[derive(Debug, Default)]
pub(crate) struct PairMeta {
    pub(crate) attr: PairAttr,
    pub(crate) dirty: bool,
    pub(crate) checkpoint_pending: bool,
    /// A checkpoint clone of this pair has been taken and not yet written.
    pub(crate) clone_pending: bool,
    /// Dirtied again while its clone was being written; the clone write
    /// then leaves `dirty` set.
    pub(crate) dirtied_since_clone: bool,
    pub(crate) clock_count: u8,
    /// Inserted as a placeholder; the value is still being fetched.
    pub(crate) fetching: bool,
    /// Removed from the directory. Anyone who still holds the Arc must
    /// look the key up again.
    pub(crate) evicted: bool,
}

impl PairMeta {
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
        if self.clone_pending {
            self.dirtied_since_clone = true;
        }
    }
}

/// A cache entry.
pub(crate) struct Pair<V> {
    pub(crate) key: BlockKey,
    pub(crate) fullhash: u32,
    pub(crate) ops: Arc<dyn BlockOps<V>>,
    pub(crate) lock: PairLock,
    pub(crate) value: RwLock<Option<V>>,
    pub(crate) meta: Mutex<PairMeta>,
    /// Lookups that have found the pair but not yet queued on its lock.
    pub(crate) refs: AtomicUsize,
    /// Client pins currently held.
    pub(crate) pins: AtomicUsize,
}

impl<V> std::fmt::Debug for Pair<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pair")
            .field("key", &self.key)
            .field("fullhash", &self.fullhash)
            .finish_non_exhaustive()
    }
}

impl<V> Pair<V> {
    /// A placeholder for a block being fetched. The creator holds the lock
    /// `WriteExpensive`.
    pub(crate) fn new_fetching(key: BlockKey, fullhash: u32, ops: Arc<dyn BlockOps<V>>) -> Self {
        Self {
            key,
            fullhash,
            ops,
            lock: PairLock::new_locked(LockMode::WriteExpensive),
            value: RwLock::new(None),
            meta: Mutex::new(PairMeta {
                fetching: true,
                ..PairMeta::default()
            }),
            refs: AtomicUsize::new(0),
            pins: AtomicUsize::new(0),
        }
    }

    /// A pair created by a put: dirty, already valued, held `WriteCheap`.
    pub(crate) fn new_put(
        key: BlockKey,
        fullhash: u32,
        value: V,
        attr: PairAttr,
        ops: Arc<dyn BlockOps<V>>,
    ) -> Self {
        Self {
            key,
            fullhash,
            ops,
            lock: PairLock::new_locked(LockMode::WriteCheap),
            value: RwLock::new(Some(value)),
            meta: Mutex::new(PairMeta {
                attr,
                dirty: true,
                ..PairMeta::default()
            }),
            refs: AtomicUsize::new(0),
            pins: AtomicUsize::new(0),
        }
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.meta.lock().evicted
    }

    pub(crate) fn attr(&self) -> PairAttr {
        self.meta.lock().attr
    }

    /// Bump the recency count.
    pub(crate) fn touch(&self) {
        let mut meta = self.meta.lock();
        if meta.clock_count < CLOCK_SATURATION {
            meta.clock_count += 1;
        }
    }

    pub(crate) fn add_pin(&self) {
        self.pins.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn remove_pin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "pin count of {} went negative", self.key);
    }

    pub(crate) fn pin_count(&self) -> usize {
        self.pins.load(Ordering::SeqCst)
    }

    /// Drop the lookup reference taken by the directory.
    pub(crate) fn release_ref(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "lookup refs of {} went negative", self.key);
    }

    /// Whether nothing but `holders` lock holders can reach the pair.
    pub(crate) fn is_unused(&self, holders: usize) -> bool {
        self.refs.load(Ordering::SeqCst) == 0 && self.lock.users() == holders
    }

    /// Whether the evictor or cleaner may write this pair now.
    pub(crate) fn is_writable_in_background(meta: &PairMeta) -> bool {
        !meta.fetching && !meta.evicted && !meta.checkpoint_pending && !meta.clone_pending
    }
}

/// Borrow a pinned pair's value. A pinned pair always has one.
pub(crate) fn present<V>(slot: &Option<V>) -> &V {
    match slot {
        Some(value) => value,
        None => unreachable!("pinned pair without a value"),
    }
}

pub(crate) fn present_mut<V>(slot: &mut Option<V>) -> &mut V {
    match slot {
        Some(value) => value,
        None => unreachable!("pinned pair without a value"),
    }
}

/// Externally visible state of a resident pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairState {
    /// Memory attribution.
    pub attr: PairAttr,
    /// Modified since last written.
    pub dirty: bool,
    /// Number of client pins.
    pub pin_count: usize,
    /// Marked for the in-progress checkpoint.
    pub checkpoint_pending: bool,
    /// Clock recency count.
    pub clock_count: u8,
}

impl<V> Pair<V> {
    pub(crate) fn state(&self) -> PairState {
        let meta = self.meta.lock();
        PairState {
            attr: meta.attr,
            dirty: meta.dirty,
            pin_count: self.pin_count(),
            checkpoint_pending: meta.checkpoint_pending,
            clock_count: meta.clock_count,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::cachefile::BlockFile;
    use crate::ops::{FlushArgs, Fetched};
    use crate::types::{BlockNum, FileId};
    use crate::Result;

    /// Ops for `u64` values that never touch disk.
    pub(crate) struct MemOps;

    impl BlockOps<u64> for MemOps {
        fn fetch(&self, _file: &BlockFile, key: BlockKey, _fullhash: u32) -> Result<Fetched<u64>> {
            Ok(Fetched::clean(key.block_num.0, PairAttr::new(8)))
        }

        fn flush(&self, _file: &BlockFile, _value: &mut u64, _args: &FlushArgs) -> Result<()> {
            Ok(())
        }
    }

    pub(crate) fn mem_ops() -> Arc<dyn BlockOps<u64>> {
        Arc::new(MemOps)
    }

    pub(crate) fn key(n: u64) -> BlockKey {
        BlockKey::new(FileId(1), BlockNum(n))
    }

    pub(crate) fn put_pair(n: u64) -> Arc<Pair<u64>> {
        let key = key(n);
        Arc::new(Pair::new_put(key, key.fullhash(), n, PairAttr::new(8), mem_ops()))
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;

    #[test]
    fn test_fetching_pair_starts_locked() {
        let k = key(1);
        let pair: Pair<u64> = Pair::new_fetching(k, k.fullhash(), mem_ops());
        assert!(pair.lock.is_expensive());
        assert!(pair.meta.lock().fetching);
        assert!(pair.value.read().is_none());
        assert!(pair.is_unused(1));
    }

    #[test]
    fn test_put_pair_is_dirty_and_cheap() {
        let pair = put_pair(2);
        assert!(pair.lock.is_write_cheap());
        let state = pair.state();
        assert!(state.dirty);
        assert_eq!(state.attr.size, 8);
        assert_eq!(*present(&pair.value.read()), 2);
    }

    #[test]
    fn test_touch_saturates() {
        let pair = put_pair(3);
        for _ in 0..100 {
            pair.touch();
        }
        assert_eq!(pair.state().clock_count, CLOCK_SATURATION);
    }

    #[test]
    fn test_refs_block_unused() {
        let pair = put_pair(4);
        pair.lock.unlock(LockMode::WriteCheap);
        assert!(pair.is_unused(0));
        pair.refs.fetch_add(1, Ordering::SeqCst);
        assert!(!pair.is_unused(0));
        pair.release_ref();
        assert!(pair.is_unused(0));
    }

    #[test]
    fn test_background_writability() {
        let mut meta = PairMeta::default();
        assert!(Pair::<u64>::is_writable_in_background(&meta));
        meta.checkpoint_pending = true;
        assert!(!Pair::<u64>::is_writable_in_background(&meta));
        meta.checkpoint_pending = false;
        meta.clone_pending = true;
        assert!(!Pair::<u64>::is_writable_in_background(&meta));
    }

    #[test]
    fn test_mark_dirty_during_clone_write() {
        let mut meta = PairMeta::default();
        meta.mark_dirty();
        assert!(meta.dirty);
        assert!(!meta.dirtied_since_clone);

        meta.clone_pending = true;
        meta.mark_dirty();
        assert!(meta.dirtied_since_clone);
    }
}
