//! Pair directory: a sharded, resizable hash table keyed by [`BlockKey`].
//!
//! The low bits of a pair's fullhash pick its shard; the remaining bits pick
//! a bucket within the shard. A shard doubles its bucket vector whenever its
//! load factor exceeds one. Resizing happens under the shard lock, so a
//! concurrent insert or remove is never lost.
//!
//! Every resident pair is also linked into one [`ClockRing`]. Lock order is
//! shard lock, then clock lock.

mod clock;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::pair::Pair;
use crate::types::{BlockKey, FileId};

pub(crate) use clock::ClockRing;

/// Outcome of [`Directory::lookup_or_insert`].
pub(crate) enum Lookup<V> {
    /// The key was resident; a lookup reference was taken.
    Found(Arc<Pair<V>>),
    /// The key was missing and the new pair was inserted.
    Inserted(Arc<Pair<V>>),
}

struct Shard<V> {
    buckets: Vec<Vec<Arc<Pair<V>>>>,
    len: usize,
}

impl<V> Shard<V> {
    fn new(buckets: usize) -> Self {
        Self {
            buckets: (0..buckets).map(|_| Vec::new()).collect(),
            len: 0,
        }
    }

    fn bucket_index(&self, fullhash: u32, shard_bits: u32) -> usize {
        ((fullhash >> shard_bits) as usize) & (self.buckets.len() - 1)
    }

    fn find(&self, key: &BlockKey, fullhash: u32, shard_bits: u32) -> Option<&Arc<Pair<V>>> {
        let idx = self.bucket_index(fullhash, shard_bits);
        self.buckets[idx].iter().find(|p| p.key == *key)
    }

    fn insert(&mut self, pair: Arc<Pair<V>>, shard_bits: u32) {
        let idx = self.bucket_index(pair.fullhash, shard_bits);
        self.buckets[idx].push(pair);
        self.len += 1;
        if self.len > self.buckets.len() {
            self.grow(shard_bits);
        }
    }

    fn remove(&mut self, key: &BlockKey, fullhash: u32, shard_bits: u32) -> Option<Arc<Pair<V>>> {
        let idx = self.bucket_index(fullhash, shard_bits);
        let bucket = &mut self.buckets[idx];
        let pos = bucket.iter().position(|p| p.key == *key)?;
        self.len -= 1;
        Some(bucket.swap_remove(pos))
    }

    fn grow(&mut self, shard_bits: u32) {
        let new_size = self.buckets.len() * 2;
        let old = std::mem::replace(
            &mut self.buckets,
            (0..new_size).map(|_| Vec::new()).collect(),
        );
        for pair in old.into_iter().flatten() {
            let idx = self.bucket_index(pair.fullhash, shard_bits);
            self.buckets[idx].push(pair);
        }
        trace!(buckets = new_size, "directory shard resized");
    }
}

/// The hash directory plus the clock ring.
pub(crate) struct Directory<V> {
    shards: Vec<Mutex<Shard<V>>>,
    shard_bits: u32,
    clock: Mutex<ClockRing<V>>,
    len: AtomicUsize,
}

impl<V> Directory<V> {
    /// `shards` and `initial_buckets` must be powers of two.
    pub(crate) fn new(shards: usize, initial_buckets: usize) -> Self {
        debug_assert!(shards.is_power_of_two());
        debug_assert!(initial_buckets.is_power_of_two());
        Self {
            shards: (0..shards)
                .map(|_| Mutex::new(Shard::new(initial_buckets)))
                .collect(),
            shard_bits: shards.trailing_zeros(),
            clock: Mutex::new(ClockRing::new()),
            len: AtomicUsize::new(0),
        }
    }

    fn shard(&self, fullhash: u32) -> &Mutex<Shard<V>> {
        &self.shards[(fullhash as usize) & (self.shards.len() - 1)]
    }

    /// Number of resident pairs.
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    /// Find a pair and take a lookup reference on it. The caller must
    /// [`Pair::release_ref`] once it is queued on the pair lock (or gives up).
    pub(crate) fn lookup(&self, key: &BlockKey, fullhash: u32) -> Option<Arc<Pair<V>>> {
        let shard = self.shard(fullhash).lock();
        let pair = shard.find(key, fullhash, self.shard_bits)?;
        pair.refs.fetch_add(1, Ordering::SeqCst);
        Some(Arc::clone(pair))
    }

    /// Find a pair without taking a reference. For inspection only.
    pub(crate) fn peek(&self, key: &BlockKey, fullhash: u32) -> Option<Arc<Pair<V>>> {
        let shard = self.shard(fullhash).lock();
        shard.find(key, fullhash, self.shard_bits).cloned()
    }

    /// Find `key`, or insert the pair `make` builds. Only one of several
    /// racing callers inserts.
    pub(crate) fn lookup_or_insert(
        &self,
        key: &BlockKey,
        fullhash: u32,
        make: impl FnOnce() -> Pair<V>,
    ) -> Lookup<V> {
        let mut shard = self.shard(fullhash).lock();
        if let Some(pair) = shard.find(key, fullhash, self.shard_bits) {
            pair.refs.fetch_add(1, Ordering::SeqCst);
            return Lookup::Found(Arc::clone(pair));
        }

        let pair = Arc::new(make());
        self.link(&mut shard, Arc::clone(&pair));
        Lookup::Inserted(pair)
    }

    /// Insert a new pair. Hands it back if the key is already resident.
    pub(crate) fn insert(&self, pair: Arc<Pair<V>>) -> Result<(), Arc<Pair<V>>> {
        let mut shard = self.shard(pair.fullhash).lock();
        if shard.find(&pair.key, pair.fullhash, self.shard_bits).is_some() {
            return Err(pair);
        }
        self.link(&mut shard, pair);
        Ok(())
    }

    fn link(&self, shard: &mut Shard<V>, pair: Arc<Pair<V>>) {
        self.clock.lock().insert(Arc::clone(&pair));
        shard.insert(pair, self.shard_bits);
        self.len.fetch_add(1, Ordering::SeqCst);
    }

    /// Remove `pair` if nothing but `holders` lock holders can reach it.
    /// Marks it evicted on success.
    pub(crate) fn remove_if_unused(&self, pair: &Arc<Pair<V>>, holders: usize) -> bool {
        let mut shard = self.shard(pair.fullhash).lock();
        if !pair.is_unused(holders) {
            return false;
        }
        self.unlink(&mut shard, pair)
    }

    /// Remove `pair` regardless of waiters. Marks it evicted; waiters see
    /// the mark once they get the lock and retry their lookup.
    pub(crate) fn remove(&self, pair: &Arc<Pair<V>>) -> bool {
        let mut shard = self.shard(pair.fullhash).lock();
        self.unlink(&mut shard, pair)
    }

    fn unlink(&self, shard: &mut Shard<V>, pair: &Arc<Pair<V>>) -> bool {
        match shard.find(&pair.key, pair.fullhash, self.shard_bits) {
            Some(found) if Arc::ptr_eq(found, pair) => {}
            _ => return false,
        }
        shard.remove(&pair.key, pair.fullhash, self.shard_bits);
        self.clock.lock().remove(&pair.key);
        pair.meta.lock().evicted = true;
        self.len.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Snapshot of every resident pair.
    pub(crate) fn all_pairs(&self) -> Vec<Arc<Pair<V>>> {
        let mut out = Vec::with_capacity(self.len());
        for shard in &self.shards {
            let shard = shard.lock();
            for bucket in &shard.buckets {
                out.extend(bucket.iter().cloned());
            }
        }
        out
    }

    /// Snapshot of the resident pairs of one file.
    pub(crate) fn pairs_of_file(&self, file_id: FileId) -> Vec<Arc<Pair<V>>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            for bucket in &shard.buckets {
                out.extend(bucket.iter().filter(|p| p.key.file_id == file_id).cloned());
            }
        }
        out
    }

    /// Next pair under the evictor's clock hand.
    pub(crate) fn next_for_eviction(&self) -> Option<Arc<Pair<V>>> {
        self.clock.lock().advance_evictor()
    }

    /// Next batch of pairs under the cleaner's clock hand.
    pub(crate) fn next_for_cleaning(&self, n: usize) -> Vec<Arc<Pair<V>>> {
        self.clock.lock().advance_cleaner(n)
    }

    /// Check that shards, clock ring and the length counter agree.
    pub(crate) fn verify(&self) -> std::result::Result<(), String> {
        let mut total = 0;
        for (i, shard) in self.shards.iter().enumerate() {
            let shard = shard.lock();
            let mut count = 0;
            for (b, bucket) in shard.buckets.iter().enumerate() {
                for pair in bucket {
                    if shard.bucket_index(pair.fullhash, self.shard_bits) != b {
                        return Err(format!("{} is in the wrong bucket", pair.key));
                    }
                    if (pair.fullhash as usize) & (self.shards.len() - 1) != i {
                        return Err(format!("{} is in the wrong shard", pair.key));
                    }
                    if !self.clock.lock().contains(&pair.key) {
                        return Err(format!("{} is missing from the clock", pair.key));
                    }
                    count += 1;
                }
            }
            if count != shard.len {
                return Err(format!("shard {} counts {} pairs, holds {}", i, shard.len, count));
            }
            total += count;
        }

        let clock_len = self.clock.lock().len();
        if total != clock_len || total != self.len() {
            return Err(format!(
                "directory holds {} pairs, clock {}, counter {}",
                total,
                clock_len,
                self.len()
            ));
        }
        Ok(())
    }
}
