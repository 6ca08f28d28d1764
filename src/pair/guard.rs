//! Pins held by clients.
//!
//! A successful pin returns a [`PinGuard`]. Dropping the guard unpins the
//! pair (dirty if [`PinGuard::value_mut`] was used, attribute unchanged);
//! [`PinGuard::unpin`] lets the caller say exactly what changed. A pin that
//! has to outlive the guard's scope, e.g. handed to another thread, is
//! detached with [`PinGuard::release`] and later returned through
//! [`Cachetable::unpin`](crate::Cachetable::unpin).

use std::fmt;
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLockReadGuard, RwLockWriteGuard};

use crate::cachetable::Core;
use crate::types::{BlockKey, Dirtiness, LockMode, PairAttr};
use crate::Result;

use super::{present, present_mut, Pair};

/// A pinned pair.
///
/// Value borrows are short-lived locks of their own: do not keep one alive
/// across calls into the cachetable.
#[must_use = "dropping a pin guard unpins the pair immediately"]
pub struct PinGuard<V: Send + Sync + 'static> {
    core: Arc<Core<V>>,
    pair: Arc<Pair<V>>,
    mode: LockMode,
    touched: bool,
    released: bool,
}

impl<V: Send + Sync + 'static> PinGuard<V> {
    pub(crate) fn new(core: Arc<Core<V>>, pair: Arc<Pair<V>>, mode: LockMode) -> Self {
        pair.add_pin();
        Self {
            core,
            pair,
            mode,
            touched: false,
            released: false,
        }
    }

    /// Key of the pinned block.
    pub fn key(&self) -> BlockKey {
        self.pair.key
    }

    /// Fullhash of the pinned block.
    pub fn fullhash(&self) -> u32 {
        self.pair.fullhash
    }

    /// Mode the pair is held in. A write pin that had to fetch is held
    /// `WriteExpensive` even if `WriteCheap` was requested.
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Current memory attribution.
    pub fn attr(&self) -> PairAttr {
        self.pair.attr()
    }

    /// Whether the pair is dirty.
    pub fn is_dirty(&self) -> bool {
        self.pair.meta.lock().dirty
    }

    /// Borrow the value.
    pub fn value(&self) -> MappedRwLockReadGuard<'_, V> {
        RwLockReadGuard::map(self.pair.value.read(), present)
    }

    /// Borrow the value mutably. Marks the guard dirty.
    ///
    /// # Panics
    ///
    /// Panics if the pair is pinned for reading.
    pub fn value_mut(&mut self) -> MappedRwLockWriteGuard<'_, V> {
        assert!(
            self.mode.is_write(),
            "value_mut on read-pinned pair {}",
            self.pair.key
        );
        self.touched = true;
        RwLockWriteGuard::map(self.pair.value.write(), present_mut)
    }

    /// Unpin with explicit dirtiness and, optionally, a new attribute.
    ///
    /// The explicit dirtiness wins over any use of `value_mut`.
    pub fn unpin(mut self, dirty: Dirtiness, attr: Option<PairAttr>) {
        self.released = true;
        self.core.unpin_pair(&self.pair, self.mode, dirty, attr);
    }

    /// Detach the pin from this guard.
    pub fn release(mut self) -> PairHandle<V> {
        self.released = true;
        PairHandle {
            pair: Arc::clone(&self.pair),
            mode: self.mode,
        }
    }

    /// Remove the pinned pair from the cache without writing it.
    ///
    /// A pending checkpoint obligation is discharged first. Requires a write
    /// pin.
    pub fn unpin_and_remove(mut self) -> Result<()> {
        self.released = true;
        self.core.unpin_and_remove(&self.pair, self.mode)
    }

    pub(crate) fn pair(&self) -> &Arc<Pair<V>> {
        &self.pair
    }
}

impl<V: Send + Sync + 'static> Drop for PinGuard<V> {
    fn drop(&mut self) {
        if !self.released {
            self.core
                .unpin_pair(&self.pair, self.mode, Dirtiness::from(self.touched), None);
        }
    }
}

impl<V: Send + Sync + 'static> fmt::Debug for PinGuard<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinGuard")
            .field("key", &self.pair.key)
            .field("mode", &self.mode)
            .field("touched", &self.touched)
            .finish()
    }
}

/// A pin detached from its guard.
///
/// Must be handed back to [`Cachetable::unpin`](crate::Cachetable::unpin);
/// dropping it leaks the pin.
#[must_use = "a released pin must be unpinned through the cachetable"]
pub struct PairHandle<V> {
    pub(crate) pair: Arc<Pair<V>>,
    pub(crate) mode: LockMode,
}

impl<V> PairHandle<V> {
    /// Key of the pinned block.
    pub fn key(&self) -> BlockKey {
        self.pair.key
    }

    /// Mode the pair is held in.
    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl<V> fmt::Debug for PairHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairHandle")
            .field("key", &self.pair.key)
            .field("mode", &self.mode)
            .finish()
    }
}

/// An already write-pinned pair passed along with a pin or put.
///
/// Its dirtiness is what the caller will unpin it with; declared-dirty
/// dependents are marked dirty right away so a concurrent checkpoint
/// captures them.
pub struct DependentPair<'g, V: Send + Sync + 'static> {
    /// The dependent's pin.
    pub guard: &'g PinGuard<V>,
    /// Dirtiness the dependent will be unpinned with.
    pub dirty: Dirtiness,
}

impl<'g, V: Send + Sync + 'static> DependentPair<'g, V> {
    /// Declare `guard` as a dependent.
    pub fn new(guard: &'g PinGuard<V>, dirty: Dirtiness) -> Self {
        Self { guard, dirty }
    }
}

/// Callbacks a non-blocking pin runs before it waits or does I/O.
///
/// They typically release locks the caller holds so that the work the pin
/// is about to wait for can make progress. Each runs at most once.
#[derive(Default)]
pub struct Unlockers<'a> {
    fns: Vec<Box<dyn FnOnce() + 'a>>,
    ran: bool,
}

impl<'a> Unlockers<'a> {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a callback.
    pub fn push(&mut self, f: impl FnOnce() + 'a) {
        self.fns.push(Box::new(f));
    }

    /// Run every callback, in insertion order. Later calls do nothing.
    pub fn run(&mut self) {
        self.ran = true;
        for f in self.fns.drain(..) {
            f();
        }
    }

    /// Whether [`run`](Self::run) has been called.
    pub fn has_run(&self) -> bool {
        self.ran
    }
}

impl fmt::Debug for Unlockers<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unlockers")
            .field("pending", &self.fns.len())
            .field("ran", &self.ran)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_unlockers_run_once() {
        let count = Cell::new(0);
        let mut unlockers = Unlockers::new();
        unlockers.push(|| count.set(count.get() + 1));
        unlockers.push(|| count.set(count.get() + 10));
        assert!(!unlockers.has_run());

        unlockers.run();
        unlockers.run();
        assert!(unlockers.has_run());
        assert_eq!(count.get(), 11);
    }

    #[test]
    fn test_empty_unlockers() {
        let mut unlockers = Unlockers::new();
        unlockers.run();
        assert!(unlockers.has_run());
    }
}
