//! Callback contracts between the cache and the layer that owns block
//! contents.
//!
//! Every pair carries one `Arc<dyn BlockOps<V>>` for its whole lifetime. The
//! implementing type is also where per-pair "extra" state lives: a caller that
//! needs a different partial-fetch decision simply passes a differently
//! configured ops value to the pin call.

use crate::cachefile::BlockFile;
use crate::types::{BlockKey, Dirtiness, PairAttr};
use crate::Result;

/// Result of a full fetch.
#[derive(Debug)]
pub struct Fetched<V> {
    /// The materialized value.
    pub value: V,
    /// Its memory attribution.
    pub attr: PairAttr,
    /// Whether the value is already dirty (e.g. upgraded on read).
    pub dirty: Dirtiness,
}

impl<V> Fetched<V> {
    /// A clean fetch result.
    pub fn clean(value: V, attr: PairAttr) -> Self {
        Self {
            value,
            attr,
            dirty: Dirtiness::Clean,
        }
    }
}

/// Arguments for [`BlockOps::flush`].
#[derive(Debug, Clone, Copy)]
pub struct FlushArgs {
    /// Identity of the pair being flushed.
    pub key: BlockKey,
    /// Caller-maintained hash of `key`.
    pub fullhash: u32,
    /// Attribute of the value being flushed.
    pub attr: PairAttr,
    /// Write the value to disk. `false` means discard without writing.
    pub write_me: bool,
    /// The cache keeps the value after the call. `false` means the cache
    /// drops it when the callback returns.
    pub keep_me: bool,
    /// The write is part of a checkpoint.
    pub for_checkpoint: bool,
    /// The value is a checkpoint clone, not the live value.
    pub is_clone: bool,
}

/// Relative cost of a partial eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCost {
    /// Runs inline on the evictor thread.
    Cheap,
    /// Runs on a background worker (e.g. compression).
    Expensive,
}

/// Estimate returned by [`BlockOps::partial_eviction_estimate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialEvictionEstimate {
    /// Bytes the eviction expects to free. Zero means "nothing to do".
    pub bytes_freed: usize,
    /// Where the eviction should run.
    pub cost: EvictionCost,
}

impl PartialEvictionEstimate {
    /// Nothing can be partially evicted.
    pub const NONE: PartialEvictionEstimate = PartialEvictionEstimate {
        bytes_freed: 0,
        cost: EvictionCost::Cheap,
    };

    /// An estimate of `bytes_freed` at the given cost.
    pub fn new(bytes_freed: usize, cost: EvictionCost) -> Self {
        Self { bytes_freed, cost }
    }
}

/// A point-in-time copy of a value taken for a checkpoint.
#[derive(Debug)]
pub struct Cloned<V> {
    /// The copy.
    pub value: V,
    /// Its memory attribution (charged until the clone is written).
    pub attr: PairAttr,
}

/// Per-value-type operations invoked by the cache.
///
/// Callbacks run without any directory lock held and may block on I/O.
/// They run with the pair's lock held in a mode that gives them the access
/// their signature implies (`&mut V` means exclusive).
pub trait BlockOps<V>: Send + Sync {
    /// Materialize a value that is not in memory.
    fn fetch(&self, file: &BlockFile, key: BlockKey, fullhash: u32) -> Result<Fetched<V>>;

    /// Write and/or release a value. See [`FlushArgs`].
    ///
    /// On error the cache keeps the value and leaves it dirty.
    fn flush(&self, file: &BlockFile, value: &mut V, args: &FlushArgs) -> Result<()>;

    /// Produce a checkpoint clone. `None` means the value cannot be cloned
    /// and checkpoints must write it in place.
    fn clone_value(&self, _value: &V) -> Option<Cloned<V>> {
        None
    }

    /// Whether the pin request this ops value describes needs more of the
    /// value materialized.
    fn partial_fetch_required(&self, _value: &V) -> bool {
        false
    }

    /// Materialize the missing part of the value and return its new attr.
    fn partial_fetch(&self, _file: &BlockFile, _value: &mut V, attr: PairAttr) -> Result<PairAttr> {
        Ok(attr)
    }

    /// Estimate what a partial eviction would free.
    fn partial_eviction_estimate(&self, _value: &V, _attr: PairAttr) -> PartialEvictionEstimate {
        PartialEvictionEstimate::NONE
    }

    /// Shrink the value. The returned attr is the actual post-eviction
    /// footprint and is what the cache accounts, whatever the estimate said.
    fn partial_evict(&self, _value: &mut V, attr: PairAttr) -> Result<PairAttr> {
        Ok(attr)
    }

    /// Called on the live value once its checkpoint image has been captured.
    fn checkpoint_complete(&self, _value: &mut V) {}
}
