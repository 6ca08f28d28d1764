//! Core identity and bookkeeping types.
//!
//! A cached block is identified by a [`BlockKey`]: the [`FileId`] of the
//! cachefile it belongs to plus its [`BlockNum`] within that file. Callers
//! precompute a 32-bit "fullhash" of the key once and pass it along with
//! every request; the cache uses it for bucket and shard placement.

use std::fmt;

/// Identifier of an open cachefile, unique within one cachetable.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct FileId(pub u32);

/// Block number within a cachefile.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockNum(pub u64);

/// Identity of a cached block.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BlockKey {
    /// Owning cachefile.
    pub file_id: FileId,
    /// Block within the file.
    pub block_num: BlockNum,
}

impl BlockKey {
    /// Create a new block key.
    pub fn new(file_id: FileId, block_num: BlockNum) -> Self {
        Self { file_id, block_num }
    }

    /// Compute the fullhash for this key.
    ///
    /// Callers are expected to compute this once and keep it alongside the
    /// key; the cache never recomputes it on the lookup path.
    pub fn fullhash(&self) -> u32 {
        let b = self.block_num.0;
        final_mix(self.file_id.0, (b >> 32) as u32, b as u32)
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_id.0, self.block_num.0)
    }
}

/// Bob Jenkins' final mixing step over three 32-bit words.
fn final_mix(mut a: u32, mut b: u32, mut c: u32) -> u32 {
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(14));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(11));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(25));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(16));
    a ^= c;
    a = a.wrapping_sub(c.rotate_left(4));
    b ^= a;
    b = b.wrapping_sub(a.rotate_left(14));
    c ^= b;
    c = c.wrapping_sub(b.rotate_left(24));
    c
}

/// Memory attribution of a cached value.
///
/// `size` is the logical footprint charged against the cache budget. It
/// need not match the serialized size of the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PairAttr {
    /// Bytes charged to the cache for this value.
    pub size: usize,
    /// How much work the cleaner could save by writing this pair out.
    pub cache_pressure_size: usize,
}

impl PairAttr {
    /// Attribute with the given size and no cache pressure.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            cache_pressure_size: 0,
        }
    }

    /// Set the cache pressure.
    pub fn with_cache_pressure(mut self, cache_pressure_size: usize) -> Self {
        self.cache_pressure_size = cache_pressure_size;
        self
    }
}

/// Whether a pin released its pair with modifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dirtiness {
    /// The value was not modified.
    #[default]
    Clean,
    /// The value was modified and must be written before it is discarded.
    Dirty,
}

impl Dirtiness {
    /// Check if this is `Dirty`.
    pub fn is_dirty(self) -> bool {
        matches!(self, Dirtiness::Dirty)
    }
}

impl From<bool> for Dirtiness {
    fn from(dirty: bool) -> Self {
        if dirty {
            Dirtiness::Dirty
        } else {
            Dirtiness::Clean
        }
    }
}

/// Lock mode requested when pinning a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared access.
    Read,
    /// Exclusive access for short, in-memory work.
    WriteCheap,
    /// Exclusive access that may do I/O; contending non-blocking callers
    /// back off instead of waiting.
    WriteExpensive,
}

impl LockMode {
    /// Check if this mode grants exclusive access.
    pub fn is_write(self) -> bool {
        !matches!(self, LockMode::Read)
    }

    /// Check if this is the expensive write mode.
    pub fn is_expensive(self) -> bool {
        matches!(self, LockMode::WriteExpensive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fullhash_is_stable() {
        let key = BlockKey::new(FileId(1), BlockNum(42));
        assert_eq!(key.fullhash(), key.fullhash());
        assert_eq!(key.fullhash(), BlockKey::new(FileId(1), BlockNum(42)).fullhash());
    }

    #[test]
    fn test_fullhash_spreads_neighbours() {
        let a = BlockKey::new(FileId(1), BlockNum(1)).fullhash();
        let b = BlockKey::new(FileId(1), BlockNum(2)).fullhash();
        let c = BlockKey::new(FileId(2), BlockNum(1)).fullhash();
        assert_ne!(a, b);
        assert_ne!(a, c);
        // Low bits pick the shard; neighbours should not all collide.
        let shards: std::collections::HashSet<u32> = (0..64u64)
            .map(|n| BlockKey::new(FileId(1), BlockNum(n)).fullhash() & 15)
            .collect();
        assert!(shards.len() > 8);
    }

    #[test]
    fn test_high_block_bits_affect_hash() {
        let lo = BlockKey::new(FileId(1), BlockNum(7)).fullhash();
        let hi = BlockKey::new(FileId(1), BlockNum(7 | (1 << 40))).fullhash();
        assert_ne!(lo, hi);
    }

    #[test]
    fn test_dirtiness_from_bool() {
        assert_eq!(Dirtiness::from(true), Dirtiness::Dirty);
        assert!(!Dirtiness::from(false).is_dirty());
    }

    #[test]
    fn test_lock_mode_predicates() {
        assert!(!LockMode::Read.is_write());
        assert!(LockMode::WriteCheap.is_write());
        assert!(!LockMode::WriteCheap.is_expensive());
        assert!(LockMode::WriteExpensive.is_expensive());
    }

    #[test]
    fn test_key_display() {
        let key = BlockKey::new(FileId(7), BlockNum(100));
        assert_eq!(key.to_string(), "7:100");
    }
}
