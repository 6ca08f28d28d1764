//! # cachetable
//!
//! A concurrent, disk-backed cache of pinnable blocks.
//!
//! ## Features
//!
//! - **Pinning**: read, cheap-write and expensive-write pins with a
//!   single fetch per miss, even under contention
//! - **Partial fetch and eviction**: blocks may be partially resident
//! - **Clock eviction**: a background evictor keeps memory under a budget,
//!   writing dirty blocks back first
//! - **Cleaner**: writes dirty blocks in the background
//! - **Checkpoints**: consistent images of all dirty blocks, taken
//!   without stopping writers (copy-on-write clones where supported)
//! - **Non-blocking pins**: `TryAgain` instead of waiting on I/O
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cachetable::{BlockNum, BlockOps, Cachetable, LockMode, Options};
//!
//! let ct: Arc<Cachetable<MyNode>> = Cachetable::new(Options::default())?;
//! let cf = ct.open_cachefile("./nodes.db")?;
//! let ops: Arc<dyn BlockOps<MyNode>> = Arc::new(MyNodeOps);
//!
//! let block = BlockNum(7);
//! let fullhash = cf.hash(block);
//! {
//!     let mut pin = ct.get_and_pin(&cf, block, fullhash, &ops, LockMode::WriteCheap)?;
//!     pin.value_mut().insert(b"key", b"value");
//! } // unpinned dirty
//!
//! ct.checkpoint()?;
//! ct.close_cachefile(&cf)?;
//! ```

// Public modules
pub mod cachefile;
pub mod cachetable;
pub mod error;
pub mod metrics;
pub mod ops;
pub mod options;
pub mod pair;
pub mod types;

// Internal modules
mod checkpoint;
mod cleaner;
mod directory;
mod evictor;
mod util;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use options::{Options, OptionsBuilder};
pub use types::{BlockKey, BlockNum, Dirtiness, FileId, LockMode, PairAttr};

// Block callbacks
pub use ops::{BlockOps, Cloned, EvictionCost, Fetched, FlushArgs, PartialEvictionEstimate};

// Cachetable
pub use cachetable::Cachetable;
pub use checkpoint::CheckpointStats;

// Cachefiles
pub use cachefile::{BlockFile, CacheFile, CacheFileHooks, CacheFileState, BLOCK_HEADER_SIZE};

// Pins
pub use pair::{DependentPair, PairHandle, PairState, PinGuard, Unlockers};

// Metrics
pub use metrics::{CachetableMetrics, CachetableStatus, Counter, Gauge, Histogram};
