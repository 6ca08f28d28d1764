//! Configuration options for the cachetable.

use std::time::Duration;

/// Default memory budget (128MB).
pub const DEFAULT_SIZE_LIMIT: usize = 128 * 1024 * 1024;

/// Default evictor wake-up period.
pub const DEFAULT_EVICTOR_PERIOD: Duration = Duration::from_secs(1);

/// Default cleaner wake-up period.
pub const DEFAULT_CLEANER_PERIOD: Duration = Duration::from_secs(1);

/// Default number of cleaner iterations per wake-up.
pub const DEFAULT_CLEANER_ITERATIONS: usize = 5;

/// Default number of directory shards.
pub const DEFAULT_DIRECTORY_SHARDS: usize = 16;

/// Default initial bucket count per shard.
pub const DEFAULT_INITIAL_BUCKETS: usize = 64;

/// Default number of background worker threads.
pub const DEFAULT_KIBBUTZ_THREADS: usize = 2;

/// Default block slot size for [`BlockFile`](crate::BlockFile) framing (4KB).
pub const DEFAULT_BLOCK_SIZE: usize = 4 * 1024;

/// Cachetable configuration options.
#[derive(Debug, Clone)]
pub struct Options {
    // === Memory ===
    /// Memory budget in bytes (sum of pair attributes).
    pub size_limit: usize,

    /// Eviction stops once usage drops below `size_limit * low_watermark_ratio`.
    pub low_watermark_ratio: f64,

    /// Eviction starts once usage exceeds `size_limit * high_watermark_ratio`.
    pub high_watermark_ratio: f64,

    // === Background work ===
    /// Period of the evictor thread (`None` runs only when signalled).
    pub evictor_period: Option<Duration>,

    /// Period of the cleaner thread (`None` disables it).
    pub cleaner_period: Option<Duration>,

    /// Pairs cleaned per cleaner wake-up.
    pub cleaner_iterations: usize,

    /// Period of automatic checkpoints (`None` disables them).
    pub checkpoint_period: Option<Duration>,

    /// Worker threads for deferred work (prefetch, expensive partial
    /// eviction, checkpoint clone writes).
    pub kibbutz_threads: usize,

    // === Directory ===
    /// Number of directory shards (power of two).
    pub directory_shards: usize,

    /// Initial bucket count per shard (power of two).
    pub initial_buckets: usize,

    // === Files ===
    /// Slot size used by framed block I/O.
    pub block_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            // Memory
            size_limit: DEFAULT_SIZE_LIMIT,
            low_watermark_ratio: 0.9,
            high_watermark_ratio: 1.0,

            // Background work
            evictor_period: Some(DEFAULT_EVICTOR_PERIOD),
            cleaner_period: Some(DEFAULT_CLEANER_PERIOD),
            cleaner_iterations: DEFAULT_CLEANER_ITERATIONS,
            checkpoint_period: None,
            kibbutz_threads: DEFAULT_KIBBUTZ_THREADS,

            // Directory
            directory_shards: DEFAULT_DIRECTORY_SHARDS,
            initial_buckets: DEFAULT_INITIAL_BUCKETS,

            // Files
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

impl Options {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for deterministic tests: no periodic background threads.
    ///
    /// The evictor still runs when explicitly signalled.
    pub fn for_testing() -> Self {
        Self {
            evictor_period: None,
            cleaner_period: None,
            checkpoint_period: None,
            ..Self::default()
        }
    }

    /// Validate the options.
    pub fn validate(&self) -> crate::Result<()> {
        if self.size_limit == 0 {
            return Err(crate::Error::InvalidConfiguration(
                "size_limit must be greater than zero".into(),
            ));
        }

        if !(self.low_watermark_ratio > 0.0 && self.low_watermark_ratio <= self.high_watermark_ratio)
        {
            return Err(crate::Error::InvalidConfiguration(
                "low_watermark_ratio must be in (0, high_watermark_ratio]".into(),
            ));
        }

        if self.high_watermark_ratio > 4.0 {
            return Err(crate::Error::InvalidConfiguration(
                "high_watermark_ratio cannot exceed 4.0".into(),
            ));
        }

        if self.kibbutz_threads == 0 {
            return Err(crate::Error::InvalidConfiguration(
                "kibbutz_threads must be at least 1".into(),
            ));
        }

        if !self.directory_shards.is_power_of_two() {
            return Err(crate::Error::InvalidConfiguration(format!(
                "directory_shards must be a power of two, got {}",
                self.directory_shards
            )));
        }

        if !self.initial_buckets.is_power_of_two() {
            return Err(crate::Error::InvalidConfiguration(format!(
                "initial_buckets must be a power of two, got {}",
                self.initial_buckets
            )));
        }

        if self.block_size < 64 {
            return Err(crate::Error::InvalidConfiguration(
                "block_size must be at least 64 bytes".into(),
            ));
        }

        Ok(())
    }

    /// Usage below which the evictor stops.
    pub fn low_watermark(&self) -> usize {
        (self.size_limit as f64 * self.low_watermark_ratio) as usize
    }

    /// Usage above which the evictor starts.
    pub fn high_watermark(&self) -> usize {
        (self.size_limit as f64 * self.high_watermark_ratio) as usize
    }
}

/// Builder for Options.
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the memory budget.
    pub fn size_limit(mut self, bytes: usize) -> Self {
        self.options.size_limit = bytes;
        self
    }

    /// Set the eviction watermarks as fractions of the budget.
    pub fn watermarks(mut self, low: f64, high: f64) -> Self {
        self.options.low_watermark_ratio = low;
        self.options.high_watermark_ratio = high;
        self
    }

    /// Set the evictor period.
    pub fn evictor_period(mut self, period: Option<Duration>) -> Self {
        self.options.evictor_period = period;
        self
    }

    /// Set the cleaner period.
    pub fn cleaner_period(mut self, period: Option<Duration>) -> Self {
        self.options.cleaner_period = period;
        self
    }

    /// Set cleaner iterations per wake-up.
    pub fn cleaner_iterations(mut self, iterations: usize) -> Self {
        self.options.cleaner_iterations = iterations;
        self
    }

    /// Set the automatic checkpoint period.
    pub fn checkpoint_period(mut self, period: Option<Duration>) -> Self {
        self.options.checkpoint_period = period;
        self
    }

    /// Set the number of background worker threads.
    pub fn kibbutz_threads(mut self, threads: usize) -> Self {
        self.options.kibbutz_threads = threads;
        self
    }

    /// Set the directory shard count.
    pub fn directory_shards(mut self, shards: usize) -> Self {
        self.options.directory_shards = shards;
        self
    }

    /// Set the initial bucket count per shard.
    pub fn initial_buckets(mut self, buckets: usize) -> Self {
        self.options.initial_buckets = buckets;
        self
    }

    /// Set the framed block size.
    pub fn block_size(mut self, size: usize) -> Self {
        self.options.block_size = size;
        self
    }

    /// Build the options.
    pub fn build(self) -> crate::Result<Options> {
        self.options.validate()?;
        Ok(self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert_eq!(opts.size_limit, DEFAULT_SIZE_LIMIT);
        assert_eq!(opts.evictor_period, Some(DEFAULT_EVICTOR_PERIOD));
        assert!(opts.checkpoint_period.is_none());
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_testing_options_disable_periods() {
        let opts = Options::for_testing();
        assert!(opts.evictor_period.is_none());
        assert!(opts.cleaner_period.is_none());
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_options_validation() {
        let mut opts = Options::default();
        opts.directory_shards = 12;
        assert!(opts.validate().is_err());

        let mut opts = Options::default();
        opts.low_watermark_ratio = 1.5;
        assert!(opts.validate().is_err());

        let mut opts = Options::default();
        opts.kibbutz_threads = 0;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_watermarks() {
        let opts = OptionsBuilder::new()
            .size_limit(1000)
            .watermarks(0.5, 1.0)
            .build()
            .unwrap();
        assert_eq!(opts.low_watermark(), 500);
        assert_eq!(opts.high_watermark(), 1000);
    }

    #[test]
    fn test_options_builder() {
        let opts = OptionsBuilder::new()
            .size_limit(4096)
            .cleaner_period(None)
            .kibbutz_threads(4)
            .build()
            .unwrap();

        assert_eq!(opts.size_limit, 4096);
        assert!(opts.cleaner_period.is_none());
        assert_eq!(opts.kibbutz_threads, 4);
    }
}
