//! Cachetable status counters.

use std::fmt;

use super::{Counter, Gauge, Histogram};

/// Counters and gauges maintained by a cachetable.
#[derive(Debug, Default)]
pub struct CachetableMetrics {
    // === Pins ===
    /// Full fetches.
    pub misses: Counter,
    /// Time spent in full fetches.
    pub miss_time: Histogram,
    /// Partial fetches.
    pub partial_fetches: Counter,
    /// Pairs inserted by put.
    pub puts: Counter,
    /// Prefetches scheduled.
    pub prefetches: Counter,
    /// Non-blocking pins answered with try-again.
    pub try_again: Counter,

    // === Eviction ===
    /// Clean pairs evicted.
    pub evictions_clean: Counter,
    /// Dirty pairs written and evicted.
    pub evictions_dirty: Counter,
    /// Partial evictions.
    pub partial_evictions: Counter,
    /// Bytes released by partial evictions.
    pub partial_eviction_bytes: Counter,
    /// Pairs written by the cleaner.
    pub cleaner_writes: Counter,

    // === Checkpoints ===
    /// Checkpoints completed.
    pub checkpoints_taken: Counter,
    /// Checkpoints that returned an error.
    pub checkpoints_failed: Counter,
    /// Time spent between begin and end of a checkpoint.
    pub checkpoint_time: Histogram,
    /// Checkpoint clones taken.
    pub clones: Counter,
    /// Pairs (or clones) written for a checkpoint.
    pub checkpoint_writes: Counter,

    // === Memory ===
    /// Bytes charged by resident pairs.
    pub size_current: Gauge,
    /// Bytes reserved by clients.
    pub size_reserved: Gauge,
    /// Bytes held by unwritten checkpoint clones.
    pub size_cloned: Gauge,
    /// Resident pairs.
    pub pairs: Gauge,
}

impl CachetableMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prometheus text exposition.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        let counters: [(&str, &str, &Counter); 14] = [
            ("cachetable_misses_total", "Full fetches", &self.misses),
            ("cachetable_partial_fetches_total", "Partial fetches", &self.partial_fetches),
            ("cachetable_puts_total", "Pairs inserted by put", &self.puts),
            ("cachetable_prefetches_total", "Prefetches scheduled", &self.prefetches),
            ("cachetable_try_again_total", "Non-blocking pins answered with try-again", &self.try_again),
            ("cachetable_evictions_clean_total", "Clean pairs evicted", &self.evictions_clean),
            ("cachetable_evictions_dirty_total", "Dirty pairs written and evicted", &self.evictions_dirty),
            ("cachetable_partial_evictions_total", "Partial evictions", &self.partial_evictions),
            ("cachetable_partial_eviction_bytes_total", "Bytes released by partial eviction", &self.partial_eviction_bytes),
            ("cachetable_cleaner_writes_total", "Pairs written by the cleaner", &self.cleaner_writes),
            ("cachetable_checkpoints_total", "Checkpoints completed", &self.checkpoints_taken),
            ("cachetable_checkpoints_failed_total", "Checkpoints that failed", &self.checkpoints_failed),
            ("cachetable_clones_total", "Checkpoint clones taken", &self.clones),
            ("cachetable_checkpoint_writes_total", "Pairs written for checkpoints", &self.checkpoint_writes),
        ];
        for (name, help, counter) in counters {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n\n", name, counter.get()));
        }

        let gauges: [(&str, &str, &Gauge); 4] = [
            ("cachetable_size_current_bytes", "Bytes charged by resident pairs", &self.size_current),
            ("cachetable_size_reserved_bytes", "Bytes reserved by clients", &self.size_reserved),
            ("cachetable_size_cloned_bytes", "Bytes held by unwritten clones", &self.size_cloned),
            ("cachetable_pairs", "Resident pairs", &self.pairs),
        ];
        for (name, help, gauge) in gauges {
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            output.push_str(&format!("{} {}\n\n", name, gauge.get()));
        }

        output.push_str("# HELP cachetable_miss_seconds Full fetch latency\n");
        output.push_str("# TYPE cachetable_miss_seconds histogram\n");
        output.push_str(&self.miss_time.to_prometheus("cachetable_miss_seconds"));
        output.push('\n');

        output.push_str("# HELP cachetable_checkpoint_seconds Checkpoint duration\n");
        output.push_str("# TYPE cachetable_checkpoint_seconds histogram\n");
        output.push_str(&self.checkpoint_time.to_prometheus("cachetable_checkpoint_seconds"));

        output
    }

    /// Point-in-time snapshot.
    pub fn status(&self, size_limit: usize) -> CachetableStatus {
        CachetableStatus {
            misses: self.misses.get(),
            miss_time_us: self.miss_time.sum(),
            partial_fetches: self.partial_fetches.get(),
            puts: self.puts.get(),
            prefetches: self.prefetches.get(),
            try_again: self.try_again.get(),
            evictions_clean: self.evictions_clean.get(),
            evictions_dirty: self.evictions_dirty.get(),
            partial_evictions: self.partial_evictions.get(),
            cleaner_writes: self.cleaner_writes.get(),
            checkpoints_taken: self.checkpoints_taken.get(),
            checkpoints_failed: self.checkpoints_failed.get(),
            clones: self.clones.get(),
            checkpoint_writes: self.checkpoint_writes.get(),
            size_current: self.size_current.get().max(0) as u64,
            size_limit: size_limit as u64,
            size_reserved: self.size_reserved.get().max(0) as u64,
            size_cloned: self.size_cloned.get().max(0) as u64,
            pairs: self.pairs.get().max(0) as u64,
        }
    }
}

/// Snapshot of the cachetable's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CachetableStatus {
    pub misses: u64,
    pub miss_time_us: u64,
    pub partial_fetches: u64,
    pub puts: u64,
    pub prefetches: u64,
    pub try_again: u64,
    pub evictions_clean: u64,
    pub evictions_dirty: u64,
    pub partial_evictions: u64,
    pub cleaner_writes: u64,
    pub checkpoints_taken: u64,
    pub checkpoints_failed: u64,
    pub clones: u64,
    pub checkpoint_writes: u64,
    pub size_current: u64,
    pub size_limit: u64,
    pub size_reserved: u64,
    pub size_cloned: u64,
    pub pairs: u64,
}

impl fmt::Display for CachetableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Cachetable Status ===")?;
        writeln!(f)?;
        writeln!(f, "Memory:")?;
        writeln!(
            f,
            "  Current:  {} of {}",
            format_bytes(self.size_current),
            format_bytes(self.size_limit)
        )?;
        writeln!(f, "  Reserved: {}", format_bytes(self.size_reserved))?;
        writeln!(f, "  Cloned:   {}", format_bytes(self.size_cloned))?;
        writeln!(f, "  Pairs:    {}", self.pairs)?;
        writeln!(f)?;
        writeln!(f, "Pins:")?;
        writeln!(f, "  Misses:          {} ({} µs)", self.misses, self.miss_time_us)?;
        writeln!(f, "  Partial fetches: {}", self.partial_fetches)?;
        writeln!(f, "  Puts:            {}", self.puts)?;
        writeln!(f, "  Prefetches:      {}", self.prefetches)?;
        writeln!(f, "  Try again:       {}", self.try_again)?;
        writeln!(f)?;
        writeln!(f, "Eviction:")?;
        writeln!(f, "  Clean:    {}", self.evictions_clean)?;
        writeln!(f, "  Dirty:    {}", self.evictions_dirty)?;
        writeln!(f, "  Partial:  {}", self.partial_evictions)?;
        writeln!(f, "  Cleaner:  {}", self.cleaner_writes)?;
        writeln!(f)?;
        writeln!(f, "Checkpoints:")?;
        writeln!(f, "  Taken:  {}", self.checkpoints_taken)?;
        writeln!(f, "  Failed: {}", self.checkpoints_failed)?;
        writeln!(f, "  Clones: {}", self.clones)?;
        writeln!(f, "  Writes: {}", self.checkpoint_writes)?;
        Ok(())
    }
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_snapshot() {
        let metrics = CachetableMetrics::new();
        metrics.misses.add(3);
        metrics.miss_time.observe(250);
        metrics.evictions_dirty.inc();
        metrics.size_current.set(2048);
        metrics.pairs.set(2);

        let status = metrics.status(1 << 20);
        assert_eq!(status.misses, 3);
        assert_eq!(status.miss_time_us, 250);
        assert_eq!(status.evictions_dirty, 1);
        assert_eq!(status.size_current, 2048);
        assert_eq!(status.size_limit, 1 << 20);
    }

    #[test]
    fn test_status_display() {
        let metrics = CachetableMetrics::new();
        metrics.size_current.set(3 * 1024 * 1024);
        metrics.checkpoints_taken.add(4);

        let text = metrics.status(1024).to_string();
        assert!(text.contains("3.00 MB of 1.00 KB"));
        assert!(text.contains("Taken:  4"));
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = CachetableMetrics::new();
        metrics.puts.add(7);
        metrics.size_cloned.set(64);

        let text = metrics.to_prometheus();
        assert!(text.contains("cachetable_puts_total 7"));
        assert!(text.contains("# TYPE cachetable_size_cloned_bytes gauge"));
        assert!(text.contains("cachetable_size_cloned_bytes 64"));
        assert!(text.contains("cachetable_miss_seconds_count 0"));
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(12), "12 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GB");
    }
}
