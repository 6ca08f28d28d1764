//! Metrics and observability for the cachetable.
//!
//! - **Primitives**: [`Counter`], [`Gauge`], [`Histogram`], [`Timer`]
//! - **Cachetable counters**: misses, evictions, cleaner writes, checkpoints
//! - **Prometheus export**: text exposition format

mod cachetable_metrics;
mod collector;

pub use cachetable_metrics::{CachetableMetrics, CachetableStatus};
pub use collector::{Counter, Gauge, Histogram, Timer};
