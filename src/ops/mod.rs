//! Operations and observability.
//!
//! - [`metrics`] - coordinator counters and metric names
//!
//! Logging goes through `tracing`; the binary installs the subscriber.

pub mod metrics;

pub use metrics::{CoordinatorMetrics, MetricsSnapshot};
