//! Telemetry: structured logging and queue metrics.
//!
//! - **Logging**: JSON/pretty/compact `tracing-subscriber` output with credential redaction
//! - **Metrics**: counters and gauges for scheduling, claims, conflicts and redelivery,
//!   exported through a Prometheus recorder
//!
//! # Example
//!
//! ```rust,no_run
//! use tickq_core::telemetry::{init_logging, init_metrics, LoggingConfig, MetricsConfig};
//!
//! init_logging(&LoggingConfig::default()).expect("Failed to initialize logging");
//! let registry = init_metrics(&MetricsConfig::default()).expect("Failed to initialize metrics");
//! println!("{}", registry.render());
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, SensitiveFieldRedactor};
pub use metrics::{init_metrics, MetricsConfig, MetricsRegistry, QueueMetrics};
