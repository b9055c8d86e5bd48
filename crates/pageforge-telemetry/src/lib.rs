//! PageForge Telemetry
//!
//! Usage accounting and request metrics for PageForge.
//!
//! Provides:
//! - An append-only JSONL usage log with a background writer
//! - Running token and cost totals for the usage statistics endpoint
//! - In-process outcome counters (completions, fallbacks, failures)

pub mod metrics;
pub mod service;
pub mod usage_log;

pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use service::{RecentRequest, UsageService, UsageStats};
pub use usage_log::{UsageEntry, UsageLogConfig};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::metrics::MetricsCollector;
    pub use crate::service::{UsageService, UsageStats};
    pub use crate::usage_log::{UsageEntry, UsageLogConfig};
}
