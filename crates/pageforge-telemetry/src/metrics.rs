//! In-process generation counters

use pageforge_core::{Completion, Strategy};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Outcome counters for `/api/usage-stats`
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    total_requests: AtomicU64,
    completed: AtomicU64,
    fallbacks: AtomicU64,
    placeholders: AtomicU64,
    partial: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    total_tokens: AtomicU64,
    total_latency_us: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub fn record_request(&self) {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a generation that produced a document
    pub fn record_completion(&self, completion: &Completion, latency: Duration) {
        let inner = &self.inner;
        inner.completed.fetch_add(1, Ordering::Relaxed);
        if completion.warning.is_some() {
            inner.fallbacks.fetch_add(1, Ordering::Relaxed);
        }
        if completion.strategy == Strategy::Placeholder {
            inner.placeholders.fetch_add(1, Ordering::Relaxed);
        }
        if completion.partial {
            inner.partial.fetch_add(1, Ordering::Relaxed);
        }
        inner
            .total_tokens
            .fetch_add(completion.usage.total_tokens, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_failure(&self, latency: Duration) {
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    pub fn record_cancelled(&self) {
        self.inner.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.inner
            .total_latency_us
            .fetch_add(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            total_requests: inner.total_requests.load(Ordering::Relaxed),
            completed: inner.completed.load(Ordering::Relaxed),
            fallbacks: inner.fallbacks.load(Ordering::Relaxed),
            placeholders: inner.placeholders.load(Ordering::Relaxed),
            partial: inner.partial.load(Ordering::Relaxed),
            failed: inner.failed.load(Ordering::Relaxed),
            cancelled: inner.cancelled.load(Ordering::Relaxed),
            total_tokens: inner.total_tokens.load(Ordering::Relaxed),
            total_latency_us: inner.total_latency_us.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of current counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub completed: u64,
    pub fallbacks: u64,
    pub placeholders: u64,
    pub partial: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total_tokens: u64,
    pub total_latency_us: u64,
}

impl MetricsSnapshot {
    /// Average latency over finished (completed or failed) generations
    pub fn avg_latency_us(&self) -> u64 {
        let finished = self.completed + self.failed;
        if finished == 0 {
            0
        } else {
            self.total_latency_us / finished
        }
    }

    /// Share of completions served by a fallback step
    pub fn fallback_rate(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.fallbacks as f64 / self.completed as f64
        }
    }
}
