//! Token accounting

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Words-to-tokens ratio of the approximation used when the upstream is silent
pub const TOKENS_PER_WORD: f64 = 1.3;

/// Approximate token count: `max(1, floor(words × 1.3))`
pub fn estimate_tokens(text: &str) -> u64 {
    let words = text.split_whitespace().count() as f64;
    ((words * TOKENS_PER_WORD) as u64).max(1)
}

/// Token counts reported by the upstream, any of which may be missing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedUsage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl ReportedUsage {
    /// Fold a later report into this one; newer fields win
    pub fn merge(&mut self, other: ReportedUsage) {
        if other.input_tokens.is_some() {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens.is_some() {
            self.output_tokens = other.output_tokens;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none() && self.output_tokens.is_none()
    }
}

/// Usage attached to every completed generation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// Seconds spent on the request
    pub processing_time: f64,
    pub total_cost: f64,
}

impl UsageRecord {
    /// Build a record, preferring reported counts over the word heuristic per field
    pub fn compute(
        prompt: &str,
        output: &str,
        reported: Option<ReportedUsage>,
        elapsed: Duration,
        rate_per_million: f64,
    ) -> Self {
        let reported = reported.unwrap_or_default();
        let input_tokens = reported
            .input_tokens
            .unwrap_or_else(|| estimate_tokens(prompt));
        let output_tokens = reported
            .output_tokens
            .unwrap_or_else(|| estimate_tokens(output));
        let total_tokens = input_tokens + output_tokens;

        Self {
            input_tokens,
            output_tokens,
            total_tokens,
            processing_time: elapsed.as_secs_f64(),
            total_cost: total_tokens as f64 / 1_000_000.0 * rate_per_million,
        }
    }
}
