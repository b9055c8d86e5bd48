//! Exponential backoff for upstream overload errors

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff settings for transient overload errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries shared by every strategy of one request
    pub max_retries: u32,

    pub base_delay_ms: u64,

    /// Upper bound of the uniform jitter added to each delay
    pub max_jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_jitter_ms: 500,
        }
    }
}

impl RetryPolicy {
    /// `base_delay × 2^retry`, without jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    /// [`delay_for`](Self::delay_for) plus `U(0, max_jitter)`
    pub fn jittered_delay(&self, retry: u32) -> Duration {
        let jitter = if self.max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_jitter_ms)
        };
        self.delay_for(retry) + Duration::from_millis(jitter)
    }
}

/// Per-request retry bookkeeping
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Retries used so far (0-indexed index of the next retry)
    pub attempt: u32,
    pub max_retries: u32,
    /// Text assembled so far; never discarded
    pub partial_content: String,
}

impl RetryState {
    pub fn new(max_retries: u32) -> Self {
        Self {
            attempt: 0,
            max_retries,
            partial_content: String::new(),
        }
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_retries
    }

    /// Consume one retry, returning its index
    pub fn record_retry(&mut self) -> u32 {
        let index = self.attempt;
        self.attempt += 1;
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_monotone() {
        let policy = RetryPolicy::default();
        let delays: Vec<_> = (0..policy.max_retries).map(|n| policy.delay_for(n)).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[4], Duration::from_secs(16));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let delay = policy.jittered_delay(2);
            assert!(delay >= Duration::from_secs(4));
            assert!(delay <= Duration::from_millis(4_500));
        }
    }

    #[test]
    fn test_retry_budget() {
        let mut state = RetryState::new(2);
        assert_eq!(state.record_retry(), 0);
        assert_eq!(state.record_retry(), 1);
        assert!(!state.can_retry());
    }

    #[test]
    fn test_huge_retry_index_saturates() {
        let policy = RetryPolicy::default();
        assert!(policy.delay_for(200) >= policy.delay_for(10));
    }
}
