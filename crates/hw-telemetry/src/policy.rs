//! Replay cadence and failure handling.
//!
//! Replay runs on a fixed period. There is no per-batch backoff: a
//! connectivity failure ends the whole cycle, which already throttles pressure
//! on a degraded store. Retries continue until success or eviction; the retry
//! count is only reported, never used as a gate. The one exception is a batch
//! the store keeps rejecting, which is evicted once its rejections reach the
//! ceiling.

use std::time::Duration;

use hw_common::config::ReplayConfig;
use serde::{Deserialize, Serialize};

use crate::spool::RetryState;
use crate::store::{FailureClass, StoreError};

/// What the replay cycle does after a failed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayDecision {
    /// Store is down; leave the rest of the queue for the next cycle.
    StopCycle,
    /// Only this batch failed; continue with the next one.
    SkipBatch,
    /// Batch exceeded the rejection ceiling; drop it as data loss.
    Evict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub replay_interval: Duration,

    pub store_timeout: Duration,

    /// Rejections tolerated before a batch is evicted.
    pub rejection_ceiling: u32,

    /// Retry count above which a batch is reported as stuck.
    pub stuck_retry_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ReplayConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ReplayConfig) -> Self {
        RetryPolicy {
            replay_interval: Duration::from_secs(config.interval_secs),
            store_timeout: Duration::from_millis(config.store_timeout_ms),
            rejection_ceiling: config.rejection_ceiling,
            stuck_retry_threshold: config.stuck_retry_threshold,
        }
    }

    /// Retry state after `error` on a batch currently in `previous`.
    pub fn record_failure(&self, previous: &RetryState, error: &StoreError) -> RetryState {
        let rejected = error.class() == FailureClass::Rejected;
        RetryState {
            retry_count: previous.retry_count.saturating_add(1),
            last_error: Some(error.to_string()),
            rejection_count: if rejected {
                previous.rejection_count.saturating_add(1)
            } else {
                previous.rejection_count
            },
        }
    }

    /// Decide how the cycle proceeds, given the state already updated by
    /// [`record_failure`](Self::record_failure).
    pub fn decide(&self, error: &StoreError, state: &RetryState) -> ReplayDecision {
        match error.class() {
            FailureClass::Transient => ReplayDecision::StopCycle,
            FailureClass::Rejected if state.rejection_count >= self.rejection_ceiling => {
                ReplayDecision::Evict
            }
            FailureClass::Rejected => ReplayDecision::SkipBatch,
        }
    }

    pub fn is_stuck(&self, retry_count: u32) -> bool {
        retry_count > self.stuck_retry_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(ceiling: u32) -> RetryPolicy {
        RetryPolicy {
            rejection_ceiling: ceiling,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_transient_failure_stops_cycle() {
        let p = policy(3);
        let err = StoreError::Unavailable("down".into());
        let state = p.record_failure(&RetryState::default(), &err);
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.rejection_count, 0);
        assert_eq!(p.decide(&err, &state), ReplayDecision::StopCycle);
    }

    #[test]
    fn test_rejection_skips_until_ceiling() {
        let p = policy(2);
        let err = StoreError::Rejected("constraint".into());

        let first = p.record_failure(&RetryState::default(), &err);
        assert_eq!(p.decide(&err, &first), ReplayDecision::SkipBatch);

        let second = p.record_failure(&first, &err);
        assert_eq!(second.rejection_count, 2);
        assert_eq!(second.retry_count, 2);
        assert_eq!(p.decide(&err, &second), ReplayDecision::Evict);
    }

    #[test]
    fn test_connectivity_retries_do_not_count_toward_ceiling() {
        let p = policy(1);
        let down = StoreError::Timeout { millis: 100 };
        let mut state = RetryState::default();
        for _ in 0..10 {
            state = p.record_failure(&state, &down);
        }
        assert_eq!(state.retry_count, 10);
        assert_eq!(state.rejection_count, 0);
        assert!(state.last_error.unwrap().contains("timed out"));
    }

    #[test]
    fn test_stuck_threshold() {
        let p = RetryPolicy::default();
        assert!(!p.is_stuck(10));
        assert!(p.is_stuck(11));
        assert_eq!(p.replay_interval, Duration::from_secs(30));
    }
}
