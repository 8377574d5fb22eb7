//! Backoff between attempts of one batch item.
//!
//! A batch retries items independently, so several items that failed
//! together would otherwise wake together and hit the same pool at once.
//! Jittered exponential backoff spreads them: with the `random-jitter`
//! feature (on by default) each wait is drawn uniformly from 75%..=100% of
//! the capped delay; without it the item's position picks a fixed point in
//! that range.

use std::time::Duration;

#[cfg(feature = "random-jitter")]
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How long an item waits before its next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    Fixed { delay_ms: u64 },
    /// `base_ms` after the first failure, `2 * base_ms` after the second, ...
    Linear { base_ms: u64 },
    /// `base_ms * 2^retry`, never above `max_ms`.
    ExponentialBackoff {
        base_ms: u64,
        max_ms: u64,
        jitter: bool,
    },
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        RetryPolicy::Fixed {
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Jittered exponential backoff.
    pub fn exponential(base_ms: u64, max_ms: u64) -> Self {
        RetryPolicy::ExponentialBackoff {
            base_ms,
            max_ms,
            jitter: true,
        }
    }

    /// Wait before retry number `retry` (0 is the wait before the second
    /// attempt) of the item at `item_index` in its batch.
    pub fn delay_for(&self, retry: u32, item_index: usize) -> Duration {
        let ms = match self {
            RetryPolicy::Fixed { delay_ms } => *delay_ms,
            RetryPolicy::Linear { base_ms } => base_ms.saturating_mul(u64::from(retry) + 1),
            RetryPolicy::ExponentialBackoff {
                base_ms,
                max_ms,
                jitter,
            } => {
                let capped = 1u64
                    .checked_shl(retry)
                    .and_then(|factor| base_ms.checked_mul(factor))
                    .unwrap_or(*max_ms)
                    .min(*max_ms);
                if *jitter {
                    jittered(capped, retry, item_index)
                } else {
                    capped
                }
            }
        };
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Fixed { delay_ms: 1_000 }
    }
}

#[cfg(feature = "random-jitter")]
fn jittered(capped: u64, _retry: u32, _item_index: usize) -> u64 {
    let floor = capped.saturating_mul(3) / 4;
    rand::thread_rng().gen_range(floor..=capped)
}

#[cfg(not(feature = "random-jitter"))]
fn jittered(capped: u64, retry: u32, item_index: usize) -> u64 {
    const STEPS: u64 = 8;
    let floor = capped.saturating_mul(3) / 4;
    let step = (item_index as u64).wrapping_mul(5).wrapping_add(u64::from(retry)) % STEPS;
    floor + (capped - floor) * step / (STEPS - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_policy_is_constant() {
        let p = RetryPolicy::Fixed { delay_ms: 500 };
        assert_eq!(p.delay_for(0, 0), Duration::from_millis(500));
        assert_eq!(p.delay_for(7, 3), Duration::from_millis(500));
    }

    #[test]
    fn test_linear_policy_grows_per_retry() {
        let p = RetryPolicy::Linear { base_ms: 200 };
        assert_eq!(p.delay_for(0, 0), Duration::from_millis(200));
        assert_eq!(p.delay_for(2, 9), Duration::from_millis(600));
    }

    #[test]
    fn test_exponential_policy_doubles_then_caps() {
        let p = RetryPolicy::ExponentialBackoff {
            base_ms: 100,
            max_ms: 800,
            jitter: false,
        };
        assert_eq!(p.delay_for(0, 0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1, 0), Duration::from_millis(200));
        assert_eq!(p.delay_for(3, 0), Duration::from_millis(800));
        assert_eq!(p.delay_for(63, 0), Duration::from_millis(800));
        assert_eq!(p.delay_for(200, 0), Duration::from_millis(800));
    }

    #[test]
    fn test_jitter_stays_between_three_quarters_and_cap() {
        let p = RetryPolicy::exponential(500, 1_000);
        for retry in 0..12 {
            for item in 0..16 {
                let delay = p.delay_for(retry, item);
                let capped = (500u64 << retry.min(1)).min(1_000);
                assert!(delay <= Duration::from_millis(capped), "{delay:?}");
                assert!(delay >= Duration::from_millis(capped * 3 / 4), "{delay:?}");
            }
        }
    }

    #[test]
    fn test_jitter_spreads_items_failing_on_the_same_retry() {
        let p = RetryPolicy::exponential(1_000, 60_000);
        let delays: std::collections::HashSet<Duration> =
            (0..32).map(|item| p.delay_for(3, item)).collect();
        assert!(delays.len() > 1, "all 32 items would retry together");
    }

    #[test]
    fn test_serde_uses_tagged_representation() {
        let p: RetryPolicy = serde_json::from_str(r#"{"kind":"linear","base_ms":50}"#).unwrap();
        assert_eq!(p, RetryPolicy::Linear { base_ms: 50 });
    }
}
