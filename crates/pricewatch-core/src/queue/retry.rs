//! Retry policy: attempt cap and jittered backoff delays.

use std::time::Duration;

use rand::Rng;

/// Tasks are dead-lettered once they have failed this many times.
pub const MAX_ATTEMPTS: u32 = 5;

/// What the queue does with a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Requeue,
    DeadLetter,
}

/// Retry policy for failed tasks.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failed executions after which a task is no longer retried.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// Decide for a task that has now failed `failed_attempts` times (1-indexed).
    ///
    /// With the default cap of 5:
    /// - failures 1..=4: requeue
    /// - failure 5: dead-letter (never a sixth execution)
    pub fn decide(&self, failed_attempts: u32) -> RetryDecision {
        if failed_attempts >= self.max_attempts {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Requeue
        }
    }
}

/// Linear jittered backoff: attempt `i` waits uniformly in `[min_step·i, max_step·i]`.
#[derive(Debug, Clone)]
pub struct JitteredBackoff {
    pub min_step: Duration,
    pub max_step: Duration,
}

impl Default for JitteredBackoff {
    fn default() -> Self {
        Self {
            min_step: Duration::from_millis(800),
            max_step: Duration::from_millis(1200),
        }
    }
}

impl JitteredBackoff {
    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let i = attempt.max(1);
        random_between(self.min_step * i, self.max_step * i)
    }
}

/// Uniform random duration in `[min, max]` at millisecond resolution.
pub fn random_between(min: Duration, max: Duration) -> Duration {
    let lo = min.as_millis() as u64;
    let hi = max.as_millis() as u64;
    if hi <= lo {
        return min;
    }
    Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::first(1, RetryDecision::Requeue)]
    #[case::fourth(4, RetryDecision::Requeue)]
    #[case::fifth(5, RetryDecision::DeadLetter)]
    #[case::beyond(9, RetryDecision::DeadLetter)]
    fn default_policy_caps_at_five(#[case] failed: u32, #[case] expected: RetryDecision) {
        assert_eq!(RetryPolicy::default().decide(failed), expected);
    }

    #[test]
    fn backoff_grows_with_attempt_index() {
        let backoff = JitteredBackoff::default();
        for attempt in 1..=3 {
            for _ in 0..50 {
                let d = backoff.delay(attempt);
                assert!(d >= Duration::from_millis(800 * attempt as u64));
                assert!(d <= Duration::from_millis(1200 * attempt as u64));
            }
        }
    }

    #[test]
    fn degenerate_window_returns_min() {
        let d = random_between(Duration::from_millis(500), Duration::from_millis(100));
        assert_eq!(d, Duration::from_millis(500));
    }
}
