use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff applied to outbound calls to either platform.
///
/// The jitter spreads retries from concurrent tenants apart. Message sends
/// are retried under the assumption that the remote APIs are effectively
/// idempotent for resubmitted sends; neither platform documents a guarantee,
/// so a timeout on an actually-successful send can double-deliver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay_ms: 500, max_delay_ms: 8_000, jitter_ms: 250 }
    }
}

impl RetryPolicy {
    /// Policy with no delays, for tests that count attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self { max_attempts, base_delay_ms: 0, max_delay_ms: 0, jitter_ms: 0 }
    }

    /// Delay before the given retry. `attempt` is the number of attempts
    /// already made, so the first retry (attempt 1) waits the base delay.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let multiplier = 1_u64 << exponent;
        let base = self.base_delay_ms.saturating_mul(multiplier).min(self.max_delay_ms);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(base.saturating_add(jitter))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetryPolicy;

    #[test]
    fn delay_doubles_per_attempt_without_jitter() {
        let policy =
            RetryPolicy { max_attempts: 3, base_delay_ms: 100, max_delay_ms: 10_000, jitter_ms: 0 };

        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let policy =
            RetryPolicy { max_attempts: 10, base_delay_ms: 1_000, max_delay_ms: 3_000, jitter_ms: 0 };

        assert_eq!(policy.backoff_delay(8), Duration::from_millis(3_000));
    }

    #[test]
    fn jitter_stays_within_configured_bound() {
        let policy =
            RetryPolicy { max_attempts: 3, base_delay_ms: 100, max_delay_ms: 1_000, jitter_ms: 50 };

        for _ in 0..32 {
            let delay = policy.backoff_delay(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn default_policy_matches_relay_contract() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
    }
}
