//! Bounded retry policy for protective stop placement.
//!
//! Only stop placement retries; entry orders are never blindly resubmitted
//! because a duplicate entry doubles exposure. Backoff is exponential with
//! jitter so repeated failures do not synchronize against the venue.

use std::time::Duration;

use rand::Rng;

/// Retry policy for protective stop placement.
#[derive(Debug, Clone)]
pub struct StopRetryPolicy {
    /// Total placement attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any single backoff.
    pub max_backoff: Duration,
    /// Multiplier applied per failed attempt.
    pub backoff_multiplier: f64,
    /// Random jitter fraction applied to each backoff (0.0 to 1.0).
    pub jitter_factor: f64,
}

impl Default for StopRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl StopRetryPolicy {
    /// Policy with the configured attempt count and default backoff shape.
    #[must_use]
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Backoff to sleep after the given failed attempt (1-based).
    ///
    /// Returns `None` once the attempt budget is exhausted.
    #[must_use]
    pub fn next_backoff(&self, failed_attempt: u32) -> Option<Duration> {
        if failed_attempt >= self.max_attempts {
            return None;
        }

        let exponent = failed_attempt.saturating_sub(1);
        let base_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(exponent as i32);
        let capped_ms = base_ms.min(self.max_backoff.as_millis() as f64);

        let jitter = if self.jitter_factor > 0.0 {
            rand::rng().random_range(-self.jitter_factor..=self.jitter_factor)
        } else {
            0.0
        };
        let jittered_ms = (capped_ms * (1.0 + jitter)).max(0.0);

        Some(Duration::from_millis(jittered_ms as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(max_attempts: u32) -> StopRetryPolicy {
        StopRetryPolicy {
            max_attempts,
            jitter_factor: 0.0,
            ..StopRetryPolicy::default()
        }
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = no_jitter(4);
        assert_eq!(policy.next_backoff(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.next_backoff(2), Some(Duration::from_millis(400)));
        assert_eq!(policy.next_backoff(3), Some(Duration::from_millis(800)));
    }

    #[test]
    fn test_budget_exhausts_at_max_attempts() {
        let policy = no_jitter(3);
        assert!(policy.next_backoff(2).is_some());
        assert!(policy.next_backoff(3).is_none());
        assert!(policy.next_backoff(10).is_none());
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let policy = StopRetryPolicy {
            max_attempts: 20,
            jitter_factor: 0.0,
            ..StopRetryPolicy::default()
        };
        assert_eq!(policy.next_backoff(15), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = StopRetryPolicy::default();
        for _ in 0..100 {
            let backoff = policy.next_backoff(1).unwrap();
            // 200ms +/- 20%
            assert!(backoff >= Duration::from_millis(160));
            assert!(backoff <= Duration::from_millis(240));
        }
    }

    #[test]
    fn test_with_attempts_floors_at_one() {
        assert_eq!(StopRetryPolicy::with_attempts(0).max_attempts, 1);
    }
}
