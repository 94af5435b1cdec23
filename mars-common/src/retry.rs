use std::time;

/// Backoff policy for retrying writes to a sink after an infrastructure failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
    /// Total attempts, including the first one. Always at least one.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn build(backoff_coefficient: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(backoff_coefficient, initial_interval)
    }

    /// Time to wait before the retry following `attempt` (zero-based) failed attempts.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .backoff_coefficient
            .checked_pow(attempt)
            .and_then(|factor| self.initial_interval.checked_mul(factor));

        match (candidate_interval, self.maximum_interval) {
            (Some(interval), Some(max_interval)) => std::cmp::min(interval, max_interval),
            (Some(interval), None) => interval,
            // Overflowed: saturate at the cap, or at the largest duration we can represent.
            (None, Some(max_interval)) => max_interval,
            (None, None) => time::Duration::MAX,
        }
    }

    /// Whether another attempt is allowed after `attempts` attempts have been made.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

pub struct RetryPolicyBuilder {
    backoff_coefficient: u32,
    initial_interval: time::Duration,
    maximum_interval: Option<time::Duration>,
    max_attempts: u32,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_millis(100),
            maximum_interval: Some(time::Duration::from_secs(10)),
            max_attempts: 5,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(backoff_coefficient: u32, initial_interval: time::Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> RetryPolicyBuilder {
        self.max_attempts = attempts;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            max_attempts: self.max_attempts.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_retry_interval() {
        let retry_policy = RetryPolicy::build(1, time::Duration::from_secs(2)).provide();
        let first_interval = retry_policy.retry_interval(0);
        let second_interval = retry_policy.retry_interval(1);
        let third_interval = retry_policy.retry_interval(2);

        assert_eq!(first_interval, time::Duration::from_secs(2));
        assert_eq!(second_interval, time::Duration::from_secs(2));
        assert_eq!(third_interval, time::Duration::from_secs(2));
    }

    #[test]
    fn test_retry_interval_grows_geometrically() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_millis(100))
            .maximum_interval(time::Duration::from_secs(60))
            .provide();

        assert_eq!(retry_policy.retry_interval(0), time::Duration::from_millis(100));
        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_millis(200));
        assert_eq!(retry_policy.retry_interval(3), time::Duration::from_millis(800));
    }

    #[test]
    fn test_retry_interval_never_exceeds_maximum() {
        let retry_policy = RetryPolicy::build(3, time::Duration::from_secs(1))
            .maximum_interval(time::Duration::from_secs(5))
            .provide();

        assert_eq!(retry_policy.retry_interval(1), time::Duration::from_secs(3));
        assert_eq!(retry_policy.retry_interval(2), time::Duration::from_secs(5));
        // Overflowing exponents saturate at the maximum.
        assert_eq!(retry_policy.retry_interval(200), time::Duration::from_secs(5));
    }

    #[test]
    fn test_should_retry_honours_max_attempts() {
        let retry_policy = RetryPolicy::build(2, time::Duration::from_millis(10))
            .max_attempts(3)
            .provide();

        assert!(retry_policy.should_retry(1));
        assert!(retry_policy.should_retry(2));
        assert!(!retry_policy.should_retry(3));
        assert_eq!(retry_policy.max_attempts(), 3);

        let single_shot = RetryPolicy::build(2, time::Duration::from_millis(10))
            .max_attempts(0)
            .provide();
        assert!(!single_shot.should_retry(1));
        assert_eq!(single_shot.max_attempts(), 1);
    }

    #[test]
    fn test_default_policy() {
        let retry_policy = RetryPolicy::default();

        assert_eq!(retry_policy.max_attempts(), 5);
        assert_eq!(retry_policy.retry_interval(10), time::Duration::from_secs(10));
    }
}
