//! Failure classification and class-specific exponential backoff.
//!
//! Backoff is a pure function of failure class, attempt number and a jitter
//! sample in `[0, 1)`, so it can be tested without sleeping. The worker draws
//! the sample from `fastrand` at run time.

use std::time::Duration;

/// Default retry budget per chunk.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// How a failed extraction attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// The per-call timeout fired.
    Timeout,
    /// Quota exceeded or HTTP 429.
    RateLimited,
    /// One of the known transient server errors.
    Transient,
    /// Anything else. Never retried.
    Fatal,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        !matches!(self, FailureClass::Fatal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Timeout => "timeout",
            FailureClass::RateLimited => "rate_limited",
            FailureClass::Transient => "transient",
            FailureClass::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff parameters for one failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Upper bound of the uniform jitter added after capping.
    pub jitter: Duration,
}

impl BackoffPolicy {
    pub const fn new(base_secs: u64, cap_secs: u64, jitter_secs: u64) -> Self {
        Self {
            base: Duration::from_secs(base_secs),
            cap: Duration::from_secs(cap_secs),
            jitter: Duration::from_secs(jitter_secs),
        }
    }

    /// Backoff policy for a retryable class; `None` for fatal failures.
    pub fn for_class(class: FailureClass) -> Option<Self> {
        match class {
            FailureClass::Timeout => Some(Self::new(3, 30, 2)),
            FailureClass::Transient => Some(Self::new(5, 45, 3)),
            FailureClass::RateLimited => Some(Self::new(10, 60, 5)),
            FailureClass::Fatal => None,
        }
    }

    /// `min(base × 2^(attempt-1), cap) + jitter × unit`. `attempt` is 1-based.
    pub fn delay(&self, attempt: u32, jitter_unit: f64) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let grown = self
            .base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.cap)
            .min(self.cap);
        grown + self.jitter.mul_f64(jitter_unit.clamp(0.0, 1.0))
    }
}

/// Delay before the attempt following `attempt`; zero for fatal failures.
pub fn backoff_delay(class: FailureClass, attempt: u32, jitter_unit: f64) -> Duration {
    BackoffPolicy::for_class(class)
        .map(|p| p.delay(attempt, jitter_unit))
        .unwrap_or(Duration::ZERO)
}

/// Tagged result of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome<T, E> {
    Success(T),
    Retryable { class: FailureClass, error: E },
    Fatal(E),
}

impl<T, E> AttemptOutcome<T, E> {
    /// Tag a result using a classifier for its error.
    pub fn from_result(result: Result<T, E>, classify: impl Fn(&E) -> FailureClass) -> Self {
        match result {
            Ok(value) => AttemptOutcome::Success(value),
            Err(error) => match classify(&error) {
                FailureClass::Fatal => AttemptOutcome::Fatal(error),
                class => AttemptOutcome::Retryable { class, error },
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl RetryPolicy {
    /// A budget of zero is treated as a single attempt.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn allows_another(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Wait before the next attempt; a server-provided retry-after raises
    /// rate-limit waits but never shortens them.
    pub fn wait(
        &self,
        class: FailureClass,
        attempt: u32,
        retry_after: Option<Duration>,
        jitter_unit: f64,
    ) -> Duration {
        let delay = backoff_delay(class, attempt, jitter_unit);
        match (class, retry_after) {
            (FailureClass::RateLimited, Some(hint)) => delay.max(hint),
            _ => delay,
        }
    }
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date form: fall back to a conservative fixed wait
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_backoff_grows_and_caps() {
        let secs: Vec<u64> = (1..=6)
            .map(|a| backoff_delay(FailureClass::Timeout, a, 0.0).as_secs())
            .collect();
        assert_eq!(secs, vec![3, 6, 12, 24, 30, 30]);
    }

    #[test]
    fn rate_limit_backoff_is_most_aggressive() {
        let secs: Vec<u64> = (1..=4)
            .map(|a| backoff_delay(FailureClass::RateLimited, a, 0.0).as_secs())
            .collect();
        assert_eq!(secs, vec![10, 20, 40, 60]);
        assert!(
            backoff_delay(FailureClass::RateLimited, 10, 0.0)
                > backoff_delay(FailureClass::Transient, 10, 0.0)
        );
    }

    #[test]
    fn transient_backoff_caps_at_45() {
        assert_eq!(
            backoff_delay(FailureClass::Transient, 5, 0.0),
            Duration::from_secs(45)
        );
    }

    #[test]
    fn jitter_is_bounded() {
        let lo = backoff_delay(FailureClass::Transient, 1, 0.0);
        let hi = backoff_delay(FailureClass::Transient, 1, 0.999);
        assert_eq!(lo, Duration::from_secs(5));
        assert!(hi < Duration::from_secs(8));
        assert_eq!(
            backoff_delay(FailureClass::Transient, 1, 7.0),
            Duration::from_secs(8)
        );
    }

    #[test]
    fn huge_attempt_numbers_do_not_overflow() {
        assert_eq!(
            backoff_delay(FailureClass::Timeout, u32::MAX, 0.0),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn fatal_has_no_backoff() {
        assert_eq!(backoff_delay(FailureClass::Fatal, 1, 0.5), Duration::ZERO);
        assert!(!FailureClass::Fatal.is_retryable());
    }

    #[test]
    fn retry_after_only_extends_rate_limit_waits() {
        let policy = RetryPolicy::default();
        let hint = Some(Duration::from_secs(90));
        assert_eq!(
            policy.wait(FailureClass::RateLimited, 1, hint, 0.0),
            Duration::from_secs(90)
        );
        assert_eq!(
            policy.wait(FailureClass::RateLimited, 1, Some(Duration::from_secs(1)), 0.0),
            Duration::from_secs(10)
        );
        assert_eq!(
            policy.wait(FailureClass::Timeout, 1, hint, 0.0),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn attempt_budget() {
        let policy = RetryPolicy::new(5);
        assert!(policy.allows_another(4));
        assert!(!policy.allows_another(5));
        assert_eq!(RetryPolicy::new(0).max_attempts, 1);
    }

    #[test]
    fn outcome_tagging() {
        let classify = |e: &&str| {
            if *e == "slow" {
                FailureClass::Timeout
            } else {
                FailureClass::Fatal
            }
        };
        assert_eq!(
            AttemptOutcome::<u8, &str>::from_result(Ok(1), classify),
            AttemptOutcome::Success(1)
        );
        assert_eq!(
            AttemptOutcome::<u8, &str>::from_result(Err("slow"), classify),
            AttemptOutcome::Retryable {
                class: FailureClass::Timeout,
                error: "slow"
            }
        );
        assert_eq!(
            AttemptOutcome::<u8, &str>::from_result(Err("bad"), classify),
            AttemptOutcome::Fatal("bad")
        );
    }

    #[test]
    fn parse_retry_after_forms() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(Duration::from_secs(5))
        );
        assert_eq!(parse_retry_after("xyz"), None);
    }
}
