//! Adaptive request pacing for the HTTP extraction backend.
//!
//! Each call waits for its governor permit via `until_ready()`, which spaces
//! requests at the configured rate. On 429 the governor is swapped for a
//! slower one; after a quiet cooldown the original rate comes back.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Largest slowdown applied after repeated 429s.
const MAX_SLOWDOWN: u32 = 16;

/// Quiet period after the last 429 before the base rate is restored.
const COOLDOWN: Duration = Duration::from_secs(60);

fn quota_for(period: Duration) -> Quota {
    Quota::with_period(period).unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
}

/// Rate limiter whose period can be stretched at run time via ArcSwap.
pub struct AdaptiveRateLimiter {
    limiter: ArcSwap<DirectLimiter>,
    base_period: Duration,
    /// 1 = normal, 2 = half rate, ...
    current_factor: AtomicU32,
    last_429: Mutex<Option<Instant>>,
}

impl AdaptiveRateLimiter {
    pub fn new(period: Duration) -> Self {
        Self {
            limiter: ArcSwap::from(Arc::new(DirectLimiter::direct(quota_for(period)))),
            base_period: period,
            current_factor: AtomicU32::new(1),
            last_429: Mutex::new(None),
        }
    }

    /// Allow `n` requests per minute.
    pub fn per_minute(n: u32) -> Self {
        Self::new(Duration::from_secs(60) / n.max(1))
    }

    pub fn base_period(&self) -> Duration {
        self.base_period
    }

    pub fn slowdown(&self) -> u32 {
        self.current_factor.load(Ordering::SeqCst)
    }

    /// Wait until the limiter allows a request.
    pub async fn acquire(&self) {
        self.try_decay();
        let limiter = self.limiter.load_full();
        limiter.until_ready().await;
    }

    /// Double the slowdown factor (capped) and swap in a slower governor.
    pub fn on_rate_limited(&self) {
        *self.last_429.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());

        let _ = self
            .current_factor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                Some((f * 2).min(MAX_SLOWDOWN))
            });

        let factor = self.current_factor.load(Ordering::SeqCst);
        if let Some(scaled) = self.base_period.checked_mul(factor)
            && let Some(quota) = Quota::with_period(scaled)
        {
            self.limiter.store(Arc::new(DirectLimiter::direct(quota)));
            tracing::info!(factor, period_ms = scaled.as_millis() as u64, "extraction pacing slowed");
        }
    }

    fn try_decay(&self) {
        let should_restore = self
            .last_429
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|t| t.elapsed() >= COOLDOWN);

        if should_restore && self.current_factor.load(Ordering::SeqCst) > 1 {
            self.current_factor.store(1, Ordering::SeqCst);
            self.limiter
                .store(Arc::new(DirectLimiter::direct(quota_for(self.base_period))));
            tracing::info!("extraction pacing restored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_minute_period() {
        assert_eq!(
            AdaptiveRateLimiter::per_minute(30).base_period(),
            Duration::from_secs(2)
        );
        assert_eq!(
            AdaptiveRateLimiter::per_minute(0).base_period(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn slowdown_doubles_and_caps() {
        let limiter = AdaptiveRateLimiter::per_minute(600);
        assert_eq!(limiter.slowdown(), 1);
        limiter.on_rate_limited();
        assert_eq!(limiter.slowdown(), 2);
        for _ in 0..10 {
            limiter.on_rate_limited();
        }
        assert_eq!(limiter.slowdown(), MAX_SLOWDOWN);
    }

    #[tokio::test]
    async fn first_acquire_is_immediate() {
        AdaptiveRateLimiter::per_minute(600).acquire().await;
    }

    #[tokio::test]
    async fn decay_restores_after_cooldown() {
        let limiter = AdaptiveRateLimiter::per_minute(600);
        limiter.on_rate_limited();
        limiter.on_rate_limited();
        assert_eq!(limiter.slowdown(), 4);

        *limiter.last_429.lock().unwrap() = Some(Instant::now() - Duration::from_secs(61));

        limiter.acquire().await;
        assert_eq!(limiter.slowdown(), 1);
    }
}
