use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};

use crate::config::RateLimit;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Outbound request limiter for one provider.
///
/// Cloning shares the underlying budget.
#[derive(Clone)]
pub struct RequestThrottle {
    limiter: Arc<DirectRateLimiter>,
    limit: RateLimit,
}

impl std::fmt::Debug for RequestThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestThrottle")
            .field("limit", &self.limit)
            .finish_non_exhaustive()
    }
}

impl RequestThrottle {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::direct(quota_for(limit))),
            limit,
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Takes one request slot if available, otherwise returns the wait until
    /// the next slot frees up.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.limiter
            .check()
            .map_err(|not_until| not_until.wait_time_from(DefaultClock::default().now()))
    }

    /// Waits for a request slot.
    pub async fn ready(&self) {
        if self.try_acquire().is_ok() {
            return;
        }
        tracing::debug!(
            requests_per_minute = self.limit.requests_per_minute,
            "rate limit reached; waiting for budget"
        );
        self.limiter.until_ready().await;
    }
}

fn quota_for(limit: RateLimit) -> Quota {
    let per_minute = NonZeroU32::new(limit.requests_per_minute).unwrap_or(NonZeroU32::MIN);
    let burst = limit
        .burst
        .and_then(NonZeroU32::new)
        .unwrap_or(per_minute);
    Quota::per_minute(per_minute).allow_burst(burst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_once_burst_is_spent() {
        let throttle = RequestThrottle::new(RateLimit::per_minute(60).with_burst(2));

        assert!(throttle.try_acquire().is_ok());
        assert!(throttle.try_acquire().is_ok());
        let wait = throttle.try_acquire().expect_err("burst exhausted");
        assert!(wait <= Duration::from_secs(1));
    }

    #[test]
    fn clones_share_budget() {
        let throttle = RequestThrottle::new(RateLimit::per_minute(1));
        let clone = throttle.clone();

        assert!(throttle.try_acquire().is_ok());
        assert!(clone.try_acquire().is_err());
    }

    #[tokio::test]
    async fn ready_returns_immediately_with_budget() {
        let throttle = RequestThrottle::new(RateLimit::per_minute(600));
        throttle.ready().await;
        throttle.ready().await;
    }
}
