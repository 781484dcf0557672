//! Rate limiting middleware using token bucket algorithm

use axum::{
    extract::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::QuantaClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;
use storesage_common::errors::AppError;

/// Rate limiter using governor crate
pub type GlobalRateLimiter = RateLimiter<NotKeyed, InMemoryState, QuantaClock>;

/// Shared limiter and the rate it enforces
#[derive(Clone)]
pub struct TurnLimiter {
    limiter: Arc<GlobalRateLimiter>,
    requests_per_second: u32,
}

impl TurnLimiter {
    /// Zero rates are raised to one
    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(rate);
        let quota = Quota::per_second(rate).allow_burst(burst);

        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            requests_per_second: rate.get(),
        }
    }

    pub fn check(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(limiter: TurnLimiter, request: Request, next: Next) -> Response {
    if limiter.check() {
        return next.run(request).await;
    }

    tracing::warn!(path = %request.uri().path(), "Rate limit exceeded");
    metrics::counter!("storesage_rate_limited_total").increment(1);
    AppError::RateLimited {
        limit: limiter.requests_per_second,
    }
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = TurnLimiter::new(100, 200);
        assert!(limiter.check());
    }

    #[test]
    fn test_burst_is_enforced() {
        let limiter = TurnLimiter::new(1, 2);
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(!limiter.check());
    }

    #[test]
    fn test_zero_rate_is_raised() {
        let limiter = TurnLimiter::new(0, 0);
        assert_eq!(limiter.requests_per_second, 1);
        assert!(limiter.check());
    }
}
