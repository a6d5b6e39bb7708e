//! Per-provider API rate limiting
//!
//! Token bucket (GCRA via `governor`) sized by the provider's declared
//! calls-per-minute: the full quota is available as a burst and refills
//! continuously. Acquisition waits for a token up to the caller's deadline
//! and fails with `RateLimitExceeded` after that; work is never dropped
//! silently.

use crate::error::EngineError;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use tokio::time::Instant;
use tracing::debug;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token bucket for one provider
pub struct ProviderRateLimiter {
    per_minute: u32,
    limiter: Option<DirectLimiter>,
}

impl std::fmt::Debug for ProviderRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRateLimiter")
            .field("per_minute", &self.per_minute)
            .finish()
    }
}

impl ProviderRateLimiter {
    /// Create a limiter; `0` calls per minute means unlimited
    pub fn new(per_minute: u32) -> Self {
        let limiter = NonZeroU32::new(per_minute)
            .map(|quota| RateLimiter::direct(Quota::per_minute(quota)));
        Self {
            per_minute,
            limiter,
        }
    }

    pub fn per_minute(&self) -> u32 {
        self.per_minute
    }

    pub fn is_unlimited(&self) -> bool {
        self.limiter.is_none()
    }

    /// Take a token if one is available right now
    pub fn try_acquire(&self) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }

    /// Wait for a token, giving up at `deadline`
    pub async fn acquire(&self, provider: &str, deadline: Instant) -> Result<(), EngineError> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        if limiter.check().is_ok() {
            return Ok(());
        }

        debug!(provider = %provider, "Rate limit reached, waiting for token");
        tokio::time::timeout_at(deadline, limiter.until_ready())
            .await
            .map_err(|_| EngineError::RateLimitExceeded {
                provider: provider.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_unlimited_always_admits() {
        let limiter = ProviderRateLimiter::new(0);
        assert!(limiter.is_unlimited());
        for _ in 0..1000 {
            assert!(limiter.try_acquire());
        }
    }

    #[test]
    fn test_burst_equals_quota() {
        let limiter = ProviderRateLimiter::new(10);
        let admitted = (0..15).filter(|_| limiter.try_acquire()).count();
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_never_exceeds_quota() {
        let limiter = Arc::new(ProviderRateLimiter::new(5));
        let deadline = Instant::now() + Duration::from_millis(200);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire("tmdb", deadline).await })
            })
            .collect();

        let mut ok = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(EngineError::RateLimitExceeded { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(ok, 5);
        assert_eq!(rejected, 3);
    }
}
