// =============================================================================
// Shared helpers for venue adapters — retry/backoff, sizing, local rate limits
// =============================================================================

use crate::error::AppError;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

/// Retry a fallible venue call with exponential backoff. Only retries
/// failures the caller marks as retryable via `AppError::Transient`; any
/// other error (and any `Ok`) short-circuits immediately.
pub async fn retry_with_backoff<F, Fut, T>(
    max_attempts: u32,
    base_delay: Duration,
    mut call: F,
) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(AppError::Transient(msg)) if attempt < max_attempts => {
                let delay = base_delay * 2u32.pow(attempt - 1);
                warn!(attempt, delay_ms = delay.as_millis() as u64, %msg, "retrying venue call after transient failure");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Round a raw quantity down to the venue's step size. Returns `None` if the
/// result rounds to zero (the caller should surface `AppError::TooSmall`).
pub fn round_down_to_step(raw_quantity: f64, step: f64) -> Option<f64> {
    if step <= 0.0 {
        return Some(raw_quantity);
    }
    let steps = (raw_quantity / step).floor();
    let rounded = steps * step;
    if rounded <= 0.0 {
        None
    } else {
        Some(rounded)
    }
}

/// Convert a USD notional into a base-asset quantity given a reference price,
/// then round to the venue's step size.
pub fn notional_to_quantity(notional_usd: f64, price: f64, step: f64) -> Option<f64> {
    if price <= 0.0 {
        return None;
    }
    round_down_to_step(notional_usd / price, step)
}

/// A simple per-instance request-rate limiter. Unlike the per-user token
/// bucket in `rate_limit::RateLimiter`, this guards the adapter's own
/// outbound request budget against the venue itself, mirroring a
/// venue-published rate limit (e.g. orders per ten seconds).
pub struct LocalRateLimiter {
    count: AtomicU32,
    limit: u32,
}

impl LocalRateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            count: AtomicU32::new(0),
            limit,
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current >= self.limit {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_succeeds_after_transient_failures() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result = retry_with_backoff(3, Duration::from_millis(1), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AppError::Transient("timeout".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let result: Result<u32, AppError> =
            retry_with_backoff(2, Duration::from_millis(1), || async {
                Err(AppError::Transient("down".into()))
            })
            .await;
        assert!(matches!(result, Err(AppError::Transient(_))));
    }

    #[tokio::test]
    async fn retry_does_not_retry_non_transient_errors() {
        let attempts = std::sync::atomic::AtomicU32::new(0);
        let result: Result<u32, AppError> =
            retry_with_backoff(5, Duration::from_millis(1), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(AppError::AlreadyOpen) }
            })
            .await;
        assert!(matches!(result, Err(AppError::AlreadyOpen)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn round_down_to_step_floors_correctly() {
        assert_eq!(round_down_to_step(0.0734, 0.001), Some(0.073));
    }

    #[test]
    fn round_down_to_step_below_minimum_is_none() {
        assert_eq!(round_down_to_step(0.0004, 0.001), None);
    }

    #[test]
    fn notional_to_quantity_divides_by_price() {
        assert_eq!(notional_to_quantity(600.0, 50_000.0, 0.001), Some(0.012));
    }

    #[test]
    fn local_rate_limiter_blocks_after_limit() {
        let limiter = LocalRateLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        limiter.reset();
        assert!(limiter.try_acquire());
    }
}
